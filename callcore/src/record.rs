//! Call history rows written to the external store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{CallId, CallIdentity, CallKind, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallRecordStatus {
    Ringing,
    Accepted,
    Rejected,
    Ended,
}

/// One row of call history. Write-only from the session's point of view.
///
/// The caller's `ringing` write inserts the row; every later write, from
/// either side, only updates `status`. `created_at` is therefore only set on
/// the insert, so a callee's clock never overwrites the caller's timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRecord {
    pub id: CallId,
    pub caller_id: UserId,
    pub receiver_id: UserId,
    pub call_type: CallKind,
    pub status: CallRecordStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl CallRecord {
    pub fn from_identity(identity: &CallIdentity, status: CallRecordStatus) -> Self {
        Self {
            id: identity.call_id.clone(),
            caller_id: identity.caller_id.clone(),
            receiver_id: identity.callee_id.clone(),
            call_type: identity.kind,
            status,
            created_at: status.is_insert().then_some(identity.created_at),
        }
    }
}

impl CallRecordStatus {
    /// Whether a write with this status creates the row.
    pub fn is_insert(&self) -> bool {
        *self == Self::Ringing
    }
}
