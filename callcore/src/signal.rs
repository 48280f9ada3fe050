//! Signaling messages and their wire encoding.
//!
//! Every message travels inside a [`SignalEnvelope`] published on the
//! recipient's inbox channel:
//!
//! ```json
//! { "call_id": "AC90CF...",
//!   "signal_type": "offer",
//!   "sender_id": "grower-17",
//!   "signal_data": { "sdp": "v=0...", "call_type": "video" } }
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::SignalDecodeError;
use crate::types::{CallId, CallKind, UserId};

/// A connectivity candidate, shaped like the browser's `RTCIceCandidateInit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidateInit {
    /// The candidate line (e.g. "candidate:1 1 UDP 2130706431 192.168.1.1 8888 typ host")
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidateInit {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
            username_fragment: None,
        }
    }

    pub fn with_sdp_mid(mut self, sdp_mid: impl Into<String>) -> Self {
        self.sdp_mid = Some(sdp_mid.into());
        self
    }

    pub fn with_sdp_m_line_index(mut self, index: u16) -> Self {
        self.sdp_m_line_index = Some(index);
        self
    }

    pub fn with_username_fragment(mut self, ufrag: impl Into<String>) -> Self {
        self.username_fragment = Some(ufrag.into());
        self
    }
}

/// Why the sender ended the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndCode {
    #[default]
    Hangup,
    Rejected,
    Busy,
    Timeout,
    Failed,
}

/// Tag carried in `signal_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalType {
    Offer,
    Answer,
    IceCandidate,
    End,
}

impl SignalType {
    pub const ALL: [SignalType; 4] = [Self::Offer, Self::Answer, Self::IceCandidate, Self::End];

    pub const fn tag_name(&self) -> &'static str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::IceCandidate => "ice_candidate",
            Self::End => "end",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "offer" => Some(Self::Offer),
            "answer" => Some(Self::Answer),
            "ice_candidate" => Some(Self::IceCandidate),
            "end" => Some(Self::End),
            _ => None,
        }
    }
}

impl fmt::Display for SignalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag_name())
    }
}

/// Typed signaling message, as consumed by the call state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalMessage {
    Offer { sdp: String, kind: CallKind },
    Answer { sdp: String },
    IceCandidate(IceCandidateInit),
    End(EndCode),
}

impl SignalMessage {
    pub fn signal_type(&self) -> SignalType {
        match self {
            Self::Offer { .. } => SignalType::Offer,
            Self::Answer { .. } => SignalType::Answer,
            Self::IceCandidate(_) => SignalType::IceCandidate,
            Self::End(_) => SignalType::End,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<IceCandidateInit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_type: Option<CallKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<EndCode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct RawEnvelope {
    call_id: CallId,
    signal_type: String,
    sender_id: UserId,
    #[serde(default)]
    signal_data: SignalData,
}

/// A message addressed to one call, with its sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalEnvelope {
    pub call_id: CallId,
    pub sender_id: UserId,
    pub message: SignalMessage,
}

impl SignalEnvelope {
    pub fn new(call_id: CallId, sender_id: UserId, message: SignalMessage) -> Self {
        Self {
            call_id,
            sender_id,
            message,
        }
    }

    pub fn encode(&self) -> String {
        let signal_data = match &self.message {
            SignalMessage::Offer { sdp, kind } => SignalData {
                sdp: Some(sdp.clone()),
                call_type: Some(*kind),
                ..Default::default()
            },
            SignalMessage::Answer { sdp } => SignalData {
                sdp: Some(sdp.clone()),
                ..Default::default()
            },
            SignalMessage::IceCandidate(c) => SignalData {
                candidate: Some(c.clone()),
                ..Default::default()
            },
            SignalMessage::End(code) => SignalData {
                reason: Some(*code),
                ..Default::default()
            },
        };
        let raw = RawEnvelope {
            call_id: self.call_id.clone(),
            signal_type: self.message.signal_type().tag_name().to_string(),
            sender_id: self.sender_id.clone(),
            signal_data,
        };
        // A struct of strings and enums cannot fail to serialize.
        serde_json::to_string(&raw).unwrap_or_default()
    }

    pub fn decode(payload: &str) -> Result<Self, SignalDecodeError> {
        let raw: RawEnvelope =
            serde_json::from_str(payload).map_err(|e| SignalDecodeError::Json(e.to_string()))?;
        let signal_type = SignalType::from_tag(&raw.signal_type)
            .ok_or_else(|| SignalDecodeError::UnknownType(raw.signal_type.clone()))?;
        let data = raw.signal_data;

        let message = match signal_type {
            SignalType::Offer => {
                let sdp = data.sdp.ok_or(SignalDecodeError::MissingField("sdp"))?;
                let kind = data.call_type.unwrap_or_else(|| CallKind::from_sdp(&sdp));
                SignalMessage::Offer { sdp, kind }
            }
            SignalType::Answer => SignalMessage::Answer {
                sdp: data.sdp.ok_or(SignalDecodeError::MissingField("sdp"))?,
            },
            SignalType::IceCandidate => SignalMessage::IceCandidate(
                data.candidate
                    .ok_or(SignalDecodeError::MissingField("candidate"))?,
            ),
            SignalType::End => SignalMessage::End(data.reason.unwrap_or_default()),
        };

        Ok(Self {
            call_id: raw.call_id,
            sender_id: raw.sender_id,
            message,
        })
    }
}
