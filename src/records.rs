//! Call history sink.
//!
//! Writes are side effects only: nothing reads records back to make call
//! decisions, and a failed write never affects the live session.

use async_trait::async_trait;
use callcore::{CallRecord, CallRecordStatus};
use log::{debug, info, warn};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[async_trait]
pub trait CallRecordSink: Send + Sync {
    /// Inserts the row or updates its status.
    async fn write(&self, record: CallRecord) -> Result<(), anyhow::Error>;
}

/// Per-session write queue.
///
/// Rows are handed to a single background task that writes them one after
/// another, so the status updates of a row reach the store in the order the
/// session issued them. The session never waits on the store. Dropping the
/// writer lets the task finish what is queued and exit.
pub(crate) struct RecordWriter {
    tx: mpsc::UnboundedSender<CallRecord>,
}

impl RecordWriter {
    pub(crate) fn spawn(sink: Arc<dyn CallRecordSink>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<CallRecord>();
        tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                let id = record.id.clone();
                let status = record.status;
                if let Err(e) = sink.write(record).await {
                    warn!(target: "Call/Records", "Failed to write {status:?} for call {id}: {e}");
                }
            }
            debug!(target: "Call/Records", "Record writer finished");
        });
        Self { tx }
    }

    pub(crate) fn write(&self, record: CallRecord) {
        if let Err(e) = self.tx.send(record) {
            warn!(target: "Call/Records", "Record writer is gone, dropping {:?} for call {}", e.0.status, e.0.id);
        }
    }
}

/// Logs each row as JSON. Used when no store is configured.
#[derive(Debug, Default)]
pub struct LogRecordSink;

#[async_trait]
impl CallRecordSink for LogRecordSink {
    async fn write(&self, record: CallRecord) -> Result<(), anyhow::Error> {
        info!(target: "Call/Records", "{}", serde_json::to_string(&record)?);
        Ok(())
    }
}

/// Keeps every write in memory, in order.
#[derive(Debug, Default)]
pub struct MemoryRecordSink {
    writes: Mutex<Vec<CallRecord>>,
}

impl MemoryRecordSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn writes(&self) -> Vec<CallRecord> {
        self.writes.lock().map(|w| w.clone()).unwrap_or_default()
    }

    pub fn statuses(&self) -> Vec<CallRecordStatus> {
        self.writes().into_iter().map(|r| r.status).collect()
    }
}

#[async_trait]
impl CallRecordSink for MemoryRecordSink {
    async fn write(&self, record: CallRecord) -> Result<(), anyhow::Error> {
        self.writes
            .lock()
            .map_err(|_| anyhow::anyhow!("record store poisoned"))?
            .push(record);
        Ok(())
    }
}
