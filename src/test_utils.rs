use async_trait::async_trait;
use callcore::{CallRecord, CallRecordStatus, CallState};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::records::{CallRecordSink, MemoryRecordSink};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Waits until `rx` reports `expected`, failing the test after two seconds.
pub async fn wait_for_state(rx: &mut watch::Receiver<CallState>, expected: CallState) {
    let reached = tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| *s == expected))
        .await
        .map(|r| r.is_ok());
    match reached {
        Ok(true) => {}
        Ok(false) => panic!("session stopped before reaching {expected}, last {}", *rx.borrow()),
        Err(_) => panic!("timed out waiting for {expected}, last {}", *rx.borrow()),
    }
}

/// A store that is slow to insert: `ringing` writes are held back by `delay`
/// before landing in `inner`.
pub struct SlowRingingSink {
    inner: Arc<MemoryRecordSink>,
    delay: Duration,
}

impl SlowRingingSink {
    pub fn new(inner: Arc<MemoryRecordSink>, delay: Duration) -> Self {
        Self { inner, delay }
    }
}

#[async_trait]
impl CallRecordSink for SlowRingingSink {
    async fn write(&self, record: CallRecord) -> Result<(), anyhow::Error> {
        if record.status == CallRecordStatus::Ringing {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.write(record).await
    }
}
