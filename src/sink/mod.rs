// Batch sink receiving a session's accumulated activity at termination

pub mod memory;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::{ActivityRecord, MemoryBatchSink};

/// Sink that drains a session's buffered activity into long-term storage
#[async_trait]
pub trait BatchSink: Send + Sync {
    /// Flush everything accumulated for the session. May fail; callers must
    /// treat failures as data loss for that session, not as a reason to keep
    /// the session alive.
    async fn flush(&self, session_id: &str) -> Result<(), SinkError>;

    /// Buffer one activity record for a later flush. Sinks fed directly by
    /// the workload can keep the default, which discards the record.
    async fn append(&self, record: ActivityRecord) -> Result<(), SinkError> {
        let _ = record;
        Ok(())
    }
}

/// Batch sink errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SinkError {
    #[error("Sink unavailable: {0}")]
    Unavailable(String),
    #[error("Flush rejected: {0}")]
    Rejected(String),
    #[error("Flush timed out after {0}ms")]
    Timeout(u64),
}

impl SinkError {
    /// Stable label for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            SinkError::Unavailable(_) => "unavailable",
            SinkError::Rejected(_) => "rejected",
            SinkError::Timeout(_) => "timeout",
        }
    }
}
