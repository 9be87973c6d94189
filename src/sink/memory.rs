// In-memory batch sink
// Buffers activity per session and moves it to a flushed archive on flush

use super::{BatchSink, SinkError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// A unit of workload output attributed to a session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityRecord {
    pub session_id: String,
    pub recorded_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

/// In-memory batch sink
pub struct MemoryBatchSink {
    pending: Arc<RwLock<HashMap<String, Vec<ActivityRecord>>>>,
    flushed: Arc<RwLock<HashMap<String, Vec<ActivityRecord>>>>,
}

impl MemoryBatchSink {
    pub fn new() -> Self {
        Self {
            pending: Arc::new(RwLock::new(HashMap::new())),
            flushed: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Buffer a record until the session is flushed
    pub async fn push(&self, record: ActivityRecord) {
        let mut pending = self.pending.write().await;
        pending
            .entry(record.session_id.clone())
            .or_default()
            .push(record);
    }

    /// Records not yet flushed for a session
    pub async fn pending(&self, session_id: &str) -> Vec<ActivityRecord> {
        let pending = self.pending.read().await;
        pending.get(session_id).cloned().unwrap_or_default()
    }

    /// Records already flushed for a session
    pub async fn flushed(&self, session_id: &str) -> Vec<ActivityRecord> {
        let flushed = self.flushed.read().await;
        flushed.get(session_id).cloned().unwrap_or_default()
    }
}

impl Default for MemoryBatchSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BatchSink for MemoryBatchSink {
    async fn append(&self, record: ActivityRecord) -> Result<(), SinkError> {
        self.push(record).await;
        Ok(())
    }

    async fn flush(&self, session_id: &str) -> Result<(), SinkError> {
        let drained = {
            let mut pending = self.pending.write().await;
            pending.remove(session_id).unwrap_or_default()
        };

        if drained.is_empty() {
            debug!("Nothing to flush for session {}", session_id);
            return Ok(());
        }

        let count = drained.len();
        let mut flushed = self.flushed.write().await;
        flushed
            .entry(session_id.to_string())
            .or_default()
            .extend(drained);

        info!("Flushed {} records for session {}", count, session_id);
        Ok(())
    }
}
