//! Streaming progress updates for long-running control-API actions.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStatus {
    Progress,
    Success,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressUpdate {
    /// Named step, e.g. a build phase.
    pub process: String,
    pub status: ProgressStatus,
    pub message: String,
}

/// Callback handed down from the API connection into component
/// operations. `None` when the caller doesn't stream.
pub type ProgressSink = Arc<dyn Fn(ProgressUpdate) + Send + Sync>;

pub fn report(sink: &Option<ProgressSink>, process: &str, status: ProgressStatus, message: &str) {
    if let Some(sink) = sink {
        sink(ProgressUpdate {
            process: process.to_string(),
            status,
            message: message.to_string(),
        });
    }
}
