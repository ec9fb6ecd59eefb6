//! Durable job records and their execution substrate.
//!
//! A job is the unit of asynchronous work: created by the dispatcher,
//! executed by a worker handler, observed by operator UIs. Records live
//! in a Redis hash and advance through a small state machine:
//!
//! ```text
//! queued ──▶ running ──▶ succeeded | failed
//!    │           │
//!    └──────▶ cancelling ──▶ cancelled
//! ```
//!
//! Terminal statuses freeze `status`, `result`, and `error`; `progress`
//! never decreases while a job is live; `logs` is append-only.

pub mod dispatcher;
pub mod runtime;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub use dispatcher::Dispatcher;
pub use runtime::{
    HandlerError, HandlerRegistry, JobContext, JobHandler, LazyLoader, WorkerRuntime,
};
pub use store::{JobFilters, JobStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Cancelling,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Cancelling => "cancelling",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One timestamped line of job output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub ts: DateTime<Utc>,
    pub message: String,
}

/// Durable record of one asynchronous operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub toolkit: String,
    /// Mirror of `toolkit`, kept as an independent listing filter.
    #[serde(default)]
    pub module: String,
    pub operation: String,
    #[serde(rename = "type")]
    pub job_type: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default = "default_status")]
    pub status: JobStatus,
    #[serde(default)]
    pub progress: u8,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub celery_task_id: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_status() -> JobStatus {
    JobStatus::Queued
}

impl Job {
    pub fn new(toolkit: &str, operation: &str, payload: Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            toolkit: toolkit.to_string(),
            module: toolkit.to_string(),
            operation: operation.to_string(),
            job_type: format!("{toolkit}.{operation}"),
            payload,
            status: JobStatus::Queued,
            progress: 0,
            logs: Vec::new(),
            result: None,
            error: None,
            celery_task_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Advance progress; clamped to 100 and never decreasing.
    pub fn set_progress(&mut self, progress: u8) {
        self.progress = self.progress.max(progress.min(100));
    }

    /// Restore defaults for fields older records may lack.
    pub(crate) fn normalize(&mut self) {
        if self.module.is_empty() {
            self.module = self.toolkit.clone();
        }
        if self.job_type.is_empty() {
            self.job_type = format!("{}.{}", self.toolkit, self.operation);
        }
        if self.updated_at < self.created_at {
            self.updated_at = self.created_at;
        }
    }
}
