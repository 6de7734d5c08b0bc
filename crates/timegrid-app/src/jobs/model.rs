//! Job, retry-log, and webhook entity types persisted by the job store.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorKind;

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_WEBHOOK_MAX_ATTEMPTS: u32 = 3;

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

/// Lifecycle state of an extraction job.
///
/// Legal transitions form the DAG `Pending → Processing → {Completed, Failed}`
/// plus `Pending → Cancelled`; the store enforces them with compare-and-set
/// updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

/// Metadata persisted for every extraction job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub status: JobStatus,
    /// Blob key of the uploaded artifact.
    pub blob_key: String,
    pub mime_type: String,
    pub original_name: String,
    pub size_bytes: u64,
    #[serde(default)]
    pub submitter: Option<String>,
    #[serde(default)]
    pub teacher_name: Option<String>,
    #[serde(default)]
    pub class_name: Option<String>,
    /// BLAKE3 hex of the artifact bytes, recorded at submission.
    #[serde(default)]
    pub content_hash: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Backend method actually used, set on success.
    #[serde(default)]
    pub method: Option<String>,
    /// Complexity classification, set on success.
    #[serde(default)]
    pub complexity: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    /// Key of the result document blob; never overwritten once assigned.
    #[serde(default)]
    pub result_blob_key: Option<String>,
    pub created_at_ms: i64,
    #[serde(default)]
    pub started_at_ms: Option<i64>,
    #[serde(default)]
    pub completed_at_ms: Option<i64>,
}

impl Job {
    #[must_use]
    pub fn new(
        blob_key: impl Into<String>,
        mime_type: impl Into<String>,
        original_name: impl Into<String>,
        size_bytes: u64,
    ) -> Self {
        let now_ms = current_timestamp_ms();
        Self {
            job_id: Uuid::new_v4().to_string(),
            status: JobStatus::Pending,
            blob_key: blob_key.into(),
            mime_type: mime_type.into(),
            original_name: original_name.into(),
            size_bytes,
            submitter: None,
            teacher_name: None,
            class_name: None,
            content_hash: None,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            method: None,
            complexity: None,
            error: None,
            result_blob_key: None,
            created_at_ms: now_ms,
            started_at_ms: None,
            completed_at_ms: None,
        }
    }
}

/// One append-only record per failed extraction attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryLogEntry {
    pub job_id: String,
    /// 1-based attempt number.
    pub attempt: u32,
    pub kind: ErrorKind,
    pub message: String,
    /// Source-chain detail for operators; not shown to clients.
    #[serde(default)]
    pub detail: Option<String>,
    pub at_ms: i64,
}

/// A webhook subscription attached to a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookRecord {
    pub webhook_id: String,
    pub job_id: String,
    pub url: String,
    #[serde(default)]
    pub attempts: u32,
    pub max_attempts: u32,
    #[serde(default)]
    pub delivered: bool,
    #[serde(default)]
    pub delivered_at_ms: Option<i64>,
    #[serde(default)]
    pub last_attempt_at_ms: Option<i64>,
    /// Earliest instant the next delivery attempt may run; `None` means
    /// immediately.
    #[serde(default)]
    pub next_attempt_at_ms: Option<i64>,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at_ms: i64,
}

impl WebhookRecord {
    #[must_use]
    pub fn new(job_id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            webhook_id: Uuid::new_v4().to_string(),
            job_id: job_id.into(),
            url: url.into(),
            attempts: 0,
            max_attempts: DEFAULT_WEBHOOK_MAX_ATTEMPTS,
            delivered: false,
            delivered_at_ms: None,
            last_attempt_at_ms: None,
            next_attempt_at_ms: None,
            error: None,
            created_at_ms: current_timestamp_ms(),
        }
    }

    /// Whether delivery should still be attempted.
    pub fn pending_delivery(&self) -> bool {
        !self.delivered && self.attempts < self.max_attempts
    }

    /// Whether the backoff window has passed.
    pub fn due(&self, now_ms: i64) -> bool {
        self.next_attempt_at_ms.map_or(true, |at| at <= now_ms)
    }
}

pub fn current_timestamp_ms() -> i64 {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    since_epoch.as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_job_sets_defaults() {
        let job = Job::new("uploads/anonymous/1-grid.png", "image/png", "grid.png", 512);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.max_retries, 3);
        assert!(job.method.is_none());
        assert!(job.result_blob_key.is_none());
        assert!(!job.job_id.is_empty());
    }

    #[test]
    fn terminal_states() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }

    #[test]
    fn webhook_delivery_window() {
        let mut hook = WebhookRecord::new("job-1", "https://example.com/hook");
        assert!(hook.pending_delivery());
        hook.attempts = 3;
        assert!(!hook.pending_delivery());
        hook.attempts = 1;
        hook.delivered = true;
        assert!(!hook.pending_delivery());
    }
}
