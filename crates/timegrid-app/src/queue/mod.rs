//! Work queue abstraction: at-least-once delivery with visibility timeout and
//! a paired dead-letter queue.

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub use memory::MemoryQueue;

/// Body of a queued work item. Field names follow the wire contract shared
/// with the submission facade.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkOrder {
    pub job_id: String,
    /// Blob key of the uploaded artifact.
    pub file_url: String,
    pub original_file_name: String,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub teacher_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// One received message. The receipt handle is only valid until the message's
/// visibility timeout expires; a later redelivery carries a fresh handle.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub message_id: String,
    pub receipt: String,
    pub body: String,
    pub attributes: Vec<(String, String)>,
}

/// Errors emitted by queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue transport error: {0}")]
    Transport(String),
    #[error("receipt handle `{0}` is stale or unknown")]
    StaleReceipt(String),
}

/// At-least-once work queue.
///
/// `receive` hides returned messages from other consumers for the queue's
/// visibility timeout; consumers that neither delete nor finish in time will
/// see the message again. Duplicates are expected and must be benign.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue a message body with broker-level attributes, returning its
    /// message id.
    async fn send(
        &self,
        body: String,
        attributes: Vec<(String, String)>,
    ) -> Result<String, QueueError>;

    /// Long-poll for up to `wait`; returns between zero and `max` messages.
    async fn receive(&self, max: usize, wait: Duration) -> Result<Vec<QueueMessage>, QueueError>;

    /// Remove a message for good. Stale receipts are ignored: the message was
    /// already redelivered under a fresh handle.
    async fn delete(&self, receipt: &str) -> Result<(), QueueError>;

    /// Copy a permanently failed message onto the dead-letter queue.
    async fn send_dlq(&self, body: String, error: &str) -> Result<(), QueueError>;
}
