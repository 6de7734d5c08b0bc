//! Submission facade: accepts an artifact, persists it, creates the job
//! record, registers an optional webhook, and enqueues the work item.
//!
//! Client input errors are surfaced synchronously and create no job. The blob
//! upload and the job record must both exist before the enqueue; an enqueue
//! failure marks the job Failed so it never occupies the queue.

use std::sync::Arc;

use thiserror::Error;
use url::Url;

use crate::config::PipelineConfig;
use crate::jobs::{current_timestamp_ms, Job, JobStore, JobStoreError, WebhookRecord};
use crate::queue::{JobQueue, QueueError, WorkOrder};

use super::blob_store::{self, BlobError, BlobStore};
use super::preprocess;

/// Hard cap on accepted artifact size.
pub const MAX_ARTIFACT_BYTES: usize = 10 * 1024 * 1024;

/// One submission.
#[derive(Debug, Clone)]
pub struct SubmissionRequest {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub original_name: String,
    pub teacher_name: Option<String>,
    pub class_name: Option<String>,
    pub submitter: Option<String>,
    pub webhook_url: Option<String>,
}

/// What the facade reports back for an accepted submission.
#[derive(Debug, Clone)]
pub struct SubmissionOutcome {
    pub job_id: String,
    pub created_at_ms: i64,
    pub webhook_registered: bool,
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("unsupported artifact type `{0}`")]
    UnsupportedType(String),
    #[error("artifact of {size} bytes exceeds the {limit}-byte limit")]
    TooLarge { size: usize, limit: usize },
    #[error("artifact is empty")]
    EmptyArtifact,
    #[error("webhook URL `{0}` is not a valid http(s) URL")]
    InvalidWebhookUrl(String),
    #[error(transparent)]
    Blob(#[from] BlobError),
    #[error(transparent)]
    Store(#[from] Box<JobStoreError>),
    #[error("failed to enqueue job `{job_id}`: {source}")]
    Enqueue {
        job_id: String,
        #[source]
        source: QueueError,
    },
}

impl SubmitError {
    /// Whether the submitter caused this (4xx) as opposed to the system (5xx).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            SubmitError::UnsupportedType(_)
                | SubmitError::TooLarge { .. }
                | SubmitError::EmptyArtifact
                | SubmitError::InvalidWebhookUrl(_)
        )
    }
}

impl From<JobStoreError> for SubmitError {
    fn from(e: JobStoreError) -> Self {
        SubmitError::Store(Box::new(e))
    }
}

pub struct SubmissionFacade {
    blob: Arc<dyn BlobStore>,
    store: Arc<dyn JobStore>,
    queue: Arc<dyn JobQueue>,
    config: PipelineConfig,
}

impl SubmissionFacade {
    pub fn new(
        blob: Arc<dyn BlobStore>,
        store: Arc<dyn JobStore>,
        queue: Arc<dyn JobQueue>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            blob,
            store,
            queue,
            config,
        }
    }

    pub async fn submit(&self, request: SubmissionRequest) -> Result<SubmissionOutcome, SubmitError> {
        if !preprocess::is_supported_mime(&request.mime_type) {
            return Err(SubmitError::UnsupportedType(request.mime_type));
        }
        if request.bytes.is_empty() {
            return Err(SubmitError::EmptyArtifact);
        }
        if request.bytes.len() > MAX_ARTIFACT_BYTES {
            return Err(SubmitError::TooLarge {
                size: request.bytes.len(),
                limit: MAX_ARTIFACT_BYTES,
            });
        }
        if let Some(raw) = &request.webhook_url {
            let parsed = Url::parse(raw).map_err(|_| SubmitError::InvalidWebhookUrl(raw.clone()))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(SubmitError::InvalidWebhookUrl(raw.clone()));
            }
        }

        let now_ms = current_timestamp_ms();
        let blob_key = blob_store::upload_key(
            request.submitter.as_deref(),
            now_ms,
            &request.original_name,
        );
        let hash = blob_store::content_hash(&request.bytes);
        let size = request.bytes.len() as u64;

        self.blob
            .put(&blob_key, request.bytes, &request.mime_type)
            .await?;

        let mut job = Job::new(&blob_key, &request.mime_type, &request.original_name, size);
        job.submitter = request.submitter.clone();
        job.teacher_name = request.teacher_name.clone();
        job.class_name = request.class_name.clone();
        job.content_hash = Some(hash);
        job.max_retries = self.config.max_retries;
        self.store.create_job(&job)?;

        let webhook_registered = match &request.webhook_url {
            Some(url) => {
                // Registered before the enqueue so a fast worker cannot finish
                // the job ahead of the subscription.
                let hook = WebhookRecord::new(&job.job_id, url);
                self.store.create_webhook(&hook)?;
                true
            }
            None => false,
        };

        let order = WorkOrder {
            job_id: job.job_id.clone(),
            file_url: blob_key,
            original_file_name: request.original_name,
            mime_type: request.mime_type,
            teacher_name: request.teacher_name,
            class_name: request.class_name,
            user_id: request.submitter,
        };
        let body = serde_json::to_string(&order).expect("work order serializes");
        let attributes = vec![
            ("jobId".to_string(), job.job_id.clone()),
            ("mimeType".to_string(), job.mime_type.clone()),
        ];

        if let Err(source) = self.queue.send(body, attributes).await {
            let message = format!("enqueue_error: {source}");
            if let Err(store_err) = self.store.fail_job(&job.job_id, &message, now_ms) {
                tracing::error!(
                    job_id = %job.job_id,
                    %store_err,
                    "failed to mark job Failed after enqueue error"
                );
            }
            return Err(SubmitError::Enqueue {
                job_id: job.job_id,
                source,
            });
        }

        tracing::info!(
            job_id = %job.job_id,
            mime = %job.mime_type,
            size_bytes = size,
            webhook_registered,
            "job submitted"
        );
        Ok(SubmissionOutcome {
            job_id: job.job_id,
            created_at_ms: job.created_at_ms,
            webhook_registered,
        })
    }
}
