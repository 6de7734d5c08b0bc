//! Worker pool: drains the job queue with bounded concurrency.
//!
//! Each worker long-polls for one message at a time, runs the extraction
//! orchestrator, and owns the retry/dead-letter protocol. Workers share no
//! mutable in-process state; the job store's compare-and-set transitions and
//! the queue's visibility timeout carry all the coordination.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::config::PipelineConfig;
use crate::error::ErrorKind;
use crate::jobs::{
    current_timestamp_ms, JobStatus, JobStore, JobStoreError, RetryLogEntry,
};
use crate::queue::{JobQueue, QueueMessage, WorkOrder};
use crate::services::blob_store::{self, BlobStore};
use crate::services::orchestrator::ExtractionOrchestrator;
use crate::services::preprocess::{FilePreprocessor, PreprocessError};
use crate::services::webhook::WebhookNotifier;
use crate::services::MetadataHint;

/// How long shutdown waits for in-flight jobs before abandoning them to the
/// visibility timeout.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);
const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_secs(1);
/// Cadence of the undelivered-webhook sweep.
const WEBHOOK_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const WEBHOOK_SWEEP_BATCH: usize = 100;

/// Everything a worker needs; cheap to clone behind an `Arc`.
pub struct WorkerDeps {
    pub queue: Arc<dyn JobQueue>,
    pub store: Arc<dyn JobStore>,
    pub blob: Arc<dyn BlobStore>,
    pub preprocessor: Arc<FilePreprocessor>,
    pub orchestrator: Arc<ExtractionOrchestrator>,
    pub notifier: Arc<WebhookNotifier>,
    pub config: PipelineConfig,
}

/// A classified pipeline failure ready for the retry protocol.
#[derive(Debug)]
struct PipelineFailure {
    kind: ErrorKind,
    message: String,
    detail: Option<String>,
}

impl PipelineFailure {
    fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            detail: None,
        }
    }

    fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

pub struct WorkerPool {
    deps: Arc<WorkerDeps>,
}

impl WorkerPool {
    pub fn new(deps: WorkerDeps) -> Self {
        Self {
            deps: Arc::new(deps),
        }
    }

    /// Run until `shutdown` flips to true, then wait (bounded) for in-flight
    /// jobs. Messages still held at exit reappear after the visibility
    /// timeout.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let concurrency = self.deps.config.worker_concurrency.max(1);
        tracing::info!(concurrency, "worker pool starting");

        let mut workers = JoinSet::new();
        for worker_idx in 0..concurrency {
            let deps = Arc::clone(&self.deps);
            let shutdown = shutdown.clone();
            workers.spawn(async move {
                worker_loop(deps, worker_idx, shutdown).await;
            });
        }
        {
            let deps = Arc::clone(&self.deps);
            let shutdown = shutdown.clone();
            workers.spawn(async move {
                webhook_sweep_loop(deps, shutdown).await;
            });
        }

        // A closed channel counts as a shutdown request.
        if !*shutdown.borrow() {
            let _ = shutdown.changed().await;
        }

        let drain = async {
            while workers.join_next().await.is_some() {}
        };
        if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            tracing::warn!(
                grace_secs = SHUTDOWN_GRACE.as_secs(),
                "shutdown grace elapsed; abandoning in-flight jobs to the visibility timeout"
            );
            workers.abort_all();
        }
        tracing::info!("worker pool stopped");
    }
}

async fn worker_loop(deps: Arc<WorkerDeps>, worker_idx: usize, mut shutdown: watch::Receiver<bool>) {
    tracing::debug!(worker_idx, "worker started");
    loop {
        if *shutdown.borrow() {
            break;
        }

        let received = tokio::select! {
            received = deps.queue.receive(1, deps.config.long_poll()) => received,
            _ = shutdown.changed() => break,
        };

        match received {
            Ok(messages) => {
                for message in messages {
                    process_message(&deps, message).await;
                }
            }
            Err(error) => {
                tracing::error!(worker_idx, %error, "queue receive failed");
                tokio::time::sleep(RECEIVE_ERROR_BACKOFF).await;
            }
        }
    }
    tracing::debug!(worker_idx, "worker stopped");
}

/// Periodic redelivery of webhooks that failed their first attempts.
async fn webhook_sweep_loop(deps: Arc<WorkerDeps>, mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(WEBHOOK_SWEEP_INTERVAL) => {}
            _ = shutdown.changed() => break,
        }
        match deps.notifier.sweep_undelivered(WEBHOOK_SWEEP_BATCH).await {
            Ok(0) => {}
            Ok(count) => tracing::info!(count, "webhook sweep re-attempted deliveries"),
            Err(error) => tracing::error!(%error, "webhook sweep failed"),
        }
    }
}

/// Handle one delivery end to end. Exposed so integration tests can drive the
/// protocol without standing up the pool.
pub async fn process_message(deps: &WorkerDeps, message: QueueMessage) {
    let order: WorkOrder = match serde_json::from_str(&message.body) {
        Ok(order) => order,
        Err(error) => {
            tracing::warn!(%error, message_id = %message.message_id, "unparseable queue message dropped");
            delete_message(deps, &message).await;
            return;
        }
    };
    let job_id = order.job_id.clone();

    let job = match deps.store.get_job(&job_id) {
        Ok(Some(job)) => job,
        Ok(None) => {
            tracing::warn!(%job_id, "message references unknown job; dropping");
            delete_message(deps, &message).await;
            return;
        }
        Err(error) => {
            // Leave the message for redelivery; the store may recover.
            tracing::error!(%job_id, %error, "job store read failed");
            return;
        }
    };

    match job.status {
        JobStatus::Cancelled => {
            tracing::info!(%job_id, "job cancelled before processing; dropping message");
            delete_message(deps, &message).await;
            return;
        }
        JobStatus::Completed => {
            tracing::debug!(%job_id, "duplicate delivery of completed job; dropping message");
            delete_message(deps, &message).await;
            return;
        }
        JobStatus::Failed => {
            tracing::debug!(%job_id, "delivery of terminally failed job; dropping message");
            delete_message(deps, &message).await;
            return;
        }
        JobStatus::Pending | JobStatus::Processing => {}
    }

    let job = match deps.store.begin_processing(&job_id, current_timestamp_ms()) {
        Ok(job) => job,
        Err(JobStoreError::InvalidTransition { from, .. }) => {
            // Lost a race with cancellation or a faster worker.
            tracing::info!(%job_id, from = from.as_str(), "job no longer startable; dropping message");
            delete_message(deps, &message).await;
            return;
        }
        Err(error) => {
            tracing::error!(%job_id, %error, "failed to transition job to processing");
            return;
        }
    };

    match run_pipeline(deps, &order).await {
        Ok(()) => {}
        Err(failure) => {
            handle_failure(deps, &job.job_id, job.retry_count, failure, &message).await;
            return;
        }
    }

    delete_message(deps, &message).await;
    if let Err(error) = deps.notifier.notify_completed(&job_id).await {
        tracing::error!(%job_id, %error, "webhook notification failed");
    }
}

/// Fetch → preprocess → orchestrate → persist. Returns a classified failure
/// for anything that should enter the retry protocol.
async fn run_pipeline(deps: &WorkerDeps, order: &WorkOrder) -> Result<(), PipelineFailure> {
    let job_id = &order.job_id;

    let artifact_bytes = deps
        .blob
        .get(&order.file_url)
        .await
        .map_err(|e| PipelineFailure::new(ErrorKind::BlobError, e.to_string()))?;

    let artifact = deps
        .preprocessor
        .preprocess(artifact_bytes, &order.mime_type, &order.original_file_name)
        .await
        .map_err(classify_preprocess_failure)?;

    let hint = MetadataHint {
        teacher_name: order.teacher_name.clone(),
        class_name: order.class_name.clone(),
    };
    let outcome = deps
        .orchestrator
        .run(&artifact, &hint)
        .await
        .map_err(|e| {
            PipelineFailure::new(e.kind(), e.to_string()).with_detail(format!("{e:?}"))
        })?;

    tracing::info!(
        %job_id,
        method = outcome.method.as_ref(),
        complexity = outcome.complexity.level.as_ref(),
        elapsed_ms = outcome.elapsed_ms,
        blocks = outcome.data.blocks.len(),
        "extraction finished"
    );

    let result_json = serde_json::to_vec_pretty(&outcome.data)
        .map_err(|e| PipelineFailure::new(ErrorKind::UnknownError, e.to_string()))?;
    let result_key = blob_store::result_key(job_id);
    deps.blob
        .put(&result_key, result_json, "application/json")
        .await
        .map_err(|e| PipelineFailure::new(ErrorKind::BlobError, e.to_string()))?;

    let completion = deps
        .store
        .complete_job(
            job_id,
            &outcome.data,
            outcome.method.as_ref(),
            outcome.complexity.level.as_ref(),
            &result_key,
            current_timestamp_ms(),
        )
        .map_err(|e| PipelineFailure::new(ErrorKind::StoreError, e.to_string()))?;

    match completion {
        crate::jobs::CompletionOutcome::Applied => Ok(()),
        crate::jobs::CompletionOutcome::AlreadyCompleted => {
            tracing::debug!(%job_id, "concurrent delivery already completed this job");
            Ok(())
        }
    }
}

fn classify_preprocess_failure(error: PreprocessError) -> PipelineFailure {
    let kind = match &error {
        PreprocessError::UnsupportedType(_) => ErrorKind::UnsupportedType,
        // Evidence extraction failures: decode, text layer, container.
        _ => ErrorKind::OcrError,
    };
    PipelineFailure::new(kind, error.to_string())
}

/// Retry protocol. Below the retry budget the message is left in place and
/// reappears after the visibility timeout; at the budget the job fails, the
/// message is echoed to the DLQ once, and removed from the main queue.
async fn handle_failure(
    deps: &WorkerDeps,
    job_id: &str,
    prior_retries: u32,
    failure: PipelineFailure,
    message: &QueueMessage,
) {
    let attempt = prior_retries + 1;
    let entry = RetryLogEntry {
        job_id: job_id.to_string(),
        attempt,
        kind: failure.kind,
        message: failure.message.clone(),
        detail: failure.detail.clone(),
        at_ms: current_timestamp_ms(),
    };

    let job = match deps.store.record_attempt_failure(&entry) {
        Ok(job) => job,
        Err(error) => {
            tracing::error!(job_id, %error, "failed to record retry-log entry");
            return;
        }
    };

    if job.retry_count < job.max_retries {
        tracing::warn!(
            job_id,
            attempt,
            max_retries = job.max_retries,
            kind = failure.kind.as_ref(),
            error = %failure.message,
            "attempt failed; message left for redelivery after visibility timeout"
        );
        return;
    }

    match deps
        .store
        .fail_job(job_id, &failure.message, current_timestamp_ms())
    {
        Ok(_) => {
            let annotation = format!("{}: {}", failure.kind.as_ref(), failure.message);
            if let Err(error) = deps.queue.send_dlq(message.body.clone(), &annotation).await {
                tracing::error!(job_id, %error, "failed to copy message to DLQ");
            }
            tracing::error!(
                job_id,
                attempts = job.retry_count,
                kind = failure.kind.as_ref(),
                "job failed terminally; echoed to DLQ"
            );
        }
        Err(JobStoreError::InvalidTransition { from, .. }) => {
            // Another delivery already finalized the job; do not double-DLQ.
            tracing::warn!(
                job_id,
                from = from.as_str(),
                "job already finalized; skipping DLQ echo"
            );
        }
        Err(error) => {
            tracing::error!(job_id, %error, "failed to mark job Failed");
            return;
        }
    }

    delete_message(deps, message).await;
}

async fn delete_message(deps: &WorkerDeps, message: &QueueMessage) {
    if let Err(error) = deps.queue.delete(&message.receipt).await {
        tracing::warn!(
            message_id = %message.message_id,
            %error,
            "failed to delete queue message"
        );
    }
}
