//! Job store: durable records, retry log, webhook registrations, results.
//!
//! All status mutations that depend on a prior status are compare-and-set
//! inside a single write transaction; the store is the serialization point for
//! the job lifecycle. The Completed transition persists the extraction result
//! and the job update atomically.

use bincode::config;
use bincode::error::{DecodeError, EncodeError};
use bincode::serde::{decode_from_slice, encode_to_vec};
use heed::types::{Bytes, Str};
use heed::{Database, Env, EnvOpenOptions};
use thiserror::Error;

use crate::paths::{AppPaths, PathError};
use crate::timetable::ExtractedTimetable;

use super::model::{Job, JobStatus, RetryLogEntry, WebhookRecord};

const JOB_ENV_MAP_SIZE_BYTES: usize = 1 << 28; // 256 MiB
const JOBS_DB: &str = "jobs";
const RESULTS_DB: &str = "results";
const RETRIES_DB: &str = "retries";
const WEBHOOKS_DB: &str = "webhooks";

/// Errors emitted by the job store.
#[derive(Debug, Error)]
pub enum JobStoreError {
    #[error(transparent)]
    Path(#[from] PathError),
    #[error(transparent)]
    Heed(#[from] heed::Error),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("job `{0}` already exists")]
    Duplicate(String),
    #[error("job `{0}` not found")]
    NotFound(String),
    #[error("job `{job_id}` cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        job_id: String,
        from: JobStatus,
        to: JobStatus,
    },
}

/// Outcome of the conditional Completed transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// The job moved from Processing to Completed and the result was stored.
    Applied,
    /// Another delivery already completed the job; nothing was written.
    AlreadyCompleted,
}

/// Listing filter; `page` is 1-based.
#[derive(Debug, Clone)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub page: usize,
    pub per_page: usize,
}

impl Default for JobFilter {
    fn default() -> Self {
        Self {
            status: None,
            page: 1,
            per_page: 20,
        }
    }
}

/// One page of job records, newest first.
#[derive(Debug, Clone)]
pub struct JobPage {
    pub jobs: Vec<Job>,
    pub total: usize,
    pub page: usize,
    pub per_page: usize,
}

/// Durable persistence for jobs, retry log, webhooks, and results.
pub trait JobStore: Send + Sync {
    fn create_job(&self, job: &Job) -> Result<(), JobStoreError>;

    fn get_job(&self, job_id: &str) -> Result<Option<Job>, JobStoreError>;

    fn list_jobs(&self, filter: &JobFilter) -> Result<JobPage, JobStoreError>;

    /// Move a job into Processing, stamping `started_at_ms`. Accepts Pending
    /// (first delivery) and Processing (redelivery after a worker crash or
    /// visibility-timeout expiry); rejects terminal states.
    fn begin_processing(&self, job_id: &str, now_ms: i64) -> Result<Job, JobStoreError>;

    /// Cancel a Pending job. Any other state is an invalid transition.
    fn cancel_job(&self, job_id: &str, now_ms: i64) -> Result<Job, JobStoreError>;

    /// Append a retry-log row and raise the job's retry count to the attempt
    /// number, recording the error message. Single transaction.
    fn record_attempt_failure(&self, entry: &RetryLogEntry) -> Result<Job, JobStoreError>;

    /// Terminal failure: Processing → Failed with `completed_at_ms` stamped.
    fn fail_job(&self, job_id: &str, error: &str, now_ms: i64) -> Result<Job, JobStoreError>;

    /// Conditional completion: applies only while the job is Processing, and
    /// persists the result rows in the same transaction. A job already
    /// Completed yields [`CompletionOutcome::AlreadyCompleted`] without any
    /// write, which makes duplicate queue deliveries benign.
    #[allow(clippy::too_many_arguments)]
    fn complete_job(
        &self,
        job_id: &str,
        result: &ExtractedTimetable,
        method: &str,
        complexity: &str,
        result_blob_key: &str,
        now_ms: i64,
    ) -> Result<CompletionOutcome, JobStoreError>;

    fn get_result(&self, job_id: &str) -> Result<Option<ExtractedTimetable>, JobStoreError>;

    fn retry_log(&self, job_id: &str) -> Result<Vec<RetryLogEntry>, JobStoreError>;

    fn create_webhook(&self, hook: &WebhookRecord) -> Result<(), JobStoreError>;

    fn webhooks_for_job(&self, job_id: &str) -> Result<Vec<WebhookRecord>, JobStoreError>;

    fn update_webhook(&self, hook: &WebhookRecord) -> Result<(), JobStoreError>;

    /// Undelivered webhooks of Completed jobs whose backoff window has
    /// passed, oldest first. Feeds the periodic delivery sweep.
    fn due_webhooks(&self, now_ms: i64, limit: usize) -> Result<Vec<WebhookRecord>, JobStoreError>;
}

/// LMDB-backed job store.
#[derive(Debug)]
pub struct LmdbJobStore {
    env: Env,
    jobs: Database<Str, Bytes>,
    results: Database<Str, Bytes>,
    retries: Database<Str, Bytes>,
    webhooks: Database<Str, Bytes>,
}

impl LmdbJobStore {
    pub fn open(paths: &AppPaths) -> Result<Self, JobStoreError> {
        let path = paths.jobs_lmdb_dir()?;
        debug_assert!(path.exists());

        let mut options = EnvOpenOptions::new();
        options.max_dbs(8);
        options.map_size(JOB_ENV_MAP_SIZE_BYTES);
        let env = unsafe {
            // SAFETY: LMDB requires callers to uphold environment lifetime invariants.
            options.open(&path)?
        };

        let mut wtxn = env.write_txn()?;
        let jobs = env.create_database::<Str, Bytes>(&mut wtxn, Some(JOBS_DB))?;
        let results = env.create_database::<Str, Bytes>(&mut wtxn, Some(RESULTS_DB))?;
        let retries = env.create_database::<Str, Bytes>(&mut wtxn, Some(RETRIES_DB))?;
        let webhooks = env.create_database::<Str, Bytes>(&mut wtxn, Some(WEBHOOKS_DB))?;
        wtxn.commit()?;

        Ok(Self {
            env,
            jobs,
            results,
            retries,
            webhooks,
        })
    }

    fn read_job(
        &self,
        txn: &heed::RoTxn<'_>,
        job_id: &str,
    ) -> Result<Option<Job>, JobStoreError> {
        let value = self.jobs.get(txn, job_id)?;
        match value {
            Some(raw) => {
                let (job, _) = decode_from_slice::<Job, _>(raw, config::standard())?;
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    fn write_job(&self, txn: &mut heed::RwTxn<'_>, job: &Job) -> Result<(), JobStoreError> {
        let encoded = encode_to_vec(job, config::standard())?;
        self.jobs.put(txn, job.job_id.as_str(), encoded.as_slice())?;
        Ok(())
    }

    fn retry_key(job_id: &str, attempt: u32) -> String {
        format!("{job_id}#{attempt:04}")
    }
}

impl JobStore for LmdbJobStore {
    fn create_job(&self, job: &Job) -> Result<(), JobStoreError> {
        debug_assert!(!job.job_id.is_empty());
        debug_assert!(job.status == JobStatus::Pending);

        let mut wtxn = self.env.write_txn()?;
        if self.jobs.get(&wtxn, job.job_id.as_str())?.is_some() {
            return Err(JobStoreError::Duplicate(job.job_id.clone()));
        }
        self.write_job(&mut wtxn, job)?;
        wtxn.commit()?;
        Ok(())
    }

    fn get_job(&self, job_id: &str) -> Result<Option<Job>, JobStoreError> {
        debug_assert!(!job_id.is_empty());
        let rtxn = self.env.read_txn()?;
        self.read_job(&rtxn, job_id)
    }

    fn list_jobs(&self, filter: &JobFilter) -> Result<JobPage, JobStoreError> {
        debug_assert!(filter.page >= 1);
        debug_assert!(filter.per_page > 0);

        let rtxn = self.env.read_txn()?;
        let iter = self.jobs.iter(&rtxn)?;
        let mut matched = Vec::new();
        for entry in iter {
            let (_, raw) = entry?;
            let (job, _) = decode_from_slice::<Job, _>(raw, config::standard())?;
            if let Some(status) = filter.status {
                if job.status != status {
                    continue;
                }
            }
            matched.push(job);
        }
        matched.sort_by(|a, b| b.created_at_ms.cmp(&a.created_at_ms));

        let total = matched.len();
        let start = filter.per_page.saturating_mul(filter.page.saturating_sub(1));
        let jobs = matched
            .into_iter()
            .skip(start)
            .take(filter.per_page)
            .collect();
        Ok(JobPage {
            jobs,
            total,
            page: filter.page,
            per_page: filter.per_page,
        })
    }

    fn begin_processing(&self, job_id: &str, now_ms: i64) -> Result<Job, JobStoreError> {
        let mut wtxn = self.env.write_txn()?;
        let raw = self
            .jobs
            .get(&wtxn, job_id)?
            .ok_or_else(|| JobStoreError::NotFound(job_id.to_string()))?;
        let (mut job, _) = decode_from_slice::<Job, _>(raw, config::standard())?;

        match job.status {
            JobStatus::Pending | JobStatus::Processing => {
                job.status = JobStatus::Processing;
                job.started_at_ms = Some(now_ms);
            }
            from => {
                return Err(JobStoreError::InvalidTransition {
                    job_id: job_id.to_string(),
                    from,
                    to: JobStatus::Processing,
                });
            }
        }
        self.write_job(&mut wtxn, &job)?;
        wtxn.commit()?;
        Ok(job)
    }

    fn cancel_job(&self, job_id: &str, now_ms: i64) -> Result<Job, JobStoreError> {
        let mut wtxn = self.env.write_txn()?;
        let raw = self
            .jobs
            .get(&wtxn, job_id)?
            .ok_or_else(|| JobStoreError::NotFound(job_id.to_string()))?;
        let (mut job, _) = decode_from_slice::<Job, _>(raw, config::standard())?;

        if job.status != JobStatus::Pending {
            return Err(JobStoreError::InvalidTransition {
                job_id: job_id.to_string(),
                from: job.status,
                to: JobStatus::Cancelled,
            });
        }
        job.status = JobStatus::Cancelled;
        job.completed_at_ms = Some(now_ms);
        self.write_job(&mut wtxn, &job)?;
        wtxn.commit()?;
        Ok(job)
    }

    fn record_attempt_failure(&self, entry: &RetryLogEntry) -> Result<Job, JobStoreError> {
        debug_assert!(entry.attempt >= 1);

        let mut wtxn = self.env.write_txn()?;
        let raw = self
            .jobs
            .get(&wtxn, entry.job_id.as_str())?
            .ok_or_else(|| JobStoreError::NotFound(entry.job_id.clone()))?;
        let (mut job, _) = decode_from_slice::<Job, _>(raw, config::standard())?;

        job.retry_count = job.retry_count.max(entry.attempt);
        job.error = Some(entry.message.clone());
        self.write_job(&mut wtxn, &job)?;

        let encoded = encode_to_vec(entry, config::standard())?;
        self.retries.put(
            &mut wtxn,
            Self::retry_key(&entry.job_id, entry.attempt).as_str(),
            encoded.as_slice(),
        )?;
        wtxn.commit()?;
        Ok(job)
    }

    fn fail_job(&self, job_id: &str, error: &str, now_ms: i64) -> Result<Job, JobStoreError> {
        let mut wtxn = self.env.write_txn()?;
        let raw = self
            .jobs
            .get(&wtxn, job_id)?
            .ok_or_else(|| JobStoreError::NotFound(job_id.to_string()))?;
        let (mut job, _) = decode_from_slice::<Job, _>(raw, config::standard())?;

        match job.status {
            // Processing is the normal path; Pending covers enqueue failures
            // surfaced before any worker picked the job up.
            JobStatus::Processing | JobStatus::Pending => {
                job.status = JobStatus::Failed;
                job.error = Some(error.to_string());
                job.completed_at_ms = Some(now_ms);
            }
            from => {
                return Err(JobStoreError::InvalidTransition {
                    job_id: job_id.to_string(),
                    from,
                    to: JobStatus::Failed,
                });
            }
        }
        self.write_job(&mut wtxn, &job)?;
        wtxn.commit()?;
        Ok(job)
    }

    fn complete_job(
        &self,
        job_id: &str,
        result: &ExtractedTimetable,
        method: &str,
        complexity: &str,
        result_blob_key: &str,
        now_ms: i64,
    ) -> Result<CompletionOutcome, JobStoreError> {
        let mut wtxn = self.env.write_txn()?;
        let raw = self
            .jobs
            .get(&wtxn, job_id)?
            .ok_or_else(|| JobStoreError::NotFound(job_id.to_string()))?;
        let (mut job, _) = decode_from_slice::<Job, _>(raw, config::standard())?;

        match job.status {
            JobStatus::Completed => return Ok(CompletionOutcome::AlreadyCompleted),
            JobStatus::Processing => {}
            from => {
                return Err(JobStoreError::InvalidTransition {
                    job_id: job_id.to_string(),
                    from,
                    to: JobStatus::Completed,
                });
            }
        }

        job.status = JobStatus::Completed;
        job.method = Some(method.to_string());
        job.complexity = Some(complexity.to_string());
        job.result_blob_key = Some(result_blob_key.to_string());
        job.error = None;
        job.completed_at_ms = Some(now_ms);
        self.write_job(&mut wtxn, &job)?;

        let encoded = encode_to_vec(result, config::standard())?;
        self.results.put(&mut wtxn, job_id, encoded.as_slice())?;
        wtxn.commit()?;
        Ok(CompletionOutcome::Applied)
    }

    fn get_result(&self, job_id: &str) -> Result<Option<ExtractedTimetable>, JobStoreError> {
        let rtxn = self.env.read_txn()?;
        match self.results.get(&rtxn, job_id)? {
            Some(raw) => {
                let (result, _) =
                    decode_from_slice::<ExtractedTimetable, _>(raw, config::standard())?;
                Ok(Some(result))
            }
            None => Ok(None),
        }
    }

    fn retry_log(&self, job_id: &str) -> Result<Vec<RetryLogEntry>, JobStoreError> {
        let rtxn = self.env.read_txn()?;
        let iter = self.retries.iter(&rtxn)?;
        let mut entries = Vec::new();
        for entry in iter {
            let (_, raw) = entry?;
            let (row, _) = decode_from_slice::<RetryLogEntry, _>(raw, config::standard())?;
            if row.job_id == job_id {
                entries.push(row);
            }
        }
        entries.sort_by_key(|row| row.attempt);
        Ok(entries)
    }

    fn create_webhook(&self, hook: &WebhookRecord) -> Result<(), JobStoreError> {
        debug_assert!(!hook.webhook_id.is_empty());
        let mut wtxn = self.env.write_txn()?;
        let encoded = encode_to_vec(hook, config::standard())?;
        self.webhooks
            .put(&mut wtxn, hook.webhook_id.as_str(), encoded.as_slice())?;
        wtxn.commit()?;
        Ok(())
    }

    fn webhooks_for_job(&self, job_id: &str) -> Result<Vec<WebhookRecord>, JobStoreError> {
        let rtxn = self.env.read_txn()?;
        let iter = self.webhooks.iter(&rtxn)?;
        let mut hooks = Vec::new();
        for entry in iter {
            let (_, raw) = entry?;
            let (hook, _) = decode_from_slice::<WebhookRecord, _>(raw, config::standard())?;
            if hook.job_id == job_id {
                hooks.push(hook);
            }
        }
        hooks.sort_by_key(|hook| hook.created_at_ms);
        Ok(hooks)
    }

    fn update_webhook(&self, hook: &WebhookRecord) -> Result<(), JobStoreError> {
        let mut wtxn = self.env.write_txn()?;
        if self.webhooks.get(&wtxn, hook.webhook_id.as_str())?.is_none() {
            return Err(JobStoreError::NotFound(hook.webhook_id.clone()));
        }
        let encoded = encode_to_vec(hook, config::standard())?;
        self.webhooks
            .put(&mut wtxn, hook.webhook_id.as_str(), encoded.as_slice())?;
        wtxn.commit()?;
        Ok(())
    }

    fn due_webhooks(&self, now_ms: i64, limit: usize) -> Result<Vec<WebhookRecord>, JobStoreError> {
        debug_assert!(limit > 0);
        let rtxn = self.env.read_txn()?;
        let iter = self.webhooks.iter(&rtxn)?;
        let mut due = Vec::new();
        for entry in iter {
            let (_, raw) = entry?;
            let (hook, _) = decode_from_slice::<WebhookRecord, _>(raw, config::standard())?;
            if !hook.pending_delivery() || !hook.due(now_ms) {
                continue;
            }
            let completed = self
                .read_job(&rtxn, &hook.job_id)?
                .map_or(false, |job| job.status == JobStatus::Completed);
            if completed {
                due.push(hook);
            }
        }
        due.sort_by_key(|hook| hook.created_at_ms);
        due.truncate(limit);
        Ok(due)
    }
}

/// In-memory job store with the same compare-and-set semantics, used by tests
/// and single-process deployments that do not need durability.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    inner: std::sync::Mutex<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    jobs: std::collections::HashMap<String, Job>,
    results: std::collections::HashMap<String, ExtractedTimetable>,
    retries: Vec<RetryLogEntry>,
    webhooks: std::collections::HashMap<String, WebhookRecord>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().expect("job store mutex poisoned")
    }
}

impl JobStore for MemoryJobStore {
    fn create_job(&self, job: &Job) -> Result<(), JobStoreError> {
        let mut inner = self.lock();
        if inner.jobs.contains_key(&job.job_id) {
            return Err(JobStoreError::Duplicate(job.job_id.clone()));
        }
        inner.jobs.insert(job.job_id.clone(), job.clone());
        Ok(())
    }

    fn get_job(&self, job_id: &str) -> Result<Option<Job>, JobStoreError> {
        Ok(self.lock().jobs.get(job_id).cloned())
    }

    fn list_jobs(&self, filter: &JobFilter) -> Result<JobPage, JobStoreError> {
        let inner = self.lock();
        let mut matched: Vec<Job> = inner
            .jobs
            .values()
            .filter(|job| filter.status.map_or(true, |s| job.status == s))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.created_at_ms.cmp(&a.created_at_ms));
        let total = matched.len();
        let start = filter.per_page.saturating_mul(filter.page.saturating_sub(1));
        let jobs = matched
            .into_iter()
            .skip(start)
            .take(filter.per_page)
            .collect();
        Ok(JobPage {
            jobs,
            total,
            page: filter.page,
            per_page: filter.per_page,
        })
    }

    fn begin_processing(&self, job_id: &str, now_ms: i64) -> Result<Job, JobStoreError> {
        let mut inner = self.lock();
        let job = inner
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| JobStoreError::NotFound(job_id.to_string()))?;
        match job.status {
            JobStatus::Pending | JobStatus::Processing => {
                job.status = JobStatus::Processing;
                job.started_at_ms = Some(now_ms);
                Ok(job.clone())
            }
            from => Err(JobStoreError::InvalidTransition {
                job_id: job_id.to_string(),
                from,
                to: JobStatus::Processing,
            }),
        }
    }

    fn cancel_job(&self, job_id: &str, now_ms: i64) -> Result<Job, JobStoreError> {
        let mut inner = self.lock();
        let job = inner
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| JobStoreError::NotFound(job_id.to_string()))?;
        if job.status != JobStatus::Pending {
            return Err(JobStoreError::InvalidTransition {
                job_id: job_id.to_string(),
                from: job.status,
                to: JobStatus::Cancelled,
            });
        }
        job.status = JobStatus::Cancelled;
        job.completed_at_ms = Some(now_ms);
        Ok(job.clone())
    }

    fn record_attempt_failure(&self, entry: &RetryLogEntry) -> Result<Job, JobStoreError> {
        let mut inner = self.lock();
        let job = inner
            .jobs
            .get_mut(&entry.job_id)
            .ok_or_else(|| JobStoreError::NotFound(entry.job_id.clone()))?;
        job.retry_count = job.retry_count.max(entry.attempt);
        job.error = Some(entry.message.clone());
        let job = job.clone();
        inner.retries.push(entry.clone());
        Ok(job)
    }

    fn fail_job(&self, job_id: &str, error: &str, now_ms: i64) -> Result<Job, JobStoreError> {
        let mut inner = self.lock();
        let job = inner
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| JobStoreError::NotFound(job_id.to_string()))?;
        match job.status {
            JobStatus::Processing | JobStatus::Pending => {
                job.status = JobStatus::Failed;
                job.error = Some(error.to_string());
                job.completed_at_ms = Some(now_ms);
                Ok(job.clone())
            }
            from => Err(JobStoreError::InvalidTransition {
                job_id: job_id.to_string(),
                from,
                to: JobStatus::Failed,
            }),
        }
    }

    fn complete_job(
        &self,
        job_id: &str,
        result: &ExtractedTimetable,
        method: &str,
        complexity: &str,
        result_blob_key: &str,
        now_ms: i64,
    ) -> Result<CompletionOutcome, JobStoreError> {
        let mut inner = self.lock();
        let job = inner
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| JobStoreError::NotFound(job_id.to_string()))?;
        match job.status {
            JobStatus::Completed => return Ok(CompletionOutcome::AlreadyCompleted),
            JobStatus::Processing => {}
            from => {
                return Err(JobStoreError::InvalidTransition {
                    job_id: job_id.to_string(),
                    from,
                    to: JobStatus::Completed,
                });
            }
        }
        job.status = JobStatus::Completed;
        job.method = Some(method.to_string());
        job.complexity = Some(complexity.to_string());
        job.result_blob_key = Some(result_blob_key.to_string());
        job.error = None;
        job.completed_at_ms = Some(now_ms);
        inner.results.insert(job_id.to_string(), result.clone());
        Ok(CompletionOutcome::Applied)
    }

    fn get_result(&self, job_id: &str) -> Result<Option<ExtractedTimetable>, JobStoreError> {
        Ok(self.lock().results.get(job_id).cloned())
    }

    fn retry_log(&self, job_id: &str) -> Result<Vec<RetryLogEntry>, JobStoreError> {
        let inner = self.lock();
        let mut entries: Vec<RetryLogEntry> = inner
            .retries
            .iter()
            .filter(|row| row.job_id == job_id)
            .cloned()
            .collect();
        entries.sort_by_key(|row| row.attempt);
        Ok(entries)
    }

    fn create_webhook(&self, hook: &WebhookRecord) -> Result<(), JobStoreError> {
        self.lock()
            .webhooks
            .insert(hook.webhook_id.clone(), hook.clone());
        Ok(())
    }

    fn webhooks_for_job(&self, job_id: &str) -> Result<Vec<WebhookRecord>, JobStoreError> {
        let inner = self.lock();
        let mut hooks: Vec<WebhookRecord> = inner
            .webhooks
            .values()
            .filter(|hook| hook.job_id == job_id)
            .cloned()
            .collect();
        hooks.sort_by_key(|hook| hook.created_at_ms);
        Ok(hooks)
    }

    fn update_webhook(&self, hook: &WebhookRecord) -> Result<(), JobStoreError> {
        let mut inner = self.lock();
        if !inner.webhooks.contains_key(&hook.webhook_id) {
            return Err(JobStoreError::NotFound(hook.webhook_id.clone()));
        }
        inner.webhooks.insert(hook.webhook_id.clone(), hook.clone());
        Ok(())
    }

    fn due_webhooks(&self, now_ms: i64, limit: usize) -> Result<Vec<WebhookRecord>, JobStoreError> {
        let inner = self.lock();
        let mut due: Vec<WebhookRecord> = inner
            .webhooks
            .values()
            .filter(|hook| hook.pending_delivery() && hook.due(now_ms))
            .filter(|hook| {
                inner
                    .jobs
                    .get(&hook.job_id)
                    .map_or(false, |job| job.status == JobStatus::Completed)
            })
            .cloned()
            .collect();
        due.sort_by_key(|hook| hook.created_at_ms);
        due.truncate(limit);
        Ok(due)
    }
}
