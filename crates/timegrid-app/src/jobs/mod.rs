//! Durable job records, retry log, and webhook registrations.

pub mod model;
pub mod store;

pub use model::{
    current_timestamp_ms, Job, JobStatus, RetryLogEntry, WebhookRecord, DEFAULT_MAX_RETRIES,
    DEFAULT_WEBHOOK_MAX_ATTEMPTS,
};
pub use store::{
    CompletionOutcome, JobFilter, JobPage, JobStore, JobStoreError, LmdbJobStore, MemoryJobStore,
};
