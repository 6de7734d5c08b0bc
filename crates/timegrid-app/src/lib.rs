//! Asynchronous timetable extraction pipeline.
//!
//! The crate is organised leaves-first: `timetable` holds the pure data model
//! and timeline validator, `jobs`/`queue`/`services` provide the durable job
//! lifecycle and the capability interfaces it runs against, and `worker`
//! drains the queue with bounded concurrency. The HTTP surface lives in the
//! sibling `timegrid-server` crate.

pub mod config;
pub mod error;
pub mod jobs;
pub mod paths;
pub mod pdf;
pub mod queue;
pub mod services;
pub mod timetable;
pub mod worker;

pub use config::{AppConfig, BackendConfig, PipelineConfig, StorageConfig};
pub use error::AppError;
pub use paths::{AppPaths, PathError};
