//! Application-level error type and the failure taxonomy shared with the
//! retry log and dead-letter metadata.

use serde::{Deserialize, Serialize};
use strum::AsRefStr;
use thiserror::Error;

use crate::jobs::JobStoreError;
use crate::paths::PathError;
use crate::pdf::{PdfRenderError, PdfTextError};
use crate::queue::QueueError;
use crate::services::blob_store::BlobError;
use crate::services::extract::ExtractError;
use crate::services::model_client::ModelError;
use crate::services::ocr::OcrError;
use crate::services::preprocess::PreprocessError;
use crate::services::submission::SubmitError;
use crate::services::webhook::WebhookError;

/// Failure classification used in retry-log rows and DLQ annotations. The
/// worker routes retries on these tags rather than matching message strings.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    OcrError,
    StructuredBackendError,
    VisionBackendError,
    /// The backend responded, but its payload failed schema validation.
    ValidationError,
    BlobError,
    StoreError,
    EnqueueError,
    UnsupportedType,
    UnknownError,
}

/// Crate-level error shared across the pipeline and the CLI.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] crate::config::AppConfigError),
    #[error(transparent)]
    Paths(#[from] PathError),
    #[error(transparent)]
    Blob(#[from] BlobError),
    #[error(transparent)]
    Jobs(#[from] Box<JobStoreError>),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Pdf(#[from] PdfTextError),
    #[error(transparent)]
    PdfRender(#[from] PdfRenderError),
    #[error(transparent)]
    Ocr(#[from] OcrError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Preprocess(#[from] PreprocessError),
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error(transparent)]
    Submit(#[from] SubmitError),
    #[error(transparent)]
    Webhook(#[from] WebhookError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("failed to read input file {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl From<JobStoreError> for AppError {
    fn from(e: JobStoreError) -> Self {
        AppError::Jobs(Box::new(e))
    }
}
