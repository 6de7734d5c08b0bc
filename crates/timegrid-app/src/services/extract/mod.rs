//! Extraction backends: structured (table-aware document AI), vision
//! (multimodal model), and the hybrid composition of the two.

pub mod hybrid;
pub mod structured;
pub mod vision;

use async_trait::async_trait;
use thiserror::Error;

use crate::error::ErrorKind;
use crate::timetable::ExtractedTimetable;

use super::model_client::ModelError;
use super::preprocess::ProcessedArtifact;

pub use hybrid::HybridBackend;
pub use structured::{DocTable, HttpTableRecognizer, StructuredBackend, TableRecognizer};
pub use vision::VisionBackend;

/// Caller-supplied metadata that overrides whatever the backends infer.
#[derive(Debug, Clone, Default)]
pub struct MetadataHint {
    pub teacher_name: Option<String>,
    pub class_name: Option<String>,
}

impl MetadataHint {
    /// Apply the hint on top of an extracted result.
    pub fn apply(&self, timetable: &mut ExtractedTimetable) {
        if self.teacher_name.is_some() {
            timetable.teacher_name = self.teacher_name.clone();
        }
        if self.class_name.is_some() {
            timetable.class_name = self.class_name.clone();
        }
    }
}

/// Errors produced by extraction backends.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("structured backend failed: {0}")]
    Structured(#[source] ModelError),
    #[error("vision backend failed: {0}")]
    Vision(#[source] ModelError),
    #[error("no timetable grid detected in artifact `{0}`")]
    NoGrid(String),
    #[error("backend response failed schema validation: {0}")]
    Schema(String),
}

impl ExtractError {
    /// Taxonomy tag recorded in the retry log and DLQ metadata.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExtractError::Structured(_) | ExtractError::NoGrid(_) => {
                ErrorKind::StructuredBackendError
            }
            ExtractError::Vision(_) => ErrorKind::VisionBackendError,
            ExtractError::Schema(_) => ErrorKind::ValidationError,
        }
    }
}

/// Uniform extraction capability implemented by all backends.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(
        &self,
        artifact: &ProcessedArtifact,
        hint: &MetadataHint,
    ) -> Result<ExtractedTimetable, ExtractError>;
}
