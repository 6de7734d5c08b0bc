//! Orchestration layer for IO-bound pipeline services.
//!
//! Modules here coordinate external systems (blob storage, model providers,
//! webhook targets) or compose them into pipeline stages. Pure transforms
//! live in `crate::timetable`; keep them out of this tree so concurrency and
//! resource accounting stay localized.

pub mod blob_store;
pub mod complexity;
pub mod extract;
pub mod model_client;
pub mod ocr;
pub mod orchestrator;
pub mod preprocess;
pub mod submission;
pub mod webhook;

pub use blob_store::{BlobError, BlobStore, FsBlobStore, MemoryBlobStore};
pub use complexity::{classify, ComplexityLevel, ComplexityReport, RecommendedBackend};
pub use extract::{
    ExtractError, Extractor, HybridBackend, MetadataHint, StructuredBackend, VisionBackend,
};
pub use model_client::{ChatModel, ChatRequest, HttpChatModel, ImageAttachment, ModelError};
pub use ocr::{ChatOcr, OcrConfig, OcrEngine, OcrError};
pub use orchestrator::{ExtractionMethod, ExtractionOrchestrator, ExtractionOutcome};
pub use preprocess::{FilePreprocessor, PreprocessError, ProcessedArtifact};
pub use submission::{
    SubmissionFacade, SubmissionOutcome, SubmissionRequest, SubmitError, MAX_ARTIFACT_BYTES,
};
pub use webhook::{WebhookError, WebhookNotifier};
