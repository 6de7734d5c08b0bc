//! Hybrid extraction: the structured backend produces a draft and the vision
//! backend checks it against the original artifact, correcting entries and
//! identifying recurring fixtures. A failed validation call is non-fatal; the
//! structured draft is returned unchanged.

use std::sync::Arc;

use async_trait::async_trait;

use crate::services::preprocess::ProcessedArtifact;
use crate::timetable::ExtractedTimetable;

use super::vision::VisionBackend;
use super::{ExtractError, Extractor, MetadataHint};

pub struct HybridBackend {
    structured: Arc<dyn Extractor>,
    vision: Arc<VisionBackend>,
}

impl HybridBackend {
    pub fn new(structured: Arc<dyn Extractor>, vision: Arc<VisionBackend>) -> Self {
        Self { structured, vision }
    }
}

#[async_trait]
impl Extractor for HybridBackend {
    async fn extract(
        &self,
        artifact: &ProcessedArtifact,
        hint: &MetadataHint,
    ) -> Result<ExtractedTimetable, ExtractError> {
        let draft = self.structured.extract(artifact, hint).await?;

        match self.vision.validate_extraction(artifact, &draft).await {
            Ok(mut validated) => {
                hint.apply(&mut validated);
                Ok(validated)
            }
            Err(error) => {
                tracing::warn!(
                    %error,
                    artifact = %artifact.name,
                    "hybrid validation pass failed; keeping structured draft"
                );
                Ok(draft)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::model_client::{ChatModel, ChatRequest, ModelError};
    use crate::timetable::{TimeBlock, Weekday};

    struct FixedStructured(ExtractedTimetable);

    #[async_trait]
    impl Extractor for FixedStructured {
        async fn extract(
            &self,
            _artifact: &ProcessedArtifact,
            _hint: &MetadataHint,
        ) -> Result<ExtractedTimetable, ExtractError> {
            Ok(self.0.clone())
        }
    }

    struct FailingStructured;

    #[async_trait]
    impl Extractor for FailingStructured {
        async fn extract(
            &self,
            _artifact: &ProcessedArtifact,
            _hint: &MetadataHint,
        ) -> Result<ExtractedTimetable, ExtractError> {
            Err(ExtractError::NoGrid("grid.png".to_string()))
        }
    }

    struct CannedModel(&'static str);

    #[async_trait]
    impl ChatModel for CannedModel {
        async fn complete(&self, _request: ChatRequest) -> Result<String, ModelError> {
            Ok(self.0.to_string())
        }
    }

    struct DownModel;

    #[async_trait]
    impl ChatModel for DownModel {
        async fn complete(&self, _request: ChatRequest) -> Result<String, ModelError> {
            Err(ModelError::Status {
                status: 503,
                body: "overloaded".to_string(),
            })
        }
    }

    fn artifact() -> ProcessedArtifact {
        ProcessedArtifact {
            text: Some("Monday 09:00-10:00 Maths".to_string()),
            image_png: Some(vec![0u8; 4]),
            mime_type: "image/png".to_string(),
            name: "grid.png".to_string(),
        }
    }

    fn draft() -> ExtractedTimetable {
        ExtractedTimetable {
            blocks: vec![TimeBlock::new(Weekday::Monday, 540, 600, "Maths")],
            ..ExtractedTimetable::default()
        }
    }

    #[tokio::test]
    async fn validation_result_replaces_draft() {
        let corrected = r#"{"metadata":{"teacherName":null,"className":null,"term":null,"week":null},
"blocks":[{"day":"Monday","startTime":"09:00","endTime":"10:00","eventName":"Mathematics"}],
"recurringBlocks":[{"startTime":"10:30","endTime":"10:45","eventName":"Break","appliesDaily":true,"notes":null}],
"warnings":["renamed Maths to Mathematics"]}"#;
        let backend = HybridBackend::new(
            Arc::new(FixedStructured(draft())),
            Arc::new(VisionBackend::new(Arc::new(CannedModel(corrected)))),
        );
        let result = backend
            .extract(&artifact(), &MetadataHint::default())
            .await
            .expect("extract");
        assert_eq!(result.blocks[0].event_name, "Mathematics");
        assert_eq!(result.recurring_blocks.len(), 1);
        assert!(!result.warnings.is_empty());
    }

    #[tokio::test]
    async fn failed_validation_keeps_structured_draft() {
        let backend = HybridBackend::new(
            Arc::new(FixedStructured(draft())),
            Arc::new(VisionBackend::new(Arc::new(DownModel))),
        );
        let result = backend
            .extract(&artifact(), &MetadataHint::default())
            .await
            .expect("draft survives validation outage");
        assert_eq!(result.blocks[0].event_name, "Maths");
        assert!(result.recurring_blocks.is_empty());
    }

    #[tokio::test]
    async fn structured_failure_propagates() {
        let backend = HybridBackend::new(
            Arc::new(FailingStructured),
            Arc::new(VisionBackend::new(Arc::new(DownModel))),
        );
        let err = backend
            .extract(&artifact(), &MetadataHint::default())
            .await
            .expect_err("structured failure is fatal for hybrid");
        assert!(matches!(err, ExtractError::NoGrid(_)));
    }
}
