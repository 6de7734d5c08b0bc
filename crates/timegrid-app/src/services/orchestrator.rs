//! Extraction orchestrator: preprocessed artifact in, validated timetable out.
//!
//! Drives router → backend selection → extraction → in-process vision fallback
//! → timeline validation, and reports which path actually ran. Transport-level
//! retries are not handled here; job-level retry belongs to the worker pool.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use strum::AsRefStr;

use crate::config::PipelineConfig;
use crate::timetable::{validate_timeline, ExtractedTimetable};

use super::complexity::{self, ComplexityReport, RecommendedBackend};
use super::extract::{ExtractError, Extractor, MetadataHint};
use super::preprocess::ProcessedArtifact;

/// Backend path that produced the final result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ExtractionMethod {
    Structured,
    Vision,
    Hybrid,
    /// The routed path failed and the single vision retry produced the result.
    VisionErrorFallback,
}

/// Result of one orchestrated extraction run.
#[derive(Debug, Clone)]
pub struct ExtractionOutcome {
    pub data: ExtractedTimetable,
    pub method: ExtractionMethod,
    pub complexity: ComplexityReport,
    pub elapsed_ms: u64,
}

pub struct ExtractionOrchestrator {
    structured: Arc<dyn Extractor>,
    vision: Arc<dyn Extractor>,
    hybrid: Arc<dyn Extractor>,
    config: PipelineConfig,
}

impl ExtractionOrchestrator {
    pub fn new(
        structured: Arc<dyn Extractor>,
        vision: Arc<dyn Extractor>,
        hybrid: Arc<dyn Extractor>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            structured,
            vision,
            hybrid,
            config,
        }
    }

    pub async fn run(
        &self,
        artifact: &ProcessedArtifact,
        hint: &MetadataHint,
    ) -> Result<ExtractionOutcome, ExtractError> {
        let started = Instant::now();
        let mut complexity = complexity::classify(artifact);
        let method = self.select_path(&complexity);
        tracing::debug!(
            artifact = %artifact.name,
            level = complexity.level.as_ref(),
            score = complexity.score,
            method = method.as_ref(),
            "routing extraction"
        );

        let backend = self.backend_for(method);
        let (data, method) = match backend.extract(artifact, hint).await {
            Ok(data) => (data, method),
            Err(primary) if self.config.vision_fallback_enabled => {
                tracing::warn!(
                    error = %primary,
                    artifact = %artifact.name,
                    method = method.as_ref(),
                    "primary extraction failed; retrying with vision backend"
                );
                let data = self.vision.extract(artifact, hint).await?;
                complexity = ComplexityReport::fallback();
                (data, ExtractionMethod::VisionErrorFallback)
            }
            Err(primary) => return Err(primary),
        };

        let data = if self.config.validate_output {
            validate_timeline(data).data
        } else {
            data
        };

        Ok(ExtractionOutcome {
            data,
            method,
            complexity,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Path selection from the router's recommendation and the feature flags.
    /// Precedence follows the flag semantics: a disabled structured backend
    /// forces vision even when hybrid was recommended.
    fn select_path(&self, report: &ComplexityReport) -> ExtractionMethod {
        let cfg = &self.config;
        match report.recommended {
            RecommendedBackend::Structured if cfg.structured_enabled => {
                ExtractionMethod::Structured
            }
            _ if !cfg.structured_enabled => ExtractionMethod::Vision,
            RecommendedBackend::Vision => ExtractionMethod::Vision,
            RecommendedBackend::Hybrid if cfg.hybrid_enabled => ExtractionMethod::Hybrid,
            _ => ExtractionMethod::Vision,
        }
    }

    fn backend_for(&self, method: ExtractionMethod) -> &Arc<dyn Extractor> {
        match method {
            ExtractionMethod::Structured => &self.structured,
            ExtractionMethod::Hybrid => &self.hybrid,
            ExtractionMethod::Vision | ExtractionMethod::VisionErrorFallback => &self.vision,
        }
    }
}
