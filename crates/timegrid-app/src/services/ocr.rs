//! Best-effort OCR over artifact images.
//!
//! OCR output feeds the complexity router's heuristics and gives the vision
//! backend a text channel alongside the image. Failures here never abort the
//! pipeline; the preprocessor degrades to image-only evidence.

use std::io::Cursor;
use std::sync::Arc;

use async_trait::async_trait;
use bon::Builder;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::GenericImageView;
use thiserror::Error;

use super::model_client::{ChatModel, ChatRequest, ImageAttachment, ModelError};

const OCR_SYSTEM_PROMPT: &str =
    "You are an OCR engine. Transcribe every piece of text visible in the image, \
     preserving line breaks and reading order. Output only the transcription.";

/// Parameters controlling OCR execution.
#[derive(Debug, Clone, Builder)]
pub struct OcrConfig {
    /// Longest image edge sent to the model; larger inputs are downscaled.
    #[builder(default = 1280)]
    pub image_max_edge: u32,
    #[builder(default = 4096)]
    pub max_tokens: u32,
    /// JPEG quality for the downscaled payload.
    #[builder(default = 90)]
    pub jpeg_quality: u8,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Errors produced by the OCR service.
#[derive(Debug, Error)]
pub enum OcrError {
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("failed to decode image for OCR: {0}")]
    ImageDecode(#[source] image::ImageError),
    #[error("failed to encode image for OCR: {0}")]
    ImageEncode(#[source] image::ImageError),
}

/// Abstract OCR backend.
#[async_trait]
pub trait OcrEngine: Send + Sync {
    /// Transcribe the given PNG image. An empty string is a valid result for
    /// an image without text.
    async fn recognize(&self, png: &[u8]) -> Result<String, OcrError>;
}

/// OCR engine backed by a multimodal chat model.
pub struct ChatOcr {
    model: Arc<dyn ChatModel>,
    config: OcrConfig,
}

impl ChatOcr {
    pub fn new(model: Arc<dyn ChatModel>, config: OcrConfig) -> Self {
        Self { model, config }
    }
}

#[async_trait]
impl OcrEngine for ChatOcr {
    async fn recognize(&self, png: &[u8]) -> Result<String, OcrError> {
        let payload = prepare_image(png, self.config.image_max_edge, self.config.jpeg_quality)?;
        let text = self
            .model
            .complete(ChatRequest {
                system: OCR_SYSTEM_PROMPT.to_string(),
                user_text: "Transcribe this document.".to_string(),
                image: Some(ImageAttachment {
                    bytes: payload,
                    mime_type: "image/jpeg",
                }),
                temperature: 0.0,
                max_tokens: self.config.max_tokens,
            })
            .await?;
        Ok(text)
    }
}

/// Downscale to the configured max edge and re-encode as JPEG to keep the
/// request payload small.
fn prepare_image(png: &[u8], max_edge: u32, quality: u8) -> Result<Vec<u8>, OcrError> {
    let mut dyn_image = image::load_from_memory(png).map_err(OcrError::ImageDecode)?;

    let max_edge = max_edge.max(1);
    let (width, height) = dyn_image.dimensions();
    let longest_edge = width.max(height);
    if longest_edge > max_edge {
        let scale = max_edge as f32 / longest_edge as f32;
        let target_width = ((width as f32 * scale).round() as u32).max(1);
        let target_height = ((height as f32 * scale).round() as u32).max(1);
        dyn_image = dyn_image.resize(target_width, target_height, FilterType::CatmullRom);
    }

    let mut buffer = Cursor::new(Vec::new());
    let mut encoder = JpegEncoder::new_with_quality(&mut buffer, quality);
    encoder
        .encode_image(&dyn_image)
        .map_err(OcrError::ImageEncode)?;
    Ok(buffer.into_inner())
}
