//! Artifact normalization: one uploaded file in, `{text, image}` evidence out.
//!
//! Images are normalized to PNG and transcribed with best-effort OCR. PDFs
//! contribute their textual layer plus a rasterized first page. DOCX files
//! contribute text only. OCR failures degrade to image-only evidence and never
//! abort the pipeline.

use std::io::Cursor;
use std::sync::{Arc, OnceLock};

use regex::Regex;
use thiserror::Error;
use zip::ZipArchive;

use crate::pdf::{self, PdfRenderError, PdfTextError};

use super::ocr::OcrEngine;

pub const MIME_PNG: &str = "image/png";
pub const MIME_JPEG: &str = "image/jpeg";
pub const MIME_WEBP: &str = "image/webp";
pub const MIME_GIF: &str = "image/gif";
pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";

const SUPPORTED_IMAGE_MIMES: [&str; 4] = [MIME_PNG, MIME_JPEG, MIME_WEBP, MIME_GIF];
const PDF_RENDER_WIDTH: u32 = 2048;

/// Whether the submission facade accepts this MIME type at all.
pub fn is_supported_mime(mime: &str) -> bool {
    SUPPORTED_IMAGE_MIMES.contains(&mime) || mime == MIME_PDF || mime == MIME_DOCX
}

/// Normalized evidence produced from one artifact.
#[derive(Debug, Clone)]
pub struct ProcessedArtifact {
    pub text: Option<String>,
    /// Normalized PNG bytes when the artifact has a visual form.
    pub image_png: Option<Vec<u8>>,
    pub mime_type: String,
    pub name: String,
}

impl ProcessedArtifact {
    /// Trimmed text evidence, if any survived preprocessing.
    pub fn text_evidence(&self) -> Option<&str> {
        self.text.as_deref().map(str::trim).filter(|t| !t.is_empty())
    }
}

#[derive(Debug, Error)]
pub enum PreprocessError {
    #[error("unsupported artifact type `{0}`")]
    UnsupportedType(String),
    #[error("failed to decode image artifact: {0}")]
    ImageDecode(#[source] image::ImageError),
    #[error("failed to normalize image artifact: {0}")]
    ImageEncode(#[source] image::ImageError),
    #[error(transparent)]
    Pdf(#[from] PdfTextError),
    #[error(transparent)]
    PdfRender(#[from] PdfRenderError),
    #[error("failed to read DOCX container: {0}")]
    Docx(String),
    #[error("preprocessing task failed: {0}")]
    Task(String),
}

/// Normalizes artifacts into the evidence pair consumed by the router and the
/// extraction backends.
pub struct FilePreprocessor {
    ocr: Option<Arc<dyn OcrEngine>>,
}

impl FilePreprocessor {
    pub fn new(ocr: Option<Arc<dyn OcrEngine>>) -> Self {
        Self { ocr }
    }

    pub async fn preprocess(
        &self,
        bytes: Vec<u8>,
        mime_type: &str,
        name: &str,
    ) -> Result<ProcessedArtifact, PreprocessError> {
        if SUPPORTED_IMAGE_MIMES.contains(&mime_type) {
            return self.preprocess_image(bytes, mime_type, name).await;
        }
        match mime_type {
            MIME_PDF => self.preprocess_pdf(bytes, name).await,
            MIME_DOCX => preprocess_docx(&bytes, name),
            other => Err(PreprocessError::UnsupportedType(other.to_string())),
        }
    }

    async fn preprocess_image(
        &self,
        bytes: Vec<u8>,
        mime_type: &str,
        name: &str,
    ) -> Result<ProcessedArtifact, PreprocessError> {
        let png = tokio::task::spawn_blocking(move || normalize_to_png(&bytes))
            .await
            .map_err(|join| PreprocessError::Task(join.to_string()))??;

        let text = match &self.ocr {
            Some(engine) => match engine.recognize(&png).await {
                Ok(text) if !text.trim().is_empty() => Some(text),
                Ok(_) => None,
                Err(error) => {
                    tracing::warn!(%error, artifact = %name, "OCR failed; continuing with image-only evidence");
                    None
                }
            },
            None => None,
        };

        Ok(ProcessedArtifact {
            text,
            image_png: Some(png),
            mime_type: mime_type.to_string(),
            name: name.to_string(),
        })
    }

    async fn preprocess_pdf(
        &self,
        bytes: Vec<u8>,
        name: &str,
    ) -> Result<ProcessedArtifact, PreprocessError> {
        let artifact_name = name.to_string();
        let (text, image_png) = tokio::task::spawn_blocking(move || {
            let text = pdf::extract_pdf_text(&bytes)?;
            let image = match pdf::render_first_page_png(&bytes, PDF_RENDER_WIDTH) {
                Ok(png) => Some(png),
                Err(error) if !text.trim().is_empty() => {
                    tracing::warn!(%error, artifact = %artifact_name, "PDF rasterization failed; continuing text-only");
                    None
                }
                Err(error) => return Err(PreprocessError::PdfRender(error)),
            };
            Ok((text, image))
        })
        .await
        .map_err(|join| PreprocessError::Task(join.to_string()))??;

        let text = if text.trim().is_empty() { None } else { Some(text) };
        Ok(ProcessedArtifact {
            text,
            image_png,
            mime_type: MIME_PDF.to_string(),
            name: name.to_string(),
        })
    }
}

/// Decode any supported raster format and re-encode as PNG.
fn normalize_to_png(bytes: &[u8]) -> Result<Vec<u8>, PreprocessError> {
    let decoded = image::load_from_memory(bytes).map_err(PreprocessError::ImageDecode)?;
    let mut out = Cursor::new(Vec::new());
    decoded
        .write_to(&mut out, image::ImageFormat::Png)
        .map_err(PreprocessError::ImageEncode)?;
    Ok(out.into_inner())
}

fn preprocess_docx(bytes: &[u8], name: &str) -> Result<ProcessedArtifact, PreprocessError> {
    let text = extract_docx_text(bytes)?;
    Ok(ProcessedArtifact {
        text: if text.trim().is_empty() { None } else { Some(text) },
        image_png: None,
        mime_type: MIME_DOCX.to_string(),
        name: name.to_string(),
    })
}

/// Pull the raw text out of `word/document.xml` inside the DOCX container.
/// Paragraph ends become newlines, tabs are preserved, all other markup is
/// stripped.
fn extract_docx_text(bytes: &[u8]) -> Result<String, PreprocessError> {
    static TAG_RE: OnceLock<Regex> = OnceLock::new();
    let tag_re = TAG_RE.get_or_init(|| Regex::new(r"<[^>]+>").expect("tag regex compiles"));

    let mut archive = ZipArchive::new(Cursor::new(bytes))
        .map_err(|err| PreprocessError::Docx(err.to_string()))?;
    let mut document = archive
        .by_name("word/document.xml")
        .map_err(|err| PreprocessError::Docx(err.to_string()))?;

    let mut xml = String::new();
    std::io::Read::read_to_string(&mut document, &mut xml)
        .map_err(|err| PreprocessError::Docx(err.to_string()))?;

    let with_breaks = xml
        .replace("</w:p>", "\n")
        .replace("<w:tab/>", "\t")
        .replace("<w:br/>", "\n");
    let stripped = tag_re.replace_all(&with_breaks, "");
    let decoded = stripped
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'");

    let cleaned: String = decoded
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n");
    Ok(cleaned.trim().to_string())
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::services::ocr::OcrError;

    struct FixedOcr(&'static str);

    #[async_trait]
    impl OcrEngine for FixedOcr {
        async fn recognize(&self, _png: &[u8]) -> Result<String, OcrError> {
            Ok(self.0.to_string())
        }
    }

    struct FailingOcr;

    #[async_trait]
    impl OcrEngine for FailingOcr {
        async fn recognize(&self, _png: &[u8]) -> Result<String, OcrError> {
            Err(OcrError::Model(
                crate::services::model_client::ModelError::EmptyResponse,
            ))
        }
    }

    fn sample_jpeg() -> Vec<u8> {
        let img = image::DynamicImage::new_rgb8(40, 30);
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageFormat::Jpeg)
            .expect("encode jpeg");
        out.into_inner()
    }

    fn sample_docx(document_xml: &str) -> Vec<u8> {
        use std::io::Write;
        use zip::write::SimpleFileOptions;

        let mut out = Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut out);
            writer
                .start_file("word/document.xml", SimpleFileOptions::default())
                .expect("start zip entry");
            writer
                .write_all(document_xml.as_bytes())
                .expect("write zip entry");
            writer.finish().expect("finish zip");
        }
        out.into_inner()
    }

    #[test]
    fn mime_whitelist() {
        assert!(is_supported_mime(MIME_PNG));
        assert!(is_supported_mime(MIME_PDF));
        assert!(is_supported_mime(MIME_DOCX));
        assert!(!is_supported_mime("text/plain"));
        assert!(!is_supported_mime("application/zip"));
    }

    #[tokio::test]
    async fn image_is_normalized_to_png_with_ocr_text() {
        let preprocessor =
            FilePreprocessor::new(Some(Arc::new(FixedOcr("Monday 09:00-10:00 Maths"))));
        let artifact = preprocessor
            .preprocess(sample_jpeg(), MIME_JPEG, "grid.jpg")
            .await
            .expect("preprocess");

        assert_eq!(artifact.text_evidence(), Some("Monday 09:00-10:00 Maths"));
        let png = artifact.image_png.expect("image evidence present");
        assert!(image::load_from_memory_with_format(&png, image::ImageFormat::Png).is_ok());
    }

    #[tokio::test]
    async fn ocr_failure_degrades_to_image_only() {
        let preprocessor = FilePreprocessor::new(Some(Arc::new(FailingOcr)));
        let artifact = preprocessor
            .preprocess(sample_jpeg(), MIME_JPEG, "grid.jpg")
            .await
            .expect("preprocess must not fail on OCR errors");
        assert!(artifact.text.is_none());
        assert!(artifact.image_png.is_some());
    }

    #[tokio::test]
    async fn unsupported_mime_is_rejected() {
        let preprocessor = FilePreprocessor::new(None);
        let err = preprocessor
            .preprocess(vec![1, 2, 3], "text/plain", "notes.txt")
            .await
            .expect_err("unsupported type must fail");
        assert!(matches!(err, PreprocessError::UnsupportedType(_)));
    }

    #[tokio::test]
    async fn docx_text_extraction_strips_markup() {
        let xml = r#"<?xml version="1.0"?>
<w:document><w:body>
<w:p><w:r><w:t>Monday</w:t></w:r><w:tab/><w:r><w:t>Maths &amp; Science</w:t></w:r></w:p>
<w:p><w:r><w:t>Tuesday</w:t></w:r></w:p>
</w:body></w:document>"#;
        let preprocessor = FilePreprocessor::new(None);
        let artifact = preprocessor
            .preprocess(sample_docx(xml), MIME_DOCX, "plan.docx")
            .await
            .expect("preprocess docx");
        let text = artifact.text.expect("text extracted");
        assert!(text.contains("Monday\tMaths & Science"));
        assert!(text.contains("Tuesday"));
        assert!(!text.contains('<'));
        assert!(artifact.image_png.is_none());
    }
}
