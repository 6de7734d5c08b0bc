//! PDF helpers: textual-layer extraction and page rasterization.
//!
//! The vision backend ingests images, so PDFs are pre-rasterized here rather
//! than shipped as raw bytes.

use std::env;
use std::path::PathBuf;

use image::codecs::png::PngEncoder;
use image::{ColorType, ImageEncoder};
use pdfium_render::prelude::{PdfRenderConfig, Pdfium, PdfiumError};
use thiserror::Error;

/// Errors emitted while extracting text from PDF documents.
#[derive(Debug, Error)]
pub enum PdfTextError {
    #[error("failed to load Pdfium runtime: {0}")]
    Library(#[from] PdfiumError),

    #[error("failed to load PDF document: {0}")]
    Document(#[source] PdfiumError),

    #[error("failed to extract text for page {page_index}: {source}")]
    PageText {
        page_index: usize,
        #[source]
        source: PdfiumError,
    },
}

/// Errors emitted while rendering PDF pages into PNG images.
#[derive(Debug, Error)]
pub enum PdfRenderError {
    #[error("failed to load Pdfium runtime: {0}")]
    Library(#[from] PdfiumError),

    #[error("failed to load PDF document: {0}")]
    Document(#[source] PdfiumError),

    #[error("document has no pages")]
    EmptyDocument,

    #[error("failed to render page {page_index}: {source}")]
    PageRender {
        page_index: usize,
        #[source]
        source: PdfiumError,
    },

    #[error("failed to encode page {page_index} as PNG: {source}")]
    Encode {
        page_index: usize,
        #[source]
        source: image::ImageError,
    },
}

/// Extract the textual layer of a PDF. Pages without extractable text are
/// skipped; a scanned PDF therefore yields an empty or near-empty string,
/// which the complexity router treats as a scan indicator.
pub fn extract_pdf_text(bytes: &[u8]) -> Result<String, PdfTextError> {
    let pdfium = load_pdfium()?;
    let document = pdfium
        .load_pdf_from_byte_slice(bytes, None)
        .map_err(PdfTextError::Document)?;

    let mut buffer = String::new();
    for (page_index, page) in document.pages().iter().enumerate() {
        let text = page
            .text()
            .map_err(|source| PdfTextError::PageText { page_index, source })?;
        let page_text = text.all();
        if page_text.trim().is_empty() {
            continue;
        }
        if !buffer.is_empty() {
            buffer.push_str("\n\n");
        }
        buffer.push_str(&page_text);
    }
    Ok(buffer)
}

/// Render the first page of a PDF into PNG bytes with the requested target
/// width. Timetable artifacts are single-page; later pages are ignored.
pub fn render_first_page_png(bytes: &[u8], target_width: u32) -> Result<Vec<u8>, PdfRenderError> {
    debug_assert!(target_width > 0);
    let pdfium = load_pdfium()?;
    let document = pdfium
        .load_pdf_from_byte_slice(bytes, None)
        .map_err(PdfRenderError::Document)?;

    let pages = document.pages();
    let page = pages.iter().next().ok_or(PdfRenderError::EmptyDocument)?;

    let render_config = PdfRenderConfig::new().set_target_width(target_width as i32);
    let bitmap = page
        .render_with_config(&render_config)
        .map_err(|source| PdfRenderError::PageRender {
            page_index: 0,
            source,
        })?;

    let width = bitmap.width() as u32;
    let height = bitmap.height() as u32;
    let rgba = bitmap.as_rgba_bytes();

    let mut encoded = Vec::new();
    let encoder = PngEncoder::new(&mut encoded);
    encoder
        .write_image(&rgba, width, height, ColorType::Rgba8.into())
        .map_err(|source| PdfRenderError::Encode {
            page_index: 0,
            source,
        })?;
    Ok(encoded)
}

fn load_pdfium() -> Result<Pdfium, PdfiumError> {
    if let Some(raw) = env::var_os("PDFIUM_LIBRARY_PATH") {
        let path = PathBuf::from(raw);
        let lib_path = if path.is_dir() {
            Pdfium::pdfium_platform_library_name_at_path(&path)
        } else {
            path
        };
        return Pdfium::bind_to_library(lib_path).map(Pdfium::new);
    }

    match Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("./")) {
        Ok(bindings) => Ok(Pdfium::new(bindings)),
        Err(primary_err) => match Pdfium::bind_to_system_library() {
            Ok(bindings) => Ok(Pdfium::new(bindings)),
            Err(_) => Err(primary_err),
        },
    }
}
