//! Complexity router: decides which extraction backend an artifact should hit.
//!
//! The classification is a weighted sum of cheap, deterministic heuristics
//! over the preprocessed evidence. The same input always produces the same
//! report, and every contributing factor is named in `reasons` for
//! observability.

use serde::Serialize;
use strum::AsRefStr;

use super::preprocess::{ProcessedArtifact, MIME_PDF};

const WEIGHT_OCR_CONFIDENCE: f32 = 0.25;
const WEIGHT_HANDWRITING: f32 = 0.30;
const WEIGHT_LAYOUT: f32 = 0.15;
const WEIGHT_SCANNED_PDF: f32 = 0.05;
const WEIGHT_IMAGE_QUALITY: f32 = 0.05;

const SIMPLE_THRESHOLD: f32 = 0.30;
const MEDIUM_THRESHOLD: f32 = 0.60;

/// Text shorter than this in a PDF marks the file as a scan of a page.
const SCANNED_PDF_TEXT_CHARS: usize = 100;
const SHORT_LINE_CHARS: f32 = 18.0;
const MODERATE_LINE_CHARS: f32 = 30.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ComplexityLevel {
    Simple,
    Medium,
    Complex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RecommendedBackend {
    Structured,
    Vision,
    Hybrid,
}

/// Output of a classification run.
#[derive(Debug, Clone, Serialize)]
pub struct ComplexityReport {
    pub level: ComplexityLevel,
    pub score: f32,
    pub reasons: Vec<String>,
    pub recommended: RecommendedBackend,
}

impl ComplexityReport {
    /// Report used when the primary extraction path failed and the vision
    /// fallback ran instead.
    pub fn fallback() -> Self {
        Self {
            level: ComplexityLevel::Complex,
            score: 1.0,
            reasons: vec!["primary extraction failed".to_string()],
            recommended: RecommendedBackend::Vision,
        }
    }
}

/// Classify a preprocessed artifact.
pub fn classify(artifact: &ProcessedArtifact) -> ComplexityReport {
    let mut score = 0.0f32;
    let mut reasons = Vec::new();
    let mut handwriting_present = false;

    match artifact.text_evidence() {
        Some(text) => {
            let metrics = TextMetrics::measure(text);

            let ocr_noise = metrics.ocr_noise_score();
            if ocr_noise > 0.0 {
                score += WEIGHT_OCR_CONFIDENCE * ocr_noise;
                reasons.push(format!(
                    "low OCR confidence (punctuation {:.2}, single-char {:.2}, vowel-less {:.2})",
                    metrics.punctuation_ratio,
                    metrics.single_char_token_ratio,
                    metrics.vowelless_word_ratio
                ));
            }

            let handwriting = metrics.handwriting_score();
            if handwriting > 0.0 {
                score += WEIGHT_HANDWRITING * handwriting;
                reasons.push(format!(
                    "handwriting indicators (mixed-case {:.2}, confusion glyphs {:.2})",
                    metrics.mixed_case_word_ratio, metrics.confusion_glyph_ratio
                ));
                handwriting_present = handwriting >= 1.0;
            }

            let layout = metrics.layout_score();
            if layout > 0.0 {
                score += WEIGHT_LAYOUT * layout;
                reasons.push(format!(
                    "complex layout (average line length {:.1} chars)",
                    metrics.avg_line_chars
                ));
            }

            if artifact.mime_type == MIME_PDF && text.chars().count() < SCANNED_PDF_TEXT_CHARS {
                score += WEIGHT_SCANNED_PDF;
                reasons.push("scanned PDF: negligible text layer".to_string());
            }
        }
        None => {
            score += WEIGHT_OCR_CONFIDENCE;
            reasons.push("no machine-readable text".to_string());
            if artifact.mime_type == MIME_PDF {
                score += WEIGHT_SCANNED_PDF;
                reasons.push("scanned PDF: negligible text layer".to_string());
            }
        }
    }

    // Image-quality indicator. Measuring blur or contrast would require a
    // second decode pass over the artifact; the factor is a stub that always
    // contributes zero, kept so the weight table matches the scoring model.
    score += WEIGHT_IMAGE_QUALITY * image_quality_score(artifact);

    let score = score.clamp(0.0, 1.0);
    let level = if score < SIMPLE_THRESHOLD {
        ComplexityLevel::Simple
    } else if score < MEDIUM_THRESHOLD {
        ComplexityLevel::Medium
    } else {
        ComplexityLevel::Complex
    };

    let recommended = if handwriting_present {
        RecommendedBackend::Vision
    } else {
        match level {
            ComplexityLevel::Simple => RecommendedBackend::Structured,
            ComplexityLevel::Medium => RecommendedBackend::Hybrid,
            ComplexityLevel::Complex => RecommendedBackend::Vision,
        }
    };

    ComplexityReport {
        level,
        score,
        reasons,
        recommended,
    }
}

fn image_quality_score(_artifact: &ProcessedArtifact) -> f32 {
    0.0
}

#[derive(Debug)]
struct TextMetrics {
    punctuation_ratio: f32,
    single_char_token_ratio: f32,
    vowelless_word_ratio: f32,
    mixed_case_word_ratio: f32,
    confusion_glyph_ratio: f32,
    avg_line_chars: f32,
}

impl TextMetrics {
    fn measure(text: &str) -> Self {
        let total_chars = text.chars().filter(|c| !c.is_whitespace()).count().max(1);
        let punctuation = text
            .chars()
            .filter(|c| c.is_ascii_punctuation())
            .count();

        let tokens: Vec<&str> = text.split_whitespace().collect();
        let token_count = tokens.len().max(1);
        let single_char = tokens.iter().filter(|t| t.chars().count() == 1).count();

        let words: Vec<&str> = tokens
            .iter()
            .copied()
            .filter(|t| t.len() >= 3 && t.chars().all(|c| c.is_ascii_alphabetic()))
            .collect();
        let word_count = words.len().max(1);
        let vowelless = words
            .iter()
            .filter(|w| !w.chars().any(|c| "aeiouAEIOU".contains(c)))
            .count();
        let mixed_case = words
            .iter()
            .filter(|w| {
                let mut chars = w.chars();
                chars.next();
                chars.any(|c| c.is_ascii_uppercase())
            })
            .count();

        // Digits glued into alphabetic tokens read as OCR confusion between
        // 0/O, 1/l, 5/S and friends.
        let confusion = tokens
            .iter()
            .filter(|t| {
                t.chars().any(|c| c.is_ascii_digit())
                    && t.chars().any(|c| c.is_ascii_alphabetic())
                    && !looks_like_time_range(t)
            })
            .count();

        let lines: Vec<&str> = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect();
        let line_count = lines.len().max(1);
        let avg_line_chars =
            lines.iter().map(|l| l.chars().count()).sum::<usize>() as f32 / line_count as f32;

        Self {
            punctuation_ratio: punctuation as f32 / total_chars as f32,
            single_char_token_ratio: single_char as f32 / token_count as f32,
            vowelless_word_ratio: vowelless as f32 / word_count as f32,
            mixed_case_word_ratio: mixed_case as f32 / word_count as f32,
            confusion_glyph_ratio: confusion as f32 / token_count as f32,
            avg_line_chars,
        }
    }

    fn ocr_noise_score(&self) -> f32 {
        let mut hits = 0;
        if self.punctuation_ratio > 0.25 {
            hits += 1;
        }
        if self.single_char_token_ratio > 0.30 {
            hits += 1;
        }
        if self.vowelless_word_ratio > 0.20 {
            hits += 1;
        }
        hits as f32 / 3.0
    }

    fn handwriting_score(&self) -> f32 {
        let inconsistent_caps = self.mixed_case_word_ratio > 0.15;
        let confusion = self.confusion_glyph_ratio > 0.05;
        match (inconsistent_caps, confusion) {
            (true, true) => 1.0,
            (true, false) | (false, true) => 0.4,
            (false, false) => 0.0,
        }
    }

    fn layout_score(&self) -> f32 {
        if self.avg_line_chars < SHORT_LINE_CHARS {
            1.0
        } else if self.avg_line_chars < MODERATE_LINE_CHARS {
            0.5
        } else {
            0.0
        }
    }
}

/// Timetable cells legitimately mix digits and letters in time ranges such
/// as `9:00am-10:00am`; do not count those as confusion glyphs.
fn looks_like_time_range(token: &str) -> bool {
    token.contains(':')
        && token
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, ':' | '-' | '–' | 'a' | 'p' | 'm' | 'A' | 'P' | 'M' | '.'))
}
