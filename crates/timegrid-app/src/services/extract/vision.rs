//! Vision extraction backend: a multimodal model reads the artifact image and
//! OCR text and answers with exactly one JSON document matching the timetable
//! schema. Temperature is pinned to zero for determinism.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::services::model_client::{ChatModel, ChatRequest, ImageAttachment};
use crate::services::preprocess::ProcessedArtifact;
use crate::timetable::{parse_weekday, ExtractedTimetable, RecurringBlock, TimeBlock};

use super::{ExtractError, Extractor, MetadataHint};

const VISION_MAX_TOKENS: u32 = 8192;

pub(crate) const VISION_SYSTEM_PROMPT: &str = "You are an expert at reading teacher timetables. \
Extract the weekly schedule from the supplied image and text. \
Respond with exactly one JSON object and nothing else, in this shape: \
{\"metadata\":{\"teacherName\":string|null,\"className\":string|null,\"term\":string|null,\"week\":string|null},\
\"blocks\":[{\"day\":\"Monday\"..\"Friday\",\"startTime\":\"HH:MM\",\"endTime\":\"HH:MM\",\"eventName\":string,\
\"notes\":string|null,\"color\":string|null,\"confidence\":number 0..1,\"isFixed\":boolean}],\
\"recurringBlocks\":[{\"startTime\":\"HH:MM\",\"endTime\":\"HH:MM\",\"eventName\":string,\
\"appliesDaily\":boolean,\"notes\":string|null}],\
\"warnings\":[string]}. \
Times are 24-hour. Events that repeat at the same time every day (registration, \
breaks, lunch) belong in recurringBlocks, not blocks. Never invent events that \
are not visible in the source.";

pub(crate) const VALIDATION_SYSTEM_PROMPT: &str = "You are validating a timetable that was \
extracted from a document by a table parser. Compare the draft JSON against the \
image. Correct wrong or missing entries, fill gaps you can read from the image, \
and move daily fixtures (registration, breaks, lunch) into recurringBlocks. \
Respond with exactly one corrected JSON object in the same shape as the draft, \
and list every change you made in warnings.";

/// Model-facing JSON payload. Times arrive as `HH:MM` strings and are
/// converted to minute-of-day during validation.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct VisionPayload {
    #[serde(default)]
    metadata: Option<VisionMetadata>,
    #[serde(default)]
    blocks: Vec<VisionBlock>,
    #[serde(default)]
    recurring_blocks: Vec<VisionRecurring>,
    #[serde(default)]
    warnings: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VisionMetadata {
    #[serde(default)]
    teacher_name: Option<String>,
    #[serde(default)]
    class_name: Option<String>,
    #[serde(default)]
    term: Option<String>,
    #[serde(default)]
    week: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VisionBlock {
    day: String,
    start_time: String,
    end_time: String,
    event_name: String,
    #[serde(default)]
    notes: Option<String>,
    #[serde(default)]
    color: Option<String>,
    #[serde(default)]
    confidence: Option<f32>,
    #[serde(default)]
    is_fixed: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VisionRecurring {
    start_time: String,
    end_time: String,
    event_name: String,
    #[serde(default)]
    applies_daily: bool,
    #[serde(default)]
    notes: Option<String>,
}

/// Vision extraction backend.
pub struct VisionBackend {
    model: Arc<dyn ChatModel>,
}

impl VisionBackend {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self { model }
    }

    /// Hybrid validation pass: hand the model a draft produced by the
    /// structured backend and ask for a corrected document.
    pub async fn validate_extraction(
        &self,
        artifact: &ProcessedArtifact,
        draft: &ExtractedTimetable,
    ) -> Result<ExtractedTimetable, ExtractError> {
        let draft_json = to_wire_json(draft);
        let mut user_text = format!("Draft extraction to validate:\n{draft_json}");
        if let Some(text) = artifact.text_evidence() {
            user_text.push_str("\n\nOCR text of the source document:\n");
            user_text.push_str(text);
        }
        self.run(artifact, VALIDATION_SYSTEM_PROMPT, user_text).await
    }

    async fn run(
        &self,
        artifact: &ProcessedArtifact,
        system: &str,
        user_text: String,
    ) -> Result<ExtractedTimetable, ExtractError> {
        let response = self
            .model
            .complete(ChatRequest {
                system: system.to_string(),
                user_text,
                image: artifact.image_png.as_ref().map(|png| ImageAttachment {
                    bytes: png.clone(),
                    mime_type: "image/png",
                }),
                temperature: 0.0,
                max_tokens: VISION_MAX_TOKENS,
            })
            .await
            .map_err(ExtractError::Vision)?;

        parse_vision_response(&response)
    }
}

#[async_trait]
impl Extractor for VisionBackend {
    async fn extract(
        &self,
        artifact: &ProcessedArtifact,
        hint: &MetadataHint,
    ) -> Result<ExtractedTimetable, ExtractError> {
        let mut user_text = String::from("Extract the timetable from this document.");
        if let Some(text) = artifact.text_evidence() {
            user_text.push_str("\n\nOCR text of the document:\n");
            user_text.push_str(text);
        }
        if let Some(teacher) = &hint.teacher_name {
            user_text.push_str(&format!("\n\nThe teacher is {teacher}."));
        }
        if let Some(class) = &hint.class_name {
            user_text.push_str(&format!("\nThe class is {class}."));
        }

        let mut timetable = self.run(artifact, VISION_SYSTEM_PROMPT, user_text).await?;
        hint.apply(&mut timetable);
        Ok(timetable)
    }
}

/// Extract the first balanced `{…}` region of the response, respecting string
/// literals and escapes, and validate it against the timetable schema.
pub(crate) fn parse_vision_response(raw: &str) -> Result<ExtractedTimetable, ExtractError> {
    let json = first_balanced_json(raw)
        .ok_or_else(|| ExtractError::Schema("response contains no JSON object".to_string()))?;

    let payload: VisionPayload =
        serde_json::from_str(json).map_err(|err| ExtractError::Schema(err.to_string()))?;
    convert_payload(payload)
}

/// Render a timetable in the same wire shape the model is asked to produce,
/// with `HH:MM` time strings.
fn to_wire_json(timetable: &ExtractedTimetable) -> String {
    use crate::timetable::format_minutes;
    use serde_json::json;

    let blocks: Vec<_> = timetable
        .blocks
        .iter()
        .map(|b| {
            json!({
                "day": b.day.as_ref(),
                "startTime": format_minutes(b.start_min),
                "endTime": format_minutes(b.end_min),
                "eventName": b.event_name,
                "notes": b.notes,
                "color": b.color,
                "confidence": b.confidence,
                "isFixed": b.is_fixed,
            })
        })
        .collect();
    let recurring: Vec<_> = timetable
        .recurring_blocks
        .iter()
        .map(|r| {
            json!({
                "startTime": format_minutes(r.start_min),
                "endTime": format_minutes(r.end_min),
                "eventName": r.event_name,
                "appliesDaily": r.applies_daily,
                "notes": r.notes,
            })
        })
        .collect();

    json!({
        "metadata": {
            "teacherName": timetable.teacher_name,
            "className": timetable.class_name,
            "term": timetable.term,
            "week": timetable.week,
        },
        "blocks": blocks,
        "recurringBlocks": recurring,
        "warnings": timetable.warnings,
    })
    .to_string()
}

fn first_balanced_json(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in raw[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&raw[start..start + offset + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

fn parse_clock(raw: &str) -> Option<u16> {
    let (hours, minutes) = raw.trim().split_once(':')?;
    let hours: u16 = hours.parse().ok()?;
    let minutes: u16 = minutes.parse().ok()?;
    if hours >= 24 || minutes >= 60 {
        return None;
    }
    Some(hours * 60 + minutes)
}

fn convert_payload(payload: VisionPayload) -> Result<ExtractedTimetable, ExtractError> {
    let mut issues = Vec::new();
    let mut blocks = Vec::with_capacity(payload.blocks.len());

    for (idx, raw) in payload.blocks.into_iter().enumerate() {
        let Some(day) = parse_weekday(&raw.day) else {
            issues.push(format!("blocks[{idx}].day `{}` is not a weekday", raw.day));
            continue;
        };
        let (Some(start), Some(end)) = (parse_clock(&raw.start_time), parse_clock(&raw.end_time))
        else {
            issues.push(format!(
                "blocks[{idx}] has unparseable times `{}`-`{}`",
                raw.start_time, raw.end_time
            ));
            continue;
        };
        if start >= end {
            issues.push(format!(
                "blocks[{idx}] start {} is not before end {}",
                raw.start_time, raw.end_time
            ));
            continue;
        }
        let mut block = TimeBlock::new(day, start, end, raw.event_name);
        block.notes = raw.notes;
        block.color = raw.color;
        block.confidence = raw.confidence;
        block.is_fixed = raw.is_fixed;
        blocks.push(block);
    }

    let mut recurring = Vec::with_capacity(payload.recurring_blocks.len());
    for (idx, raw) in payload.recurring_blocks.into_iter().enumerate() {
        let (Some(start), Some(end)) = (parse_clock(&raw.start_time), parse_clock(&raw.end_time))
        else {
            issues.push(format!(
                "recurringBlocks[{idx}] has unparseable times `{}`-`{}`",
                raw.start_time, raw.end_time
            ));
            continue;
        };
        if start >= end {
            issues.push(format!(
                "recurringBlocks[{idx}] start {} is not before end {}",
                raw.start_time, raw.end_time
            ));
            continue;
        }
        recurring.push(RecurringBlock {
            start_min: start,
            end_min: end,
            event_name: raw.event_name,
            applies_daily: raw.applies_daily,
            notes: raw.notes,
        });
    }

    if !issues.is_empty() {
        // Partial output is worse than a clean failure; the worker's retry
        // protocol owns what happens next.
        return Err(ExtractError::Schema(issues.join("; ")));
    }

    let metadata = payload.metadata.unwrap_or_default();
    let timetable = ExtractedTimetable {
        teacher_name: metadata.teacher_name,
        class_name: metadata.class_name,
        term: metadata.term,
        week: metadata.week,
        blocks,
        recurring_blocks: recurring,
        warnings: payload.warnings,
    };

    timetable
        .validate()
        .map_err(|err| ExtractError::Schema(err.to_string()))?;
    Ok(timetable)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timetable::Weekday;

    const GOOD_RESPONSE: &str = r#"Here is the extracted timetable:
{
  "metadata": { "teacherName": "Ms Patel", "className": null, "term": "Autumn", "week": null },
  "blocks": [
    { "day": "Monday", "startTime": "09:00", "endTime": "10:00", "eventName": "Maths",
      "notes": null, "color": null, "confidence": 0.95, "isFixed": false }
  ],
  "recurringBlocks": [
    { "startTime": "10:30", "endTime": "10:45", "eventName": "Break", "appliesDaily": true, "notes": null }
  ],
  "warnings": ["Friday column partially occluded"]
}
Let me know if you need anything else."#;

    #[test]
    fn parses_first_balanced_object_from_chatty_response() {
        let result = parse_vision_response(GOOD_RESPONSE).expect("parse");
        assert_eq!(result.teacher_name.as_deref(), Some("Ms Patel"));
        assert_eq!(result.term.as_deref(), Some("Autumn"));
        assert_eq!(result.blocks.len(), 1);
        assert_eq!(result.blocks[0].day, Weekday::Monday);
        assert_eq!(result.blocks[0].start_min, 540);
        assert_eq!(result.blocks[0].end_min, 600);
        assert_eq!(result.recurring_blocks.len(), 1);
        assert!(result.recurring_blocks[0].applies_daily);
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn balanced_scan_ignores_braces_inside_strings() {
        let raw = r#"{"blocks":[],"recurringBlocks":[],"warnings":["odd note with } brace"]}"#;
        let result = parse_vision_response(raw).expect("parse");
        assert_eq!(result.warnings[0], "odd note with } brace");
    }

    #[test]
    fn response_without_json_is_schema_error() {
        let err = parse_vision_response("I could not read the image.").expect_err("no JSON");
        assert!(matches!(err, ExtractError::Schema(_)));
        assert_eq!(err.kind(), crate::error::ErrorKind::ValidationError);
    }

    #[test]
    fn unknown_top_level_fields_are_rejected() {
        let raw = r#"{"blocks":[],"recurringBlocks":[],"warnings":[],"surprise":true}"#;
        assert!(matches!(
            parse_vision_response(raw),
            Err(ExtractError::Schema(_))
        ));
    }

    #[test]
    fn invalid_day_or_times_reject_the_whole_payload() {
        let bad_day = r#"{"blocks":[{"day":"Sunday","startTime":"09:00","endTime":"10:00","eventName":"Maths"}],"recurringBlocks":[],"warnings":[]}"#;
        assert!(matches!(
            parse_vision_response(bad_day),
            Err(ExtractError::Schema(_))
        ));

        let bad_time = r#"{"blocks":[{"day":"Monday","startTime":"25:00","endTime":"26:00","eventName":"Maths"}],"recurringBlocks":[],"warnings":[]}"#;
        assert!(matches!(
            parse_vision_response(bad_time),
            Err(ExtractError::Schema(_))
        ));

        let inverted = r#"{"blocks":[{"day":"Monday","startTime":"10:00","endTime":"09:00","eventName":"Maths"}],"recurringBlocks":[],"warnings":[]}"#;
        assert!(matches!(
            parse_vision_response(inverted),
            Err(ExtractError::Schema(_))
        ));
    }

    #[test]
    fn clock_parsing_bounds() {
        assert_eq!(parse_clock("00:00"), Some(0));
        assert_eq!(parse_clock("23:59"), Some(1439));
        assert_eq!(parse_clock("9:05"), Some(545));
        assert_eq!(parse_clock("24:00"), None);
        assert_eq!(parse_clock("12:60"), None);
        assert_eq!(parse_clock("noon"), None);
    }

    #[tokio::test]
    async fn hint_overrides_model_metadata() {
        struct CannedModel;

        #[async_trait]
        impl ChatModel for CannedModel {
            async fn complete(
                &self,
                _request: ChatRequest,
            ) -> Result<String, crate::services::model_client::ModelError> {
                Ok(GOOD_RESPONSE.to_string())
            }
        }

        let backend = VisionBackend::new(Arc::new(CannedModel));
        let artifact = ProcessedArtifact {
            text: Some("Monday Maths".to_string()),
            image_png: Some(vec![0u8; 4]),
            mime_type: "image/png".to_string(),
            name: "grid.png".to_string(),
        };
        let hint = MetadataHint {
            teacher_name: Some("Mr Okafor".to_string()),
            class_name: Some("5B".to_string()),
        };
        let result = backend.extract(&artifact, &hint).await.expect("extract");
        assert_eq!(result.teacher_name.as_deref(), Some("Mr Okafor"));
        assert_eq!(result.class_name.as_deref(), Some("5B"));
    }
}
