//! Structured representation of an extracted teacher timetable.
//!
//! These data types model the contract shared by every extraction backend.
//! They stay pure, provide JSON schema generation for prompting, and expose
//! validation so downstream code can refuse malformed payloads before writing
//! to storage.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use strum::{AsRefStr, EnumIter, IntoEnumIterator};
use thiserror::Error;

/// Minutes in one day; block times are minute-of-day values below this bound.
pub const MINUTES_PER_DAY: u16 = 24 * 60;

/// School weekday. Serialized as the full English name.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
    EnumIter, AsRefStr,
)]
pub enum Weekday {
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
}

impl Weekday {
    /// Calendar day number with Monday = 1, matching FullCalendar's
    /// `daysOfWeek` convention offset by Sunday = 0.
    pub fn calendar_index(self) -> u8 {
        match self {
            Weekday::Monday => 1,
            Weekday::Tuesday => 2,
            Weekday::Wednesday => 3,
            Weekday::Thursday => 4,
            Weekday::Friday => 5,
        }
    }
}

/// Parse a weekday from a full English name or 3-letter abbreviation,
/// case-insensitively. Returns `None` for anything else (including weekend
/// days, which the model deliberately excludes).
pub fn parse_weekday(raw: &str) -> Option<Weekday> {
    let trimmed = raw.trim();
    if trimmed.len() < 3 {
        return None;
    }
    let lower = trimmed.to_ascii_lowercase();
    for day in Weekday::iter() {
        let name = day.as_ref().to_ascii_lowercase();
        if lower == name || lower == name[..3] {
            return Some(day);
        }
    }
    None
}

/// Render a minute-of-day value as `HH:MM` (24-hour).
pub fn format_minutes(minutes: u16) -> String {
    debug_assert!(minutes < MINUTES_PER_DAY);
    format!("{:02}:{:02}", minutes / 60, minutes % 60)
}

/// A concrete scheduled event on a specific weekday.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TimeBlock {
    pub day: Weekday,
    /// Start as minute-of-day in `[0, 1440)`.
    pub start_min: u16,
    /// End as minute-of-day; always strictly greater than `start_min`.
    pub end_min: u16,
    pub event_name: String,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
    /// Extraction confidence in `[0, 1]` when the backend reports one.
    #[serde(default)]
    pub confidence: Option<f32>,
    #[serde(default)]
    pub is_fixed: bool,
}

impl TimeBlock {
    pub fn new(day: Weekday, start_min: u16, end_min: u16, event_name: impl Into<String>) -> Self {
        Self {
            day,
            start_min,
            end_min,
            event_name: event_name.into(),
            notes: None,
            color: None,
            confidence: None,
            is_fixed: false,
        }
    }

    pub fn duration_min(&self) -> u16 {
        self.end_min.saturating_sub(self.start_min)
    }
}

/// A daily fixture occupying the same slot across the week.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RecurringBlock {
    pub start_min: u16,
    pub end_min: u16,
    pub event_name: String,
    /// When true the block implicitly covers Monday through Friday; otherwise
    /// the applicable days are enumerated in `notes`.
    pub applies_daily: bool,
    #[serde(default)]
    pub notes: Option<String>,
}

impl RecurringBlock {
    /// Whether this fixture occupies the given weekday.
    pub fn applies_on(&self, day: Weekday) -> bool {
        if self.applies_daily {
            return true;
        }
        let Some(notes) = self.notes.as_deref() else {
            return false;
        };
        notes
            .split(|c: char| !c.is_ascii_alphabetic())
            .filter_map(parse_weekday)
            .any(|named| named == day)
    }

    /// Whether the half-open interval `[gap_start, gap_end)` intersects this
    /// fixture's window.
    pub fn covers_gap(&self, day: Weekday, gap_start: u16, gap_end: u16) -> bool {
        self.applies_on(day) && self.start_min < gap_end && gap_start < self.end_min
    }
}

/// Structured output of an extraction run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedTimetable {
    #[serde(default)]
    pub teacher_name: Option<String>,
    #[serde(default)]
    pub class_name: Option<String>,
    #[serde(default)]
    pub term: Option<String>,
    #[serde(default)]
    pub week: Option<String>,
    #[serde(default)]
    pub blocks: Vec<TimeBlock>,
    #[serde(default)]
    pub recurring_blocks: Vec<RecurringBlock>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl ExtractedTimetable {
    /// Generate a JSON schema describing this payload, used to pin the vision
    /// backend's output contract.
    pub fn schema() -> JsonValue {
        let schema = schemars::schema_for!(ExtractedTimetable);
        serde_json::to_value(&schema).expect("schema is serializable")
    }

    /// Blocks scheduled on the given day, in input order.
    pub fn blocks_for_day(&self, day: Weekday) -> Vec<&TimeBlock> {
        self.blocks.iter().filter(|b| b.day == day).collect()
    }

    /// Validate semantic constraints beyond plain JSON typing.
    pub fn validate(&self) -> Result<(), TimetableValidationError> {
        let mut issues = Vec::new();

        for (idx, block) in self.blocks.iter().enumerate() {
            if block.event_name.trim().is_empty() {
                issues.push(format!("blocks[{idx}].eventName must not be empty"));
            }
            if block.start_min >= block.end_min {
                issues.push(format!(
                    "blocks[{idx}] start {} must precede end {}",
                    block.start_min, block.end_min
                ));
            }
            if block.end_min >= MINUTES_PER_DAY {
                issues.push(format!(
                    "blocks[{idx}] end {} exceeds minutes in a day",
                    block.end_min
                ));
            }
            if let Some(confidence) = block.confidence {
                if !(0.0..=1.0).contains(&confidence) {
                    issues.push(format!(
                        "blocks[{idx}].confidence must be within [0, 1], got {confidence}"
                    ));
                }
            }
        }

        for (idx, fixture) in self.recurring_blocks.iter().enumerate() {
            if fixture.event_name.trim().is_empty() {
                issues.push(format!("recurringBlocks[{idx}].eventName must not be empty"));
            }
            if fixture.start_min >= fixture.end_min {
                issues.push(format!(
                    "recurringBlocks[{idx}] start {} must precede end {}",
                    fixture.start_min, fixture.end_min
                ));
            }
            if fixture.end_min >= MINUTES_PER_DAY {
                issues.push(format!(
                    "recurringBlocks[{idx}] end {} exceeds minutes in a day",
                    fixture.end_min
                ));
            }
            if !fixture.applies_daily && fixture.notes.is_none() {
                issues.push(format!(
                    "recurringBlocks[{idx}] must enumerate days in notes when not daily"
                ));
            }
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(TimetableValidationError { issues })
        }
    }
}

/// Validation failures aggregated into a single error.
#[derive(Debug, Error)]
#[error("timetable validation failed: {issues:?}")]
pub struct TimetableValidationError {
    pub issues: Vec<String>,
}

impl TimetableValidationError {
    pub fn with_issue(issue: impl Into<String>) -> Self {
        Self {
            issues: vec![issue.into()],
        }
    }
}
