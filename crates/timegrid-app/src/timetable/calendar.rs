//! Read-side calendar projection over an extracted timetable.
//!
//! The pipeline never merges recurring fixtures into the per-day sequences;
//! callers that want a unified view use [`merged_day_timeline`], and the HTTP
//! surface serves [`project_calendar`] in FullCalendar's recurring-event shape.

use serde::Serialize;
use strum::IntoEnumIterator;

use super::model::{format_minutes, ExtractedTimetable, TimeBlock, Weekday};

/// One projected calendar event. Times are `HH:MM` strings and `days_of_week`
/// uses FullCalendar numbering (Monday = 1).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarEvent {
    pub id: String,
    pub title: String,
    pub days_of_week: Vec<u8>,
    pub start_time: String,
    pub end_time: String,
    pub color: Option<String>,
    pub extended_props: CalendarEventProps,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarEventProps {
    pub notes: Option<String>,
    pub confidence: Option<f32>,
    pub is_fixed: bool,
    /// `"block"` for day-specific events, `"recurring"` for daily fixtures.
    pub source: &'static str,
}

/// Projection payload for the calendar endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarProjection {
    pub events: Vec<CalendarEvent>,
    pub metadata: CalendarMetadata,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarMetadata {
    pub teacher_name: Option<String>,
    pub class_name: Option<String>,
    pub term: Option<String>,
    pub week: Option<String>,
    pub warnings: Vec<String>,
}

/// Project a timetable into calendar events.
pub fn project_calendar(timetable: &ExtractedTimetable) -> CalendarProjection {
    let mut events = Vec::with_capacity(timetable.blocks.len() + timetable.recurring_blocks.len());

    for (idx, block) in timetable.blocks.iter().enumerate() {
        events.push(CalendarEvent {
            id: format!("block-{idx}"),
            title: block.event_name.clone(),
            days_of_week: vec![block.day.calendar_index()],
            start_time: format_minutes(block.start_min),
            end_time: format_minutes(block.end_min),
            color: block.color.clone(),
            extended_props: CalendarEventProps {
                notes: block.notes.clone(),
                confidence: block.confidence,
                is_fixed: block.is_fixed,
                source: "block",
            },
        });
    }

    for (idx, fixture) in timetable.recurring_blocks.iter().enumerate() {
        let days: Vec<u8> = Weekday::iter()
            .filter(|day| fixture.applies_on(*day))
            .map(Weekday::calendar_index)
            .collect();
        events.push(CalendarEvent {
            id: format!("recurring-{idx}"),
            title: fixture.event_name.clone(),
            days_of_week: days,
            start_time: format_minutes(fixture.start_min),
            end_time: format_minutes(fixture.end_min),
            color: None,
            extended_props: CalendarEventProps {
                notes: fixture.notes.clone(),
                confidence: None,
                is_fixed: true,
                source: "recurring",
            },
        });
    }

    CalendarProjection {
        events,
        metadata: CalendarMetadata {
            teacher_name: timetable.teacher_name.clone(),
            class_name: timetable.class_name.clone(),
            term: timetable.term.clone(),
            week: timetable.week.clone(),
            warnings: timetable.warnings.clone(),
        },
    }
}

/// Merge the day's blocks with the recurring fixtures that apply on that day,
/// sorted by start time. Recurring fixtures become plain blocks with
/// `is_fixed` set.
pub fn merged_day_timeline(timetable: &ExtractedTimetable, day: Weekday) -> Vec<TimeBlock> {
    let mut merged: Vec<TimeBlock> = timetable
        .blocks
        .iter()
        .filter(|b| b.day == day)
        .cloned()
        .collect();

    for fixture in &timetable.recurring_blocks {
        if !fixture.applies_on(day) {
            continue;
        }
        let mut block = TimeBlock::new(day, fixture.start_min, fixture.end_min, &fixture.event_name);
        block.notes = fixture.notes.clone();
        block.is_fixed = true;
        merged.push(block);
    }

    merged.sort_by_key(|b| (b.start_min, b.end_min));
    merged
}
