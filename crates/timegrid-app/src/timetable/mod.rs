//! Structured timetable model, timeline validation, and read-side projections.
//!
//! Everything in this module tree is pure: no IO, no clocks. The extraction
//! backends produce an [`ExtractedTimetable`], the validator repairs its
//! per-day timeline, and `calendar` projects the result into calendar events.

pub mod calendar;
pub mod model;
pub mod validator;

pub use calendar::{merged_day_timeline, project_calendar, CalendarEvent, CalendarProjection};
pub use model::{
    format_minutes, parse_weekday, ExtractedTimetable, RecurringBlock, TimeBlock,
    TimetableValidationError, Weekday, MINUTES_PER_DAY,
};
pub use validator::{validate_timeline, ValidationOutcome};
