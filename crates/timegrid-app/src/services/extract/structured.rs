//! Structured extraction backend: a table-aware document-understanding
//! service returns cell grids, and the first detected table is converted into
//! time blocks.

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::services::model_client::ModelError;
use crate::services::preprocess::ProcessedArtifact;
use crate::timetable::{parse_weekday, ExtractedTimetable, TimeBlock, Weekday};

use super::{ExtractError, Extractor, MetadataHint};

/// Confidence assigned to every cell-derived block.
const TABLE_CELL_CONFIDENCE: f32 = 0.85;

/// A recognized table as a dense grid of cell texts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocTable {
    pub rows: Vec<Vec<String>>,
}

/// Abstract table-recognition service.
#[async_trait]
pub trait TableRecognizer: Send + Sync {
    async fn recognize_tables(
        &self,
        artifact: &ProcessedArtifact,
    ) -> Result<Vec<DocTable>, ModelError>;
}

/// HTTP implementation posting the artifact to a document-AI endpoint.
#[derive(Clone)]
pub struct HttpTableRecognizer {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TableResponse {
    #[serde(default)]
    tables: Vec<DocTable>,
}

impl HttpTableRecognizer {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ModelError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key,
        })
    }
}

#[async_trait]
impl TableRecognizer for HttpTableRecognizer {
    async fn recognize_tables(
        &self,
        artifact: &ProcessedArtifact,
    ) -> Result<Vec<DocTable>, ModelError> {
        let document = artifact
            .image_png
            .as_deref()
            .map(|png| BASE64_STANDARD.encode(png));
        let body = json!({
            "document": document,
            "text": artifact.text,
            "mimeType": artifact.mime_type,
        });

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let parsed: TableResponse = response.json().await?;
        Ok(parsed.tables)
    }
}

/// Backend converting recognized tables into a timetable.
pub struct StructuredBackend<R: TableRecognizer> {
    recognizer: R,
}

impl<R: TableRecognizer> StructuredBackend<R> {
    pub fn new(recognizer: R) -> Self {
        Self { recognizer }
    }
}

#[async_trait]
impl<R: TableRecognizer> Extractor for StructuredBackend<R> {
    async fn extract(
        &self,
        artifact: &ProcessedArtifact,
        hint: &MetadataHint,
    ) -> Result<ExtractedTimetable, ExtractError> {
        let tables = self
            .recognizer
            .recognize_tables(artifact)
            .await
            .map_err(ExtractError::Structured)?;

        let table = tables
            .into_iter()
            .next()
            .ok_or_else(|| ExtractError::NoGrid(artifact.name.clone()))?;

        let mut timetable = convert_table(&table, &artifact.name)?;
        hint.apply(&mut timetable);
        Ok(timetable)
    }
}

fn time_range_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(\d{1,2}):(\d{2})\s*[-–]\s*(\d{1,2}):(\d{2})").expect("time regex compiles")
    })
}

/// Parse `H:MM-H:MM` (padded or not, hyphen or en dash) into minute-of-day
/// bounds. Out-of-range components yield `None`.
fn parse_time_range(raw: &str) -> Option<(u16, u16)> {
    let caps = time_range_re().captures(raw)?;
    let component = |idx: usize| caps.get(idx)?.as_str().parse::<u16>().ok();
    let start = component(1)? * 60 + component(2)?;
    let end = component(3)? * 60 + component(4)?;
    if component(2)? >= 60 || component(4)? >= 60 || start >= end || end >= 24 * 60 {
        return None;
    }
    Some((start, end))
}

/// Layout of day headers within the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Orientation {
    /// Days across the header row, time ranges down the first column.
    DaysAsColumns,
    /// Days down the first column, time ranges across the header row.
    DaysAsRows,
}

fn detect_orientation(table: &DocTable) -> Option<Orientation> {
    let header_days = table
        .rows
        .first()
        .map(|row| row.iter().filter(|c| parse_weekday(c).is_some()).count())
        .unwrap_or(0);
    let column_days = table
        .rows
        .iter()
        .filter_map(|row| row.first())
        .filter(|c| parse_weekday(c).is_some())
        .count();

    if header_days == 0 && column_days == 0 {
        return None;
    }
    if header_days >= column_days {
        Some(Orientation::DaysAsColumns)
    } else {
        Some(Orientation::DaysAsRows)
    }
}

/// Convert the first recognized table into blocks. Cells that do not sit at a
/// (day, parseable time range) intersection are ignored.
fn convert_table(table: &DocTable, artifact_name: &str) -> Result<ExtractedTimetable, ExtractError> {
    let orientation =
        detect_orientation(table).ok_or_else(|| ExtractError::NoGrid(artifact_name.to_string()))?;

    let mut blocks = Vec::new();
    let mut warnings = Vec::new();

    match orientation {
        Orientation::DaysAsColumns => {
            let header = &table.rows[0];
            let day_columns: Vec<(usize, Weekday)> = header
                .iter()
                .enumerate()
                .filter_map(|(idx, cell)| parse_weekday(cell).map(|day| (idx, day)))
                .collect();

            for row in table.rows.iter().skip(1) {
                let Some((start, end)) = row.first().and_then(|cell| parse_time_range(cell)) else {
                    continue;
                };
                for (col, day) in &day_columns {
                    let Some(cell) = row.get(*col) else { continue };
                    push_cell_block(&mut blocks, *day, start, end, cell);
                }
            }
        }
        Orientation::DaysAsRows => {
            let header = &table.rows[0];
            let time_columns: Vec<(usize, (u16, u16))> = header
                .iter()
                .enumerate()
                .filter_map(|(idx, cell)| parse_time_range(cell).map(|range| (idx, range)))
                .collect();

            for row in table.rows.iter().skip(1) {
                let Some(day) = row.first().and_then(|cell| parse_weekday(cell)) else {
                    continue;
                };
                for (col, (start, end)) in &time_columns {
                    let Some(cell) = row.get(*col) else { continue };
                    push_cell_block(&mut blocks, day, *start, *end, cell);
                }
            }
        }
    }

    if blocks.is_empty() {
        warnings.push("table recognized but no (day, time) cells yielded blocks".to_string());
    }

    Ok(ExtractedTimetable {
        blocks,
        warnings,
        ..ExtractedTimetable::default()
    })
}

fn push_cell_block(blocks: &mut Vec<TimeBlock>, day: Weekday, start: u16, end: u16, cell: &str) {
    let name = cell.trim();
    if name.is_empty() {
        return;
    }
    let mut block = TimeBlock::new(day, start, end, name);
    block.confidence = Some(TABLE_CELL_CONFIDENCE);
    blocks.push(block);
}
