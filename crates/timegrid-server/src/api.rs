//! Route handlers and wire DTOs for the timetable API.

use std::sync::Arc;

use axum::extract::{Multipart, Path, Query};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Extension, Json};
use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};

use timegrid_app::jobs::{Job, JobFilter, JobStatus, JobStore, JobStoreError, WebhookRecord};
use timegrid_app::services::{SubmissionFacade, SubmissionRequest, SubmitError};
use timegrid_app::timetable::{
    format_minutes, project_calendar, CalendarProjection, ExtractedTimetable,
};

const ERROR_INVALID_PARAMETER: &str = "invalid_parameter";
const ERROR_UNSUPPORTED_TYPE: &str = "unsupported_type";
const ERROR_PAYLOAD_TOO_LARGE: &str = "payload_too_large";
const ERROR_NOT_FOUND: &str = "not_found";
const ERROR_CONFLICT: &str = "conflict";
const ERROR_INTERNAL: &str = "internal_server_error";
pub(crate) const ERROR_RATE_LIMITED: &str = "rate_limited";

const LIST_PER_PAGE_MAX: usize = 100;

/// Shared handler state.
pub struct ApiState {
    pub facade: Arc<SubmissionFacade>,
    pub store: Arc<dyn JobStore>,
}

pub type ApiStateHandle = Arc<ApiState>;

#[derive(Debug, Serialize)]
pub struct ApiSuccess<T: Serialize> {
    pub success: bool,
    pub data: T,
}

impl<T: Serialize> ApiSuccess<T> {
    fn new(data: T) -> Self {
        Self {
            success: true,
            data,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiErrorBody {
    pub error: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ApiErrorBody,
}

impl ApiError {
    fn new(status: StatusCode, error: &'static str, message: impl Into<String>) -> Self {
        ApiError {
            status,
            body: ApiErrorBody {
                error,
                message: message.into(),
                field: None,
                retry_after_ms: None,
            },
        }
    }

    fn with_field(mut self, field: &str) -> Self {
        debug_assert!(!field.is_empty());
        self.body.field = Some(field.to_string());
        self
    }

    fn invalid_param(field: &str, message: impl Into<String>) -> Self {
        ApiError::new(StatusCode::BAD_REQUEST, ERROR_INVALID_PARAMETER, message).with_field(field)
    }

    fn not_found(message: impl Into<String>) -> Self {
        ApiError::new(StatusCode::NOT_FOUND, ERROR_NOT_FOUND, message)
    }

    fn conflict(message: impl Into<String>) -> Self {
        ApiError::new(StatusCode::CONFLICT, ERROR_CONFLICT, message)
    }

    fn internal() -> Self {
        ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            ERROR_INTERNAL,
            "internal server error",
        )
    }

    pub(crate) fn rate_limited(retry_after_ms: u64) -> Self {
        let mut err = ApiError::new(
            StatusCode::TOO_MANY_REQUESTS,
            ERROR_RATE_LIMITED,
            "rate limit exceeded; retry after backoff",
        );
        err.body.retry_after_ms = Some(retry_after_ms);
        err
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<SubmitError> for ApiError {
    fn from(error: SubmitError) -> Self {
        match &error {
            SubmitError::UnsupportedType(mime) => ApiError::new(
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                ERROR_UNSUPPORTED_TYPE,
                format!("artifact type `{mime}` is not supported"),
            ),
            SubmitError::TooLarge { size, limit } => ApiError::new(
                StatusCode::PAYLOAD_TOO_LARGE,
                ERROR_PAYLOAD_TOO_LARGE,
                format!("artifact of {size} bytes exceeds the {limit}-byte limit"),
            ),
            SubmitError::EmptyArtifact => ApiError::invalid_param("file", "artifact is empty"),
            SubmitError::InvalidWebhookUrl(_) => {
                ApiError::invalid_param("webhookUrl", error.to_string())
            }
            SubmitError::Blob(_) | SubmitError::Store(_) | SubmitError::Enqueue { .. } => {
                tracing::error!(%error, "submission failed");
                ApiError::internal()
            }
        }
    }
}

fn store_error(error: JobStoreError) -> ApiError {
    match error {
        JobStoreError::NotFound(id) => ApiError::not_found(format!("job `{id}` not found")),
        JobStoreError::InvalidTransition { job_id, from, .. } => ApiError::conflict(format!(
            "job `{job_id}` is {} and cannot be modified",
            from.as_str()
        )),
        other => {
            tracing::error!(error = %other, "job store operation failed");
            ApiError::internal()
        }
    }
}

fn rfc3339(at_ms: i64) -> String {
    Utc.timestamp_millis_opt(at_ms)
        .single()
        .unwrap_or_else(Utc::now)
        .to_rfc3339()
}

// ---- upload ----

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadData {
    pub job_id: String,
    pub status: &'static str,
    pub created_at: String,
    pub status_url: String,
    pub webhook_registered: bool,
}

pub async fn upload(
    Extension(state): Extension<ApiStateHandle>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let mut file: Option<(Vec<u8>, String, String)> = None;
    let mut teacher_name = None;
    let mut class_name = None;
    let mut webhook_url = None;
    let mut user_id = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::invalid_param("body", format!("malformed multipart body: {err}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                let original_name = field
                    .file_name()
                    .unwrap_or("artifact")
                    .to_string();
                let mime_type = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let bytes = field.bytes().await.map_err(|err| {
                    ApiError::invalid_param("file", format!("failed to read file field: {err}"))
                })?;
                file = Some((bytes.to_vec(), mime_type, original_name));
            }
            "teacherName" => teacher_name = read_text_field(field, "teacherName").await?,
            "className" => class_name = read_text_field(field, "className").await?,
            "webhookUrl" => webhook_url = read_text_field(field, "webhookUrl").await?,
            "userId" => user_id = read_text_field(field, "userId").await?,
            _ => {}
        }
    }

    let (bytes, mime_type, original_name) =
        file.ok_or_else(|| ApiError::invalid_param("file", "missing `file` field"))?;

    let outcome = state
        .facade
        .submit(SubmissionRequest {
            bytes,
            mime_type,
            original_name,
            teacher_name,
            class_name,
            submitter: user_id,
            webhook_url,
        })
        .await?;

    let data = UploadData {
        status_url: format!("/api/v2/timetable/jobs/{}", outcome.job_id),
        job_id: outcome.job_id,
        status: "pending",
        created_at: rfc3339(outcome.created_at_ms),
        webhook_registered: outcome.webhook_registered,
    };
    Ok((StatusCode::ACCEPTED, Json(ApiSuccess::new(data))))
}

async fn read_text_field(
    field: axum::extract::multipart::Field<'_>,
    name: &'static str,
) -> Result<Option<String>, ApiError> {
    let value = field
        .text()
        .await
        .map_err(|err| ApiError::invalid_param(name, format!("failed to read field: {err}")))?;
    let trimmed = value.trim();
    Ok(if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    })
}

// ---- status & listing ----

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusData {
    pub job_id: String,
    pub status: &'static str,
    pub original_file_name: String,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub complexity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_log: Option<Vec<RetryLogData>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<TimetableData>,
}

/// Wire form of an extracted timetable: `HH:MM` time strings, full English
/// day names.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimetableData {
    pub teacher_name: Option<String>,
    pub class_name: Option<String>,
    pub term: Option<String>,
    pub week: Option<String>,
    pub blocks: Vec<TimeBlockData>,
    pub recurring_blocks: Vec<RecurringBlockData>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeBlockData {
    pub day: &'static str,
    pub start_time: String,
    pub end_time: String,
    pub event_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    pub is_fixed: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecurringBlockData {
    pub start_time: String,
    pub end_time: String,
    pub event_name: String,
    pub applies_daily: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl From<ExtractedTimetable> for TimetableData {
    fn from(timetable: ExtractedTimetable) -> Self {
        let blocks = timetable
            .blocks
            .into_iter()
            .map(|b| TimeBlockData {
                day: weekday_name(b.day),
                start_time: format_minutes(b.start_min),
                end_time: format_minutes(b.end_min),
                event_name: b.event_name,
                notes: b.notes,
                color: b.color,
                confidence: b.confidence,
                is_fixed: b.is_fixed,
            })
            .collect();
        let recurring_blocks = timetable
            .recurring_blocks
            .into_iter()
            .map(|r| RecurringBlockData {
                start_time: format_minutes(r.start_min),
                end_time: format_minutes(r.end_min),
                event_name: r.event_name,
                applies_daily: r.applies_daily,
                notes: r.notes,
            })
            .collect();
        Self {
            teacher_name: timetable.teacher_name,
            class_name: timetable.class_name,
            term: timetable.term,
            week: timetable.week,
            blocks,
            recurring_blocks,
            warnings: timetable.warnings,
        }
    }
}

fn weekday_name(day: timegrid_app::timetable::Weekday) -> &'static str {
    use timegrid_app::timetable::Weekday;
    match day {
        Weekday::Monday => "Monday",
        Weekday::Tuesday => "Tuesday",
        Weekday::Wednesday => "Wednesday",
        Weekday::Thursday => "Thursday",
        Weekday::Friday => "Friday",
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryLogData {
    pub attempt: u32,
    pub error_type: String,
    pub message: String,
    pub at: String,
}

pub async fn get_job(
    Extension(state): Extension<ApiStateHandle>,
    Path(job_id): Path<String>,
) -> Result<Json<ApiSuccess<JobStatusData>>, ApiError> {
    let job = state
        .store
        .get_job(&job_id)
        .map_err(store_error)?
        .ok_or_else(|| ApiError::not_found(format!("job `{job_id}` not found")))?;

    let result = if job.status == JobStatus::Completed {
        state
            .store
            .get_result(&job_id)
            .map_err(store_error)?
            .map(TimetableData::from)
    } else {
        None
    };
    let retry_log = if job.status == JobStatus::Failed {
        let rows = state.store.retry_log(&job_id).map_err(store_error)?;
        Some(
            rows.into_iter()
                .map(|row| RetryLogData {
                    attempt: row.attempt,
                    error_type: row.kind.as_ref().to_string(),
                    message: row.message,
                    at: rfc3339(row.at_ms),
                })
                .collect(),
        )
    } else {
        None
    };

    Ok(Json(ApiSuccess::new(job_status_data(job, result, retry_log))))
}

fn job_status_data(
    job: Job,
    result: Option<TimetableData>,
    retry_log: Option<Vec<RetryLogData>>,
) -> JobStatusData {
    JobStatusData {
        job_id: job.job_id,
        status: job.status.as_str(),
        original_file_name: job.original_name,
        created_at: rfc3339(job.created_at_ms),
        started_at: job.started_at_ms.map(rfc3339),
        completed_at: job.completed_at_ms.map(rfc3339),
        processing_method: job.method,
        complexity: job.complexity,
        error_message: job.error,
        retry_count: job.retry_count,
        max_retries: job.max_retries,
        retry_log,
        result,
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub page: Option<usize>,
    #[serde(default)]
    pub per_page: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSummaryData {
    pub job_id: String,
    pub status: &'static str,
    pub original_file_name: String,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_method: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListData {
    pub jobs: Vec<JobSummaryData>,
    pub pagination: PaginationData,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaginationData {
    pub page: usize,
    pub per_page: usize,
    pub total: usize,
    pub total_pages: usize,
}

pub async fn list_jobs(
    Extension(state): Extension<ApiStateHandle>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ApiSuccess<ListData>>, ApiError> {
    let status = match query.status.as_deref() {
        None => None,
        Some(raw) => Some(parse_status(raw)?),
    };
    let page = query.page.unwrap_or(1).max(1);
    let per_page = query.per_page.unwrap_or(20).clamp(1, LIST_PER_PAGE_MAX);

    let result = state
        .store
        .list_jobs(&JobFilter {
            status,
            page,
            per_page,
        })
        .map_err(store_error)?;

    let jobs = result
        .jobs
        .into_iter()
        .map(|job| JobSummaryData {
            job_id: job.job_id,
            status: job.status.as_str(),
            original_file_name: job.original_name,
            created_at: rfc3339(job.created_at_ms),
            completed_at: job.completed_at_ms.map(rfc3339),
            processing_method: job.method,
        })
        .collect();
    let total_pages = result.total.div_ceil(per_page);

    Ok(Json(ApiSuccess::new(ListData {
        jobs,
        pagination: PaginationData {
            page,
            per_page,
            total: result.total,
            total_pages,
        },
    })))
}

fn parse_status(raw: &str) -> Result<JobStatus, ApiError> {
    match raw.to_ascii_lowercase().as_str() {
        "pending" => Ok(JobStatus::Pending),
        "processing" => Ok(JobStatus::Processing),
        "completed" => Ok(JobStatus::Completed),
        "failed" => Ok(JobStatus::Failed),
        "cancelled" => Ok(JobStatus::Cancelled),
        other => Err(ApiError::invalid_param(
            "status",
            format!("unknown status `{other}`"),
        )),
    }
}

// ---- webhook attach ----

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachWebhookRequest {
    pub url: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookData {
    pub webhook_id: String,
    pub job_id: String,
    pub url: String,
    pub created_at: String,
}

pub async fn attach_webhook(
    Extension(state): Extension<ApiStateHandle>,
    Path(job_id): Path<String>,
    Json(request): Json<AttachWebhookRequest>,
) -> Result<Json<ApiSuccess<WebhookData>>, ApiError> {
    let parsed = url::Url::parse(&request.url)
        .map_err(|_| ApiError::invalid_param("url", "not a valid URL"))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ApiError::invalid_param("url", "must use http or https"));
    }

    let job = state
        .store
        .get_job(&job_id)
        .map_err(store_error)?
        .ok_or_else(|| ApiError::not_found(format!("job `{job_id}` not found")))?;
    if job.status.is_terminal() {
        return Err(ApiError::conflict(format!(
            "job `{job_id}` is already {}",
            job.status.as_str()
        )));
    }

    let hook = WebhookRecord::new(&job_id, &request.url);
    state.store.create_webhook(&hook).map_err(store_error)?;

    Ok(Json(ApiSuccess::new(WebhookData {
        webhook_id: hook.webhook_id,
        job_id,
        url: request.url,
        created_at: rfc3339(hook.created_at_ms),
    })))
}

// ---- cancel ----

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelData {
    pub job_id: String,
    pub status: &'static str,
}

pub async fn cancel_job(
    Extension(state): Extension<ApiStateHandle>,
    Path(job_id): Path<String>,
) -> Result<Json<ApiSuccess<CancelData>>, ApiError> {
    let job = state
        .store
        .cancel_job(&job_id, timegrid_app::jobs::current_timestamp_ms())
        .map_err(store_error)?;
    Ok(Json(ApiSuccess::new(CancelData {
        job_id: job.job_id,
        status: job.status.as_str(),
    })))
}

// ---- calendar projection ----

pub async fn fullcalendar(
    Extension(state): Extension<ApiStateHandle>,
    Path(job_id): Path<String>,
) -> Result<Json<CalendarProjection>, ApiError> {
    let job = state
        .store
        .get_job(&job_id)
        .map_err(store_error)?
        .ok_or_else(|| ApiError::not_found(format!("job `{job_id}` not found")))?;
    if job.status != JobStatus::Completed {
        return Err(ApiError::conflict(format!(
            "job `{job_id}` is {}; calendar projection requires a completed job",
            job.status.as_str()
        )));
    }
    let result = state
        .store
        .get_result(&job_id)
        .map_err(store_error)?
        .ok_or_else(|| {
            tracing::error!(%job_id, "completed job has no stored result");
            ApiError::internal()
        })?;
    Ok(Json(project_calendar(&result)))
}
