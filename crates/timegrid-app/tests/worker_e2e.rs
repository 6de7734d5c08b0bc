//! End-to-end worker protocol tests over the in-memory queue, store, and
//! blob fakes: clean completion, retry-then-DLQ, cancellation race, and
//! duplicate delivery after visibility expiry.

use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use timegrid_app::config::PipelineConfig;
use timegrid_app::jobs::{JobStatus, JobStore, MemoryJobStore};
use timegrid_app::queue::{JobQueue, MemoryQueue, QueueMessage};
use timegrid_app::services::{
    ExtractError, ExtractionOrchestrator, Extractor, FilePreprocessor, MemoryBlobStore,
    MetadataHint, ModelError, ProcessedArtifact, SubmissionFacade, SubmissionRequest,
    WebhookNotifier,
};
use timegrid_app::timetable::{ExtractedTimetable, TimeBlock, Weekday};
use timegrid_app::worker::{process_message, WorkerDeps};

const VISIBILITY: Duration = Duration::from_secs(5);

struct MockExtractor {
    calls: AtomicUsize,
    fail: bool,
}

impl MockExtractor {
    fn ok() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail: false,
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail: true,
        })
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Extractor for MockExtractor {
    async fn extract(
        &self,
        _artifact: &ProcessedArtifact,
        hint: &MetadataHint,
    ) -> Result<ExtractedTimetable, ExtractError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(ExtractError::Vision(ModelError::Status {
                status: 503,
                body: "model overloaded".to_string(),
            }));
        }
        let mut result = ExtractedTimetable {
            blocks: vec![
                TimeBlock::new(Weekday::Monday, 540, 600, "Maths"),
                TimeBlock::new(Weekday::Monday, 600, 660, "English"),
            ],
            ..ExtractedTimetable::default()
        };
        hint.apply(&mut result);
        Ok(result)
    }
}

struct Harness {
    queue: Arc<MemoryQueue>,
    store: Arc<MemoryJobStore>,
    blob: Arc<MemoryBlobStore>,
    facade: SubmissionFacade,
    deps: WorkerDeps,
    structured: Arc<MockExtractor>,
    vision: Arc<MockExtractor>,
}

fn harness(config: PipelineConfig, structured_fails: bool, vision_fails: bool) -> Harness {
    let queue = Arc::new(MemoryQueue::new(VISIBILITY));
    let store = Arc::new(MemoryJobStore::new());
    let blob = Arc::new(MemoryBlobStore::new());

    let structured = if structured_fails {
        MockExtractor::failing()
    } else {
        MockExtractor::ok()
    };
    let vision = if vision_fails {
        MockExtractor::failing()
    } else {
        MockExtractor::ok()
    };

    let orchestrator = Arc::new(ExtractionOrchestrator::new(
        structured.clone(),
        vision.clone(),
        vision.clone(),
        config.clone(),
    ));
    let deps = WorkerDeps {
        queue: queue.clone(),
        store: store.clone(),
        blob: blob.clone(),
        preprocessor: Arc::new(FilePreprocessor::new(None)),
        orchestrator,
        notifier: Arc::new(WebhookNotifier::new(store.clone()).expect("notifier")),
        config: config.clone(),
    };
    let facade = SubmissionFacade::new(blob.clone(), store.clone(), queue.clone(), config);

    Harness {
        queue,
        store,
        blob,
        facade,
        deps,
        structured,
        vision,
    }
}

fn sample_png() -> Vec<u8> {
    let img = image::DynamicImage::new_rgb8(64, 48);
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, image::ImageFormat::Png)
        .expect("encode test png");
    out.into_inner()
}

fn submission() -> SubmissionRequest {
    SubmissionRequest {
        bytes: sample_png(),
        mime_type: "image/png".to_string(),
        original_name: "grid.png".to_string(),
        teacher_name: Some("Ms Patel".to_string()),
        class_name: None,
        submitter: None,
        webhook_url: None,
    }
}

async fn next_message(queue: &MemoryQueue) -> QueueMessage {
    let mut messages = queue
        .receive(1, Duration::from_millis(100))
        .await
        .expect("receive");
    assert_eq!(messages.len(), 1, "expected exactly one visible message");
    messages.remove(0)
}

#[tokio::test]
async fn clean_submission_completes_with_structured_method() {
    let h = harness(PipelineConfig::default(), false, false);
    let outcome = h.facade.submit(submission()).await.expect("submit");

    let message = next_message(&h.queue).await;
    process_message(&h.deps, message).await;

    let job = h
        .store
        .get_job(&outcome.job_id)
        .expect("read")
        .expect("job exists");
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.method.as_deref(), Some("structured"));
    assert_eq!(job.complexity.as_deref(), Some("simple"));
    assert!(job.started_at_ms.is_some());
    assert!(job.completed_at_ms.is_some());

    let result = h
        .store
        .get_result(&outcome.job_id)
        .expect("result read")
        .expect("result stored");
    assert_eq!(result.teacher_name.as_deref(), Some("Ms Patel"));
    assert!(!result.blocks.is_empty());
    // Sorted per-day blocks never overlap after validation.
    let monday: Vec<_> = result
        .blocks
        .iter()
        .filter(|b| b.day == Weekday::Monday)
        .collect();
    for window in monday.windows(2) {
        assert!(window[0].end_min <= window[1].start_min);
    }

    let result_key = job.result_blob_key.expect("result blob key assigned");
    assert!(h.blob.contains(&result_key), "result document uploaded");
    assert_eq!(h.queue.depth().await, 0, "message removed from main queue");
    assert!(h.queue.dead_letters().await.is_empty());
    assert_eq!(h.structured.call_count(), 1);
    assert_eq!(h.vision.call_count(), 0);
}

#[tokio::test]
async fn failing_backend_retries_then_dead_letters() {
    tokio::time::pause();
    // Structured disabled so the router lands on the (failing) vision
    // backend; the in-process fallback is disabled to keep one call per
    // delivery.
    let config = PipelineConfig {
        structured_enabled: false,
        vision_fallback_enabled: false,
        ..PipelineConfig::default()
    };
    let h = harness(config, false, true);
    let outcome = h.facade.submit(submission()).await.expect("submit");

    for attempt in 1..=3u32 {
        let message = next_message(&h.queue).await;
        process_message(&h.deps, message).await;

        let job = h
            .store
            .get_job(&outcome.job_id)
            .expect("read")
            .expect("job exists");
        assert_eq!(job.retry_count, attempt);

        if attempt < 3 {
            assert_eq!(job.status, JobStatus::Processing);
            assert_eq!(
                h.queue.depth().await,
                1,
                "message must stay queued for redelivery"
            );
            // Nothing is visible until the visibility timeout lapses.
            let hidden = h
                .queue
                .receive(1, Duration::from_millis(50))
                .await
                .expect("receive");
            assert!(hidden.is_empty());
            tokio::time::advance(VISIBILITY + Duration::from_secs(1)).await;
        }
    }

    let job = h
        .store
        .get_job(&outcome.job_id)
        .expect("read")
        .expect("job exists");
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.retry_count, job.max_retries);
    assert!(job.error.is_some());
    assert!(job.completed_at_ms.is_some());

    let retry_log = h.store.retry_log(&outcome.job_id).expect("retry log");
    assert_eq!(
        retry_log.iter().map(|r| r.attempt).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );

    let letters = h.queue.dead_letters().await;
    assert_eq!(letters.len(), 1, "exactly one DLQ echo");
    assert!(letters[0].body.contains(&outcome.job_id));
    assert!(letters[0].error.starts_with("vision_backend_error"));
    assert_eq!(h.queue.depth().await, 0, "main queue drained after final failure");
}

#[tokio::test]
async fn cancelled_job_is_dropped_without_backend_calls() {
    let h = harness(PipelineConfig::default(), false, false);
    let outcome = h.facade.submit(submission()).await.expect("submit");

    h.store
        .cancel_job(&outcome.job_id, 1)
        .expect("cancel while pending");

    let message = next_message(&h.queue).await;
    process_message(&h.deps, message).await;

    let job = h
        .store
        .get_job(&outcome.job_id)
        .expect("read")
        .expect("job exists");
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.started_at_ms.is_none(), "no processing happened");
    assert_eq!(h.structured.call_count(), 0);
    assert_eq!(h.vision.call_count(), 0);
    assert_eq!(h.queue.depth().await, 0, "message deleted");
    assert!(h.store.get_result(&outcome.job_id).expect("read").is_none());
}

#[tokio::test]
async fn duplicate_delivery_does_not_double_write() {
    tokio::time::pause();
    let h = harness(PipelineConfig::default(), false, false);
    let outcome = h.facade.submit(submission()).await.expect("submit");

    // First delivery, then visibility expiry yields a second delivery of the
    // same message before the first worker finishes.
    let first = next_message(&h.queue).await;
    tokio::time::advance(VISIBILITY + Duration::from_secs(1)).await;
    let second = next_message(&h.queue).await;
    assert_eq!(first.message_id, second.message_id);

    process_message(&h.deps, first).await;
    let job_after_first = h
        .store
        .get_job(&outcome.job_id)
        .expect("read")
        .expect("job exists");
    assert_eq!(job_after_first.status, JobStatus::Completed);
    let first_result_key = job_after_first.result_blob_key.clone().expect("key");

    // The first worker's delete used a stale receipt, so the message is
    // still queued; the second delivery must observe Completed and clean up
    // without re-running extraction.
    assert_eq!(h.queue.depth().await, 1);
    let calls_after_first = h.structured.call_count();

    process_message(&h.deps, second).await;

    let job_after_second = h
        .store
        .get_job(&outcome.job_id)
        .expect("read")
        .expect("job exists");
    assert_eq!(job_after_second.status, JobStatus::Completed);
    assert_eq!(
        job_after_second.result_blob_key.as_deref(),
        Some(first_result_key.as_str()),
        "result blob key never overwritten"
    );
    assert_eq!(h.structured.call_count(), calls_after_first, "no second extraction");
    assert_eq!(h.queue.depth().await, 0, "second delivery deleted the message");
    assert!(h.queue.dead_letters().await.is_empty());
}

#[tokio::test]
async fn unparseable_message_is_deleted_and_logged() {
    let h = harness(PipelineConfig::default(), false, false);
    h.queue
        .send("this is not json".to_string(), Vec::new())
        .await
        .expect("send");

    let message = next_message(&h.queue).await;
    process_message(&h.deps, message).await;

    assert_eq!(h.queue.depth().await, 0);
    assert_eq!(h.structured.call_count(), 0);
}

#[tokio::test]
async fn handwritten_path_uses_vision_and_completes() {
    // Structured failing + fallback enabled: the router's choice fails, the
    // vision fallback completes, and the method records the fallback.
    let h = harness(PipelineConfig::default(), true, false);
    let outcome = h.facade.submit(submission()).await.expect("submit");

    let message = next_message(&h.queue).await;
    process_message(&h.deps, message).await;

    let job = h
        .store
        .get_job(&outcome.job_id)
        .expect("read")
        .expect("job exists");
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.method.as_deref(), Some("vision_error_fallback"));
    assert_eq!(job.complexity.as_deref(), Some("complex"));
    assert_eq!(h.vision.call_count(), 1);
}
