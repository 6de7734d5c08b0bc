use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use thiserror::Error;
use tokio::sync::watch;
use tracing_subscriber::{filter::LevelFilter, fmt};

use timegrid_app::config::{AppConfig, AppConfigError, BackendConfig};
use timegrid_app::jobs::LmdbJobStore;
use timegrid_app::paths::AppPaths;
use timegrid_app::queue::MemoryQueue;
use timegrid_app::services::{
    ChatOcr, ExtractionOrchestrator, FilePreprocessor, FsBlobStore, HttpChatModel, HybridBackend,
    OcrConfig, StructuredBackend, SubmissionFacade, VisionBackend, WebhookNotifier,
};
use timegrid_app::services::extract::{Extractor, HttpTableRecognizer};
use timegrid_app::worker::{WorkerDeps, WorkerPool};
use timegrid_server::api::ApiState;

#[derive(Debug, Parser)]
#[command(name = "timegrid", about = "Teacher timetable extraction service")]
struct Cli {
    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the HTTP API together with the worker pool.
    Serve,
    /// Run the worker pool only.
    Worker,
    /// Preprocess and classify a local artifact, printing the routing report.
    ValidateFile {
        path: PathBuf,
        /// MIME type override; inferred from the extension when omitted.
        #[arg(long)]
        mime: Option<String>,
    },
}

#[derive(Debug, Error)]
enum MainError {
    #[error(transparent)]
    Config(#[from] AppConfigError),
    #[error(transparent)]
    ServerConfig(#[from] timegrid_server::config::ServerConfigError),
    #[error(transparent)]
    App(#[from] timegrid_app::AppError),
    #[error(transparent)]
    Server(#[from] timegrid_server::ServerError),
    #[error("backend configuration incomplete: {0}")]
    MissingBackend(&'static str),
    #[error(transparent)]
    Model(#[from] timegrid_app::services::ModelError),
    #[error(transparent)]
    Webhook(#[from] timegrid_app::services::WebhookError),
    #[error(transparent)]
    Blob(#[from] timegrid_app::services::BlobError),
    #[error(transparent)]
    Preprocess(#[from] timegrid_app::services::PreprocessError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("failed to read input file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot infer MIME type for {0}; pass --mime")]
    UnknownExtension(PathBuf),
}

impl From<timegrid_app::jobs::JobStoreError> for MainError {
    fn from(e: timegrid_app::jobs::JobStoreError) -> Self {
        MainError::App(e.into())
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(match cli.verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    });

    if let Err(err) = run(cli).await {
        eprintln!("{err}");
        process::exit(1);
    }
}

fn init_tracing(level: LevelFilter) {
    let subscriber = fmt().with_max_level(level).with_target(false).finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        tracing::warn!("tracing subscriber already set; skipping re-initialization");
    }
}

async fn run(cli: Cli) -> Result<(), MainError> {
    match cli.command {
        Command::Serve => {
            let app_config = timegrid_app::config::load()?;
            let server_config = timegrid_server::config::load()?;
            let runtime = Runtime::build(&app_config)?;

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let pool = WorkerPool::new(runtime.worker_deps());
            let worker_handle = tokio::spawn(async move { pool.run(shutdown_rx).await });

            let state = Arc::new(ApiState {
                facade: runtime.facade.clone(),
                store: runtime.store.clone(),
            });
            let serve_result = timegrid_server::serve(server_config, state).await;

            // The HTTP server only returns on shutdown; stop the pool too.
            let _ = shutdown_tx.send(true);
            let _ = worker_handle.await;
            serve_result?;
            Ok(())
        }
        Command::Worker => {
            let app_config = timegrid_app::config::load()?;
            let runtime = Runtime::build(&app_config)?;

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            tokio::spawn(async move {
                let _ = tokio::signal::ctrl_c().await;
                let _ = shutdown_tx.send(true);
            });
            WorkerPool::new(runtime.worker_deps()).run(shutdown_rx).await;
            Ok(())
        }
        Command::ValidateFile { path, mime } => validate_file(path, mime).await,
    }
}

/// Wired pipeline components shared by the server and the worker pool.
struct Runtime {
    facade: Arc<SubmissionFacade>,
    store: Arc<LmdbJobStore>,
    queue: Arc<MemoryQueue>,
    blob: Arc<FsBlobStore>,
    preprocessor: Arc<FilePreprocessor>,
    orchestrator: Arc<ExtractionOrchestrator>,
    notifier: Arc<WebhookNotifier>,
    config: timegrid_app::config::PipelineConfig,
}

impl Runtime {
    fn build(config: &AppConfig) -> Result<Self, MainError> {
        let paths = AppPaths::new(&config.storage.data_dir)
            .map_err(timegrid_app::AppError::from)?;
        let store = Arc::new(LmdbJobStore::open(&paths)?);
        let blob = Arc::new(FsBlobStore::open(&paths)?);
        let queue = Arc::new(MemoryQueue::new(config.pipeline.visibility_timeout()));

        let backends = &config.backends;
        let timeout = config.pipeline.backend_timeout();

        let vision_model = Arc::new(build_chat_model(
            &backends.vision_endpoint,
            &backends.vision_model,
            backends,
            timeout,
            "backends.vision_endpoint",
        )?);
        let ocr_model = Arc::new(build_chat_model(
            &backends.ocr_endpoint,
            &backends.ocr_model,
            backends,
            timeout,
            "backends.ocr_endpoint",
        )?);
        if backends.table_endpoint.trim().is_empty() {
            return Err(MainError::MissingBackend("backends.table_endpoint"));
        }
        let recognizer = HttpTableRecognizer::new(
            backends.table_endpoint.clone(),
            std::env::var(&backends.api_key_env).ok(),
            timeout,
        )?;

        let structured: Arc<dyn Extractor> = Arc::new(StructuredBackend::new(recognizer));
        let vision_backend = Arc::new(VisionBackend::new(vision_model));
        let hybrid: Arc<dyn Extractor> = Arc::new(HybridBackend::new(
            structured.clone(),
            vision_backend.clone(),
        ));
        let orchestrator = Arc::new(ExtractionOrchestrator::new(
            structured,
            vision_backend,
            hybrid,
            config.pipeline.clone(),
        ));

        let ocr = Arc::new(ChatOcr::new(ocr_model, OcrConfig::default()));
        let preprocessor = Arc::new(FilePreprocessor::new(Some(ocr)));
        let notifier = Arc::new(WebhookNotifier::new(store.clone())?);
        let facade = Arc::new(SubmissionFacade::new(
            blob.clone(),
            store.clone(),
            queue.clone(),
            config.pipeline.clone(),
        ));

        Ok(Self {
            facade,
            store,
            queue,
            blob,
            preprocessor,
            orchestrator,
            notifier,
            config: config.pipeline.clone(),
        })
    }

    fn worker_deps(&self) -> WorkerDeps {
        WorkerDeps {
            queue: self.queue.clone(),
            store: self.store.clone(),
            blob: self.blob.clone(),
            preprocessor: self.preprocessor.clone(),
            orchestrator: self.orchestrator.clone(),
            notifier: self.notifier.clone(),
            config: self.config.clone(),
        }
    }
}

fn build_chat_model(
    endpoint: &str,
    model: &str,
    backends: &BackendConfig,
    timeout: std::time::Duration,
    field: &'static str,
) -> Result<HttpChatModel, MainError> {
    if endpoint.trim().is_empty() || model.trim().is_empty() {
        return Err(MainError::MissingBackend(field));
    }
    let api_key = std::env::var(&backends.api_key_env).ok();
    Ok(HttpChatModel::new(
        endpoint,
        model,
        api_key,
        timeout,
    )?)
}

async fn validate_file(path: PathBuf, mime: Option<String>) -> Result<(), MainError> {
    let bytes = std::fs::read(&path).map_err(|source| MainError::Io {
        path: path.clone(),
        source,
    })?;
    let mime = match mime {
        Some(explicit) => explicit,
        None => infer_mime(&path)?,
    };
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "artifact".to_string());

    let preprocessor = FilePreprocessor::new(None);
    let artifact = preprocessor.preprocess(bytes, &mime, &name).await?;
    let report = timegrid_app::services::classify(&artifact);

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn infer_mime(path: &PathBuf) -> Result<String, MainError> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    let mime = match ext.as_deref() {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        Some("pdf") => "application/pdf",
        Some("docx") => {
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
        }
        _ => return Err(MainError::UnknownExtension(path.clone())),
    };
    Ok(mime.to_string())
}
