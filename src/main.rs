use audiobook_pipeline::config::PipelineConfig;
use audiobook_pipeline::services::chapterizer::{split_manuscript, write_chapter_files};
use audiobook_pipeline::services::pipeline::{AudiobookPipeline, GenerationReport};
use audiobook_pipeline::services::orchestrator::StopHandle;
use audiobook_pipeline::utils::strip_bom;
use anyhow::{bail, Context};
use axum::{
    Router,
    extract::{Multipart, State},
    http::StatusCode,
    response::{
        Html, Json,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use clap::{Parser, Subcommand};
use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_stream::{Stream, StreamExt, wrappers::BroadcastStream};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser)]
#[command(name = "audiobook")]
#[command(about = "Turn a directory of chapter texts into a narrated audiobook")]
struct Cli {
    /// TOML configuration file
    #[arg(long, short, global = true, default_value = "audiobook.toml")]
    config: PathBuf,

    /// Debug logging (RUST_LOG still wins when set)
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP service
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Synthesize and assemble the audiobook, resuming any earlier run
    Generate {
        #[arg(long)]
        chapters: Option<PathBuf>,
        #[arg(long)]
        output: Option<PathBuf>,
        /// Conservative chunk ceiling with even distribution
        #[arg(long)]
        safe_mode: bool,
        /// Mix background music into the book
        #[arg(long)]
        music: bool,
        /// Only write chapter files
        #[arg(long)]
        no_combine: bool,
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// Show how chapters would be chunked
    Plan {
        #[arg(long)]
        chapters: Option<PathBuf>,
        #[arg(long)]
        safe_mode: bool,
    },
    /// Show checkpoint progress per chapter
    Status,
    /// Delete the checkpoint
    Reset {
        #[arg(long)]
        confirm: bool,
    },
    /// Split one manuscript into chapter files
    Split {
        manuscript: PathBuf,
        /// Defaults to the configured chapter directory
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    fmt().with_env_filter(filter).init();

    let mut config = PipelineConfig::load(Some(&cli.config))?;

    match cli.command {
        Command::Serve { port } => {
            if let Some(port) = port {
                config.server.port = port;
            }
            serve(config).await
        }
        Command::Generate {
            chapters,
            output,
            safe_mode,
            music,
            no_combine,
            concurrency,
        } => {
            if let Some(dir) = chapters {
                config.paths.chapters_dir = dir;
            }
            if let Some(dir) = output {
                config.paths.output_dir = dir;
            }
            config.planner.safe_mode |= safe_mode;
            config.assembly.music.enabled |= music;
            config.assembly.combine_book &= !no_combine;
            if let Some(concurrency) = concurrency {
                config.generation.concurrency = concurrency;
            }
            config.validate()?;
            generate(config).await
        }
        Command::Plan { chapters, safe_mode } => {
            if let Some(dir) = chapters {
                config.paths.chapters_dir = dir;
            }
            config.planner.safe_mode |= safe_mode;
            let pipeline = AudiobookPipeline::from_config(config);
            for chapter in pipeline.plan()? {
                let sizes: Vec<usize> = chapter.chunks.iter().map(|c| c.tokens).collect();
                println!("{:>3}  {:<32} {:>3} chunks  tokens {:?}", chapter.id + 1, chapter.name, sizes.len(), sizes);
            }
            Ok(())
        }
        Command::Status => {
            let pipeline = AudiobookPipeline::from_config(config);
            let status = pipeline.status().await?;
            match status.run_id {
                Some(id) => println!("Run {}", id),
                None => println!("No checkpoint yet"),
            }
            for s in status.summaries {
                println!("{:>3}  {:<32} {}/{} done, {} failed {:?}", s.chapter + 1, s.name, s.succeeded, s.total, s.failed, s.failed_chunks);
            }
            Ok(())
        }
        Command::Reset { confirm } => {
            if !confirm {
                bail!("refusing to delete the checkpoint without --confirm");
            }
            let pipeline = AudiobookPipeline::from_config(config);
            if pipeline.reset().await? {
                println!("Checkpoint removed");
            } else {
                println!("No checkpoint to remove");
            }
            Ok(())
        }
        Command::Split { manuscript, out } => {
            let raw = std::fs::read(&manuscript).with_context(|| format!("could not read {}", manuscript.display()))?;
            let text = String::from_utf8(strip_bom(&raw).to_vec()).context("manuscript is not valid UTF-8")?;
            let sections = split_manuscript(&text);
            let dir = out.unwrap_or(config.paths.chapters_dir);
            let files = write_chapter_files(&dir, &sections)?;
            for (section, file) in sections.iter().zip(&files) {
                println!("{}  {}", file.display(), section.title);
            }
            Ok(())
        }
    }
}

async fn generate(config: PipelineConfig) -> anyhow::Result<()> {
    let pipeline = AudiobookPipeline::from_config(config);
    let stop = StopHandle::new();

    let mut events = pipeline.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            tracing::info!(chunk = %event.chunk, status = %event.status, attempts = event.attempts, "progress");
        }
    });

    let on_ctrl_c = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Stop requested; waiting for in-flight chunks");
            on_ctrl_c.stop();
        }
    });

    let report = pipeline.generate(&stop).await;
    drop(pipeline);
    printer.abort();
    print_report(&report?);
    Ok(())
}

fn print_report(report: &GenerationReport) {
    println!("Run {} {:?}: {} chunks synthesized", report.run_id, report.outcome, report.synthesized);
    for s in &report.summaries {
        println!("{:>3}  {:<32} {}/{} done, {} failed {:?}", s.chapter + 1, s.name, s.succeeded, s.total, s.failed, s.failed_chunks);
    }
    for chapter in &report.chapters {
        println!("chapter  {}", chapter.artifact.path.display());
    }
    if let Some(book) = &report.book {
        println!("book     {} ({:.1}s)", book.path.display(), book.duration_secs);
    }
}

#[derive(Default)]
struct RunSlot {
    stop: Option<StopHandle>,
    last: Option<serde_json::Value>,
}

#[derive(Clone)]
struct AppState {
    pipeline: Arc<AudiobookPipeline>,
    run: Arc<Mutex<RunSlot>>,
}

async fn serve(config: PipelineConfig) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let app_state = AppState {
        pipeline: Arc::new(AudiobookPipeline::from_config(config)),
        run: Arc::new(Mutex::new(RunSlot::default())),
    };

    let app = Router::new()
        .route("/", get(index))
        .route("/health", get(health_check))
        .route("/upload", post(upload_file))
        .route("/runs", post(start_run))
        .route("/runs/stop", post(stop_run))
        .route("/runs/status", get(run_status))
        .route("/runs/events", get(run_events))
        .with_state(app_state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::AllowMethods::any())
                .allow_headers(tower_http::cors::AllowHeaders::any()),
        );

    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}

async fn index() -> Html<&'static str> {
    Html(
        r#"<!DOCTYPE html>
<html>
<head><title>Audiobook Generator</title><meta charset="utf-8"></head>
<body>
  <h1>Audiobook Generator</h1>
  <ul>
    <li>GET /health</li>
    <li>POST /upload - multipart field 'text_file', split into chapter files</li>
    <li>POST /runs - start or resume generation</li>
    <li>POST /runs/stop - pause the current run</li>
    <li>GET /runs/status - checkpoint progress and the last report</li>
    <li>GET /runs/events - progress as server-sent events</li>
  </ul>
</body>
</html>"#,
    )
}

async fn health_check() -> &'static str {
    "OK"
}

async fn upload_file(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<serde_json::Value>, StatusCode> {
    while let Some(field) = multipart.next_field().await.map_err(|_| StatusCode::BAD_REQUEST)? {
        if field.name() != Some("text_file") {
            continue;
        }
        let data = field.bytes().await.map_err(|_| StatusCode::BAD_REQUEST)?;
        let text = String::from_utf8(strip_bom(&data).to_vec()).map_err(|_| StatusCode::BAD_REQUEST)?;

        let sections = split_manuscript(&text);
        let dir = state.pipeline.config().paths.chapters_dir.clone();
        let files = write_chapter_files(&dir, &sections).map_err(|e| {
            tracing::error!("Could not write chapter files: {:#}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

        return Ok(Json(serde_json::json!({
            "success": true,
            "chapter_count": files.len(),
            "chapters": sections.iter().map(|s| &s.title).collect::<Vec<_>>(),
        })));
    }

    Err(StatusCode::BAD_REQUEST)
}

async fn start_run(State(state): State<AppState>) -> Result<(StatusCode, Json<serde_json::Value>), StatusCode> {
    let mut slot = state.run.lock().await;
    if slot.stop.is_some() {
        return Err(StatusCode::CONFLICT);
    }
    let stop = StopHandle::new();
    slot.stop = Some(stop.clone());
    drop(slot);

    let pipeline = state.pipeline.clone();
    let run = state.run.clone();
    tokio::spawn(async move {
        let result = pipeline.generate(&stop).await;
        let last = match result {
            Ok(report) => serde_json::to_value(&report).unwrap_or_default(),
            Err(e) => {
                tracing::error!("Generation failed: {:#}", e);
                serde_json::json!({ "error": format!("{:#}", e) })
            }
        };
        let mut slot = run.lock().await;
        slot.stop = None;
        slot.last = Some(last);
    });

    Ok((StatusCode::ACCEPTED, Json(serde_json::json!({ "started": true }))))
}

async fn stop_run(State(state): State<AppState>) -> StatusCode {
    match &state.run.lock().await.stop {
        Some(stop) => {
            stop.stop();
            StatusCode::ACCEPTED
        }
        None => StatusCode::NOT_FOUND,
    }
}

async fn run_status(State(state): State<AppState>) -> Result<Json<serde_json::Value>, StatusCode> {
    let status = state.pipeline.status().await.map_err(|e| {
        tracing::error!("Could not read status: {:#}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    let slot = state.run.lock().await;
    Ok(Json(serde_json::json!({
        "running": slot.stop.is_some(),
        "stopping": slot.stop.as_ref().is_some_and(StopHandle::is_stopped),
        "run_id": status.run_id,
        "chapters": status.summaries,
        "last_report": slot.last,
    })))
}

async fn run_events(State(state): State<AppState>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = BroadcastStream::new(state.pipeline.subscribe())
        .filter_map(|event| event.ok())
        .filter_map(|event| Event::default().event("progress").json_data(event).ok())
        .map(Ok);
    Sse::new(stream).keep_alive(KeepAlive::default())
}
