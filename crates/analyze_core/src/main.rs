//! Thin CLI entry point for the analysis engine: drives `Engine` end to
//! end for manual testing and scripting. The HTTP surface this engine is
//! meant to sit behind is out of scope here — `analyze serve` boots the
//! scheduler and background refresher and blocks on a signal, but does
//! not itself listen on a socket.

use std::process::ExitCode;
use std::sync::Arc;

use analyze_core::{Engine, SubmitRequest};
use analyze_protocol::{JobId, SystemConfig};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "analyze", about = "Profile analysis orchestration engine")]
struct Cli {
    /// Enable verbose logging (info/debug to stderr)
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// SQLite database URL (defaults to a file under ~/.analyze_core)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Submit a job for a subject, waiting for fast-path resolution only
    Submit {
        /// Source identifier (e.g. scholar, github, linkedin)
        #[arg(long)]
        source: String,

        /// Raw input content, parsed as JSON if it looks like JSON,
        /// otherwise wrapped as a bare string under "content"
        #[arg(long)]
        content: String,

        /// Comma-separated card types to request (default: the source's
        /// full card set)
        #[arg(long, value_delimiter = ',')]
        cards: Vec<String>,

        /// Wait for job completion before printing (sync) or return
        /// immediately with the job snapshot (async)
        #[arg(long, default_value = "async")]
        mode: SubmitMode,

        /// Idempotency key: replays an identical prior request instead of
        /// creating a new job
        #[arg(long)]
        idempotency_key: Option<String>,

        /// Skip the cache-hit fast path and force a fresh run
        #[arg(long)]
        force_refresh: bool,
    },

    /// Inspect an existing job
    Job {
        #[command(subcommand)]
        action: JobAction,
    },

    /// Boot the scheduler and background refresher, blocking until
    /// SIGINT/SIGTERM
    Serve,
}

#[derive(Subcommand, Debug)]
enum JobAction {
    /// Print a snapshot of a job and its cards
    Get {
        /// Job id
        job_id: i64,
    },
    /// Stream a job's events as NDJSON until it reaches a terminal state
    Stream {
        /// Job id
        job_id: i64,

        /// Only print events after this sequence number
        #[arg(long, default_value = "0")]
        after: i64,
    },
    /// Cancel a job: stop dispatching further cards for it and finalize
    /// it as cancelled
    Cancel {
        /// Job id
        job_id: i64,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
enum SubmitMode {
    Sync,
    Async,
}

fn default_database_url() -> String {
    if let Ok(url) = std::env::var("ANALYZE_DATABASE_URL") {
        return url;
    }
    let path = analyze_logging::analyze_home().join("analyze.db");
    format!("sqlite://{}", path.display())
}

fn parse_content(raw: &str) -> serde_json::Value {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(value) => value,
        Err(_) => serde_json::json!({ "content": raw }),
    }
}

fn subject_key_for(source: &str, input: &serde_json::Value) -> String {
    for key in ["subject_key", "id", "login", "url"] {
        if let Some(value) = input.get(key).and_then(|v| v.as_str()) {
            return value.to_string();
        }
    }
    if let Some(content) = input.get("content").and_then(|v| v.as_str()) {
        return content.to_string();
    }
    format!("{source}:unknown")
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let database_url = cli.database_url.clone().unwrap_or_else(default_database_url);
    let config = SystemConfig {
        database_url,
        ..SystemConfig::default()
    };

    let executor = Arc::new(analyze_core::demo_executor::EchoExecutor);
    let gate = Arc::new(analyze_core::demo_executor::PassthroughGate);
    let engine = Engine::bootstrap(config, executor, gate).await?;

    match cli.command {
        Commands::Submit { source, content, cards, mode, idempotency_key, force_refresh } => {
            let input = parse_content(&content);
            let subject_key = subject_key_for(&source, &input);
            let requested_cards = if cards.is_empty() { None } else { Some(cards) };

            let response = engine
                .submit(SubmitRequest {
                    user_id: "cli".to_string(),
                    source,
                    subject_key,
                    input,
                    options: serde_json::json!({}),
                    requested_cards,
                    idempotency_key,
                    force_refresh,
                })
                .await?;

            if mode == SubmitMode::Sync && !response.cache_hit {
                await_terminal(&engine, response.job.job.id).await?;
                let refreshed = engine.get_job(response.job.job.id).await?;
                println!("{}", serde_json::to_string_pretty(&refreshed)?);
            } else {
                println!("{}", serde_json::to_string_pretty(&response.job)?);
            }
        }
        Commands::Job { action } => match action {
            JobAction::Get { job_id } => {
                let job = engine.get_job(JobId::new(job_id)).await?;
                println!("{}", serde_json::to_string_pretty(&job)?);
            }
            JobAction::Stream { job_id, after } => {
                stream_job(&engine, JobId::new(job_id), after).await?;
            }
            JobAction::Cancel { job_id } => {
                let cancelled = engine.cancel_job(JobId::new(job_id)).await?;
                if cancelled {
                    println!("job {job_id} cancelled");
                } else {
                    println!("job {job_id} already terminal, not cancelled");
                }
            }
        },
        Commands::Serve => {
            info!("analyze serve: scheduler and background refresher are live");
            wait_for_shutdown().await;
            info!("shutdown signal received, stopping scheduler");
            engine.stop();
        }
    }

    Ok(())
}

async fn stream_job(engine: &Engine, job_id: JobId, after: i64) -> anyhow::Result<()> {
    let mut stream = Box::pin(engine.stream_job(job_id, after));
    while let Some(event) = stream.next().await {
        let event = event?;
        let is_terminal = event.event_type.is_job_terminal();
        println!("{}", serde_json::to_string(&event)?);
        if is_terminal {
            break;
        }
    }
    Ok(())
}

async fn await_terminal(engine: &Engine, job_id: JobId) -> anyhow::Result<()> {
    stream_job(engine, job_id, 0).await
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let tui_mode = false;
    if let Err(e) = analyze_logging::init_logging(analyze_logging::LogConfig {
        app_name: "analyze",
        verbose: cli.verbose,
        tui_mode,
    }) {
        eprintln!("Warning: failed to initialize logging: {e:?}");
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start tokio runtime: {e}");
            return ExitCode::from(1);
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:?}");
            eprintln!("{err:?}");
            ExitCode::from(1)
        }
    }
}
