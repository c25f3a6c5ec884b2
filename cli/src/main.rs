//! `caseflow`: operator command line for the job orchestrator.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use caseflow::config::{default_config_path, load_config, validate_config, Config};
use caseflow::store::JobQuery;
use caseflow::{
    BatchRequest, Database, Dispatcher, DispatcherConfig, JobOptions, JobProgressBroadcaster,
    JobQueue, JobStatus, JobStore, PipelineRunner, StatusReader,
};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, EnvFilter};

#[derive(Parser)]
#[command(name = "caseflow")]
#[command(about = "Durable batch orchestrator for media analysis jobs")]
#[command(version)]
struct Cli {
    /// Config file (default: ~/.caseflow/config.json when it exists)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Queue a batch of uploads for analysis and print the job id
    Enqueue {
        #[arg(long = "case")]
        case_id: String,

        #[arg(long = "user")]
        user_id: String,

        /// Upload id (repeat for each file)
        #[arg(long = "upload", value_name = "ID")]
        upload_ids: Vec<String>,

        /// Video path (repeat for each file)
        #[arg(long = "video", value_name = "PATH")]
        video_paths: Vec<PathBuf>,

        /// Processing options as a JSON object
        #[arg(long, value_name = "JSON")]
        options: Option<String>,
    },

    /// Print a job's status, artifacts and log as JSON
    Status { job_id: String },

    /// List jobs, newest first
    List {
        /// queued, running, completed or failed
        #[arg(long)]
        status: Option<String>,

        #[arg(long = "case")]
        case_id: Option<String>,

        #[arg(long, default_value_t = 50)]
        limit: u64,
    },

    /// Ask a queued or running job to stop
    Cancel { job_id: String },

    /// Remove a job that is not running
    Delete { job_id: String },

    /// Run the dispatcher until interrupted
    Run,
}

fn main() -> Result<()> {
    init_logging()?;

    let cli = Cli::parse();
    let config = resolve_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Enqueue {
            case_id,
            user_id,
            upload_ids,
            video_paths,
            options,
        } => {
            let options = match options {
                Some(raw) => {
                    let value = serde_json::from_str(&raw).context("--options is not valid JSON")?;
                    JobOptions::from_value(value)?
                }
                None => JobOptions::default(),
            };
            let request = BatchRequest::new(case_id, user_id, upload_ids, video_paths, options);
            let job_id = JobQueue::new(open_store(&config)?).enqueue_batch(&request)?;
            println!("{}", job_id);
        }
        Commands::Status { job_id } => {
            let view = StatusReader::new(open_store(&config)?).get_job_status(&job_id)?;
            println!("{}", serde_json::to_string_pretty(&view)?);
        }
        Commands::List {
            status,
            case_id,
            limit,
        } => {
            let status = status
                .map(|s| JobStatus::parse(&s).ok_or_else(|| anyhow!("unknown status '{}'", s)))
                .transpose()?;
            let query = JobQuery {
                status,
                case_id,
                limit: Some(limit),
                ..Default::default()
            };
            let page = StatusReader::new(open_store(&config)?).list(&query)?;
            for job in &page.jobs {
                println!(
                    "{}  {:<9}  {:>5.1}%  case={}  artifacts={}  updated={}",
                    job.job_id,
                    job.status,
                    job.progress,
                    job.case_id,
                    job.artifact_count,
                    job.updated_at.to_rfc3339()
                );
            }
            println!("{} of {} job(s)", page.jobs.len(), page.total);
        }
        Commands::Cancel { job_id } => {
            let job = open_store(&config)?.request_cancel(&job_id)?;
            println!("cancellation requested for {} ({})", job.job_id, job.status);
        }
        Commands::Delete { job_id } => {
            open_store(&config)?.delete(&job_id)?;
            println!("deleted {}", job_id);
        }
        Commands::Run => run_dispatcher(&config)?,
    }

    Ok(())
}

fn init_logging() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::registry().with(filter).with(
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_writer(std::io::stderr),
    );
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to install tracing subscriber")?;
    tracing_log::LogTracer::init().context("failed to bridge log records")?;
    Ok(())
}

fn resolve_config(explicit: Option<&std::path::Path>) -> Result<Config> {
    if let Some(path) = explicit {
        return load_config(path).with_context(|| format!("loading {}", path.display()));
    }
    match default_config_path() {
        Some(path) if path.exists() => {
            load_config(&path).with_context(|| format!("loading {}", path.display()))
        }
        _ => {
            let config = Config::default();
            validate_config(&config)?;
            Ok(config)
        }
    }
}

fn open_store(config: &Config) -> Result<JobStore> {
    let db = Database::open(&config.database_path)
        .with_context(|| format!("opening {}", config.database_path.display()))?;
    Ok(JobStore::new(db))
}

fn run_dispatcher(config: &Config) -> Result<()> {
    let store = open_store(config)?.with_broadcaster(JobProgressBroadcaster::default());
    let runner = Arc::new(PipelineRunner::from_config(store.clone(), config));
    info!(
        owner = %runner.owner(),
        stages = ?runner.stage_kinds(),
        workers = config.worker_count,
        "Starting caseflow"
    );

    if let Some(mut events) = StatusReader::new(store).subscribe() {
        thread::Builder::new()
            .name("caseflow-progress".to_string())
            .spawn(move || loop {
                match events.blocking_recv() {
                    Ok(event) => debug!(
                        job_id = %event.job_id,
                        status = %event.status,
                        progress = event.progress,
                        estimate = ?event.estimated_progress,
                        "{}",
                        event.message
                    ),
                    Err(RecvError::Lagged(skipped)) => debug!(skipped, "Progress log lagging"),
                    Err(RecvError::Closed) => break,
                }
            })
            .context("failed to spawn progress logger")?;
    }

    let mut dispatcher = Dispatcher::new(runner, DispatcherConfig::from_config(config));
    dispatcher.start()?;

    let running = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&running);
    ctrlc::set_handler(move || flag.store(false, Ordering::SeqCst))
        .context("failed to install Ctrl-C handler")?;

    while running.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(200));
    }

    dispatcher.shutdown();
    dispatcher.wait();
    Ok(())
}
