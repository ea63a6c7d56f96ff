mod phases;

use anyhow::{Context, Result};
use clap::Parser;
use grader_common::config::{self, JobConfig};
use grader_common::redis;
use grader_kernel::{ActivityTracker, Job};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "grader-worker")]
#[command(about = "Grade one submission and print the committed outcome as JSON", long_about = None)]
struct Args {
    /// Job configuration file (defaults to <testcase_dir>/config.json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Phase handler to run, overriding the configuration
    #[arg(short, long)]
    phase: Option<String>,

    /// Test cases graded concurrently (1 = sequential)
    #[arg(short, long)]
    workers: Option<usize>,

    /// Persist the outcome and statements to this Redis instance
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long, default_value = "false")]
    json_logs: bool,
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    info!("Grader worker booting...");

    let mut job_config = JobConfig::load(args.config.as_deref()).map_err(|e| {
        error!("Failed to load job configuration: {:#}", e);
        e
    })?;
    if let Some(phase) = &args.phase {
        job_config.insert(config::PHASE, phase.as_str());
    }
    let workers = args.workers.unwrap_or_else(|| job_config.workers());
    if job_config.is_debug() {
        debug!(config = ?job_config.as_map(), "Effective job configuration");
    }

    let registry = phases::registry();
    let phase = registry.resolve_for(&job_config).map_err(|e| {
        error!("{}", e);
        error!("Available phases: {:?}", registry.names());
        e
    })?;

    info!(
        phase = phase.name(),
        workers,
        submit_dir = %job_config.submit_dir().display(),
        testcase_dir = %job_config.testcase_dir().display(),
        "Job configured"
    );

    let track_enabled = job_config.track_enabled();
    let tracker = ActivityTracker::shared();
    let mut job = Job::new(job_config, phase, Arc::clone(&tracker));
    let job_id = job.id();

    let start = std::time::Instant::now();
    job.start(workers)
        .await
        .with_context(|| format!("grading job {job_id} aborted"))?;

    info!(
        job_id = %job_id,
        state = ?job.state(),
        verdict = %job.verdict(),
        score = job.score(),
        max_score = job.get_testcases().max_score(),
        execution_ms = start.elapsed().as_millis(),
        "Grading completed"
    );

    let outcome = job.outcome();
    println!("{}", serde_json::to_string_pretty(&outcome)?);

    match (&args.redis_url, track_enabled) {
        (Some(url), true) => persist(url, &outcome, &tracker).await,
        (Some(_), false) => info!(job_id = %job_id, "Tracking disabled, skipping persistence"),
        (None, _) => {}
    }

    Ok(())
}

async fn connect(url: &str) -> ::redis::RedisResult<::redis::aio::ConnectionManager> {
    let client = ::redis::Client::open(url)?;
    ::redis::aio::ConnectionManager::new(client).await
}

/// Store the committed outcome and the statement log. Failures are logged only.
async fn persist(url: &str, outcome: &grader_common::types::JobOutcome, tracker: &ActivityTracker) {
    let mut conn = match connect(url).await {
        Ok(conn) => conn,
        Err(e) => {
            warn!(error = %e, "Could not connect to Redis, outcome not persisted");
            return;
        }
    };

    match redis::store_outcome(&mut conn, outcome).await {
        Ok(_) => info!(job_id = %outcome.job_id, "Outcome persisted to Redis"),
        Err(e) => error!(job_id = %outcome.job_id, error = %e, "Failed to persist outcome"),
    }

    let statements: Vec<_> = tracker
        .get_statements_queue()
        .iter()
        .map(|statement| statement.as_ref().clone())
        .collect();
    match redis::store_statements(&mut conn, &outcome.job_id, &statements).await {
        Ok(_) => info!(job_id = %outcome.job_id, count = statements.len(), "Statements persisted to Redis"),
        Err(e) => error!(job_id = %outcome.job_id, error = %e, "Failed to persist statements"),
    }
}
