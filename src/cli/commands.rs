//! CLI command definitions for hint-forge.
//!
//! Configuration comes from the environment (see [`HintConfig::from_env`]);
//! flags only override the few settings that are handy to change per run.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use crate::collaborators::{HttpHintDelivery, HttpProblemQuery, HttpProgramExecutor};
use crate::config::HintConfig;
use crate::intake::{submit_reflection, submit_request};
use crate::llm::LiteLlmClient;
use crate::metrics::{export_metrics, init_metrics};
use crate::models::{HintType, NewRequest};
use crate::phases::PhaseContext;
use crate::scheduler::{
    RedisConnector, RedisTaskQueue, TaskDispatcher, TaskQueue, WorkerPool, WorkerPoolConfig,
};
use crate::storage::PgStore;

/// Queue-driven generator of pedagogical hints for student programs.
#[derive(Parser)]
#[command(name = "hint-forge")]
#[command(about = "Turn student programs into pedagogical LLM hints")]
#[command(version)]
#[command(
    long_about = "hint-forge runs the hint generation pipeline: it executes student programs, asks an LLM for repaired or optimized variants, scores them, and generates a hint once every input has arrived.\n\nExample usage:\n  hint-forge migrate\n  hint-forge worker --workers 8\n  hint-forge submit --request-id 1 --problem-id sum_list --hint-type debug --program-file student.py"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Create or upgrade the database schema.
    Migrate,

    /// Run the worker pool until Ctrl-C.
    Worker(WorkerArgs),

    /// Submit a new hint request.
    Submit(SubmitArgs),

    /// Submit the student's reflection for a request.
    Reflect(ReflectArgs),

    /// Show pending and in-flight task counts.
    #[command(name = "queue-stats")]
    QueueStats,
}

/// Arguments for `hint-forge worker`.
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    /// Number of workers (overrides HINT_WORKERS).
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Path to the AI model YAML (overrides AI_CONFIG_PATH).
    #[arg(long)]
    pub ai_config: Option<PathBuf>,
}

/// Arguments for `hint-forge submit`.
#[derive(Parser, Debug)]
pub struct SubmitArgs {
    /// Externally assigned request id.
    #[arg(long)]
    pub request_id: i64,

    /// Problem the program was written for.
    #[arg(long)]
    pub problem_id: String,

    /// Kind of hint: plan, debug or optimize.
    #[arg(long, default_value = "debug")]
    pub hint_type: HintType,

    /// File containing the student's program.
    #[arg(long, conflicts_with = "program")]
    pub program_file: Option<PathBuf>,

    /// The student's program, inline.
    #[arg(long)]
    pub program: Option<String>,
}

/// Arguments for `hint-forge reflect`.
#[derive(Parser, Debug)]
pub struct ReflectArgs {
    #[arg(long)]
    pub request_id: i64,

    /// Question the student was asked.
    #[arg(long, default_value = "What do you think is wrong with your program?")]
    pub question: String,

    /// The student's answer.
    #[arg(long)]
    pub answer: String,
}

/// Parse CLI arguments and return the Cli struct.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = HintConfig::from_env().context("Invalid configuration")?;

    match cli.command {
        Commands::Migrate => run_migrate_command(&config).await,
        Commands::Worker(args) => run_worker_command(config, args).await,
        Commands::Submit(args) => run_submit_command(&config, args).await,
        Commands::Reflect(args) => run_reflect_command(&config, args).await,
        Commands::QueueStats => run_queue_stats_command(&config).await,
    }
}

/// Wires the production store, collaborators and LLM client.
async fn build_context(config: &HintConfig) -> anyhow::Result<PhaseContext> {
    let store = PgStore::connect(&config.database_url)
        .await
        .context("Failed to connect to the database")?;
    let llm = LiteLlmClient::from_config(config).context("Failed to build the LLM client")?;
    let ai = config.load_ai_config().context("Failed to load AI config")?;

    Ok(PhaseContext::new(
        Arc::new(store),
        Arc::new(HttpProgramExecutor::from_config(config)),
        Arc::new(HttpProblemQuery::new(&config.problem_query_url)),
        Arc::new(llm),
        Arc::new(HttpHintDelivery::new(&config.delivery_url)),
    )
    .with_ai_config(ai)
    .with_priorities(config.priorities))
}

async fn connect_queue(config: &HintConfig) -> anyhow::Result<RedisTaskQueue> {
    let queue = RedisTaskQueue::connect(&config.redis_url, &config.queue_name, config.max_priority)
        .await
        .context("Failed to connect to the task queue")?;
    Ok(queue.with_recovery_priority(config.priorities.retry))
}

async fn run_migrate_command(config: &HintConfig) -> anyhow::Result<()> {
    let store = PgStore::connect(&config.database_url)
        .await
        .context("Failed to connect to the database")?;
    let applied = store.run_migrations().await?;

    if applied == 0 {
        println!("Schema is up to date");
    } else {
        println!("Applied {} migration(s)", applied);
    }
    Ok(())
}

async fn run_worker_command(mut config: HintConfig, args: WorkerArgs) -> anyhow::Result<()> {
    if let Some(workers) = args.workers {
        config.num_workers = workers;
    }
    if let Some(path) = args.ai_config {
        config.ai_config_path = Some(path);
    }
    config.validate()?;

    if let Err(e) = init_metrics() {
        warn!(error = %e, "Metrics registration failed, continuing without metrics");
    }

    let ctx = Arc::new(build_context(&config).await?);
    let dispatcher = Arc::new(
        TaskDispatcher::new(ctx, config.max_tries).with_retry_pause(config.retry_pause),
    );
    let connector = Arc::new(RedisConnector {
        redis_url: config.redis_url.clone(),
        queue_name: config.queue_name.clone(),
        max_priority: config.max_priority,
        recovery_priority: config.priorities.retry,
        consumer_lease: config.consumer_lease,
    });

    let mut pool = WorkerPool::new(WorkerPoolConfig::from_config(&config), connector, dispatcher);
    pool.start().await?;
    info!(
        workers = config.num_workers,
        queue = %config.queue_name,
        "Waiting for tasks, press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c().await?;
    pool.shutdown().await?;

    let stats = pool.stats();
    info!(
        succeeded = stats.tasks_succeeded,
        retried = stats.tasks_retried,
        terminal = stats.tasks_terminal,
        already_applied = stats.tasks_already_applied,
        average_ms = stats.average_task_duration.as_millis() as u64,
        "Worker pool stopped"
    );
    info!("Metrics at shutdown:\n{}", export_metrics());

    Ok(())
}

async fn run_submit_command(config: &HintConfig, args: SubmitArgs) -> anyhow::Result<()> {
    let program = match (args.program_file, args.program) {
        (Some(path), _) => fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?,
        (None, Some(program)) => program,
        (None, None) => anyhow::bail!("Either --program-file or --program is required"),
    };

    let ctx = build_context(config).await?;
    let queue = connect_queue(config).await?;

    let request = submit_request(
        &ctx,
        &queue,
        NewRequest::new(args.request_id, args.problem_id, args.hint_type, program),
    )
    .await?;

    println!(
        "Submitted request {} ({} hint for {})",
        request.request_id, request.hint_type, request.problem_id
    );
    Ok(())
}

async fn run_reflect_command(config: &HintConfig, args: ReflectArgs) -> anyhow::Result<()> {
    let ctx = build_context(config).await?;
    let queue = connect_queue(config).await?;

    submit_reflection(&ctx, &queue, args.request_id, args.question, args.answer).await?;

    println!("Submitted reflection for request {}", args.request_id);
    Ok(())
}

async fn run_queue_stats_command(config: &HintConfig) -> anyhow::Result<()> {
    let queue = connect_queue(config).await?;
    let stats = queue.stats().await?;

    println!("Queue: {}", stats.queue_name);
    for (priority, pending) in &stats.pending_by_priority {
        println!("  priority {}: {} pending", priority, pending);
    }
    println!("  in flight: {}", stats.in_flight);
    println!("  total: {}", stats.total());
    Ok(())
}
