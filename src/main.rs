use anyhow::{Context, Result};
use binlog_capture::{
    CheckpointStore, Config, DurableBuffer, FileLogReader, RedbBuffer, Task, TaskRecord,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "binlog-capture")]
#[command(about = "MySQL binlog change capture into a local durable buffer", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
    config: PathBuf,

    #[arg(short, long, help = "Enable JSON output for logs")]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging")]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Capture changes until a termination signal arrives
    Run,
    /// Print the stored checkpoint and buffer size for the configured task
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose);

    info!("Loading configuration from {:?}", args.config);
    let config = Config::from_file(&args.config)
        .with_context(|| format!("failed to load configuration from {:?}", args.config))?;

    let store_path = config.store_path();
    let buffer = RedbBuffer::open(&store_path)
        .with_context(|| format!("failed to open store at {:?}", store_path))?;

    match args.command.unwrap_or(Command::Run) {
        Command::Run => run(config, Arc::new(buffer)).await,
        Command::Status => status(&config, &buffer),
    }
}

async fn run(config: Config, buffer: Arc<dyn DurableBuffer>) -> Result<()> {
    info!(
        log_dir = %config.source.log_dir.display(),
        store = %config.store_path().display(),
        binlog_file = %config.source.binlog_file,
        binlog_position = config.source.binlog_position,
        use_stored_position = config.source.use_stored_position,
        batch_size = config.pipeline.batch_size,
        "Configuration summary"
    );
    if config.task.id.is_none() {
        warn!("No task.id configured; this run cannot be resumed by a new process");
    }

    let reader = FileLogReader::new(config.source.log_dir.clone(), config.poll_interval());
    let mut task = Task::new(config.task_config(), Box::new(reader), buffer)
        .context("failed to create task")?;

    task.start()
        .await
        .with_context(|| format!("failed to start task {}", task.id()))?;

    let failed = match task.cancellation() {
        Some(cancel) => tokio::select! {
            result = wait_for_shutdown_signal() => {
                result?;
                false
            }
            _ = cancel.cancelled() => true,
        },
        None => false,
    };

    task.stop().await;

    if failed {
        error!(task_id = %task.id(), "Pipeline failed");
        anyhow::bail!("task {} stopped after a pipeline failure", task.id());
    }

    info!(task_id = %task.id(), "Shutdown complete");
    Ok(())
}

fn status(config: &Config, buffer: &RedbBuffer) -> Result<()> {
    let Some(task_id) = config.task.id.as_deref() else {
        anyhow::bail!("status needs a configured task.id");
    };

    let position_bucket = format!("{}_{}", task_id, config.storage.position_bucket);
    let row_bucket = format!("{}_{}", task_id, config.storage.row_bucket);
    buffer.create_buckets_if_absent(&[
        position_bucket.as_str(),
        row_bucket.as_str(),
        config.storage.task_bucket.as_str(),
    ])?;

    let checkpoints = CheckpointStore::new(
        Arc::new(buffer.clone()),
        position_bucket,
        config.storage.position_key.clone(),
    );

    println!("task:       {}", task_id);
    match checkpoints.load()? {
        Some(position) => println!("checkpoint: {}", position),
        None => println!("checkpoint: none"),
    }
    println!("buffered:   {}", buffer.size(&row_bucket)?);
    match TaskRecord::load(buffer, &config.storage.task_bucket, task_id)? {
        Some(record) => println!(
            "state:      {} (updated {})",
            record.state,
            record.updated_at.to_rfc3339()
        ),
        None => println!("state:      unknown"),
    }
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    let mut interrupt =
        signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;
    let mut terminate =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut hangup = signal(SignalKind::hangup()).context("failed to install SIGHUP handler")?;
    let mut quit = signal(SignalKind::quit()).context("failed to install SIGQUIT handler")?;

    let name = tokio::select! {
        _ = interrupt.recv() => "SIGINT",
        _ = terminate.recv() => "SIGTERM",
        _ = hangup.recv() => "SIGHUP",
        _ = quit.recv() => "SIGQUIT",
    };
    info!(signal = name, "Received shutdown signal");
    Ok(())
}

fn init_logging(json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("binlog_capture=debug,info")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("binlog_capture=info,warn"))
    };

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
