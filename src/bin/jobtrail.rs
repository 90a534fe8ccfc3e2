//! jobtrail CLI: enqueue, perform and destroy instrumented jobs.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use jobtrail::config::secrets::ExposeSecret;
use jobtrail::config::{Config, PublisherSettings};
use jobtrail::db::{Db, PgmqTransport};
use jobtrail::job::{JobError, JobOutcome, JobRegistry, Perform, Worker, WorkerConfig};
use jobtrail::marshal::JsonLines;
use jobtrail::queue::{MemoryTransport, QueueInterceptor, QueueTransport};
use jobtrail::runtime::RuntimeContext;
use jobtrail::telemetry::{TelemetryConfig, init_telemetry};
use jobtrail::{Instrumentation, Item};
use serde_json::Value;

#[derive(Parser)]
#[command(name = "jobtrail", about = "Lifecycle events for background jobs")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one job end to end in memory and print its events
    Demo {
        /// Make the job fail
        #[arg(long)]
        fail: bool,
    },
    /// Push a job onto a pgmq queue
    Enqueue {
        queue: String,
        /// Handler name ("Echo" or "Fail")
        worker_class: String,
        /// JSON array of job arguments
        #[arg(long)]
        args: Option<String>,
    },
    /// Perform jobs from a pgmq queue
    Work {
        queue: String,
        /// Perform at most one job and exit
        #[arg(long)]
        once: bool,
        /// Seconds to wait when the queue is empty
        #[arg(long, default_value_t = 1)]
        poll_interval: u64,
    },
    /// Remove queued jobs of a worker class from a pgmq queue
    Destroy {
        queue: String,
        worker_class: String,
        /// Only remove jobs with exactly these arguments (JSON array)
        #[arg(long)]
        args: Option<String>,
    },
}

/// Logs its arguments.
struct Echo;

#[async_trait]
impl Perform for Echo {
    async fn perform(&self, args: &[Value], ctx: &RuntimeContext) -> Result<(), JobError> {
        let shown = Value::from(args.to_vec());
        tracing::info!(args = %shown, "echo");
        ctx.insert("echoed", args.len());
        Ok(())
    }
}

/// Always fails, with the first argument as its message.
struct Fail;

#[async_trait]
impl Perform for Fail {
    async fn perform(&self, args: &[Value], _ctx: &RuntimeContext) -> Result<(), JobError> {
        let message = args
            .first()
            .and_then(Value::as_str)
            .unwrap_or("job failed on purpose");
        Err(JobError::new("RuntimeError", message))
    }
}

fn registry() -> Arc<JobRegistry> {
    let mut registry = JobRegistry::new();
    registry.register("Echo", Arc::new(Echo));
    registry.register("Fail", Arc::new(Fail));
    Arc::new(registry)
}

fn parse_args(args: Option<&str>) -> anyhow::Result<Vec<Value>> {
    match args {
        Some(json) => match serde_json::from_str(json)? {
            Value::Array(values) => Ok(values),
            other => Ok(vec![other]),
        },
        None => Ok(Vec::new()),
    }
}

/// Event sinks from `JOBTRAIL_PUBLISHERS`, stdout when unset.
fn instrumentation(config: &Config) -> anyhow::Result<Arc<Instrumentation>> {
    let settings = config.publisher_settings(PublisherSettings::stdout())?;
    Ok(Arc::new(settings.instrumentation(Arc::new(JsonLines))?))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig::from_config(&config, "jobtrail"))?;

    match cli.command {
        Command::Demo { fail } => cmd_demo(&config, fail).await,
        Command::Enqueue {
            queue,
            worker_class,
            args,
        } => {
            let transport = connect(&config, &queue).await?;
            cmd_enqueue(&config, transport, &queue, worker_class, args.as_deref()).await
        }
        Command::Work {
            queue,
            once,
            poll_interval,
        } => {
            let transport = connect(&config, &queue).await?;
            cmd_work(&config, transport, queue, once, poll_interval).await
        }
        Command::Destroy {
            queue,
            worker_class,
            args,
        } => {
            let transport = connect(&config, &queue).await?;
            cmd_destroy(&config, transport, &queue, &worker_class, args.as_deref()).await
        }
    }
}

async fn connect(config: &Config, queue: &str) -> anyhow::Result<Arc<PgmqTransport>> {
    let db = Db::connect(config.require_database_url()?.expose_secret()).await?;
    db.ensure_pgmq().await?;
    db.create_queue(queue).await?;
    Ok(Arc::new(PgmqTransport::new(Arc::new(db))))
}

async fn cmd_demo(config: &Config, fail: bool) -> anyhow::Result<()> {
    let instrumentation = instrumentation(config)?;
    let transport = Arc::new(MemoryTransport::new());
    let producer = QueueInterceptor::new(Arc::clone(&transport), Arc::clone(&instrumentation));

    let item = if fail {
        Item::new("Fail").arg("demo failure")
    } else {
        Item::new("Echo").arg("hello").arg(42)
    };
    producer.push("default", item).await?;

    let worker = Worker::new(
        transport,
        registry(),
        instrumentation,
        WorkerConfig::default(),
    );
    if let Some(JobOutcome::Failed { error, .. }) = worker.work_once("default").await? {
        eprintln!("job failed: {error}");
    }
    Ok(())
}

async fn cmd_enqueue(
    config: &Config,
    transport: Arc<PgmqTransport>,
    queue: &str,
    worker_class: String,
    args: Option<&str>,
) -> anyhow::Result<()> {
    let producer = QueueInterceptor::new(transport, instrumentation(config)?);
    let item = Item::new(worker_class).args(parse_args(args)?);
    producer.push(queue, item).await?;
    Ok(())
}

async fn cmd_work(
    config: &Config,
    transport: Arc<PgmqTransport>,
    queue: String,
    once: bool,
    poll_interval: u64,
) -> anyhow::Result<()> {
    let worker = Arc::new(Worker::new(
        transport,
        registry(),
        instrumentation(config)?,
        WorkerConfig {
            poll_interval: Duration::from_secs(poll_interval),
        },
    ));

    if once {
        match worker.work_once(&queue).await? {
            None => eprintln!("queue {queue} is empty"),
            Some(JobOutcome::Finished { worker_class }) => eprintln!("{worker_class} finished"),
            Some(JobOutcome::Failed {
                worker_class,
                error,
            }) => eprintln!("{worker_class} failed: {error}"),
        }
        return Ok(());
    }

    let handle = Arc::clone(&worker);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        handle.shutdown();
    });

    worker.run(&queue).await?;
    Ok(())
}

async fn cmd_destroy(
    config: &Config,
    transport: Arc<PgmqTransport>,
    queue: &str,
    worker_class: &str,
    args: Option<&str>,
) -> anyhow::Result<()> {
    let queue_handle = QueueInterceptor::new(transport, instrumentation(config)?);
    let args = args.map(|json| parse_args(Some(json))).transpose()?;
    let removed = queue_handle
        .destroy(queue, worker_class, args.as_deref())
        .await?;
    eprintln!("removed {} job(s)", removed.len());
    Ok(())
}
