use anyhow::{bail, Context, Result};
use aws_config::SdkConfig;
use chrono::Utc;
use clap::{Parser, Subcommand};
use parcel_pipeline::api::{start_api_server, AppState};
use parcel_pipeline::aws::load_sdk_config;
use parcel_pipeline::queue::provision_queues;
use parcel_pipeline::reports::{parse_date, parse_month, Order};
use parcel_pipeline::{
    Capabilities, Config, InspectProcessor, ItemState, LifecycleMover, NewWorkItem, ObjectStore,
    PgStatusStore, Producer, ReportStore, RetryPolicy, RetryingWriter, S3ObjectStore,
    SnsNotifier, SqsQueue, StatusStore, Worker, WorkerSettings,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "parcel", about = "Queue-driven job pipeline with storage lifecycle", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Consume the work queue until SIGINT/SIGTERM
    Worker,
    /// Move stale report partitions to the cold bucket
    Sweep {
        /// Keep sweeping on the configured interval
        #[arg(long)]
        watch: bool,
    },
    /// Serve the report and status API
    Serve,
    /// Upload one file and enqueue it for processing
    Submit {
        file: PathBuf,
        /// Object key; defaults to uploads/<file name>
        #[arg(long)]
        key: Option<String>,
        /// Caller-chosen item ID
        #[arg(long)]
        item_id: Option<String>,
    },
    /// Create the dead-letter queue and the work queue with its redrive policy
    Provision,
    /// Partition a day's orders by product and upload them as CSV reports
    PublishReports {
        /// YYYY-MM-DD
        date: String,
        /// JSON array of orders
        orders: PathBuf,
    },
    /// Sum a month of daily reports into one revenue summary
    PublishMonthly {
        /// YYYY-MM
        month: String,
    },
    /// List status records, most recently updated first
    Items {
        /// uploaded, processing, processed or error
        #[arg(long)]
        state: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(service = %config.service.name, "Starting Parcel Pipeline");

    let sdk_config = load_sdk_config(&config.aws).await;
    let writer = RetryingWriter::new(RetryPolicy::from_config(&config.retry));

    match cli.command {
        Command::Worker => run_worker(&config, &sdk_config, writer).await,
        Command::Sweep { watch } => run_sweep(&config, &sdk_config, writer, watch).await,
        Command::Serve => run_server(&config, &sdk_config, writer).await,
        Command::Submit { file, key, item_id } => {
            run_submit(&config, &sdk_config, writer, file, key, item_id).await
        }
        Command::Provision => {
            let client = aws_sdk_sqs::Client::new(&sdk_config);
            let queues = provision_queues(&client, &config.queue)
                .await
                .context("Failed to provision queues")?;
            println!("queue_url={}", queues.queue_url);
            println!("dead_letter_queue_url={}", queues.dead_letter_queue_url);
            Ok(())
        }
        Command::PublishReports { date, orders } => {
            run_publish_reports(&config, &sdk_config, writer, &date, orders).await
        }
        Command::PublishMonthly { month } => {
            let (year, month) = parse_month(&month)?;
            let summary = report_store(&config, &sdk_config, writer)
                .publish_monthly(year, month)
                .await
                .context("Failed to publish monthly report")?;
            println!("{} ({} days, total {:.2})", summary.key, summary.days.len(), summary.total);
            Ok(())
        }
        Command::Items { state, limit } => {
            let state = state.as_deref().map(str::parse::<ItemState>).transpose()?;
            let store = connect_status_store(&config).await?;
            for record in store.list(state, limit).await? {
                println!("{}", serde_json::to_string(&record)?);
            }
            Ok(())
        }
    }
}

async fn run_worker(config: &Config, sdk_config: &SdkConfig, writer: RetryingWriter) -> Result<()> {
    init_metrics(config.service.metrics_port)?;

    let capabilities = connect(config, sdk_config).await?;
    let worker = Worker::new(
        capabilities,
        Arc::new(InspectProcessor),
        writer,
        WorkerSettings::from_config(&config.queue, &config.notifier),
    );

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    let stats = worker.run(shutdown).await?;
    info!(
        processed = stats.processed,
        failed = stats.failed,
        malformed = stats.malformed,
        unacknowledged = stats.unacknowledged,
        "Worker stopped"
    );
    Ok(())
}

async fn run_sweep(
    config: &Config,
    sdk_config: &SdkConfig,
    writer: RetryingWriter,
    watch: bool,
) -> Result<()> {
    let objects = Arc::new(S3ObjectStore::new(sdk_config, &config.aws, &config.storage));
    let mover = LifecycleMover::new(
        objects,
        writer,
        &config.storage.hot_bucket,
        &config.storage.cold_bucket,
        &config.storage.report_prefix,
        config.lifecycle.date_segment,
    );

    if watch {
        init_metrics(config.service.metrics_port)?;
        let shutdown = CancellationToken::new();
        tokio::spawn(cancel_on_signal(shutdown.clone()));
        mover
            .run(config.lifecycle_threshold(), config.sweep_interval(), shutdown)
            .await;
        return Ok(());
    }

    let report = mover
        .sweep(config.lifecycle_threshold(), Utc::now())
        .await
        .context("Lifecycle sweep failed")?;
    println!("{report:?}");
    Ok(())
}

async fn run_server(config: &Config, sdk_config: &SdkConfig, writer: RetryingWriter) -> Result<()> {
    init_metrics(config.service.metrics_port)?;

    let status = connect_status_store(config).await?;

    let state = AppState {
        reports: Arc::new(report_store(config, sdk_config, writer)),
        status,
        max_range_days: config.api.max_range_days,
    };

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));
    start_api_server(state, &config.api, shutdown).await
}

async fn run_submit(
    config: &Config,
    sdk_config: &SdkConfig,
    writer: RetryingWriter,
    file: PathBuf,
    key: Option<String>,
    item_id: Option<String>,
) -> Result<()> {
    let body = tokio::fs::read(&file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;

    let file_name = match file.file_name().and_then(|n| n.to_str()) {
        Some(name) => name.to_string(),
        None => bail!("{} has no usable file name", file.display()),
    };

    let mut item = NewWorkItem::new(key.unwrap_or_else(|| format!("uploads/{file_name}")), body)
        .with_metadata("original_name", file_name);
    if let Some(id) = item_id {
        item = item.with_item_id(id.as_str().into());
    }

    let capabilities = connect(config, sdk_config).await?;
    let producer = Producer::new(capabilities, &config.storage.hot_bucket, writer);
    let work_item = producer.submit(item).await.context("Failed to submit work item")?;

    println!("{}", work_item.item_id);
    Ok(())
}

async fn run_publish_reports(
    config: &Config,
    sdk_config: &SdkConfig,
    writer: RetryingWriter,
    date: &str,
    orders: PathBuf,
) -> Result<()> {
    let date = parse_date(date)?;
    let raw = tokio::fs::read(&orders)
        .await
        .with_context(|| format!("Failed to read {}", orders.display()))?;
    let orders: Vec<Order> = serde_json::from_slice(&raw).context("Failed to parse orders")?;

    let reports = report_store(config, sdk_config, writer);
    for partition in reports.publish_daily(date, &orders).await? {
        println!(
            "{} ({} rows, revenue {:.2})",
            partition.key, partition.rows, partition.revenue
        );
    }
    Ok(())
}

fn report_store(config: &Config, sdk_config: &SdkConfig, writer: RetryingWriter) -> ReportStore {
    let objects: Arc<dyn ObjectStore> =
        Arc::new(S3ObjectStore::new(sdk_config, &config.aws, &config.storage));
    ReportStore::new(
        objects,
        writer,
        &config.storage.hot_bucket,
        &config.storage.report_prefix,
    )
    .with_monthly_prefix(&config.storage.monthly_prefix)
}

/// Build the AWS/Postgres capability set
async fn connect(config: &Config, sdk_config: &SdkConfig) -> Result<Capabilities> {
    let queue = SqsQueue::connect(sdk_config, &config.queue)
        .await
        .context("Failed to connect to work queue")?;

    Ok(Capabilities {
        objects: Arc::new(S3ObjectStore::new(sdk_config, &config.aws, &config.storage)),
        queue: Arc::new(queue),
        status: connect_status_store(config).await?,
        notifier: Arc::new(SnsNotifier::new(sdk_config)),
    })
}

async fn connect_status_store(config: &Config) -> Result<Arc<PgStatusStore>> {
    let store = PgStatusStore::new(&config.database)
        .await
        .context("Failed to initialize status store")?;

    // Run migrations if enabled
    if config.database.run_migrations {
        store
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    Ok(Arc::new(store))
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

async fn cancel_on_signal(shutdown: CancellationToken) {
    if let Err(e) = shutdown_signal().await {
        error!(error = %e, "Signal handler failed, stopping");
    }
    shutdown.cancel();
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() -> Result<()> {
    let ctrl_c = async { signal::ctrl_c().await.context("Failed to install Ctrl+C handler") };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("Failed to install SIGTERM handler")?
            .recv()
            .await;
        Ok::<_, anyhow::Error>(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Result<()>>();

    tokio::select! {
        result = ctrl_c => {
            info!("Received Ctrl+C signal");
            result
        }
        result = terminate => {
            info!("Received SIGTERM signal");
            result
        }
    }
}
