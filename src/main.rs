use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use clap::{Parser, ValueEnum};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use reliable_fetch::broker::RedisBroker;
use reliable_fetch::ledger::StatsSnapshot;
use reliable_fetch::shutdown::install_shutdown_handler;
use reliable_fetch::{
    Job, JobContext, JobError, JobHandler, Processor, ProcessorConfig, ProcessorError,
    QueueConfig,
};

#[derive(Parser, Debug)]
#[command(name = "reliable-fetch")]
#[command(version)]
#[command(about = "Process jobs from Redis lists with at-least-once delivery")]
struct Args {
    /// Redis URL
    #[arg(long, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    redis_url: String,

    /// Queues to serve, as "name:priority" (repeatable or comma-separated)
    /// Example: "critical:10,default:5,low:1"
    #[arg(long, short = 'q', value_delimiter = ',', default_value = "default:1")]
    queue: Vec<String>,

    /// Number of worker slots
    #[arg(long, short = 'c', env = "RF_CONCURRENCY", default_value = "10")]
    concurrency: usize,

    /// Milliseconds a task may hold the scheduler before it is asked to yield
    #[arg(long, default_value = "100")]
    preemption_threshold_ms: u64,

    /// Milliseconds a claim blocks on an empty queue
    #[arg(long, default_value = "2000")]
    claim_timeout_ms: u64,

    /// Seconds running jobs get to finish on shutdown
    #[arg(long, default_value = "25")]
    shutdown_grace_secs: u64,

    /// Seconds between stats reports
    #[arg(long, default_value = "5")]
    stats_interval_secs: u64,

    /// Busy-work each job performs, in milliseconds
    #[arg(long, default_value = "0")]
    simulate_work_ms: u64,

    /// Stats output format on stdout
    #[arg(long, short = 'o', default_value = "none")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    None,
    Json,
}

// =============================================================================
// Job Handler
// =============================================================================

/// Logs each payload, optionally spinning for a while to simulate CPU-bound
/// work.
struct LogHandler {
    work: Duration,
}

#[async_trait]
impl JobHandler for LogHandler {
    async fn perform(&self, job: &Job, ctx: &JobContext) -> Result<(), JobError> {
        tracing::info!(job_id = %job.id, queue = %job.queue, payload = %job.payload_lossy(), "Processing job");

        let started = Instant::now();
        while started.elapsed() < self.work {
            std::hint::spin_loop();
            ctx.checkpoint().await;
        }
        Ok(())
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

/// Parse `name:priority` specs. Any malformed entry aborts startup rather
/// than silently dropping that queue.
fn parse_queues(specs: &[String], claim_timeout: Duration) -> Result<Vec<QueueConfig>, ProcessorError> {
    specs
        .iter()
        .filter(|spec| !spec.trim().is_empty())
        .map(|spec| Ok(QueueConfig::parse(spec)?.with_claim_timeout(claim_timeout)))
        .collect()
}

async fn print_stats(mut rx: mpsc::Receiver<StatsSnapshot>) {
    while let Some(snapshot) = rx.recv().await {
        match serde_json::to_string(&snapshot) {
            Ok(line) => println!("{}", line),
            Err(e) => tracing::warn!(error = %e, "Failed to encode stats"),
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let claim_timeout = Duration::from_millis(args.claim_timeout_ms);
    let threshold = Duration::from_millis(args.preemption_threshold_ms);
    let mut config = ProcessorConfig::new(args.concurrency)
        .with_preemption_threshold(threshold)
        .with_shutdown_grace(Duration::from_secs(args.shutdown_grace_secs));
    config.stats_interval = Duration::from_secs(args.stats_interval_secs.max(1));
    // Check a few times per threshold period
    config.watchdog_interval = config
        .watchdog_interval
        .min(threshold / 4)
        .max(Duration::from_millis(1));
    for queue in parse_queues(&args.queue, claim_timeout)? {
        config = config.with_queue(queue);
    }

    tracing::info!(
        redis = %args.redis_url,
        queues = ?config.queues.iter().map(|q| format!("{}:{}", q.name, q.priority)).collect::<Vec<_>>(),
        concurrency = config.concurrency,
        "Starting reliable-fetch processor"
    );

    let broker = Arc::new(RedisBroker::open(&args.redis_url)?);
    let handler = Arc::new(LogHandler {
        work: Duration::from_millis(args.simulate_work_ms),
    });
    let mut processor = Processor::new(config, broker, handler)?;

    if let OutputFormat::Json = args.output {
        let (tx, rx) = mpsc::channel(16);
        processor = processor.with_stats_subscriber(tx);
        tokio::spawn(print_stats(rx));
    }

    let shutdown = install_shutdown_handler();
    processor.run(shutdown).await?;
    Ok(())
}
