//! Kernel dispatch profiling agent
//!
//! Replays a recorded dispatch stream against the simulated profiling
//! runtime and writes per-dispatch counter and trace results.

use anyhow::{Context, Result};
use clap::Parser;
use kdprof_agent::{metrics, replay, Agent, AgentConfig, Recording};
use kdprof_gpu::SimulatedRuntime;
use kdprof_shared::CompletionMode;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "kdprof-agent")]
#[command(about = "GPU kernel dispatch profiling agent", long_about = None)]
#[command(version)]
struct Args {
    /// Configuration file (TOML, JSON or YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Recorded dispatch stream (JSON)
    #[arg(short, long)]
    replay: PathBuf,

    /// Directory for results.txt and trace files (default: results on stdout)
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Completion mode: push or pull
    #[arg(long)]
    completion: Option<CompletionMode>,

    /// Counter names, comma separated
    #[arg(long, value_delimiter = ',')]
    metrics: Vec<String>,

    /// Ordinal range filter: "N" or "N:M"
    #[arg(long)]
    range: Option<String>,

    /// Device index filter, comma separated
    #[arg(long)]
    gpu_index: Option<String>,

    /// Kernel name substring filter, comma separated
    #[arg(long)]
    kernel: Option<String>,

    /// Write Prometheus metrics to this file at exit
    #[arg(long)]
    metrics_file: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_tracing(args.verbose)?;

    let config = load_config(&args)?;
    let recording = Recording::load(&args.replay)?;
    let runtime = Arc::new(SimulatedRuntime::new(recording.hardware.clone().into()));

    let mut agent = Agent::start(&config, runtime).context("Failed to start agent")?;
    let stats = replay(&mut agent, &recording).await?;
    info!(
        "replayed {} dispatches ({} profiled) from {} queues",
        stats.dispatched, stats.profiled, stats.queues
    );

    let summary = agent.stop();
    info!("{} of {} dispatches collected", summary.collected, summary.observed);

    if let Some(path) = &args.metrics_file {
        metrics::write_metrics(path)?;
        info!("metrics written to {}", path.display());
    }

    Ok(())
}

/// Merge file, environment and command line settings
fn load_config(args: &Args) -> Result<AgentConfig> {
    let mut config = AgentConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    if let Some(dir) = &args.output_dir {
        config.output_dir = Some(dir.clone());
    }
    if let Some(mode) = args.completion {
        config.completion = Some(mode);
    }
    if !args.metrics.is_empty() {
        config.metrics = args.metrics.clone();
    }
    config
        .override_filter(args.range.as_deref(), args.gpu_index.as_deref(), args.kernel.as_deref())
        .context("Invalid filter option")?;

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Initialize tracing/logging
fn init_tracing(verbose: bool) -> Result<()> {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();

    Ok(())
}
