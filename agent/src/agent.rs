//! The agent service
//!
//! [`Agent`] owns the dispatch profiler and its two inbound ports: a
//! [`DispatchPort`] the runtime calls for every observed dispatch, and the
//! completion channel the runtime feeds through completion callbacks. The
//! event loop in [`Agent::run`] is the only consumer of completions.

use crate::config::{AgentConfig, ConfigError};
use crate::metrics;
use kdprof_gpu::{
    fatal, or_fatal, CompletionCallback, CompletionStatus, DispatchOutcome, DispatchProfiler, OutputStream,
    ProfilerError, ProfilingRuntime,
};
use kdprof_shared::{CompletionMode, CompletionReady, DispatchEvent};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Entry point for dispatch notifications. Cheap to clone; every runtime
/// thread may hold its own.
#[derive(Debug, Clone)]
pub struct DispatchPort {
    profiler: Arc<DispatchProfiler>,
}

impl DispatchPort {
    /// Observe one dispatch. Integrity failures terminate the process.
    pub fn dispatch(&self, event: &DispatchEvent) -> DispatchOutcome {
        let outcome = or_fatal(self.profiler.on_dispatch(event));
        match outcome {
            DispatchOutcome::Skipped { .. } => {
                metrics::DISPATCHES_TOTAL.with_label_values(&["skipped"]).inc();
            }
            DispatchOutcome::Profiled { session_opened, .. } => {
                metrics::DISPATCHES_TOTAL.with_label_values(&["profiled"]).inc();
                if session_opened {
                    metrics::SESSIONS_OPENED.inc();
                }
                metrics::CONTEXTS_IN_FLIGHT.inc();
            }
        }
        outcome
    }
}

/// Counts reported when the agent stops
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSummary {
    /// Dispatches observed, filtered or not
    pub observed: u64,
    /// Contexts finalized over the agent's lifetime
    pub collected: u64,
    /// Contexts finalized by the shutdown sweep
    pub swept: u64,
    /// Where results were written
    pub output: String,
}

pub struct Agent {
    profiler: Arc<DispatchProfiler>,
    completions: mpsc::UnboundedReceiver<CompletionReady>,
    output_dir: Option<PathBuf>,
}

impl Agent {
    /// Open the result stream and build the profiler from `config`
    pub fn start(config: &AgentConfig, runtime: Arc<dyn ProfilingRuntime>) -> Result<Self, ConfigError> {
        let output = match config.results_path() {
            Some(path) => OutputStream::create(&path).map_err(|source| ConfigError::ResultsFile { path, source })?,
            None => OutputStream::stdout(),
        };
        let settings = config.profiler_settings()?;

        let (tx, completions) = mpsc::unbounded_channel();
        let callback: Option<CompletionCallback> = match config.completion_mode() {
            CompletionMode::Push => Some(Arc::new(move |ready: CompletionReady| {
                if tx.send(ready).is_err() {
                    debug!("completion for dispatch[{}] after agent stop", ready.ordinal);
                }
            })),
            CompletionMode::Pull => None,
        };

        log_configuration(config);
        let profiler = DispatchProfiler::new(runtime, settings, Arc::new(output), callback);

        Ok(Self {
            profiler: Arc::new(profiler),
            completions,
            output_dir: config.output_dir.clone(),
        })
    }

    pub fn dispatch_port(&self) -> DispatchPort {
        DispatchPort {
            profiler: self.profiler.clone(),
        }
    }

    pub fn mode(&self) -> CompletionMode {
        self.profiler.mode()
    }

    pub fn profiler(&self) -> &Arc<DispatchProfiler> {
        &self.profiler
    }

    /// Handle completions until `shutdown` resolves, then drain the ones
    /// already queued
    pub async fn run(&mut self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                Some(ready) = self.completions.recv() => self.handle_completion(ready).await,
                _ = &mut shutdown => break,
            }
        }
        while let Ok(ready) = self.completions.try_recv() {
            self.handle_completion(ready).await;
        }
    }

    /// Finalization blocks on the store lock and on file writes, so it runs
    /// on the blocking pool instead of the event loop's worker.
    async fn handle_completion(&self, ready: CompletionReady) {
        let profiler = self.profiler.clone();
        let handled =
            tokio::task::spawn_blocking(move || profiler.on_completion(ready.ordinal, ready.record)).await;
        let status = match handled {
            Ok(result) => or_fatal(result),
            Err(e) => fatal(ProfilerError::session(format!(
                "completion handler for dispatch[{}] failed: {}",
                ready.ordinal, e
            ))),
        };
        match status {
            CompletionStatus::Finalized => {
                metrics::CONTEXTS_FINALIZED.with_label_values(&["handler"]).inc();
                metrics::CONTEXTS_IN_FLIGHT.dec();
            }
            CompletionStatus::Retry => metrics::COMPLETION_RETRIES.inc(),
            CompletionStatus::Absent => metrics::COMPLETIONS_ABSENT.inc(),
        }
    }

    /// Finalize every outstanding context and flush the result stream.
    ///
    /// Dispatch ports must not be used after this.
    pub fn stop(self) -> AgentSummary {
        let before = self.profiler.collected();
        let collected = or_fatal(self.profiler.shutdown());
        let swept = collected - before;
        metrics::CONTEXTS_FINALIZED
            .with_label_values(&["sweep"])
            .inc_by(swept as f64);
        metrics::CONTEXTS_IN_FLIGHT.sub(swept as f64);

        or_fatal(self.profiler.output().flush().map_err(ProfilerError::from));

        let output = match &self.output_dir {
            Some(dir) => dir.display().to_string(),
            None => self.profiler.output().name().to_string(),
        };
        info!("results written to {}", output);

        AgentSummary {
            observed: self.profiler.observed(),
            collected,
            swept,
            output,
        }
    }
}

fn log_configuration(config: &AgentConfig) {
    info!("completion mode: {:?}", config.completion_mode());
    if !config.metrics.is_empty() {
        info!("metrics: {}", config.metrics.join(", "));
    }
    for trace in &config.traces {
        let parameters: Vec<String> = trace
            .parameters
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect();
        info!(
            "trace: {}{} [{}]",
            trace.name,
            if trace.copy { " (copy)" } else { "" },
            parameters.join(", ")
        );
    }

    let filter = &config.filter;
    if let Some(range) = &filter.range {
        info!("filter range: {}", range);
    }
    if let Some(devices) = &filter.devices {
        let devices: Vec<String> = devices.iter().map(u32::to_string).collect();
        info!("filter gpu_index: {}", devices.join(", "));
    }
    if let Some(kernels) = &filter.kernel_substrings {
        info!("filter kernel: {}", kernels.join(", "));
    }
    match &config.output_dir {
        Some(dir) => info!("output directory: {}", dir.display()),
        None => info!("output: stdout"),
    }
}
