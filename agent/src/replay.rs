//! Recorded dispatch streams
//!
//! A recording is a JSON document with the dispatches to observe and the
//! answers the simulated hardware gives for them:
//!
//! ```json
//! {
//!   "hardware": { "metrics": { "SQ_WAVES": 128 }, "trace_units": [[1, 0, 2, 0]] },
//!   "dispatches": [ { "kernel_name": "gemm", "device_index": 0, "queue_index": 0 } ]
//! }
//! ```
//!
//! Replaying feeds every queue from its own task, the way runtime threads
//! report dispatches concurrently.

use crate::agent::Agent;
use anyhow::{Context, Result};
use kdprof_gpu::SimulatedHardware;
use kdprof_shared::DispatchEvent;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

fn default_device_count() -> u32 {
    1
}

/// Answers of the simulated device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareRecording {
    #[serde(default = "default_device_count")]
    pub device_count: u32,

    #[serde(default)]
    pub metrics: HashMap<String, u64>,

    /// Payload of every trace unit
    #[serde(default)]
    pub trace_units: Vec<Vec<u8>>,

    /// Unit labels the device reports for `trace_units` (positional when absent)
    #[serde(default)]
    pub trace_unit_ids: Vec<u32>,

    /// Report every dispatch as not complete once before completing it
    #[serde(default)]
    pub stall_completions: bool,
}

impl Default for HardwareRecording {
    fn default() -> Self {
        Self {
            device_count: default_device_count(),
            metrics: HashMap::new(),
            trace_units: Vec::new(),
            trace_unit_ids: Vec::new(),
            stall_completions: false,
        }
    }
}

impl From<HardwareRecording> for SimulatedHardware {
    fn from(recording: HardwareRecording) -> Self {
        SimulatedHardware {
            device_count: recording.device_count,
            metrics: recording.metrics,
            trace_units: recording.trace_units,
            trace_unit_ids: recording.trace_unit_ids,
            stall_completions: recording.stall_completions,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recording {
    #[serde(default)]
    pub hardware: HardwareRecording,

    pub dispatches: Vec<DispatchEvent>,
}

impl Recording {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read recording {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("Invalid recording {}", path.display()))
    }

    /// Dispatches grouped by queue, each queue in recorded order
    pub fn queues(&self) -> BTreeMap<u64, Vec<DispatchEvent>> {
        let mut queues: BTreeMap<u64, Vec<DispatchEvent>> = BTreeMap::new();
        for event in &self.dispatches {
            queues.entry(event.queue_index).or_default().push(event.clone());
        }
        queues
    }
}

/// Counts of one replay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub queues: usize,
    pub dispatched: u64,
    pub profiled: u64,
}

/// Feed every dispatch of `recording` to `agent` and handle completions
/// until all producers are done. The agent is not stopped.
pub async fn replay(agent: &mut Agent, recording: &Recording) -> Result<ReplayStats> {
    let queues = recording.queues();
    let mut stats = ReplayStats {
        queues: queues.len(),
        ..Default::default()
    };
    info!(
        "replaying {} dispatches on {} queues",
        recording.dispatches.len(),
        queues.len()
    );

    let mut producers = JoinSet::new();
    for (queue, events) in queues {
        let port = agent.dispatch_port();
        producers.spawn(async move {
            let mut profiled = 0u64;
            for event in &events {
                if port.dispatch(event).is_profiled() {
                    profiled += 1;
                }
                tokio::task::yield_now().await;
            }
            debug!("queue {} done: {} dispatches", queue, events.len());
            (events.len() as u64, profiled)
        });
    }

    let mut failures = Vec::new();
    agent
        .run(async {
            while let Some(result) = producers.join_next().await {
                match result {
                    Ok((dispatched, profiled)) => {
                        stats.dispatched += dispatched;
                        stats.profiled += profiled;
                    }
                    Err(e) => {
                        warn!("replay producer failed: {}", e);
                        failures.push(e);
                    }
                }
            }
        })
        .await;

    if let Some(e) = failures.into_iter().next() {
        return Err(e).context("Replay producer task failed");
    }
    Ok(stats)
}
