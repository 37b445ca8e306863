//! Simulated profiling runtime
//!
//! Deterministic stand-in for the hardware service. Sessions answer with
//! configured counter values and trace unit payloads, every session carries a
//! completion record with synthetic timestamps (also reported from
//! `open_session` when a notifier is installed), and open/close calls are
//! counted so callers can check that every session was released.

use super::{CompletionNotifier, FeatureResult, ProfilingRuntime, ProfilingSession, ResultData};
use crate::error::{ProfilerError, Result};
use crate::trace::{encode_chunks, TraceChunk};
use kdprof_shared::{CompletionRecord, DeviceIndex, Feature, FeatureKind};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Behaviour of the simulated device
#[derive(Debug, Clone)]
pub struct SimulatedHardware {
    /// Number of devices; opening a session on a higher index fails
    pub device_count: u32,

    /// Counter values by feature name (missing counters read as 0)
    pub metrics: HashMap<String, u64>,

    /// One payload per trace unit
    pub trace_units: Vec<Vec<u8>>,

    /// Unit labels reported while iterating `trace_units` on the device;
    /// units without an entry are labelled by position
    pub trace_unit_ids: Vec<u32>,

    /// Report a not-yet-complete record before the final one
    pub stall_completions: bool,

    /// Profiling groups per session (the agent requires exactly one)
    pub group_count: u32,

    /// Features whose result carries a raw data kind code
    pub raw_kinds: HashMap<String, u32>,
}

impl Default for SimulatedHardware {
    fn default() -> Self {
        Self {
            device_count: 1,
            metrics: HashMap::new(),
            trace_units: Vec::new(),
            trace_unit_ids: Vec::new(),
            stall_completions: false,
            group_count: 1,
            raw_kinds: HashMap::new(),
        }
    }
}

#[derive(Debug, Default)]
struct SessionCounters {
    opened: AtomicUsize,
    closed: AtomicUsize,
}

/// In-process profiling runtime
#[derive(Debug)]
pub struct SimulatedRuntime {
    hardware: Arc<SimulatedHardware>,
    counters: Arc<SessionCounters>,
    clock: AtomicU64,
}

impl SimulatedRuntime {
    pub fn new(hardware: SimulatedHardware) -> Self {
        Self {
            hardware: Arc::new(hardware),
            counters: Arc::new(SessionCounters::default()),
            clock: AtomicU64::new(1_000),
        }
    }

    pub fn hardware(&self) -> &SimulatedHardware {
        &self.hardware
    }

    pub fn sessions_opened(&self) -> usize {
        self.counters.opened.load(Ordering::SeqCst)
    }

    pub fn sessions_closed(&self) -> usize {
        self.counters.closed.load(Ordering::SeqCst)
    }

    /// Sessions opened but not closed yet
    pub fn sessions_open(&self) -> usize {
        self.sessions_opened() - self.sessions_closed()
    }

    fn next_record(&self) -> CompletionRecord {
        let dispatch = self.clock.fetch_add(100, Ordering::SeqCst);
        CompletionRecord {
            dispatch,
            begin: dispatch + 10,
            end: dispatch + 60,
            complete: dispatch + 70,
        }
    }

    fn complete(&self, notifier: &CompletionNotifier, record: CompletionRecord) {
        if self.hardware.stall_completions {
            notifier.notify(CompletionRecord::pending(record.dispatch));
        }
        notifier.notify(record);
    }
}

impl Default for SimulatedRuntime {
    fn default() -> Self {
        Self::new(SimulatedHardware::default())
    }
}

impl ProfilingRuntime for SimulatedRuntime {
    fn open_session(
        &self,
        device_index: DeviceIndex,
        features: &[Feature],
        notifier: Option<CompletionNotifier>,
    ) -> Result<Box<dyn ProfilingSession>> {
        if device_index >= self.hardware.device_count {
            return Err(ProfilerError::session(format!(
                "no such device: {} (have {})",
                device_index, self.hardware.device_count
            )));
        }

        self.counters.opened.fetch_add(1, Ordering::SeqCst);
        debug!(
            "simulated session opened on device {} ({} features)",
            device_index,
            features.len()
        );

        let record = self.next_record();
        if let Some(notifier) = notifier {
            self.complete(&notifier, record);
        }

        Ok(Box::new(SimulatedSession {
            hardware: self.hardware.clone(),
            counters: self.counters.clone(),
            features: features.to_vec(),
            selected_group: None,
            group_data_ready: false,
            record,
        }))
    }
}

struct SimulatedSession {
    hardware: Arc<SimulatedHardware>,
    counters: Arc<SessionCounters>,
    features: Vec<Feature>,
    selected_group: Option<u32>,
    group_data_ready: bool,
    record: CompletionRecord,
}

impl ProfilingSession for SimulatedSession {
    fn group_count(&self) -> Result<u32> {
        Ok(self.hardware.group_count)
    }

    fn select_group(&mut self, index: u32) -> Result<()> {
        if index >= self.hardware.group_count {
            return Err(ProfilerError::session(format!("no such group: {}", index)));
        }
        self.selected_group = Some(index);
        Ok(())
    }

    fn fetch_group_data(&mut self) -> Result<()> {
        if self.selected_group.is_none() {
            return Err(ProfilerError::session("no group selected"));
        }
        self.group_data_ready = true;
        Ok(())
    }

    fn read_metrics(&mut self) -> Result<Vec<FeatureResult>> {
        if !self.group_data_ready {
            return Err(ProfilerError::session("group data not fetched"));
        }

        let results = self
            .features
            .iter()
            .map(|feature| {
                let data = if let Some(&kind) = self.hardware.raw_kinds.get(&feature.name) {
                    ResultData::Unrecognized(kind)
                } else {
                    match feature.kind {
                        FeatureKind::Metric => ResultData::Int64(
                            self.hardware.metrics.get(&feature.name).copied().unwrap_or(0),
                        ),
                        FeatureKind::Trace if feature.copy => {
                            ResultData::Bytes(encode_chunks(&self.hardware.trace_units))
                        }
                        FeatureKind::Trace => ResultData::DeviceTrace,
                    }
                };
                FeatureResult::new(feature.name.clone(), data)
            })
            .collect();
        Ok(results)
    }

    fn iterate_trace(&mut self, visit: &mut dyn FnMut(TraceChunk<'_>) -> Result<()>) -> Result<()> {
        for (index, payload) in self.hardware.trace_units.iter().enumerate() {
            let unit = self.hardware.trace_unit_ids.get(index).copied().unwrap_or(index as u32);
            visit(TraceChunk {
                unit,
                payload: payload.as_slice(),
            })?;
        }
        Ok(())
    }

    fn completion_record(&self) -> Option<CompletionRecord> {
        Some(self.record)
    }

    fn close(self: Box<Self>) -> Result<()> {
        self.counters.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
