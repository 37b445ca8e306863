//! Per-dispatch profiling lifecycle
//!
//! [`DispatchProfiler`] takes a dispatch from the moment it is observed to
//! the moment its results are written:
//!
//! ```text
//! on_dispatch:   filter -> open session -> register -> advance ordinal
//! on_completion: record timestamps -> finalize (or Retry)
//! shutdown:      finalize everything still registered
//! ```
//!
//! In pull mode no completion is delivered; finalization reads the
//! timestamps the session has recorded instead.
//!
//! Every step runs under the store lock. Finalization removes the context
//! before writing anything, so a context is finalized exactly once even when
//! a completion and the shutdown sweep race for it.

use crate::context::{ContextState, ProfilingContext};
use crate::error::{ProfilerError, Result};
use crate::filter::DispatchFilter;
use crate::output::OutputStream;
use crate::runtime::{CompletionCallback, CompletionNotifier, ProfilingRuntime, ProfilingSession};
use crate::sink::ResultSink;
use crate::store::{ContextStore, StoreGuard};
use kdprof_shared::{CompletionMode, CompletionRecord, DispatchEvent, DispatchOrdinal, Feature, FilterSpec};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What to collect, for which dispatches, and where trace files go
#[derive(Debug, Clone, Default)]
pub struct ProfilerSettings {
    pub features: Vec<Feature>,
    pub filter: FilterSpec,
    pub trace_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The filter rejected the dispatch; its ordinal is consumed anyway
    Skipped { ordinal: DispatchOrdinal },
    /// A context was registered. `session_opened` is false for an empty
    /// feature list.
    Profiled {
        ordinal: DispatchOrdinal,
        session_opened: bool,
    },
}

impl DispatchOutcome {
    pub fn ordinal(&self) -> DispatchOrdinal {
        match *self {
            DispatchOutcome::Skipped { ordinal } | DispatchOutcome::Profiled { ordinal, .. } => ordinal,
        }
    }

    pub fn is_profiled(&self) -> bool {
        matches!(self, DispatchOutcome::Profiled { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    /// Results were written and the context released
    Finalized,
    /// Timestamps are not final yet; the runtime reports again later
    Retry,
    /// No context under this ordinal, it was finalized elsewhere
    Absent,
}

/// Owns the context store and drives every context through its lifecycle
pub struct DispatchProfiler {
    runtime: Arc<dyn ProfilingRuntime>,
    store: ContextStore,
    filter: DispatchFilter,
    features: Arc<[Feature]>,
    sink: ResultSink,
    output: Arc<OutputStream>,
    completion: Option<CompletionCallback>,
}

impl DispatchProfiler {
    /// Build a profiler. Installing a `completion` callback selects push
    /// mode; without one every context is finalized by [`shutdown`].
    ///
    /// The runtime may invoke the callback before `on_dispatch` returns, so
    /// it must hand the notification off (e.g. to a channel) rather than
    /// finalize in place.
    ///
    /// [`shutdown`]: DispatchProfiler::shutdown
    pub fn new(
        runtime: Arc<dyn ProfilingRuntime>,
        settings: ProfilerSettings,
        output: Arc<OutputStream>,
        completion: Option<CompletionCallback>,
    ) -> Self {
        Self {
            runtime,
            store: ContextStore::new(),
            filter: DispatchFilter::new(settings.filter),
            features: Arc::from(settings.features),
            sink: ResultSink::new(settings.trace_dir),
            output,
            completion,
        }
    }

    pub fn mode(&self) -> CompletionMode {
        if self.completion.is_some() {
            CompletionMode::Push
        } else {
            CompletionMode::Pull
        }
    }

    pub fn features(&self) -> &[Feature] {
        &self.features
    }

    pub fn filter(&self) -> &DispatchFilter {
        &self.filter
    }

    pub fn output(&self) -> &Arc<OutputStream> {
        &self.output
    }

    /// Observe one dispatch
    pub fn on_dispatch(&self, event: &DispatchEvent) -> Result<DispatchOutcome> {
        let store = self.store.lock();
        let ordinal = store.current_ordinal();

        if !self.filter.matches(ordinal, event.device_index, &event.kernel_name) {
            store.next_ordinal();
            debug!("dispatch[{}] \"{}\" filtered out", ordinal, event.kernel_name);
            return Ok(DispatchOutcome::Skipped { ordinal });
        }

        let mut context = ProfilingContext::new(event, self.features.clone(), self.output.clone());
        let session_opened = !self.features.is_empty();
        if session_opened {
            context.attach_session(self.open_session(ordinal, event)?);
        }
        context.await_completion();

        let ordinal = store.allocate(context)?;
        store.next_ordinal();
        debug!(
            "dispatch[{}] \"{}\" on device {} queue {} registered",
            ordinal, event.kernel_name, event.device_index, event.queue_index
        );

        Ok(DispatchOutcome::Profiled {
            ordinal,
            session_opened,
        })
    }

    fn open_session(&self, ordinal: DispatchOrdinal, event: &DispatchEvent) -> Result<Box<dyn ProfilingSession>> {
        let notifier = self
            .completion
            .as_ref()
            .map(|callback| CompletionNotifier::new(ordinal, callback.clone()));
        let mut session = self
            .runtime
            .open_session(event.device_index, &self.features, notifier)?;

        let groups = session.group_count()?;
        if groups != 1 {
            session.close()?;
            return Err(ProfilerError::UnexpectedGroupCount(groups));
        }
        session.select_group(0)?;
        Ok(session)
    }

    /// Handle a completion report for `ordinal`
    pub fn on_completion(&self, ordinal: DispatchOrdinal, record: CompletionRecord) -> Result<CompletionStatus> {
        let store = self.store.lock();
        if !store.contains(ordinal) {
            debug!("dispatch[{}] already finalized", ordinal);
            return Ok(CompletionStatus::Absent);
        }

        let ready = store.update(ordinal, |context| {
            context.record_completion(record);
            context.is_ready()
        })?;
        if !ready {
            debug!("dispatch[{}] not complete yet", ordinal);
            return Ok(CompletionStatus::Retry);
        }

        self.finalize(&store, ordinal)?;
        Ok(CompletionStatus::Finalized)
    }

    /// Finalize every context still registered, whether or not its
    /// completion was reported. Returns the number of contexts collected
    /// over the profiler's lifetime.
    pub fn shutdown(&self) -> Result<u64> {
        let store = self.store.lock();
        let pending = store.len();
        if pending > 0 {
            debug!("sweeping {} outstanding contexts", pending);
        }

        store.for_each_snapshot(|ordinal| {
            if !store.contains(ordinal) {
                return Ok(());
            }
            if !store.inspect(ordinal, ProfilingContext::is_ready).unwrap_or(true) {
                warn!("dispatch[{}] finalized before completion, timestamps omitted", ordinal);
            }
            self.finalize(&store, ordinal)
        })?;

        let collected = store.collected();
        info!("{} contexts collected", collected);
        Ok(collected)
    }

    pub fn in_flight(&self) -> usize {
        self.store.lock().len()
    }

    pub fn collected(&self) -> u64 {
        self.store.lock().collected()
    }

    /// Number of dispatches observed so far, filtered or not
    pub fn observed(&self) -> u64 {
        self.store.lock().current_ordinal()
    }

    /// Lifecycle state of a registered context
    pub fn context_state(&self, ordinal: DispatchOrdinal) -> Option<ContextState> {
        self.store.lock().inspect(ordinal, ProfilingContext::state)
    }

    fn finalize(&self, store: &StoreGuard<'_>, ordinal: DispatchOrdinal) -> Result<()> {
        let mut context = store.remove(ordinal)?;
        store.mark_collected();
        let session = context.begin_finalizing();
        if context.record().is_none() {
            if let Some(record) = session.as_ref().and_then(|session| session.completion_record()) {
                context.record_completion(record);
            }
        }
        self.release(&mut context, session)?;
        debug!("dispatch[{}] {:?}", ordinal, context.state());
        Ok(())
    }

    fn release(&self, context: &mut ProfilingContext, session: Option<Box<dyn ProfilingSession>>) -> Result<()> {
        let output = context.output().clone();
        let mut out = output.lock();
        context.write_header(&mut **out)?;
        out.flush()?;

        if let Some(mut session) = session {
            session.fetch_group_data()?;
            let results = session.read_metrics()?;
            self.sink
                .emit(&mut **out, &context.label(), results, session.as_mut())?;
            out.flush()?;
            session.close()?;
        }

        context.mark_released();
        Ok(())
    }
}

impl std::fmt::Debug for DispatchProfiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchProfiler")
            .field("mode", &self.mode())
            .field("features", &self.features.len())
            .field("store", &self.store)
            .field("output", &self.output)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::SharedBuffer;
    use crate::runtime::sim::{SimulatedHardware, SimulatedRuntime};
    use kdprof_shared::{CompletionReady, OrdinalRange};
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::thread;

    struct Harness {
        runtime: Arc<SimulatedRuntime>,
        profiler: Arc<DispatchProfiler>,
        buffer: SharedBuffer,
        ready: Arc<Mutex<Vec<CompletionReady>>>,
    }

    fn harness(hardware: SimulatedHardware, settings: ProfilerSettings, push: bool) -> Harness {
        let runtime = Arc::new(SimulatedRuntime::new(hardware));
        let buffer = SharedBuffer::new();
        let output = Arc::new(OutputStream::from_writer("memory", buffer.clone()));
        let ready = Arc::new(Mutex::new(Vec::new()));
        let callback: Option<CompletionCallback> = if push {
            let ready = ready.clone();
            Some(Arc::new(move |r: CompletionReady| ready.lock().push(r)))
        } else {
            None
        };
        let profiler = Arc::new(DispatchProfiler::new(runtime.clone(), settings, output, callback));
        Harness {
            runtime,
            profiler,
            buffer,
            ready,
        }
    }

    fn counters() -> ProfilerSettings {
        ProfilerSettings {
            features: vec![Feature::metric("SQ_WAVES")],
            ..Default::default()
        }
    }

    fn dispatch(name: &str) -> DispatchEvent {
        DispatchEvent::new(name, 0, 0)
    }

    fn headers(text: &str) -> Vec<&str> {
        text.lines().filter(|l| l.starts_with("dispatch[")).collect()
    }

    #[test]
    fn test_filtered_dispatches_consume_ordinals() {
        let settings = ProfilerSettings {
            filter: FilterSpec::all().with_kernel_substrings(vec!["gemm".to_string()]),
            ..counters()
        };
        let h = harness(SimulatedHardware::default(), settings, false);

        let outcomes: Vec<_> = ["gemm_a", "reduce", "gemm_b"]
            .iter()
            .map(|name| h.profiler.on_dispatch(&dispatch(name)).unwrap())
            .collect();

        assert!(outcomes[0].is_profiled());
        assert_eq!(outcomes[1], DispatchOutcome::Skipped { ordinal: 1 });
        assert_eq!(outcomes[2].ordinal(), 2);
        assert!(outcomes[2].is_profiled());
        assert_eq!(h.profiler.observed(), 3);
        assert_eq!(h.profiler.in_flight(), 2);
        assert_eq!(h.runtime.sessions_opened(), 2);
    }

    #[test]
    fn test_pull_mode_finalizes_on_shutdown() {
        let hardware = SimulatedHardware {
            metrics: HashMap::from([("SQ_WAVES".to_string(), 128)]),
            ..Default::default()
        };
        let h = harness(hardware, counters(), false);
        assert_eq!(h.profiler.mode(), CompletionMode::Pull);

        h.profiler.on_dispatch(&DispatchEvent::new("gemm", 0, 3)).unwrap();
        assert_eq!(h.buffer.contents(), "");

        assert_eq!(h.profiler.shutdown().unwrap(), 1);
        assert_eq!(
            h.buffer.contents(),
            "dispatch[0], queue_index(3), kernel_name(\"gemm\"), time(1000,1010,1060,1070)\n  SQ_WAVES (128)\n"
        );
        assert_eq!(h.runtime.sessions_open(), 0);
    }

    #[test]
    fn test_push_mode_finalizes_on_completion() {
        let h = harness(SimulatedHardware::default(), counters(), true);
        assert_eq!(h.profiler.mode(), CompletionMode::Push);

        h.profiler.on_dispatch(&dispatch("gemm")).unwrap();
        let ready = h.ready.lock().pop().unwrap();
        assert_eq!(ready.ordinal, 0);

        let status = h.profiler.on_completion(ready.ordinal, ready.record).unwrap();
        assert_eq!(status, CompletionStatus::Finalized);
        assert_eq!(
            headers(&h.buffer.contents()),
            vec!["dispatch[0], queue_index(0), kernel_name(\"gemm\"), time(1000,1010,1060,1070)"]
        );

        // a second report finds nothing
        let again = h.profiler.on_completion(ready.ordinal, ready.record).unwrap();
        assert_eq!(again, CompletionStatus::Absent);
        assert_eq!(h.profiler.shutdown().unwrap(), 1);
        assert_eq!(headers(&h.buffer.contents()).len(), 1);
    }

    #[test]
    fn test_incomplete_record_is_retried() {
        let hardware = SimulatedHardware {
            stall_completions: true,
            ..Default::default()
        };
        let h = harness(hardware, counters(), true);
        h.profiler.on_dispatch(&dispatch("gemm")).unwrap();

        let reports: Vec<_> = h.ready.lock().drain(..).collect();
        assert_eq!(reports.len(), 2);

        let first = h.profiler.on_completion(0, reports[0].record).unwrap();
        assert_eq!(first, CompletionStatus::Retry);
        assert_eq!(h.buffer.contents(), "");
        assert_eq!(h.profiler.in_flight(), 1);

        let second = h.profiler.on_completion(0, reports[1].record).unwrap();
        assert_eq!(second, CompletionStatus::Finalized);
        assert!(h.buffer.contents().contains("time("));
    }

    #[test]
    fn test_sweep_omits_timestamps_of_incomplete_records() {
        let h = harness(SimulatedHardware::default(), counters(), true);
        h.profiler.on_dispatch(&dispatch("gemm")).unwrap();
        h.profiler
            .on_completion(0, CompletionRecord::pending(5))
            .unwrap();

        h.profiler.shutdown().unwrap();
        assert_eq!(
            headers(&h.buffer.contents()),
            vec!["dispatch[0], queue_index(0), kernel_name(\"gemm\")"]
        );
    }

    #[test]
    fn test_context_states_across_completion() {
        let hardware = SimulatedHardware {
            stall_completions: true,
            ..Default::default()
        };
        let h = harness(hardware, counters(), true);
        assert_eq!(h.profiler.context_state(0), None);

        h.profiler.on_dispatch(&dispatch("gemm")).unwrap();
        assert_eq!(h.profiler.context_state(0), Some(ContextState::AwaitingCompletion));

        let reports: Vec<_> = h.ready.lock().drain(..).collect();
        assert_eq!(
            h.profiler.on_completion(0, reports[0].record).unwrap(),
            CompletionStatus::Retry
        );
        assert_eq!(h.profiler.context_state(0), Some(ContextState::AwaitingCompletion));

        h.profiler.on_completion(0, reports[1].record).unwrap();
        assert_eq!(h.profiler.context_state(0), None);
    }

    #[test]
    fn test_release_moves_context_to_released() {
        let h = harness(SimulatedHardware::default(), counters(), false);
        let mut context = ProfilingContext::new(
            &dispatch("gemm"),
            h.profiler.features.clone(),
            h.profiler.output.clone(),
        );
        let session = h.runtime.open_session(0, h.profiler.features(), None).unwrap();
        context.attach_session(session);
        context.await_completion();

        let session = context.begin_finalizing();
        assert_eq!(context.state(), ContextState::Finalizing);
        h.profiler.release(&mut context, session).unwrap();
        assert_eq!(context.state(), ContextState::Released);
        assert_eq!(h.runtime.sessions_open(), 0);
        assert!(h.buffer.contents().contains("  SQ_WAVES (0)\n"));
    }

    #[test]
    fn test_pull_mode_keeps_reported_pending_record() {
        // a record delivered before the sweep wins over the session's own
        let h = harness(SimulatedHardware::default(), counters(), false);
        h.profiler.on_dispatch(&dispatch("gemm")).unwrap();
        assert_eq!(
            h.profiler.on_completion(0, CompletionRecord::pending(5)).unwrap(),
            CompletionStatus::Retry
        );

        h.profiler.shutdown().unwrap();
        assert!(!h.buffer.contents().contains("time("));
    }

    #[test]
    fn test_range_filter_selects_window() {
        let settings = ProfilerSettings {
            filter: FilterSpec::all().with_range(OrdinalRange::Between(2, 4)),
            ..counters()
        };
        let h = harness(SimulatedHardware::default(), settings, false);
        for i in 0..6 {
            h.profiler.on_dispatch(&dispatch(&format!("k{}", i))).unwrap();
        }
        h.profiler.shutdown().unwrap();

        assert_eq!(
            headers(&h.buffer.contents()),
            vec![
                "dispatch[2], queue_index(0), kernel_name(\"k2\"), time(1000,1010,1060,1070)",
                "dispatch[3], queue_index(0), kernel_name(\"k3\"), time(1100,1110,1160,1170)",
            ]
        );
    }

    #[test]
    fn test_empty_feature_list_registers_without_session() {
        let h = harness(SimulatedHardware::default(), ProfilerSettings::default(), true);
        let outcome = h.profiler.on_dispatch(&dispatch("gemm")).unwrap();
        assert_eq!(
            outcome,
            DispatchOutcome::Profiled {
                ordinal: 0,
                session_opened: false
            }
        );
        assert_eq!(h.runtime.sessions_opened(), 0);
        assert!(h.ready.lock().is_empty());

        assert_eq!(h.profiler.shutdown().unwrap(), 1);
        assert_eq!(h.buffer.contents(), "dispatch[0], queue_index(0), kernel_name(\"gemm\")\n");
    }

    #[test]
    fn test_multiple_groups_rejected() {
        let hardware = SimulatedHardware {
            group_count: 2,
            ..Default::default()
        };
        let h = harness(hardware, counters(), false);
        let err = h.profiler.on_dispatch(&dispatch("gemm")).unwrap_err();
        assert!(matches!(err, ProfilerError::UnexpectedGroupCount(2)));
        assert_eq!(h.runtime.sessions_open(), 0);
        assert_eq!(h.profiler.in_flight(), 0);
    }

    #[test]
    fn test_completion_and_sweep_race() {
        let h = harness(SimulatedHardware::default(), counters(), true);
        for i in 0..64 {
            h.profiler.on_dispatch(&dispatch(&format!("k{}", i))).unwrap();
        }
        let reports: Vec<_> = h.ready.lock().drain(..).collect();

        let handler = {
            let profiler = h.profiler.clone();
            thread::spawn(move || {
                reports
                    .into_iter()
                    .map(|r| profiler.on_completion(r.ordinal, r.record).unwrap())
                    .collect::<Vec<_>>()
            })
        };
        let sweeper = {
            let profiler = h.profiler.clone();
            thread::spawn(move || profiler.shutdown().unwrap())
        };

        let statuses = handler.join().unwrap();
        sweeper.join().unwrap();

        assert!(statuses
            .iter()
            .all(|s| matches!(s, CompletionStatus::Finalized | CompletionStatus::Absent)));
        let text = h.buffer.contents();
        let mut ordinals: Vec<u64> = headers(&text)
            .iter()
            .map(|l| l["dispatch[".len()..l.find(']').unwrap()].parse().unwrap())
            .collect();
        ordinals.sort_unstable();
        assert_eq!(ordinals, (0..64).collect::<Vec<u64>>());
        assert_eq!(h.profiler.collected(), 64);
        assert_eq!(h.runtime.sessions_closed(), h.runtime.sessions_opened());
    }
}
