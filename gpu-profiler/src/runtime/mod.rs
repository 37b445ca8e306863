//! Hardware profiling runtime boundary
//!
//! The counter/trace acquisition service is opaque to the agent. It is
//! reached only through [`ProfilingRuntime`] (open a session for a dispatch)
//! and [`ProfilingSession`] (fetch data, read results, close).

pub mod sim;

use crate::error::Result;
use crate::trace::{TraceBuffer, TraceChunk};
use kdprof_shared::{CompletionReady, CompletionRecord, DeviceIndex, DispatchOrdinal, Feature};
use std::fmt;
use std::sync::Arc;

/// Receives completion notifications from the runtime. May be invoked from
/// any runtime thread.
pub type CompletionCallback = Arc<dyn Fn(CompletionReady) + Send + Sync>;

/// Handle the runtime uses to report completion of one profiled dispatch
#[derive(Clone)]
pub struct CompletionNotifier {
    ordinal: DispatchOrdinal,
    callback: CompletionCallback,
}

impl CompletionNotifier {
    pub fn new(ordinal: DispatchOrdinal, callback: CompletionCallback) -> Self {
        Self { ordinal, callback }
    }

    pub fn ordinal(&self) -> DispatchOrdinal {
        self.ordinal
    }

    /// Report the dispatch timestamps. A record with `complete == 0` asks
    /// the agent to wait for a later notification.
    pub fn notify(&self, record: CompletionRecord) {
        (self.callback)(CompletionReady {
            ordinal: self.ordinal,
            record,
        });
    }
}

impl fmt::Debug for CompletionNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionNotifier")
            .field("ordinal", &self.ordinal)
            .finish_non_exhaustive()
    }
}

/// Result value of one feature
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultData {
    /// Counter value
    Int64(u64),
    /// Trace data already copied to host memory
    Bytes(TraceBuffer),
    /// Trace data left in device memory; read it with
    /// [`ProfilingSession::iterate_trace`]
    DeviceTrace,
    /// A data kind this agent does not understand
    Unrecognized(u32),
}

/// Result of one requested feature, in feature order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureResult {
    pub name: String,
    pub data: ResultData,
}

impl FeatureResult {
    pub fn new(name: impl Into<String>, data: ResultData) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }
}

/// An opened profiling session for one dispatch
pub trait ProfilingSession: Send {
    /// Number of profiling groups the feature list was split into
    fn group_count(&self) -> Result<u32>;

    /// Select the group subsequent calls operate on
    fn select_group(&mut self, index: u32) -> Result<()>;

    /// Fetch aggregated data of the selected group from the device
    fn fetch_group_data(&mut self) -> Result<()>;

    /// Compute per-feature results from the fetched group data
    fn read_metrics(&mut self) -> Result<Vec<FeatureResult>>;

    /// Walk raw trace records in device memory, one callback per chunk
    fn iterate_trace(&mut self, visit: &mut dyn FnMut(TraceChunk<'_>) -> Result<()>) -> Result<()>;

    /// Timestamps the runtime has recorded for the dispatch so far, read
    /// when no completion was delivered through a notifier
    fn completion_record(&self) -> Option<CompletionRecord>;

    /// Close the session, releasing every hardware-side resource
    fn close(self: Box<Self>) -> Result<()>;
}

/// The hardware profiling service
pub trait ProfilingRuntime: Send + Sync {
    /// Open a session collecting `features` for a dispatch on `device_index`.
    ///
    /// When `notifier` is set the runtime reports completion through it;
    /// otherwise the agent finalizes the dispatch on its own schedule.
    fn open_session(
        &self,
        device_index: DeviceIndex,
        features: &[Feature],
        notifier: Option<CompletionNotifier>,
    ) -> Result<Box<dyn ProfilingSession>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_notifier_tags_ordinal() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let notifier = CompletionNotifier::new(
            7,
            Arc::new(move |ready: CompletionReady| sink.lock().push(ready)),
        );

        notifier.notify(CompletionRecord::pending(100));
        assert_eq!(notifier.ordinal(), 7);

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].ordinal, 7);
        assert!(!seen[0].record.is_complete());
    }
}
