//! Per-dispatch profiling context

use crate::output::OutputStream;
use crate::runtime::ProfilingSession;
use kdprof_shared::{CompletionRecord, DeviceIndex, DispatchEvent, DispatchOrdinal, Feature};
use std::fmt;
use std::io::{self, Write};
use std::sync::Arc;

/// Longest label used to name per-unit trace files
pub const LABEL_LEN_MAX: usize = 128;

/// Lifecycle of a profiling context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Created,
    SessionOpen,
    AwaitingCompletion,
    Finalizing,
    Released,
}

/// One dispatch under observation.
///
/// The session is owned exclusively by the context from open to close. The
/// feature list and output stream are shared with the profiler.
pub struct ProfilingContext {
    ordinal: DispatchOrdinal,
    state: ContextState,
    session: Option<Box<dyn ProfilingSession>>,
    features: Arc<[Feature]>,
    kernel_name: String,
    queue_index: u64,
    device_index: DeviceIndex,
    record: Option<CompletionRecord>,
    output: Arc<OutputStream>,
}

impl ProfilingContext {
    pub fn new(event: &DispatchEvent, features: Arc<[Feature]>, output: Arc<OutputStream>) -> Self {
        Self {
            ordinal: 0,
            state: ContextState::Created,
            session: None,
            features,
            kernel_name: event.kernel_name.clone(),
            queue_index: event.queue_index,
            device_index: event.device_index,
            record: None,
            output,
        }
    }

    pub fn ordinal(&self) -> DispatchOrdinal {
        self.ordinal
    }

    pub(crate) fn assign_ordinal(&mut self, ordinal: DispatchOrdinal) {
        self.ordinal = ordinal;
    }

    pub fn state(&self) -> ContextState {
        self.state
    }

    pub fn kernel_name(&self) -> &str {
        &self.kernel_name
    }

    pub fn queue_index(&self) -> u64 {
        self.queue_index
    }

    pub fn device_index(&self) -> DeviceIndex {
        self.device_index
    }

    pub fn features(&self) -> &[Feature] {
        &self.features
    }

    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    pub fn record(&self) -> Option<&CompletionRecord> {
        self.record.as_ref()
    }

    pub fn output(&self) -> &Arc<OutputStream> {
        &self.output
    }

    pub fn attach_session(&mut self, session: Box<dyn ProfilingSession>) {
        self.session = Some(session);
        self.state = ContextState::SessionOpen;
    }

    pub(crate) fn await_completion(&mut self) {
        self.state = ContextState::AwaitingCompletion;
    }

    pub(crate) fn begin_finalizing(&mut self) -> Option<Box<dyn ProfilingSession>> {
        self.state = ContextState::Finalizing;
        self.session.take()
    }

    pub(crate) fn mark_released(&mut self) {
        self.state = ContextState::Released;
    }

    pub fn record_completion(&mut self, record: CompletionRecord) {
        self.record = Some(record);
    }

    /// False while the runtime has reported timestamps that are not final
    pub fn is_ready(&self) -> bool {
        self.record.map_or(true, |record| record.is_complete())
    }

    /// `<ordinal>__<kernel_name>`, cut to [`LABEL_LEN_MAX`] bytes
    pub fn label(&self) -> String {
        let mut label = format!("{}__{}", self.ordinal, self.kernel_name);
        if label.len() > LABEL_LEN_MAX {
            let mut end = LABEL_LEN_MAX;
            while !label.is_char_boundary(end) {
                end -= 1;
            }
            label.truncate(end);
        }
        label
    }

    /// Write the context's header line. Timestamps are printed only for a
    /// completed record.
    pub fn write_header(&self, out: &mut dyn Write) -> io::Result<()> {
        write!(
            out,
            "dispatch[{}], queue_index({}), kernel_name(\"{}\")",
            self.ordinal, self.queue_index, self.kernel_name
        )?;
        if let Some(record) = self.record.filter(CompletionRecord::is_complete) {
            write!(
                out,
                ", time({},{},{},{})",
                record.dispatch, record.begin, record.end, record.complete
            )?;
        }
        writeln!(out)
    }
}

impl fmt::Debug for ProfilingContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProfilingContext")
            .field("ordinal", &self.ordinal)
            .field("state", &self.state)
            .field("kernel_name", &self.kernel_name)
            .field("queue_index", &self.queue_index)
            .field("device_index", &self.device_index)
            .field("has_session", &self.session.is_some())
            .field("record", &self.record)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::SharedBuffer;
    use crate::runtime::sim::SimulatedRuntime;
    use crate::runtime::ProfilingRuntime;

    fn context(name: &str) -> ProfilingContext {
        let output = Arc::new(OutputStream::from_writer("memory", SharedBuffer::new()));
        let mut context = ProfilingContext::new(&DispatchEvent::new(name, 0, 2), Arc::from(vec![]), output);
        context.assign_ordinal(5);
        context
    }

    fn header(context: &ProfilingContext) -> String {
        let mut out = Vec::new();
        context.write_header(&mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_header_without_record() {
        let context = context("gemm_a");
        assert_eq!(header(&context), "dispatch[5], queue_index(2), kernel_name(\"gemm_a\")\n");
        assert!(context.is_ready());
    }

    #[test]
    fn test_header_with_complete_record() {
        let mut context = context("gemm_a");
        context.record_completion(CompletionRecord {
            dispatch: 1,
            begin: 2,
            end: 3,
            complete: 4,
        });
        assert_eq!(
            header(&context),
            "dispatch[5], queue_index(2), kernel_name(\"gemm_a\"), time(1,2,3,4)\n"
        );
    }

    #[test]
    fn test_pending_record_blocks_readiness() {
        let mut context = context("gemm_a");
        context.record_completion(CompletionRecord::pending(9));
        assert!(!context.is_ready());
        assert!(!header(&context).contains("time("));
    }

    #[test]
    fn test_label_truncation() {
        let short = context("reduce");
        assert_eq!(short.label(), "5__reduce");

        let long_name = "é".repeat(100);
        let long = context(&long_name);
        let label = long.label();
        assert!(label.len() <= LABEL_LEN_MAX);
        assert!(label.starts_with("5__é"));
    }

    #[test]
    fn test_state_follows_session() {
        let mut context = context("gemm_a");
        assert_eq!(context.state(), ContextState::Created);
        assert!(!context.has_session());

        let runtime = SimulatedRuntime::default();
        context.attach_session(runtime.open_session(0, &[Feature::metric("X")], None).unwrap());
        assert_eq!(context.state(), ContextState::SessionOpen);

        context.await_completion();
        assert_eq!(context.state(), ContextState::AwaitingCompletion);

        let session = context.begin_finalizing().unwrap();
        assert_eq!(context.state(), ContextState::Finalizing);
        assert!(!context.has_session());
        session.close().unwrap();

        context.mark_released();
        assert_eq!(context.state(), ContextState::Released);
    }
}
