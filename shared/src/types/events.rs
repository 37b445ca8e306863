//! Event type definitions for dispatch profiling
//!
//! These types represent what the hardware runtime reports to the agent:
//! a dispatch being submitted, and later the timestamps of its completion.

use serde::{Deserialize, Serialize};

/// Timestamp in nanoseconds (device clock)
pub type Timestamp = u64;

/// Sequence number assigned to every observed dispatch
pub type DispatchOrdinal = u64;

/// Device (agent) index as enumerated by the runtime
pub type DeviceIndex = u32;

/// A kernel dispatch observed on a device queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchEvent {
    /// Name of the dispatched kernel
    pub kernel_name: String,

    /// Index of the device the queue belongs to
    pub device_index: DeviceIndex,

    /// Index of the queue within the process
    #[serde(default)]
    pub queue_index: u64,
}

impl DispatchEvent {
    pub fn new(kernel_name: impl Into<String>, device_index: DeviceIndex, queue_index: u64) -> Self {
        Self {
            kernel_name: kernel_name.into(),
            device_index,
            queue_index,
        }
    }
}

/// Dispatch timestamps reported by the runtime.
///
/// `complete == 0` means the device has not finished the dispatch yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionRecord {
    pub dispatch: Timestamp,
    pub begin: Timestamp,
    pub end: Timestamp,
    pub complete: Timestamp,
}

impl CompletionRecord {
    /// Record of a dispatch the device has not completed yet
    pub fn pending(dispatch: Timestamp) -> Self {
        Self {
            dispatch,
            ..Default::default()
        }
    }

    /// Check whether the device marked the dispatch complete
    pub fn is_complete(&self) -> bool {
        self.complete != 0
    }
}

/// Completion notification delivered by the runtime for one profiled dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionReady {
    pub ordinal: DispatchOrdinal,
    pub record: CompletionRecord,
}

/// How completed contexts get finalized. Fixed for the lifetime of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionMode {
    /// The runtime invokes a completion handler per dispatch
    Push,
    /// Everything still open is finalized in one sweep at shutdown
    Pull,
}

impl std::str::FromStr for CompletionMode {
    type Err = crate::utils::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "push" => Ok(CompletionMode::Push),
            "pull" => Ok(CompletionMode::Pull),
            _ => Err(crate::utils::ParseError::InvalidValue {
                what: "completion mode",
                value: s.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_event_serialization() {
        let event = DispatchEvent::new("gemm_a", 1, 3);

        let json = serde_json::to_string(&event).unwrap();
        let deserialized: DispatchEvent = serde_json::from_str(&json).unwrap();

        assert_eq!(event, deserialized);
    }

    #[test]
    fn test_queue_index_defaults_to_zero() {
        let event: DispatchEvent =
            serde_json::from_str(r#"{"kernel_name":"reduce","device_index":0}"#).unwrap();
        assert_eq!(event.queue_index, 0);
    }

    #[test]
    fn test_completion_record_state() {
        assert!(!CompletionRecord::pending(10).is_complete());

        let done = CompletionRecord {
            dispatch: 10,
            begin: 11,
            end: 12,
            complete: 13,
        };
        assert!(done.is_complete());
    }

    #[test]
    fn test_completion_mode_parsing() {
        assert_eq!("push".parse::<CompletionMode>().unwrap(), CompletionMode::Push);
        assert_eq!("PULL".parse::<CompletionMode>().unwrap(), CompletionMode::Pull);
        assert!("sweep".parse::<CompletionMode>().is_err());

        let mode: CompletionMode = serde_json::from_str(r#""pull""#).unwrap();
        assert_eq!(mode, CompletionMode::Pull);
    }
}
