//! Dispatch selection
//!
//! The filter is a pure predicate. Advancing the ordinal counter for
//! dispatches it rejects is the lifecycle's job, see
//! [`DispatchProfiler::on_dispatch`](crate::DispatchProfiler::on_dispatch).

use kdprof_shared::{DeviceIndex, DispatchOrdinal, FilterSpec};
use std::sync::Arc;

/// Decide whether a dispatch is selected for profiling.
///
/// The result is the AND of the ordinal range, device and kernel-name rules.
/// A rule that is not configured never vetoes.
pub fn matches(
    ordinal: DispatchOrdinal,
    device_index: DeviceIndex,
    kernel_name: &str,
    spec: &FilterSpec,
) -> bool {
    let in_range = spec.range.map_or(true, |range| range.contains(ordinal));

    let on_device = spec
        .devices
        .as_ref()
        .map_or(true, |devices| devices.contains(&device_index));

    let kernel_selected = spec.kernel_substrings.as_ref().map_or(true, |substrings| {
        substrings.iter().any(|s| kernel_name.contains(s.as_str()))
    });

    in_range && on_device && kernel_selected
}

/// Shared, immutable dispatch filter
#[derive(Debug, Clone, Default)]
pub struct DispatchFilter {
    spec: Arc<FilterSpec>,
}

impl DispatchFilter {
    pub fn new(spec: FilterSpec) -> Self {
        Self {
            spec: Arc::new(spec),
        }
    }

    pub fn spec(&self) -> &FilterSpec {
        &self.spec
    }

    pub fn matches(&self, ordinal: DispatchOrdinal, device_index: DeviceIndex, kernel_name: &str) -> bool {
        matches(ordinal, device_index, kernel_name, &self.spec)
    }
}
