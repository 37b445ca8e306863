//! Dispatch filter specification
//!
//! Each sub-filter is optional; an absent sub-filter matches every dispatch.
//! Lists may be given as arrays or as delimited strings (`"0,1"`, `"2:4"`),
//! which is how they appear in flat configuration sources.

use crate::types::events::{DeviceIndex, DispatchOrdinal};
use crate::utils::{split_list, ParseError};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeSet;
use std::fmt;

/// Range of dispatch ordinals selected for profiling.
///
/// A two-bound range must be non-empty: [`from_bounds`](OrdinalRange::from_bounds)
/// rejects `N:M` with `N >= M` as a configuration error instead of building a
/// window that matches no dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrdinalRange {
    /// `[start, ∞)`
    From(DispatchOrdinal),
    /// `[start, end)`
    Between(DispatchOrdinal, DispatchOrdinal),
}

impl OrdinalRange {
    /// Build a range from its configured bounds (one or two values).
    /// Fails with [`ParseError::EmptyRange`] when `start >= end`.
    pub fn from_bounds(bounds: &[DispatchOrdinal]) -> Result<Self, ParseError> {
        match *bounds {
            [start] => Ok(OrdinalRange::From(start)),
            [start, end] if start < end => Ok(OrdinalRange::Between(start, end)),
            [start, end] => Err(ParseError::EmptyRange { start, end }),
            _ => Err(ParseError::RangeArity(bounds.len())),
        }
    }

    pub fn contains(&self, ordinal: DispatchOrdinal) -> bool {
        match *self {
            OrdinalRange::From(start) => ordinal >= start,
            OrdinalRange::Between(start, end) => start <= ordinal && ordinal < end,
        }
    }

    fn bounds(&self) -> Vec<DispatchOrdinal> {
        match *self {
            OrdinalRange::From(start) => vec![start],
            OrdinalRange::Between(start, end) => vec![start, end],
        }
    }
}

impl fmt::Display for OrdinalRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrdinalRange::From(start) => write!(f, "{}", start),
            OrdinalRange::Between(start, end) => write!(f, "{}:{}", start, end),
        }
    }
}

impl std::str::FromStr for OrdinalRange {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bounds = split_list(s, ':')
            .map(|item| {
                item.parse::<DispatchOrdinal>()
                    .map_err(|_| ParseError::InvalidValue {
                        what: "ordinal",
                        value: item.to_string(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_bounds(&bounds)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ListRepr<T> {
    Text(String),
    Single(T),
    Items(Vec<T>),
}

impl Serialize for OrdinalRange {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.bounds().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for OrdinalRange {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let range = match ListRepr::<DispatchOrdinal>::deserialize(deserializer)? {
            ListRepr::Text(text) => text.parse(),
            ListRepr::Single(start) => Ok(OrdinalRange::From(start)),
            ListRepr::Items(bounds) => OrdinalRange::from_bounds(&bounds),
        };
        range.map_err(serde::de::Error::custom)
    }
}

/// Which dispatches get profiled
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterSpec {
    /// Ordinal range rule
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<OrdinalRange>,

    /// Device index rule
    #[serde(
        default,
        rename = "gpu_index",
        deserialize_with = "deserialize_device_set",
        skip_serializing_if = "Option::is_none"
    )]
    pub devices: Option<BTreeSet<DeviceIndex>>,

    /// Kernel-name substring rule
    #[serde(
        default,
        rename = "kernel",
        deserialize_with = "deserialize_substrings",
        skip_serializing_if = "Option::is_none"
    )]
    pub kernel_substrings: Option<Vec<String>>,
}

impl FilterSpec {
    /// Filter that selects every dispatch
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_range(mut self, range: OrdinalRange) -> Self {
        self.range = Some(range);
        self
    }

    pub fn with_devices(mut self, devices: impl IntoIterator<Item = DeviceIndex>) -> Self {
        let devices: BTreeSet<_> = devices.into_iter().collect();
        self.devices = (!devices.is_empty()).then_some(devices);
        self
    }

    pub fn with_kernel_substrings<S: Into<String>>(
        mut self,
        substrings: impl IntoIterator<Item = S>,
    ) -> Self {
        let substrings: Vec<String> = substrings.into_iter().map(Into::into).collect();
        self.kernel_substrings = (!substrings.is_empty()).then_some(substrings);
        self
    }

    /// True when no sub-filter is configured
    pub fn is_unfiltered(&self) -> bool {
        self.range.is_none() && self.devices.is_none() && self.kernel_substrings.is_none()
    }
}

fn deserialize_device_set<'de, D>(deserializer: D) -> Result<Option<BTreeSet<DeviceIndex>>, D::Error>
where
    D: Deserializer<'de>,
{
    let devices: BTreeSet<DeviceIndex> = match Option::<ListRepr<DeviceIndex>>::deserialize(deserializer)? {
        None => BTreeSet::new(),
        Some(ListRepr::Text(text)) => split_list(&text, ',')
            .map(|item| {
                item.parse::<DeviceIndex>().map_err(|_| {
                    serde::de::Error::custom(ParseError::InvalidValue {
                        what: "gpu index",
                        value: item.to_string(),
                    })
                })
            })
            .collect::<Result<_, D::Error>>()?,
        Some(ListRepr::Single(index)) => BTreeSet::from([index]),
        Some(ListRepr::Items(items)) => items.into_iter().collect(),
    };
    Ok((!devices.is_empty()).then_some(devices))
}

fn deserialize_substrings<'de, D>(deserializer: D) -> Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    let substrings: Vec<String> = match Option::<ListRepr<String>>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(ListRepr::Text(text)) | Some(ListRepr::Single(text)) => {
            split_list(&text, ',').map(str::to_string).collect()
        }
        Some(ListRepr::Items(items)) => items.into_iter().filter(|s| !s.is_empty()).collect(),
    };
    Ok((!substrings.is_empty()).then_some(substrings))
}
