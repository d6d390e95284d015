//! Device identification and case placement.
//!
//! A device context is the unit of isolation for parallel runs: cases are
//! sharded onto contexts and a context executes one case at a time.

/// Identifier of a device context within a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub u32);

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "device:{}", self.0)
    }
}

/// Platform type for a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    /// Host memory standing in for an accelerator.
    Host,
}

impl Platform {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Host => "host",
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata about a device context, returned by `Backend::devices`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub platform: Platform,
    /// Human-readable name for diagnostics.
    pub label: String,
}

/// Device context that owns the case at `case_index` when cases are
/// sharded round-robin over `devices`.
///
/// Returns `None` when there are no devices.
#[must_use]
pub fn shard_device(case_index: usize, devices: &[DeviceInfo]) -> Option<DeviceId> {
    if devices.is_empty() {
        return None;
    }
    Some(devices[case_index % devices.len()].id)
}
