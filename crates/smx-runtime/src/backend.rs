//! Backend trait: device discovery and device memory.
//!
//! Kernel invocation lives behind [`crate::operator::SoftmaxOperator`]; a
//! backend only owns memory and the host/device copies. Keeping the two
//! apart lets a harness pair one memory backend with several operators.

use crate::buffer::DeviceHandle;
use crate::device::{DeviceId, DeviceInfo};

// ── Transfer direction ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferDirection {
    HostToDevice,
    DeviceToHost,
}

impl TransferDirection {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HostToDevice => "host→device",
            Self::DeviceToHost => "device→host",
        }
    }
}

impl std::fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Backend Errors ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// Requested device context does not exist on this backend.
    UnknownDevice { device: DeviceId },
    /// Device allocation failed (e.g., OOM).
    AllocationFailed { device: DeviceId, detail: String },
    /// Host/device copy failed.
    TransferFailed {
        handle: DeviceHandle,
        direction: TransferDirection,
        detail: String,
    },
    /// The handle was never allocated or was already released.
    UnknownHandle { handle: DeviceHandle },
    /// A host slice does not match the allocation size.
    SizeMismatch {
        handle: DeviceHandle,
        expected_bytes: usize,
        actual_bytes: usize,
    },
    /// Backend bookkeeping is unusable (e.g., a lock was poisoned).
    Internal { detail: String },
}

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownDevice { device } => write!(f, "unknown device {device}"),
            Self::AllocationFailed { device, detail } => {
                write!(f, "allocation failed on {device}: {detail}")
            }
            Self::TransferFailed {
                handle,
                direction,
                detail,
            } => write!(f, "transfer {direction} of {handle} failed: {detail}"),
            Self::UnknownHandle { handle } => write!(f, "unknown or released handle {handle}"),
            Self::SizeMismatch {
                handle,
                expected_bytes,
                actual_bytes,
            } => write!(
                f,
                "size mismatch on {handle}: expected {expected_bytes}B, got {actual_bytes}B"
            ),
            Self::Internal { detail } => write!(f, "backend internal error: {detail}"),
        }
    }
}

impl std::error::Error for BackendError {}

// ── Backend Trait ──────────────────────────────────────────────────

/// Uniform interface to device memory.
///
/// Every call blocks until the copy has completed; a case may rely on data
/// being visible on the device as soon as `write` returns.
pub trait Backend: Send + Sync {
    /// Human-readable backend name (e.g., "cpu", "hip").
    fn name(&self) -> &str;

    /// Device contexts available to the harness.
    fn devices(&self) -> Vec<DeviceInfo>;

    /// Default device for sequential runs (first available).
    fn default_device(&self) -> DeviceId;

    /// Allocate `size_bytes` of device memory. Contents are unspecified.
    fn allocate(&self, size_bytes: usize, device: DeviceId) -> Result<DeviceHandle, BackendError>;

    /// Copy host bytes into a device allocation. `bytes.len()` must equal
    /// the allocation size.
    fn write(&self, handle: DeviceHandle, bytes: &[u8]) -> Result<(), BackendError>;

    /// Copy a device allocation back to the host.
    fn read(&self, handle: DeviceHandle) -> Result<Vec<u8>, BackendError>;

    /// Free a device allocation. Releasing twice is an `UnknownHandle` error.
    fn release(&self, handle: DeviceHandle) -> Result<(), BackendError>;

    /// Number of allocations not yet released, across all devices.
    fn live_allocations(&self) -> usize;

    /// Platform version string, recorded in suite reports.
    fn version(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_error_display() {
        let err = BackendError::UnknownDevice {
            device: DeviceId(4),
        };
        assert_eq!(err.to_string(), "unknown device device:4");

        let err = BackendError::AllocationFailed {
            device: DeviceId(0),
            detail: "out of memory".to_owned(),
        };
        assert!(err.to_string().contains("allocation failed"));
        assert!(err.to_string().contains("out of memory"));
    }

    #[test]
    fn transfer_error_names_direction() {
        let err = BackendError::TransferFailed {
            handle: DeviceHandle::new(1, DeviceId(0), 16),
            direction: TransferDirection::DeviceToHost,
            detail: "bus error".to_owned(),
        };
        let rendered = err.to_string();
        assert!(rendered.contains("device→host"));
        assert!(rendered.contains("device:0#1"));
    }
}
