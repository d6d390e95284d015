//! Device-side memory: raw buffers and the handles that name them.
//!
//! Device memory is untyped bytes. The harness stages `f32` tensors, encoded
//! little-endian, so a buffer's size is always a multiple of
//! [`ELEMENT_BYTES`].

use crate::device::DeviceId;
use smx_core::ELEMENT_BYTES;

/// Opaque reference to one device allocation.
///
/// Handles are process-local and are never reused: a released handle stays
/// dead even if the backend recycles the memory behind it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceHandle {
    id: u64,
    device: DeviceId,
    size_bytes: usize,
}

impl DeviceHandle {
    #[must_use]
    pub fn new(id: u64, device: DeviceId, size_bytes: usize) -> Self {
        Self {
            id,
            device,
            size_bytes,
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn device(&self) -> DeviceId {
        self.device
    }

    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    #[must_use]
    pub fn element_count(&self) -> usize {
        self.size_bytes / ELEMENT_BYTES
    }
}

impl std::fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{} ({}B)", self.device, self.id, self.size_bytes)
    }
}

/// A contiguous memory region on a specific device.
///
/// Invariant: `data.len()` never changes after allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Buffer {
    data: Vec<u8>,
    device: DeviceId,
}

impl Buffer {
    /// Zero-initialized buffer, i.e. fresh device memory.
    #[must_use]
    pub fn zeroed(size: usize, device: DeviceId) -> Self {
        Self {
            data: vec![0u8; size],
            device,
        }
    }

    #[must_use]
    pub fn device(&self) -> DeviceId {
        self.device
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

#[must_use]
pub fn encode_f32s(values: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * ELEMENT_BYTES);
    for value in values {
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

#[must_use]
pub fn decode_f32s(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() % ELEMENT_BYTES != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(ELEMENT_BYTES)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect(),
    )
}
