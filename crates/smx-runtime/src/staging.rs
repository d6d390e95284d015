//! Scoped host/device staging for one case.
//!
//! A [`DeviceStaging`] owns every device allocation a case makes. Dropping
//! it releases all of them, whether the case passed, failed, or bailed out
//! halfway through staging.

use crate::backend::{Backend, BackendError, TransferDirection};
use crate::buffer::{DeviceHandle, decode_f32s, encode_f32s};
use crate::device::DeviceId;
use crate::operator::TensorArg;
use smx_core::{BufferRole, ShapeSpec};
use tracing::{debug, warn};

/// A host buffer role bound to a device allocation for the life of a case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceBinding {
    pub role: BufferRole,
    pub handle: DeviceHandle,
    pub shape: ShapeSpec,
}

impl DeviceBinding {
    #[must_use]
    pub fn as_arg(&self) -> TensorArg {
        TensorArg {
            handle: self.handle,
            shape: self.shape,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StagingError {
    /// Allocation or copy failed for `role`.
    Transfer {
        role: BufferRole,
        direction: TransferDirection,
        source: BackendError,
    },
    /// Host slice length disagrees with the declared shape.
    HostLength {
        role: BufferRole,
        expected: usize,
        actual: usize,
    },
    /// The role was bound twice in one case.
    AlreadyStaged { role: BufferRole },
    /// The role was read back or passed on without being staged.
    NotStaged { role: BufferRole },
    /// Reference buffers never leave the host.
    HostOnly { role: BufferRole },
}

impl StagingError {
    /// The buffer the failure belongs to.
    #[must_use]
    pub fn role(&self) -> BufferRole {
        match self {
            Self::Transfer { role, .. }
            | Self::HostLength { role, .. }
            | Self::AlreadyStaged { role }
            | Self::NotStaged { role }
            | Self::HostOnly { role } => *role,
        }
    }
}

impl std::fmt::Display for StagingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transfer {
                role,
                direction,
                source,
            } => write!(f, "staging `{role}` {direction} failed: {source}"),
            Self::HostLength {
                role,
                expected,
                actual,
            } => write!(
                f,
                "host buffer `{role}` has {actual} elements, shape declares {expected}"
            ),
            Self::AlreadyStaged { role } => write!(f, "buffer `{role}` is already staged"),
            Self::NotStaged { role } => write!(f, "buffer `{role}` was never staged"),
            Self::HostOnly { role } => write!(f, "buffer `{role}` is host-only"),
        }
    }
}

impl std::error::Error for StagingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transfer { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Device bindings of one case on one device context.
pub struct DeviceStaging<'b> {
    backend: &'b dyn Backend,
    device: DeviceId,
    bindings: Vec<DeviceBinding>,
}

impl<'b> DeviceStaging<'b> {
    #[must_use]
    pub fn new(backend: &'b dyn Backend, device: DeviceId) -> Self {
        Self {
            backend,
            device,
            bindings: Vec::new(),
        }
    }

    #[must_use]
    pub fn device(&self) -> DeviceId {
        self.device
    }

    #[must_use]
    pub fn bindings(&self) -> &[DeviceBinding] {
        &self.bindings
    }

    #[must_use]
    pub fn binding(&self, role: BufferRole) -> Option<&DeviceBinding> {
        self.bindings.iter().find(|binding| binding.role == role)
    }

    /// The operator argument for an already staged role.
    pub fn arg(&self, role: BufferRole) -> Result<TensorArg, StagingError> {
        self.binding(role)
            .map(DeviceBinding::as_arg)
            .ok_or(StagingError::NotStaged { role })
    }

    /// Allocate device memory for `role` and copy `values` into it.
    ///
    /// Used for inputs and, with sentinel or prior contents, for the
    /// placeholders the operator will overwrite.
    pub fn stage_in(
        &mut self,
        role: BufferRole,
        shape: ShapeSpec,
        values: &[f32],
    ) -> Result<TensorArg, StagingError> {
        if role.is_reference() {
            return Err(StagingError::HostOnly { role });
        }
        if self.binding(role).is_some() {
            return Err(StagingError::AlreadyStaged { role });
        }
        if values.len() != shape.element_count() {
            return Err(StagingError::HostLength {
                role,
                expected: shape.element_count(),
                actual: values.len(),
            });
        }

        let handle = self
            .backend
            .allocate(shape.byte_len(), self.device)
            .map_err(|source| StagingError::Transfer {
                role,
                direction: TransferDirection::HostToDevice,
                source,
            })?;
        // Bound before the copy so a failed write is still released.
        self.bindings.push(DeviceBinding {
            role,
            handle,
            shape,
        });

        self.backend
            .write(handle, &encode_f32s(values))
            .map_err(|source| StagingError::Transfer {
                role,
                direction: TransferDirection::HostToDevice,
                source,
            })?;
        debug!(role = role.as_str(), %handle, "staged host→device");
        Ok(TensorArg { handle, shape })
    }

    /// Copy the device contents of `role` back into `out`.
    pub fn stage_out(&self, role: BufferRole, out: &mut [f32]) -> Result<(), StagingError> {
        let binding = self.binding(role).ok_or(StagingError::NotStaged { role })?;
        if out.len() != binding.shape.element_count() {
            return Err(StagingError::HostLength {
                role,
                expected: binding.shape.element_count(),
                actual: out.len(),
            });
        }

        let bytes = self
            .backend
            .read(binding.handle)
            .map_err(|source| StagingError::Transfer {
                role,
                direction: TransferDirection::DeviceToHost,
                source,
            })?;
        let values = decode_f32s(&bytes)
            .filter(|values| values.len() == out.len())
            .ok_or_else(|| StagingError::Transfer {
                role,
                direction: TransferDirection::DeviceToHost,
                source: BackendError::SizeMismatch {
                    handle: binding.handle,
                    expected_bytes: binding.shape.byte_len(),
                    actual_bytes: bytes.len(),
                },
            })?;
        out.copy_from_slice(&values);
        debug!(role = role.as_str(), handle = %binding.handle, "staged device→host");
        Ok(())
    }

    /// Release every binding now. Returns the releases that failed; the
    /// bindings are forgotten either way.
    pub fn release_all(&mut self) -> Vec<(BufferRole, BackendError)> {
        let mut failures = Vec::new();
        for binding in self.bindings.drain(..) {
            if let Err(err) = self.backend.release(binding.handle) {
                failures.push((binding.role, err));
            }
        }
        failures
    }
}

impl Drop for DeviceStaging<'_> {
    fn drop(&mut self) {
        for (role, err) in self.release_all() {
            warn!(role = role.as_str(), error = %err, "device release failed at teardown");
        }
    }
}
