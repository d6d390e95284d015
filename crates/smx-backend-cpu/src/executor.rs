//! CPU device arena and operator.
//!
//! Memory is a map from handle id to [`Buffer`]. Handles are minted from a
//! monotonically increasing counter, so a released handle is never valid
//! again even if its bytes are recycled by the allocator.

use smx_core::{BufferRole, ShapeSpec};
use smx_reference::{softmax_backward, softmax_forward};
use smx_runtime::backend::{Backend, BackendError, TransferDirection};
use smx_runtime::buffer::{Buffer, DeviceHandle, decode_f32s, encode_f32s};
use smx_runtime::device::{DeviceId, DeviceInfo, Platform};
use smx_runtime::operator::{
    BackwardArgs, ForwardArgs, OperatorError, SoftmaxOperator, TensorArg, ensure_capacity,
};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Accepted spellings of [`CpuFault::parse`], for usage text.
pub const FAULT_FORMS: &str =
    "skip-tail:N, fail-transfer:N, fail-readback:N, fail-release, fail-forward, fail-backward";

/// Misbehaviour injected into the CPU device to exercise the harness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuFault {
    /// Kernels leave the last `n` elements of their result untouched.
    SkipTailWrites(usize),
    /// Copies of allocations holding exactly this many elements fail.
    FailTransfersOfElements(usize),
    /// Like `FailTransfersOfElements`, for device→host copies only.
    FailReadbackOfElements(usize),
    /// Every release fails and the allocation stays live.
    FailRelease,
    /// Forward reports failure.
    FailForward,
    /// Backward reports failure.
    FailBackward,
}

impl CpuFault {
    /// Parse `skip-tail:N`, `fail-transfer:N`, `fail-readback:N`,
    /// `fail-release`, `fail-forward` or `fail-backward`.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let (kind, arg) = match raw.split_once(':') {
            Some((kind, arg)) => (kind, Some(arg)),
            None => (raw, None),
        };
        let count = |arg: Option<&str>| -> Result<usize, String> {
            arg.ok_or_else(|| format!("fault `{kind}` needs a count, e.g. `{kind}:1`"))?
                .parse::<usize>()
                .map_err(|err| format!("invalid count in fault `{raw}`: {err}"))
        };
        match kind {
            "skip-tail" => Ok(Self::SkipTailWrites(count(arg)?)),
            "fail-transfer" => Ok(Self::FailTransfersOfElements(count(arg)?)),
            "fail-readback" => Ok(Self::FailReadbackOfElements(count(arg)?)),
            "fail-release" => Ok(Self::FailRelease),
            "fail-forward" => Ok(Self::FailForward),
            "fail-backward" => Ok(Self::FailBackward),
            _ => Err(format!("unknown fault `{raw}` (expected one of {FAULT_FORMS})")),
        }
    }
}

/// Simulated device: host memory partitioned into logical device contexts.
pub struct CpuBackend {
    device_count: u32,
    version_string: String,
    memory: Mutex<BTreeMap<u64, Buffer>>,
    next_handle: AtomicU64,
    fault: Option<CpuFault>,
}

impl CpuBackend {
    /// A CPU backend with a single device context.
    #[must_use]
    pub fn new() -> Self {
        Self::with_device_count(1)
    }

    /// Expose `count` logical device contexts (at least one).
    #[must_use]
    pub fn with_device_count(count: u32) -> Self {
        Self {
            device_count: count.max(1),
            version_string: format!("smx-backend-cpu/{}", env!("CARGO_PKG_VERSION")),
            memory: Mutex::new(BTreeMap::new()),
            next_handle: AtomicU64::new(1),
            fault: None,
        }
    }

    #[must_use]
    pub fn with_fault(mut self, fault: CpuFault) -> Self {
        self.fault = Some(fault);
        self
    }

    #[must_use]
    pub fn fault(&self) -> Option<CpuFault> {
        self.fault
    }

    fn check_device(&self, device: DeviceId) -> Result<(), BackendError> {
        if device.0 >= self.device_count {
            return Err(BackendError::UnknownDevice { device });
        }
        Ok(())
    }

    fn check_transfer(
        &self,
        handle: DeviceHandle,
        direction: TransferDirection,
    ) -> Result<(), BackendError> {
        let failing = match self.fault {
            Some(CpuFault::FailTransfersOfElements(count)) => Some(count),
            Some(CpuFault::FailReadbackOfElements(count))
                if direction == TransferDirection::DeviceToHost =>
            {
                Some(count)
            }
            _ => None,
        };
        if let Some(count) = failing
            && handle.element_count() == count
        {
            return Err(BackendError::TransferFailed {
                handle,
                direction,
                detail: format!("injected transfer fault for {count}-element buffers"),
            });
        }
        Ok(())
    }

    fn lock_memory(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, BTreeMap<u64, Buffer>>, BackendError> {
        self.memory.lock().map_err(|_| BackendError::Internal {
            detail: "device memory lock poisoned".to_owned(),
        })
    }

    /// Device-side read used by kernels; bypasses transfer faults.
    fn load(&self, arg: &TensorArg) -> Result<Vec<f32>, OperatorError> {
        ensure_capacity(arg)?;
        let memory = self.lock_memory()?;
        let buffer = memory
            .get(&arg.handle.id())
            .ok_or(BackendError::UnknownHandle { handle: arg.handle })?;
        let mut values = decode_f32s(buffer.as_bytes()).ok_or(BackendError::SizeMismatch {
            handle: arg.handle,
            expected_bytes: arg.shape.byte_len(),
            actual_bytes: buffer.size(),
        })?;
        values.truncate(arg.shape.element_count());
        Ok(values)
    }

    /// Device-side write used by kernels. Honours `SkipTailWrites`.
    fn store(&self, arg: &TensorArg, values: &[f32]) -> Result<(), OperatorError> {
        let written = match self.fault {
            Some(CpuFault::SkipTailWrites(skip)) => values.len().saturating_sub(skip),
            _ => values.len(),
        };
        let mut memory = self.lock_memory()?;
        let buffer = memory
            .get_mut(&arg.handle.id())
            .ok_or(BackendError::UnknownHandle { handle: arg.handle })?;
        let bytes = encode_f32s(&values[..written]);
        buffer.as_bytes_mut()[..bytes.len()].copy_from_slice(&bytes);
        Ok(())
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn require_same_shape(expected: ShapeSpec, actual: ShapeSpec) -> Result<(), OperatorError> {
    if expected != actual {
        return Err(OperatorError::ShapeMismatch { expected, actual });
    }
    Ok(())
}

fn kernel_error(err: smx_reference::ReferenceError) -> OperatorError {
    OperatorError::Failed {
        detail: err.to_string(),
    }
}

impl Backend for CpuBackend {
    fn name(&self) -> &str {
        "cpu"
    }

    fn devices(&self) -> Vec<DeviceInfo> {
        (0..self.device_count)
            .map(|i| DeviceInfo {
                id: DeviceId(i),
                platform: Platform::Host,
                label: format!("cpu-context-{i}"),
            })
            .collect()
    }

    fn default_device(&self) -> DeviceId {
        DeviceId(0)
    }

    fn allocate(&self, size_bytes: usize, device: DeviceId) -> Result<DeviceHandle, BackendError> {
        self.check_device(device)?;
        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        let handle = DeviceHandle::new(id, device, size_bytes);
        self.lock_memory()?
            .insert(id, Buffer::zeroed(size_bytes, device));
        Ok(handle)
    }

    fn write(&self, handle: DeviceHandle, bytes: &[u8]) -> Result<(), BackendError> {
        self.check_transfer(handle, TransferDirection::HostToDevice)?;
        let mut memory = self.lock_memory()?;
        let buffer = memory
            .get_mut(&handle.id())
            .ok_or(BackendError::UnknownHandle { handle })?;
        if buffer.size() != bytes.len() {
            return Err(BackendError::SizeMismatch {
                handle,
                expected_bytes: buffer.size(),
                actual_bytes: bytes.len(),
            });
        }
        buffer.as_bytes_mut().copy_from_slice(bytes);
        Ok(())
    }

    fn read(&self, handle: DeviceHandle) -> Result<Vec<u8>, BackendError> {
        self.check_transfer(handle, TransferDirection::DeviceToHost)?;
        let memory = self.lock_memory()?;
        memory
            .get(&handle.id())
            .map(|buffer| buffer.as_bytes().to_vec())
            .ok_or(BackendError::UnknownHandle { handle })
    }

    fn release(&self, handle: DeviceHandle) -> Result<(), BackendError> {
        if self.fault == Some(CpuFault::FailRelease) {
            return Err(BackendError::Internal {
                detail: format!("injected release fault for {handle}"),
            });
        }
        self.lock_memory()?
            .remove(&handle.id())
            .map(|_| ())
            .ok_or(BackendError::UnknownHandle { handle })
    }

    fn live_allocations(&self) -> usize {
        // A poisoned map still holds the allocations; count them.
        match self.memory.lock() {
            Ok(memory) => memory.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    fn version(&self) -> &str {
        &self.version_string
    }
}

impl SoftmaxOperator for CpuBackend {
    fn name(&self) -> &str {
        "cpu-reference-softmax"
    }

    fn forward(&self, args: &ForwardArgs) -> Result<(), OperatorError> {
        if self.fault == Some(CpuFault::FailForward) {
            return Err(OperatorError::Failed {
                detail: "injected forward fault".to_owned(),
            });
        }
        require_same_shape(args.input.shape, args.output.shape)?;

        let input = self.load(&args.input)?;
        let mut output = self.load(&args.output)?;
        softmax_forward(
            &input,
            args.input.shape,
            args.algorithm,
            args.mode,
            args.scales,
            &mut output,
        )
        .map_err(kernel_error)?;
        self.store(&args.output, &output)?;
        debug!(
            role = BufferRole::Output.as_str(),
            handle = %args.output.handle,
            algorithm = %args.algorithm,
            mode = %args.mode,
            "cpu forward complete"
        );
        Ok(())
    }

    fn backward(&self, args: &BackwardArgs) -> Result<(), OperatorError> {
        if self.fault == Some(CpuFault::FailBackward) {
            return Err(OperatorError::Failed {
                detail: "injected backward fault".to_owned(),
            });
        }
        require_same_shape(args.output.shape, args.grad_output.shape)?;
        require_same_shape(args.output.shape, args.grad_input.shape)?;

        let output = self.load(&args.output)?;
        let grad_output = self.load(&args.grad_output)?;
        let mut grad_input = self.load(&args.grad_input)?;
        softmax_backward(
            &output,
            &grad_output,
            args.output.shape,
            args.algorithm,
            args.mode,
            args.scales,
            &mut grad_input,
        )
        .map_err(kernel_error)?;
        self.store(&args.grad_input, &grad_input)?;
        debug!(
            role = BufferRole::GradInput.as_str(),
            handle = %args.grad_input.handle,
            "cpu backward complete"
        );
        Ok(())
    }
}
