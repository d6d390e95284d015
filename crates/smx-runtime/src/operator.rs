//! Invocation contract of the softmax operator under test.

use crate::backend::BackendError;
use crate::buffer::DeviceHandle;
use smx_core::{AlgorithmVariant, ReductionMode, ScalePair, ShapeSpec};

/// A device tensor: handle plus the logical shape the caller attaches to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TensorArg {
    pub handle: DeviceHandle,
    pub shape: ShapeSpec,
}

/// Arguments of `forward(x, y, algorithm, mode, alpha, beta)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ForwardArgs {
    pub input: TensorArg,
    pub output: TensorArg,
    pub algorithm: AlgorithmVariant,
    pub mode: ReductionMode,
    pub scales: ScalePair,
}

/// Arguments of `backward(y, dy, dx, algorithm, mode, alpha, beta)`.
///
/// `input` is only bound for variants whose backward formula reads `x`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackwardArgs {
    pub output: TensorArg,
    pub grad_output: TensorArg,
    pub grad_input: TensorArg,
    pub input: Option<TensorArg>,
    pub algorithm: AlgorithmVariant,
    pub mode: ReductionMode,
    pub scales: ScalePair,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperatorError {
    /// Tensor shapes are not compatible for this operator.
    ShapeMismatch {
        expected: ShapeSpec,
        actual: ShapeSpec,
    },
    /// A handle's allocation does not hold the declared shape.
    HandleTooSmall {
        handle: DeviceHandle,
        required_bytes: usize,
    },
    /// The operator reached device memory and the backend refused.
    Backend(BackendError),
    /// The kernel reported failure.
    Failed { detail: String },
}

impl std::fmt::Display for OperatorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ShapeMismatch { expected, actual } => {
                write!(f, "shape mismatch: expected {expected}, got {actual}")
            }
            Self::HandleTooSmall {
                handle,
                required_bytes,
            } => write!(f, "{handle} cannot hold {required_bytes}B"),
            Self::Backend(err) => write!(f, "device memory error: {err}"),
            Self::Failed { detail } => write!(f, "kernel failed: {detail}"),
        }
    }
}

impl std::error::Error for OperatorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Backend(err) => Some(err),
            _ => None,
        }
    }
}

impl From<BackendError> for OperatorError {
    fn from(value: BackendError) -> Self {
        Self::Backend(value)
    }
}

/// The operator under test. Opaque beyond this contract.
///
/// Postcondition of a successful call: every element of the written tensor
/// (`output` for forward, `grad_input` for backward) holds a defined value.
pub trait SoftmaxOperator: Send + Sync {
    fn name(&self) -> &str;

    fn forward(&self, args: &ForwardArgs) -> Result<(), OperatorError>;

    fn backward(&self, args: &BackwardArgs) -> Result<(), OperatorError>;
}

/// Check that `arg` is large enough for its declared shape.
pub fn ensure_capacity(arg: &TensorArg) -> Result<(), OperatorError> {
    let required_bytes = arg.shape.byte_len();
    if arg.handle.size_bytes() < required_bytes {
        return Err(OperatorError::HandleTooSmall {
            handle: arg.handle,
            required_bytes,
        });
    }
    Ok(())
}
