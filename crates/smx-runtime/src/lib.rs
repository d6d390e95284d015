#![forbid(unsafe_code)]

//! Device abstractions for the softmax conformance harness: device
//! contexts, raw buffers, the memory [`backend::Backend`], the operator
//! contract, and per-case staging.

pub mod backend;
pub mod buffer;
pub mod device;
pub mod operator;
pub mod staging;

pub use backend::{Backend, BackendError, TransferDirection};
pub use buffer::{Buffer, DeviceHandle};
pub use device::{DeviceId, DeviceInfo, Platform, shard_device};
pub use operator::{BackwardArgs, ForwardArgs, OperatorError, SoftmaxOperator, TensorArg};
pub use staging::{DeviceBinding, DeviceStaging, StagingError};
