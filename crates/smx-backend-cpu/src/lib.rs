//! Host-memory device for the softmax conformance harness.
//!
//! Implements both the memory `Backend` and the `SoftmaxOperator` contract
//! on top of the host reference math. It is always available and is what
//! the harness runs against when no accelerator is bound. Faults can be
//! injected to prove the harness catches broken operators.

#![forbid(unsafe_code)]

mod executor;

pub use executor::{CpuBackend, CpuFault, FAULT_FORMS};
