#![forbid(unsafe_code)]

//! Parameterized conformance harness for softmax-family operators.
//!
//! A suite run enumerates a [`matrix::TestMatrix`], builds one
//! [`fixture::TensorFixture`] per case, stages it on a device through
//! `smx-runtime`, invokes the operator under test and hands the results to
//! a [`compare::Comparator`]. Every case yields exactly one
//! [`runner::CaseReport`]; the [`report::SuiteReport`] gates the run.

pub mod compare;
pub mod fixture;
pub mod matrix;
pub mod report;
pub mod runner;

use compare::{Comparator, ElementwiseComparator, Tolerance};
use serde::{Deserialize, Serialize};
use smx_backend_cpu::{CpuBackend, CpuFault};
use smx_runtime::{Backend, SoftmaxOperator};
use std::path::PathBuf;
use std::sync::Arc;

pub use matrix::{ParameterAxes, TestMatrix};
pub use report::{SuiteGate, SuiteReport};
pub use runner::{CaseOutcome, CaseReport, CaseState};

/// Default suite seed when neither the caller nor `SMX_SEED` sets one.
pub const DEFAULT_SEED: u64 = 0x5eed_50f7;

/// How the output-shape axis relates to the input-shape axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShapePolicy {
    /// Output shape equals input shape; the output axis is ignored.
    #[default]
    Tied,
    /// Output shapes form their own axis. Incompatible pairs must be
    /// rejected by the operator and surface as invocation errors.
    Independent,
}

impl ShapePolicy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tied => "tied",
            Self::Independent => "independent",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, String> {
        match raw {
            "tied" => Ok(Self::Tied),
            "independent" => Ok(Self::Independent),
            _ => Err(format!(
                "unknown shape policy `{raw}` (expected tied or independent)"
            )),
        }
    }
}

/// One case, picked exactly. Unlike the substring filter, a name never
/// selects its longer siblings (`a1_b0` vs `a1_b0.5`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaseSelector {
    /// Enumeration index, stable under filtering.
    Index(usize),
    /// Full case name as printed by `list`.
    Name(String),
}

impl CaseSelector {
    /// A bare integer is an index; anything else is a name.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        match raw.parse::<usize>() {
            Ok(index) => Self::Index(index),
            Err(_) => Self::Name(raw.to_owned()),
        }
    }
}

impl std::fmt::Display for CaseSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Index(index) => write!(f, "index {index}"),
            Self::Name(name) => write!(f, "name `{name}`"),
        }
    }
}

/// Initial contents of operator-output buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputInit {
    /// Sentinel when beta == 0, seeded prior values when the blend reads them.
    #[default]
    Auto,
    /// Always the sentinel. Rejected at matrix construction if any scale
    /// pair has beta != 0.
    Poison,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HarnessConfig {
    pub seed: u64,
    /// Device contexts requested from the CPU backend.
    pub device_count: u32,
    pub parallel: bool,
    /// Run the backward pass after a passing forward pass.
    pub backward: bool,
    pub shape_policy: ShapePolicy,
    pub output_init: OutputInit,
    /// Per-buffer element ceiling; larger fixtures fail setup.
    pub max_fixture_elements: Option<usize>,
    /// Overrides the per-algorithm tolerance for every case.
    pub tolerance: Option<Tolerance>,
    /// Keep only cases whose name contains this substring.
    pub case_filter: Option<String>,
    /// Run exactly this case, after the filter.
    pub case: Option<CaseSelector>,
    pub fixture_root: PathBuf,
}

impl HarnessConfig {
    #[must_use]
    pub fn default_paths() -> Self {
        Self {
            seed: DEFAULT_SEED,
            device_count: 1,
            parallel: false,
            backward: true,
            shape_policy: ShapePolicy::Tied,
            output_init: OutputInit::Auto,
            max_fixture_elements: None,
            tolerance: None,
            case_filter: None,
            case: None,
            fixture_root: PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures"),
        }
    }

    /// Defaults overridden by `SMX_SEED`, `SMX_DEVICES`, `SMX_BACKWARD`,
    /// `SMX_CASE_FILTER` and `SMX_CASE`.
    pub fn from_env() -> Result<Self, EnvOverrideError> {
        Self::default_paths().with_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from any variable lookup; unset variables keep the
    /// current value.
    pub fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, EnvOverrideError> {
        if let Some(raw) = lookup(smx_test_utils::SEED_ENV) {
            self.seed = parse_env(smx_test_utils::SEED_ENV, &raw)?;
        }
        if let Some(raw) = lookup("SMX_DEVICES") {
            self.device_count = parse_env("SMX_DEVICES", &raw)?;
        }
        if let Some(raw) = lookup("SMX_BACKWARD") {
            self.backward = match raw.trim() {
                "1" | "true" | "on" => true,
                "0" | "false" | "off" => false,
                _ => {
                    return Err(EnvOverrideError {
                        name: "SMX_BACKWARD",
                        value: raw,
                    });
                }
            };
        }
        if let Some(raw) = lookup("SMX_CASE_FILTER")
            && !raw.trim().is_empty()
        {
            self.case_filter = Some(raw.trim().to_owned());
        }
        if let Some(raw) = lookup("SMX_CASE")
            && !raw.trim().is_empty()
        {
            self.case = Some(CaseSelector::parse(&raw));
        }
        Ok(self)
    }

    #[must_use]
    pub fn axes_path(&self) -> PathBuf {
        self.fixture_root.join("softmax_axes.json")
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self::default_paths()
    }
}

fn parse_env<T: std::str::FromStr>(name: &'static str, raw: &str) -> Result<T, EnvOverrideError> {
    raw.trim().parse::<T>().map_err(|_| EnvOverrideError {
        name,
        value: raw.to_owned(),
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvOverrideError {
    pub name: &'static str,
    pub value: String,
}

impl std::fmt::Display for EnvOverrideError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid value `{}` for {}", self.value, self.name)
    }
}

impl std::error::Error for EnvOverrideError {}

/// The collaborators a suite runs against.
///
/// Cloning is cheap; every collaborator is shared.
#[derive(Clone)]
pub struct Harness {
    backend: Arc<dyn Backend>,
    operator: Arc<dyn SoftmaxOperator>,
    comparator: Arc<dyn Comparator>,
    config: HarnessConfig,
}

impl Harness {
    #[must_use]
    pub fn new(
        backend: Arc<dyn Backend>,
        operator: Arc<dyn SoftmaxOperator>,
        config: HarnessConfig,
    ) -> Self {
        Self {
            backend,
            operator,
            comparator: Arc::new(ElementwiseComparator),
            config,
        }
    }

    /// Run against the host-memory device with `config.device_count`
    /// contexts.
    #[must_use]
    pub fn cpu(config: HarnessConfig) -> Self {
        let cpu = Arc::new(CpuBackend::with_device_count(config.device_count));
        Self::new(cpu.clone(), cpu, config)
    }

    /// Like [`Harness::cpu`], with a fault injected into the device.
    #[must_use]
    pub fn cpu_with_fault(config: HarnessConfig, fault: CpuFault) -> Self {
        let cpu = Arc::new(CpuBackend::with_device_count(config.device_count).with_fault(fault));
        Self::new(cpu.clone(), cpu, config)
    }

    #[must_use]
    pub fn with_comparator(mut self, comparator: Arc<dyn Comparator>) -> Self {
        self.comparator = comparator;
        self
    }

    #[must_use]
    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    #[must_use]
    pub fn operator(&self) -> &dyn SoftmaxOperator {
        self.operator.as_ref()
    }

    #[must_use]
    pub fn comparator(&self) -> &dyn Comparator {
        self.comparator.as_ref()
    }

    #[must_use]
    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }
}

impl std::fmt::Debug for Harness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Harness")
            .field("backend", &self.backend.name())
            .field("operator", &self.operator.name())
            .field("config", &self.config)
            .finish()
    }
}
