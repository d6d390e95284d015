#![forbid(unsafe_code)]

//! Parameter model for softmax conformance cases.
//!
//! Every type here is plain data: a case is fully described by a
//! [`ParameterCombination`], and nothing in this crate touches a device.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Size in bytes of one tensor element. The harness stages `f32` only.
pub const ELEMENT_BYTES: usize = std::mem::size_of::<f32>();

// ── Configuration errors ───────────────────────────────────────────

/// Axis of the test matrix, used to attribute configuration errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Axis {
    InputShapes,
    OutputShapes,
    Algorithms,
    Modes,
    Scales,
}

impl Axis {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InputShapes => "input_shapes",
            Self::OutputShapes => "output_shapes",
            Self::Algorithms => "algorithms",
            Self::Modes => "modes",
            Self::Scales => "scales",
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Matrix construction failed before any case ran.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// A candidate axis has no values.
    EmptyAxis { axis: Axis },
    /// A shape did not have exactly four dimensions.
    WrongRank { dims: Vec<usize> },
    /// A shape contained a zero extent.
    ZeroDimension { dims: [usize; 4] },
    /// The element count (or its byte size) does not fit in `usize`.
    ElementCountOverflow { dims: [usize; 4] },
    /// alpha or beta is NaN or infinite.
    NonFiniteScale { alpha: f32, beta: f32 },
    /// Output buffers are forced to the sentinel while a scale pair blends
    /// the prior output value back in.
    PoisonedBlend { alpha: f32, beta: f32 },
    /// The case filter selected nothing.
    NoCasesSelected { filter: String },
    /// No enumerated case has the requested index or name.
    UnknownCase { case: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyAxis { axis } => {
                write!(f, "candidate set `{axis}` is empty; the matrix would have zero cases")
            }
            Self::WrongRank { dims } => {
                write!(f, "shape {dims:?} must have exactly 4 dimensions (N, C, H, W)")
            }
            Self::ZeroDimension { dims } => {
                write!(f, "shape {dims:?} has a zero dimension")
            }
            Self::ElementCountOverflow { dims } => {
                write!(f, "shape {dims:?} overflows the addressable element count")
            }
            Self::NonFiniteScale { alpha, beta } => {
                write!(f, "scale pair (alpha: {alpha}, beta: {beta}) is not finite")
            }
            Self::PoisonedBlend { alpha, beta } => write!(
                f,
                "scale pair (alpha: {alpha}, beta: {beta}) reads the prior output, \
                 but output buffers are forced to the NaN sentinel"
            ),
            Self::NoCasesSelected { filter } => {
                write!(f, "case filter `{filter}` selected zero cases")
            }
            Self::UnknownCase { case } => write!(f, "no enumerated case matches {case}"),
        }
    }
}

impl std::error::Error for ConfigError {}

// ── Shapes ─────────────────────────────────────────────────────────

/// Extents of a dense NCHW tensor.
///
/// Invariant: every dimension is at least 1 and the byte size of the tensor
/// fits in `usize`. Both are checked by the constructors, so
/// [`ShapeSpec::element_count`] cannot overflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ShapeSpec {
    n: usize,
    c: usize,
    h: usize,
    w: usize,
}

impl ShapeSpec {
    pub fn new(n: usize, c: usize, h: usize, w: usize) -> Result<Self, ConfigError> {
        let dims = [n, c, h, w];
        if dims.contains(&0) {
            return Err(ConfigError::ZeroDimension { dims });
        }
        dims.iter()
            .try_fold(1_usize, |acc, &dim| acc.checked_mul(dim))
            .and_then(|count| count.checked_mul(ELEMENT_BYTES))
            .ok_or(ConfigError::ElementCountOverflow { dims })?;
        Ok(Self { n, c, h, w })
    }

    /// Build from a dimension list as written in an axes file.
    pub fn from_dims(dims: &[usize]) -> Result<Self, ConfigError> {
        match *dims {
            [n, c, h, w] => Self::new(n, c, h, w),
            _ => Err(ConfigError::WrongRank {
                dims: dims.to_vec(),
            }),
        }
    }

    #[must_use]
    pub fn n(&self) -> usize {
        self.n
    }

    #[must_use]
    pub fn c(&self) -> usize {
        self.c
    }

    #[must_use]
    pub fn h(&self) -> usize {
        self.h
    }

    #[must_use]
    pub fn w(&self) -> usize {
        self.w
    }

    #[must_use]
    pub fn dims(&self) -> [usize; 4] {
        [self.n, self.c, self.h, self.w]
    }

    #[must_use]
    pub fn element_count(&self) -> usize {
        self.n * self.c * self.h * self.w
    }

    #[must_use]
    pub fn byte_len(&self) -> usize {
        self.element_count() * ELEMENT_BYTES
    }

    /// Path-safe fragment used in case names, e.g. `n1_c2_h3_w4`.
    #[must_use]
    pub fn slug(&self) -> String {
        format!("n{}_c{}_h{}_w{}", self.n, self.c, self.h, self.w)
    }
}

impl fmt::Display for ShapeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(N: {} C:{} H:{} W:{})",
            self.n, self.c, self.h, self.w
        )
    }
}

// ── Algorithm and reduction scope ──────────────────────────────────

/// Numerical strategy for the same logical softmax.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlgorithmVariant {
    /// `exp(x) / sum(exp(x))` without max subtraction.
    Fast,
    /// Max-subtracted softmax.
    Accurate,
    /// Log-softmax, `x - max - ln(sum(exp(x - max)))`.
    Log,
}

impl AlgorithmVariant {
    pub const ALL: &'static [Self] = &[Self::Fast, Self::Accurate, Self::Log];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Accurate => "accurate",
            Self::Log => "log",
        }
    }

    /// Whether the backward formula reads the forward input `x` in addition
    /// to the forward output `y`.
    #[must_use]
    pub fn backward_reads_forward_input(self) -> bool {
        match self {
            Self::Fast | Self::Accurate | Self::Log => false,
        }
    }
}

impl fmt::Display for AlgorithmVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scope over which values are normalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReductionMode {
    /// One group per batch item, spanning C·H·W.
    Instance,
    /// One group per (N, H, W) position, spanning C.
    Channel,
}

impl ReductionMode {
    pub const ALL: &'static [Self] = &[Self::Instance, Self::Channel];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Instance => "instance",
            Self::Channel => "channel",
        }
    }
}

impl fmt::Display for ReductionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Scales ─────────────────────────────────────────────────────────

/// Blend coefficients: `y = alpha * softmax(x) + beta * y_prior`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScalePair {
    alpha: f32,
    beta: f32,
}

impl ScalePair {
    pub fn new(alpha: f32, beta: f32) -> Result<Self, ConfigError> {
        if !alpha.is_finite() || !beta.is_finite() {
            return Err(ConfigError::NonFiniteScale { alpha, beta });
        }
        Ok(Self { alpha, beta })
    }

    /// `(1, 0)`: overwrite the output.
    #[must_use]
    pub const fn identity() -> Self {
        Self {
            alpha: 1.0,
            beta: 0.0,
        }
    }

    #[must_use]
    pub fn alpha(&self) -> f32 {
        self.alpha
    }

    #[must_use]
    pub fn beta(&self) -> f32 {
        self.beta
    }

    /// True when the operator must read the pre-existing output value.
    #[must_use]
    pub fn reads_prior(&self) -> bool {
        self.beta != 0.0
    }

    /// Bitwise identity, used to collapse duplicate candidates.
    #[must_use]
    pub fn bits(&self) -> (u32, u32) {
        (self.alpha.to_bits(), self.beta.to_bits())
    }

    #[must_use]
    pub fn slug(&self) -> String {
        format!("a{}_b{}", self.alpha, self.beta)
    }
}

impl fmt::Display for ScalePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(alpha: {} beta:{})", self.alpha, self.beta)
    }
}

// ── Buffer roles ───────────────────────────────────────────────────

/// The part a tensor plays in a case. Drives fill policy and staging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferRole {
    /// Forward input `x`.
    Input,
    /// Forward output `y`, written by the operator under test.
    Output,
    /// Host reference for `y`.
    ReferenceOutput,
    /// Backward result `dx`, written by the operator under test.
    GradInput,
    /// Backward seed `dy`.
    GradOutput,
    /// Host reference for `dx`.
    ReferenceGradInput,
}

impl BufferRole {
    pub const ALL: &'static [Self] = &[
        Self::Input,
        Self::Output,
        Self::ReferenceOutput,
        Self::GradInput,
        Self::GradOutput,
        Self::ReferenceGradInput,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Output => "output",
            Self::ReferenceOutput => "reference_output",
            Self::GradInput => "grad_input",
            Self::GradOutput => "grad_output",
            Self::ReferenceGradInput => "reference_grad_input",
        }
    }

    /// Buffers the operator under test writes.
    #[must_use]
    pub fn is_operator_output(self) -> bool {
        matches!(self, Self::Output | Self::GradInput)
    }

    /// Buffers that never leave the host.
    #[must_use]
    pub fn is_reference(self) -> bool {
        matches!(self, Self::ReferenceOutput | Self::ReferenceGradInput)
    }

    /// The operator-written buffer a reference buffer mirrors.
    #[must_use]
    pub fn mirrored(self) -> Option<Self> {
        match self {
            Self::ReferenceOutput => Some(Self::Output),
            Self::ReferenceGradInput => Some(Self::GradInput),
            _ => None,
        }
    }
}

impl fmt::Display for BufferRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Cases ──────────────────────────────────────────────────────────

/// One point of the test matrix.
///
/// `index` is the position in the unfiltered matrix and stays stable across
/// runs with the same axes, so a failing case can be replayed by index.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ParameterCombination {
    pub index: usize,
    pub input_shape: ShapeSpec,
    pub output_shape: ShapeSpec,
    pub algorithm: AlgorithmVariant,
    pub mode: ReductionMode,
    pub scales: ScalePair,
}

impl ParameterCombination {
    /// Deterministic, independently addressable test name.
    #[must_use]
    pub fn name(&self) -> String {
        let mut name = format!("softmax/{}", self.input_shape.slug());
        if self.output_shape != self.input_shape {
            name.push_str("/out_");
            name.push_str(&self.output_shape.slug());
        }
        name.push('/');
        name.push_str(self.algorithm.as_str());
        name.push('/');
        name.push_str(self.mode.as_str());
        name.push('/');
        name.push_str(&self.scales.slug());
        name
    }

    #[must_use]
    pub fn shapes_tied(&self) -> bool {
        self.input_shape == self.output_shape
    }
}

impl fmt::Display for ParameterCombination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {}", self.index, self.name())
    }
}
