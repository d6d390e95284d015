//! Host tensor fixtures.
//!
//! Every buffer a case touches is built here, with its fill policy chosen
//! by role. Output buffers the operator must overwrite start out as the NaN
//! sentinel, so memory the operator never wrote can never match a
//! reference by accident.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use smx_core::{BufferRole, ParameterCombination, ShapeSpec};

// ── Sentinel ───────────────────────────────────────────────────────

/// Quiet NaN written to every poisoned element.
pub const SENTINEL: f32 = f32::NAN;

/// Overwrite every element with [`SENTINEL`].
pub fn poison(values: &mut [f32]) {
    values.fill(SENTINEL);
}

/// Elements still holding a NaN after the operator ran.
#[must_use]
pub fn count_sentinels(values: &[f32]) -> usize {
    values.iter().filter(|value| value.is_nan()).count()
}

#[must_use]
pub fn first_sentinel(values: &[f32]) -> Option<usize> {
    values.iter().position(|value| value.is_nan())
}

// ── Fill policy ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FillPolicy {
    /// Uniform in `[0, 1)` from the case generator.
    Randomized,
    /// Every element is [`SENTINEL`].
    Poisoned,
    /// Uniform in `[0, 1)`; the pre-existing value a `beta != 0` blend reads.
    Prior,
}

/// Fill policy for each buffer role of one case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixturePlan {
    output: FillPolicy,
    grad_output: FillPolicy,
}

impl FixturePlan {
    #[must_use]
    pub fn for_case(case: &ParameterCombination, backward: bool) -> Self {
        let output = if case.scales.reads_prior() {
            FillPolicy::Prior
        } else {
            FillPolicy::Poisoned
        };
        // dy is an input of the backward pass; it is only defined when that
        // pass runs.
        let grad_output = if backward {
            FillPolicy::Randomized
        } else {
            FillPolicy::Poisoned
        };
        Self {
            output,
            grad_output,
        }
    }

    /// Initial contents of `role`. A reference buffer is a copy of the
    /// buffer it mirrors, so it reports that buffer's policy.
    #[must_use]
    pub fn policy(&self, role: BufferRole) -> FillPolicy {
        match role {
            BufferRole::Input => FillPolicy::Randomized,
            BufferRole::Output
            | BufferRole::GradInput
            | BufferRole::ReferenceOutput
            | BufferRole::ReferenceGradInput => self.output,
            BufferRole::GradOutput => self.grad_output,
        }
    }
}

// ── Tensors ────────────────────────────────────────────────────────

/// One host buffer of a fixture. `values.len()` always equals the
/// element count of `shape`.
#[derive(Debug, Clone, PartialEq)]
pub struct HostTensor {
    role: BufferRole,
    shape: ShapeSpec,
    fill: FillPolicy,
    mirror_of: Option<BufferRole>,
    values: Vec<f32>,
}

impl HostTensor {
    #[must_use]
    pub fn role(&self) -> BufferRole {
        self.role
    }

    #[must_use]
    pub fn shape(&self) -> ShapeSpec {
        self.shape
    }

    #[must_use]
    pub fn fill(&self) -> FillPolicy {
        self.fill
    }

    /// The buffer this one was copied from, for reference buffers.
    #[must_use]
    pub fn mirror_of(&self) -> Option<BufferRole> {
        self.mirror_of
    }

    #[must_use]
    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut [f32] {
        &mut self.values
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Host buffers of one case, exclusively owned by it.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorFixture {
    pub input: HostTensor,
    pub output: HostTensor,
    pub reference_output: HostTensor,
    pub grad_input: HostTensor,
    pub grad_output: HostTensor,
    pub reference_grad_input: HostTensor,
    seed: u64,
}

impl TensorFixture {
    #[must_use]
    pub fn tensor(&self, role: BufferRole) -> &HostTensor {
        match role {
            BufferRole::Input => &self.input,
            BufferRole::Output => &self.output,
            BufferRole::ReferenceOutput => &self.reference_output,
            BufferRole::GradInput => &self.grad_input,
            BufferRole::GradOutput => &self.grad_output,
            BufferRole::ReferenceGradInput => &self.reference_grad_input,
        }
    }

    /// Seed of the generator that filled this fixture.
    #[must_use]
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Total host elements across all buffers.
    #[must_use]
    pub fn element_count(&self) -> usize {
        BufferRole::ALL
            .iter()
            .map(|role| self.tensor(*role).len())
            .sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FixtureError {
    /// The host allocator refused the buffer.
    AllocationFailed {
        role: BufferRole,
        elements: usize,
        detail: String,
    },
    /// The buffer is larger than the configured element ceiling.
    ElementCeiling {
        role: BufferRole,
        elements: usize,
        ceiling: usize,
    },
}

impl FixtureError {
    #[must_use]
    pub fn role(&self) -> BufferRole {
        match self {
            Self::AllocationFailed { role, .. } | Self::ElementCeiling { role, .. } => *role,
        }
    }
}

impl std::fmt::Display for FixtureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AllocationFailed {
                role,
                elements,
                detail,
            } => write!(
                f,
                "allocating {elements} elements for `{role}` failed: {detail}"
            ),
            Self::ElementCeiling {
                role,
                elements,
                ceiling,
            } => write!(
                f,
                "`{role}` needs {elements} elements, above the ceiling of {ceiling}"
            ),
        }
    }
}

impl std::error::Error for FixtureError {}

// ── Builder ────────────────────────────────────────────────────────

/// Derive the generator seed of one case from the suite seed.
///
/// Depends only on `(suite_seed, case_index)`, never on execution order.
#[must_use]
pub fn case_seed(suite_seed: u64, case_index: usize) -> u64 {
    let mut z = suite_seed ^ (case_index as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixtureBuilder {
    suite_seed: u64,
    max_elements: Option<usize>,
}

impl FixtureBuilder {
    #[must_use]
    pub fn new(suite_seed: u64) -> Self {
        Self {
            suite_seed,
            max_elements: None,
        }
    }

    #[must_use]
    pub fn with_element_ceiling(mut self, max_elements: Option<usize>) -> Self {
        self.max_elements = max_elements;
        self
    }

    #[must_use]
    pub fn suite_seed(&self) -> u64 {
        self.suite_seed
    }

    /// Build all six buffers for `case`.
    ///
    /// Buffers are filled in [`BufferRole::ALL`] order from a single
    /// generator, so the fill of every role is a pure function of the suite
    /// seed, the case index and the plan.
    pub fn build(
        &self,
        case: &ParameterCombination,
        plan: &FixturePlan,
    ) -> Result<TensorFixture, FixtureError> {
        let seed = case_seed(self.suite_seed, case.index);
        let mut rng = ChaCha8Rng::seed_from_u64(seed);

        let input = self.tensor(BufferRole::Input, case.input_shape, plan, &mut rng)?;
        let output = self.tensor(BufferRole::Output, case.output_shape, plan, &mut rng)?;
        let reference_output = self.mirror(BufferRole::ReferenceOutput, &output)?;
        let grad_input = self.tensor(BufferRole::GradInput, case.input_shape, plan, &mut rng)?;
        let grad_output = self.tensor(BufferRole::GradOutput, case.output_shape, plan, &mut rng)?;
        let reference_grad_input = self.mirror(BufferRole::ReferenceGradInput, &grad_input)?;

        Ok(TensorFixture {
            input,
            output,
            reference_output,
            grad_input,
            grad_output,
            reference_grad_input,
            seed,
        })
    }

    fn allocate(&self, role: BufferRole, elements: usize) -> Result<Vec<f32>, FixtureError> {
        if let Some(ceiling) = self.max_elements
            && elements > ceiling
        {
            return Err(FixtureError::ElementCeiling {
                role,
                elements,
                ceiling,
            });
        }
        let mut values = Vec::new();
        values
            .try_reserve_exact(elements)
            .map_err(|err| FixtureError::AllocationFailed {
                role,
                elements,
                detail: err.to_string(),
            })?;
        Ok(values)
    }

    fn tensor(
        &self,
        role: BufferRole,
        shape: ShapeSpec,
        plan: &FixturePlan,
        rng: &mut ChaCha8Rng,
    ) -> Result<HostTensor, FixtureError> {
        let elements = shape.element_count();
        let mut values = self.allocate(role, elements)?;
        let fill = plan.policy(role);
        match fill {
            FillPolicy::Randomized | FillPolicy::Prior => {
                values.extend((0..elements).map(|_| rng.random::<f32>()));
            }
            FillPolicy::Poisoned => {
                values.resize(elements, 0.0);
                poison(&mut values);
            }
        }
        Ok(HostTensor {
            role,
            shape,
            fill,
            mirror_of: None,
            values,
        })
    }

    fn mirror(&self, role: BufferRole, source: &HostTensor) -> Result<HostTensor, FixtureError> {
        let mut values = self.allocate(role, source.len())?;
        values.extend_from_slice(source.values());
        Ok(HostTensor {
            role,
            shape: source.shape(),
            fill: source.fill(),
            mirror_of: Some(source.role()),
            values,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smx_core::{AlgorithmVariant, ReductionMode, ScalePair};

    fn case(index: usize, scales: ScalePair) -> ParameterCombination {
        let shape = ShapeSpec::new(1, 2, 3, 4).expect("valid");
        ParameterCombination {
            index,
            input_shape: shape,
            output_shape: shape,
            algorithm: AlgorithmVariant::Accurate,
            mode: ReductionMode::Channel,
            scales,
        }
    }

    fn blend() -> ScalePair {
        ScalePair::new(0.5, 0.5).expect("finite")
    }

    #[test]
    fn poison_sets_every_element_to_sentinel() {
        let mut values = vec![1.0_f32; 7];
        poison(&mut values);
        assert_eq!(count_sentinels(&values), 7);
        assert_eq!(first_sentinel(&values), Some(0));
        assert_eq!(first_sentinel(&[1.0, 2.0]), None);
    }

    #[test]
    fn plan_poisons_outputs_without_blend() {
        let plan = FixturePlan::for_case(&case(0, ScalePair::identity()), true);
        assert_eq!(plan.policy(BufferRole::Input), FillPolicy::Randomized);
        assert_eq!(plan.policy(BufferRole::Output), FillPolicy::Poisoned);
        assert_eq!(plan.policy(BufferRole::GradInput), FillPolicy::Poisoned);
        assert_eq!(plan.policy(BufferRole::GradOutput), FillPolicy::Randomized);
        assert_eq!(plan.policy(BufferRole::ReferenceOutput), FillPolicy::Poisoned);
    }

    #[test]
    fn plan_gives_outputs_a_prior_when_blending() {
        let plan = FixturePlan::for_case(&case(0, blend()), true);
        assert_eq!(plan.policy(BufferRole::Output), FillPolicy::Prior);
        assert_eq!(plan.policy(BufferRole::GradInput), FillPolicy::Prior);
    }

    #[test]
    fn plan_poisons_grad_output_when_backward_is_off() {
        let plan = FixturePlan::for_case(&case(0, ScalePair::identity()), false);
        assert_eq!(plan.policy(BufferRole::GradOutput), FillPolicy::Poisoned);
    }

    #[test]
    fn fixture_buffers_have_exact_element_counts() {
        let case = case(3, ScalePair::identity());
        let plan = FixturePlan::for_case(&case, true);
        let fixture = FixtureBuilder::new(1).build(&case, &plan).expect("fixture");
        for role in BufferRole::ALL {
            assert_eq!(fixture.tensor(*role).len(), 24, "{role}");
        }
        assert_eq!(fixture.element_count(), 6 * 24);
    }

    #[test]
    fn randomized_fill_is_in_unit_interval_and_outputs_are_poisoned() {
        let case = case(0, ScalePair::identity());
        let plan = FixturePlan::for_case(&case, true);
        let fixture = FixtureBuilder::new(9).build(&case, &plan).expect("fixture");
        assert!(fixture.input.values().iter().all(|v| (0.0..1.0).contains(v)));
        assert_eq!(count_sentinels(fixture.output.values()), 24);
        assert_eq!(count_sentinels(fixture.reference_output.values()), 24);
        assert_eq!(count_sentinels(fixture.grad_input.values()), 24);
        assert_eq!(count_sentinels(fixture.grad_output.values()), 0);
    }

    #[test]
    fn reference_buffers_mirror_the_prior() {
        let case = case(0, blend());
        let plan = FixturePlan::for_case(&case, true);
        let fixture = FixtureBuilder::new(9).build(&case, &plan).expect("fixture");
        assert_eq!(count_sentinels(fixture.output.values()), 0);
        assert_eq!(fixture.output.values(), fixture.reference_output.values());
        assert_eq!(fixture.grad_input.values(), fixture.reference_grad_input.values());
    }

    #[test]
    fn only_reference_buffers_are_mirrors() {
        let case = case(0, blend());
        let plan = FixturePlan::for_case(&case, true);
        let fixture = FixtureBuilder::new(9).build(&case, &plan).expect("fixture");
        for role in BufferRole::ALL {
            let tensor = fixture.tensor(*role);
            assert_eq!(tensor.mirror_of(), role.mirrored(), "{role}");
            assert_eq!(tensor.fill(), plan.policy(*role), "{role}");
        }
        assert_eq!(fixture.reference_output.fill(), FillPolicy::Prior);
    }

    #[test]
    fn same_seed_and_index_reproduce_bitwise() {
        let case = case(5, ScalePair::identity());
        let plan = FixturePlan::for_case(&case, true);
        let a = FixtureBuilder::new(42).build(&case, &plan).expect("fixture");
        let b = FixtureBuilder::new(42).build(&case, &plan).expect("fixture");
        let bits = |t: &HostTensor| t.values().iter().map(|v| v.to_bits()).collect::<Vec<_>>();
        assert_eq!(bits(&a.input), bits(&b.input));
        assert_eq!(bits(&a.grad_output), bits(&b.grad_output));
        assert_eq!(a.seed(), b.seed());
    }

    #[test]
    fn different_case_indices_draw_different_data() {
        let plan = FixturePlan::for_case(&case(0, ScalePair::identity()), true);
        let builder = FixtureBuilder::new(42);
        let a = builder.build(&case(0, ScalePair::identity()), &plan).expect("fixture");
        let b = builder.build(&case(1, ScalePair::identity()), &plan).expect("fixture");
        assert_ne!(a.input.values(), b.input.values());
    }

    #[test]
    fn element_ceiling_fails_setup_with_role() {
        let case = case(0, ScalePair::identity());
        let plan = FixturePlan::for_case(&case, true);
        let err = FixtureBuilder::new(1)
            .with_element_ceiling(Some(23))
            .build(&case, &plan)
            .expect_err("ceiling");
        assert_eq!(err, FixtureError::ElementCeiling {
            role: BufferRole::Input,
            elements: 24,
            ceiling: 23
        });
        assert_eq!(err.role(), BufferRole::Input);
    }

    #[test]
    fn case_seed_mixes_index() {
        assert_ne!(case_seed(0, 0), case_seed(0, 1));
        assert_ne!(case_seed(1, 0), case_seed(2, 0));
        assert_eq!(case_seed(7, 3), case_seed(7, 3));
    }
}
