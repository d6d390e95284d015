//! Test-matrix enumeration.
//!
//! Raw axes (as read from JSON or built in code) are validated into typed
//! candidate sets, then expanded into the Cartesian product in a fixed
//! nesting order: input shape, output shape, algorithm, mode, scales, with
//! scales varying fastest.

use crate::{CaseSelector, HarnessConfig, OutputInit, ShapePolicy};
use serde::{Deserialize, Serialize};
use smx_core::{
    AlgorithmVariant, Axis, ConfigError, ParameterCombination, ReductionMode, ScalePair, ShapeSpec,
};
use std::path::{Path, PathBuf};

/// Candidate values for every axis, in their unvalidated on-disk form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterAxes {
    pub input_shapes: Vec<Vec<usize>>,
    #[serde(default)]
    pub output_shapes: Vec<Vec<usize>>,
    pub algorithms: Vec<AlgorithmVariant>,
    pub modes: Vec<ReductionMode>,
    /// `[alpha, beta]` pairs.
    pub scales: Vec<(f32, f32)>,
}

impl ParameterAxes {
    /// The historical smoke matrix for the softmax operator.
    #[must_use]
    pub fn smoke() -> Self {
        Self {
            input_shapes: vec![
                vec![1, 2, 3, 4],
                vec![4, 2, 3, 4],
                vec![8, 2, 3, 4],
                vec![16, 2, 3, 4],
            ],
            output_shapes: vec![vec![1, 2, 3, 4], vec![4, 3, 2, 4]],
            algorithms: AlgorithmVariant::ALL.to_vec(),
            modes: ReductionMode::ALL.to_vec(),
            scales: vec![(1.0, 0.0), (0.5, 0.5)],
        }
    }

    /// Validate and deduplicate every axis.
    ///
    /// Empty axes are reported first, in nesting order, so the diagnostic
    /// names the axis that collapsed the matrix rather than some later
    /// malformed value.
    pub fn validate(&self, policy: ShapePolicy) -> Result<CandidateAxes, ConfigError> {
        let checks = [
            (Axis::InputShapes, self.input_shapes.is_empty()),
            (
                Axis::OutputShapes,
                policy == ShapePolicy::Independent && self.output_shapes.is_empty(),
            ),
            (Axis::Algorithms, self.algorithms.is_empty()),
            (Axis::Modes, self.modes.is_empty()),
            (Axis::Scales, self.scales.is_empty()),
        ];
        if let Some((axis, _)) = checks.iter().find(|(_, empty)| *empty) {
            return Err(ConfigError::EmptyAxis { axis: *axis });
        }

        let input_shapes = parse_shapes(&self.input_shapes)?;
        // Parsed under either policy: a bad entry is an error even when the
        // axis does not take part in the matrix.
        let output_shapes = parse_shapes(&self.output_shapes)?;
        let mut scales: Vec<ScalePair> = Vec::with_capacity(self.scales.len());
        for &(alpha, beta) in &self.scales {
            let pair = ScalePair::new(alpha, beta)?;
            if !scales.iter().any(|seen| seen.bits() == pair.bits()) {
                scales.push(pair);
            }
        }

        Ok(CandidateAxes {
            input_shapes,
            output_shapes,
            algorithms: dedup(&self.algorithms),
            modes: dedup(&self.modes),
            scales,
            policy,
        })
    }
}

impl Default for ParameterAxes {
    fn default() -> Self {
        Self::smoke()
    }
}

fn parse_shapes(raw: &[Vec<usize>]) -> Result<Vec<ShapeSpec>, ConfigError> {
    let mut shapes = Vec::with_capacity(raw.len());
    for dims in raw {
        let shape = ShapeSpec::from_dims(dims)?;
        if !shapes.contains(&shape) {
            shapes.push(shape);
        }
    }
    Ok(shapes)
}

fn dedup<T: Copy + PartialEq>(values: &[T]) -> Vec<T> {
    let mut out = Vec::with_capacity(values.len());
    for value in values {
        if !out.contains(value) {
            out.push(*value);
        }
    }
    out
}

#[derive(Debug)]
pub enum AxesFileError {
    Io { path: PathBuf, source: std::io::Error },
    Parse { path: PathBuf, source: serde_json::Error },
}

impl std::fmt::Display for AxesFileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, source } => write!(f, "io error at {}: {source}", path.display()),
            Self::Parse { path, source } => {
                write!(f, "invalid axes file {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for AxesFileError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Parse { source, .. } => Some(source),
        }
    }
}

pub fn read_axes(path: &Path) -> Result<ParameterAxes, AxesFileError> {
    let raw = std::fs::read_to_string(path).map_err(|source| AxesFileError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| AxesFileError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Validated, deduplicated candidate sets. Each axis is non-empty except
/// `output_shapes` under [`ShapePolicy::Tied`], where it is validated but
/// unused.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateAxes {
    input_shapes: Vec<ShapeSpec>,
    output_shapes: Vec<ShapeSpec>,
    algorithms: Vec<AlgorithmVariant>,
    modes: Vec<ReductionMode>,
    scales: Vec<ScalePair>,
    policy: ShapePolicy,
}

impl CandidateAxes {
    #[must_use]
    pub fn input_shapes(&self) -> &[ShapeSpec] {
        &self.input_shapes
    }

    #[must_use]
    pub fn output_shapes(&self) -> &[ShapeSpec] {
        &self.output_shapes
    }

    #[must_use]
    pub fn algorithms(&self) -> &[AlgorithmVariant] {
        &self.algorithms
    }

    #[must_use]
    pub fn modes(&self) -> &[ReductionMode] {
        &self.modes
    }

    #[must_use]
    pub fn scales(&self) -> &[ScalePair] {
        &self.scales
    }

    #[must_use]
    pub fn policy(&self) -> ShapePolicy {
        self.policy
    }

    /// Product of the axis sizes that take part in the matrix.
    #[must_use]
    pub fn combination_count(&self) -> usize {
        let outputs = match self.policy {
            ShapePolicy::Tied => 1,
            ShapePolicy::Independent => self.output_shapes.len(),
        };
        self.input_shapes.len()
            * outputs
            * self.algorithms.len()
            * self.modes.len()
            * self.scales.len()
    }

    fn output_candidates(&self, input: ShapeSpec) -> Vec<ShapeSpec> {
        match self.policy {
            ShapePolicy::Tied => vec![input],
            ShapePolicy::Independent => self.output_shapes.clone(),
        }
    }

    /// Full Cartesian product, indexed in enumeration order.
    #[must_use]
    pub fn combinations(&self) -> Vec<ParameterCombination> {
        let mut cases = Vec::with_capacity(self.combination_count());
        for &input_shape in &self.input_shapes {
            for output_shape in self.output_candidates(input_shape) {
                for &algorithm in &self.algorithms {
                    for &mode in &self.modes {
                        for &scales in &self.scales {
                            cases.push(ParameterCombination {
                                index: cases.len(),
                                input_shape,
                                output_shape,
                                algorithm,
                                mode,
                                scales,
                            });
                        }
                    }
                }
            }
        }
        cases
    }
}

/// The selected cases of one suite run.
#[derive(Debug, Clone, PartialEq)]
pub struct TestMatrix {
    axes: CandidateAxes,
    cases: Vec<ParameterCombination>,
    total_combinations: usize,
}

impl TestMatrix {
    /// Validate `axes` against `config` and enumerate the selected cases.
    ///
    /// Filtering keeps each case's unfiltered index, so `--filter` never
    /// renumbers a case.
    pub fn build(axes: &ParameterAxes, config: &HarnessConfig) -> Result<Self, ConfigError> {
        let axes = axes.validate(config.shape_policy)?;

        if config.output_init == OutputInit::Poison
            && let Some(pair) = axes.scales().iter().find(|pair| pair.reads_prior())
        {
            return Err(ConfigError::PoisonedBlend {
                alpha: pair.alpha(),
                beta: pair.beta(),
            });
        }

        let all = axes.combinations();
        let total_combinations = all.len();
        let cases = match config.case_filter.as_deref() {
            Some(filter) => {
                let selected: Vec<_> = all
                    .into_iter()
                    .filter(|case| case.name().contains(filter))
                    .collect();
                if selected.is_empty() {
                    return Err(ConfigError::NoCasesSelected {
                        filter: filter.to_owned(),
                    });
                }
                selected
            }
            None => all,
        };

        let matrix = Self {
            axes,
            cases,
            total_combinations,
        };
        match &config.case {
            Some(selector) => matrix.select(selector),
            None => Ok(matrix),
        }
    }

    /// Narrow the matrix to the single case `selector` names.
    pub fn select(mut self, selector: &CaseSelector) -> Result<Self, ConfigError> {
        let case = match selector {
            CaseSelector::Index(index) => self.by_index(*index),
            CaseSelector::Name(name) => self.by_name(name),
        }
        .copied()
        .ok_or_else(|| ConfigError::UnknownCase {
            case: selector.to_string(),
        })?;
        self.cases = vec![case];
        Ok(self)
    }

    #[must_use]
    pub fn axes(&self) -> &CandidateAxes {
        &self.axes
    }

    #[must_use]
    pub fn cases(&self) -> &[ParameterCombination] {
        &self.cases
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.cases.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }

    /// Size of the matrix before the case filter was applied.
    #[must_use]
    pub fn total_combinations(&self) -> usize {
        self.total_combinations
    }

    #[must_use]
    pub fn by_index(&self, index: usize) -> Option<&ParameterCombination> {
        self.cases.iter().find(|case| case.index == index)
    }

    #[must_use]
    pub fn by_name(&self, name: &str) -> Option<&ParameterCombination> {
        self.cases.iter().find(|case| case.name() == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> HarnessConfig {
        HarnessConfig::default()
    }

    #[test]
    fn smoke_matrix_tied_has_48_cases() {
        let matrix = TestMatrix::build(&ParameterAxes::smoke(), &config()).expect("valid axes");
        assert_eq!(matrix.len(), 4 * 3 * 2 * 2);
        assert_eq!(matrix.total_combinations(), matrix.len());
        assert!(matrix.cases().iter().all(ParameterCombination::shapes_tied));
    }

    #[test]
    fn smoke_matrix_independent_crosses_output_shapes() {
        let config = HarnessConfig {
            shape_policy: ShapePolicy::Independent,
            ..config()
        };
        let matrix = TestMatrix::build(&ParameterAxes::smoke(), &config).expect("valid axes");
        assert_eq!(matrix.len(), 4 * 2 * 3 * 2 * 2);
        assert!(matrix.cases().iter().any(|case| !case.shapes_tied()));
    }

    #[test]
    fn scales_vary_fastest_and_indices_are_positions() {
        let matrix = TestMatrix::build(&ParameterAxes::smoke(), &config()).expect("valid axes");
        let cases = matrix.cases();
        assert_eq!(cases[0].scales, ScalePair::identity());
        assert_eq!(cases[1].scales.beta(), 0.5);
        assert_eq!(cases[0].mode, cases[1].mode);
        assert_eq!(cases[2].mode, ReductionMode::Channel);
        for (position, case) in cases.iter().enumerate() {
            assert_eq!(case.index, position);
        }
    }

    #[test]
    fn enumeration_is_stable_across_builds() {
        let a = TestMatrix::build(&ParameterAxes::smoke(), &config()).expect("valid axes");
        let b = TestMatrix::build(&ParameterAxes::smoke(), &config()).expect("valid axes");
        let names_a: Vec<_> = a.cases().iter().map(ParameterCombination::name).collect();
        let names_b: Vec<_> = b.cases().iter().map(ParameterCombination::name).collect();
        assert_eq!(names_a, names_b);
    }

    #[test]
    fn duplicate_candidates_collapse_in_first_seen_order() {
        let mut axes = ParameterAxes::smoke();
        axes.input_shapes = vec![vec![4, 2, 3, 4], vec![1, 2, 3, 4], vec![4, 2, 3, 4]];
        axes.algorithms = vec![AlgorithmVariant::Log, AlgorithmVariant::Log];
        axes.scales = vec![(1.0, 0.0), (1.0, 0.0)];
        let candidates = axes.validate(ShapePolicy::Tied).expect("valid axes");
        assert_eq!(candidates.input_shapes().len(), 2);
        assert_eq!(candidates.input_shapes()[0].n(), 4);
        assert_eq!(candidates.algorithms(), &[AlgorithmVariant::Log]);
        assert_eq!(candidates.scales().len(), 1);
        assert_eq!(candidates.combination_count(), 2 * 2);
    }

    #[test]
    fn empty_algorithm_axis_is_a_configuration_error() {
        let mut axes = ParameterAxes::smoke();
        axes.algorithms.clear();
        let err = TestMatrix::build(&axes, &config()).expect_err("empty axis");
        assert_eq!(err, ConfigError::EmptyAxis {
            axis: Axis::Algorithms
        });
    }

    #[test]
    fn empty_output_axis_only_matters_when_independent() {
        let mut axes = ParameterAxes::smoke();
        axes.output_shapes.clear();
        assert!(TestMatrix::build(&axes, &config()).is_ok());

        let independent = HarnessConfig {
            shape_policy: ShapePolicy::Independent,
            ..config()
        };
        let err = TestMatrix::build(&axes, &independent).expect_err("empty output axis");
        assert_eq!(err, ConfigError::EmptyAxis {
            axis: Axis::OutputShapes
        });
    }

    #[test]
    fn malformed_shapes_and_scales_are_rejected() {
        let mut axes = ParameterAxes::smoke();
        axes.input_shapes.push(vec![1, 2, 3]);
        assert!(matches!(
            TestMatrix::build(&axes, &config()),
            Err(ConfigError::WrongRank { .. })
        ));

        let mut axes = ParameterAxes::smoke();
        axes.input_shapes.push(vec![1, 0, 3, 4]);
        assert!(matches!(
            TestMatrix::build(&axes, &config()),
            Err(ConfigError::ZeroDimension { .. })
        ));

        let mut axes = ParameterAxes::smoke();
        axes.output_shapes.push(vec![1, 0, 3, 4]);
        assert!(matches!(
            TestMatrix::build(&axes, &config()),
            Err(ConfigError::ZeroDimension { .. })
        ));

        let mut axes = ParameterAxes::smoke();
        axes.scales.push((f32::INFINITY, 0.0));
        assert!(matches!(
            TestMatrix::build(&axes, &config()),
            Err(ConfigError::NonFiniteScale { .. })
        ));
    }

    #[test]
    fn forced_poison_with_blending_scale_is_rejected() {
        let config = HarnessConfig {
            output_init: OutputInit::Poison,
            ..config()
        };
        let err = TestMatrix::build(&ParameterAxes::smoke(), &config).expect_err("blend");
        assert_eq!(err, ConfigError::PoisonedBlend {
            alpha: 0.5,
            beta: 0.5
        });

        let mut axes = ParameterAxes::smoke();
        axes.scales = vec![(1.0, 0.0)];
        assert!(TestMatrix::build(&axes, &config).is_ok());
    }

    #[test]
    fn filter_keeps_original_indices() {
        let config = HarnessConfig {
            case_filter: Some("n8_c2_h3_w4/log/channel".to_owned()),
            ..config()
        };
        let matrix = TestMatrix::build(&ParameterAxes::smoke(), &config).expect("valid axes");
        assert_eq!(matrix.len(), 2);
        assert_eq!(matrix.total_combinations(), 48);
        let first = matrix.cases()[0];
        assert_eq!(first.index, 2 * 12 + 2 * 4 + 2);
        assert_eq!(matrix.by_index(first.index), Some(&first));
        assert_eq!(matrix.by_name(&first.name()), Some(&first));
    }

    #[test]
    fn filter_matching_nothing_is_a_configuration_error() {
        let config = HarnessConfig {
            case_filter: Some("softmax/n99".to_owned()),
            ..config()
        };
        assert!(matches!(
            TestMatrix::build(&ParameterAxes::smoke(), &config),
            Err(ConfigError::NoCasesSelected { .. })
        ));
    }

    fn single_shape_axes() -> ParameterAxes {
        ParameterAxes {
            input_shapes: vec![vec![1, 2, 3, 4]],
            output_shapes: Vec::new(),
            algorithms: vec![AlgorithmVariant::Accurate],
            modes: vec![ReductionMode::Channel],
            scales: vec![(1.0, 0.0), (1.0, 0.5)],
        }
    }

    #[test]
    fn name_selector_does_not_pick_longer_siblings() {
        let name = "softmax/n1_c2_h3_w4/accurate/channel/a1_b0";
        let by_filter = HarnessConfig {
            case_filter: Some(name.to_owned()),
            ..config()
        };
        let matrix = TestMatrix::build(&single_shape_axes(), &by_filter).expect("valid axes");
        assert_eq!(matrix.len(), 2);

        let by_name = HarnessConfig {
            case: Some(CaseSelector::Name(name.to_owned())),
            ..config()
        };
        let matrix = TestMatrix::build(&single_shape_axes(), &by_name).expect("valid axes");
        let names: Vec<_> = matrix.cases().iter().map(ParameterCombination::name).collect();
        assert_eq!(names, vec![name.to_owned()]);
        assert_eq!(matrix.cases()[0].index, 0);
        assert_eq!(matrix.total_combinations(), 2);
    }

    #[test]
    fn index_selector_keeps_the_enumeration_index() {
        let config = HarnessConfig {
            case: Some(CaseSelector::Index(1)),
            ..config()
        };
        let matrix = TestMatrix::build(&single_shape_axes(), &config).expect("valid axes");
        assert_eq!(matrix.len(), 1);
        assert_eq!(matrix.cases()[0].index, 1);
        assert_eq!(matrix.cases()[0].scales.beta(), 0.5);
    }

    #[test]
    fn selector_applies_after_the_filter() {
        let config = HarnessConfig {
            case_filter: Some("/log/".to_owned()),
            case: Some(CaseSelector::Index(0)),
            ..config()
        };
        let err = TestMatrix::build(&ParameterAxes::smoke(), &config).expect_err("filtered out");
        assert_eq!(err, ConfigError::UnknownCase {
            case: "index 0".to_owned()
        });

        let config = HarnessConfig {
            case: Some(CaseSelector::Name("softmax/n3".to_owned())),
            ..self::config()
        };
        assert!(matches!(
            TestMatrix::build(&ParameterAxes::smoke(), &config),
            Err(ConfigError::UnknownCase { .. })
        ));
    }

    #[test]
    fn axes_json_round_trips() {
        let json = serde_json::to_string(&ParameterAxes::smoke()).expect("serialize");
        assert!(json.contains("\"accurate\""));
        let decoded: ParameterAxes = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(decoded, ParameterAxes::smoke());
    }
}
