#![forbid(unsafe_code)]

//! Host reference computation for softmax-family operators.
//!
//! All reductions accumulate in `f64` and round once on store. Results are
//! blended into the destination as `alpha * value + beta * prior`; when
//! `beta == 0` the prior is not read, so a NaN-poisoned destination is fine.

use smx_core::{AlgorithmVariant, ReductionMode, ScalePair, ShapeSpec};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReferenceError {
    /// A slice does not hold `shape.element_count()` elements.
    LengthMismatch {
        operand: &'static str,
        expected: usize,
        actual: usize,
    },
}

impl std::fmt::Display for ReferenceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LengthMismatch {
                operand,
                expected,
                actual,
            } => write!(
                f,
                "reference operand `{operand}` has {actual} elements, expected {expected}"
            ),
        }
    }
}

impl std::error::Error for ReferenceError {}

/// How an NCHW tensor splits into normalization groups.
///
/// Group `g` covers offsets `base(g) + k * inner` for `k in 0..len`, with
/// `base(g) = (g / inner) * len * inner + g % inner`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReductionLayout {
    pub outer: usize,
    pub len: usize,
    pub inner: usize,
}

impl ReductionLayout {
    #[must_use]
    pub fn new(shape: ShapeSpec, mode: ReductionMode) -> Self {
        match mode {
            ReductionMode::Instance => Self {
                outer: shape.n(),
                len: shape.c() * shape.h() * shape.w(),
                inner: 1,
            },
            ReductionMode::Channel => Self {
                outer: shape.n(),
                len: shape.c(),
                inner: shape.h() * shape.w(),
            },
        }
    }

    #[must_use]
    pub fn groups(&self) -> usize {
        self.outer * self.inner
    }

    pub fn offsets(&self, group: usize) -> impl Iterator<Item = usize> + use<> {
        let base = (group / self.inner) * self.len * self.inner + group % self.inner;
        let inner = self.inner;
        (0..self.len).map(move |k| base + k * inner)
    }
}

fn check_len(operand: &'static str, shape: ShapeSpec, values: usize) -> Result<(), ReferenceError> {
    let expected = shape.element_count();
    if values != expected {
        return Err(ReferenceError::LengthMismatch {
            operand,
            expected,
            actual: values,
        });
    }
    Ok(())
}

fn blend(scales: ScalePair, value: f64, prior: f32) -> f32 {
    let scaled = f64::from(scales.alpha()) * value;
    if scales.reads_prior() {
        (scaled + f64::from(scales.beta()) * f64::from(prior)) as f32
    } else {
        scaled as f32
    }
}

/// `output = alpha * softmax(input) + beta * output`.
pub fn softmax_forward(
    input: &[f32],
    shape: ShapeSpec,
    algorithm: AlgorithmVariant,
    mode: ReductionMode,
    scales: ScalePair,
    output: &mut [f32],
) -> Result<(), ReferenceError> {
    check_len("input", shape, input.len())?;
    check_len("output", shape, output.len())?;

    let layout = ReductionLayout::new(shape, mode);
    let mut group_values = Vec::with_capacity(layout.len);
    for group in 0..layout.groups() {
        group_values.clear();
        group_values.extend(layout.offsets(group).map(|i| f64::from(input[i])));

        let max = match algorithm {
            AlgorithmVariant::Fast => 0.0,
            AlgorithmVariant::Accurate | AlgorithmVariant::Log => group_values
                .iter()
                .copied()
                .fold(f64::NEG_INFINITY, f64::max),
        };
        let sum: f64 = group_values.iter().map(|x| (x - max).exp()).sum();
        let log_sum = sum.ln();

        for (offset, x) in layout.offsets(group).zip(&group_values) {
            let value = match algorithm {
                AlgorithmVariant::Fast | AlgorithmVariant::Accurate => (x - max).exp() / sum,
                AlgorithmVariant::Log => x - max - log_sum,
            };
            output[offset] = blend(scales, value, output[offset]);
        }
    }
    Ok(())
}

/// `grad_input = alpha * d(softmax) + beta * grad_input`, given the forward
/// output `output` and the upstream gradient `grad_output`.
pub fn softmax_backward(
    output: &[f32],
    grad_output: &[f32],
    shape: ShapeSpec,
    algorithm: AlgorithmVariant,
    mode: ReductionMode,
    scales: ScalePair,
    grad_input: &mut [f32],
) -> Result<(), ReferenceError> {
    check_len("output", shape, output.len())?;
    check_len("grad_output", shape, grad_output.len())?;
    check_len("grad_input", shape, grad_input.len())?;

    let layout = ReductionLayout::new(shape, mode);
    for group in 0..layout.groups() {
        let dot: f64 = match algorithm {
            AlgorithmVariant::Fast | AlgorithmVariant::Accurate => layout
                .offsets(group)
                .map(|i| f64::from(grad_output[i]) * f64::from(output[i]))
                .sum(),
            AlgorithmVariant::Log => layout
                .offsets(group)
                .map(|i| f64::from(grad_output[i]))
                .sum(),
        };

        for offset in layout.offsets(group) {
            let y = f64::from(output[offset]);
            let dy = f64::from(grad_output[offset]);
            let value = match algorithm {
                AlgorithmVariant::Fast | AlgorithmVariant::Accurate => y * (dy - dot),
                AlgorithmVariant::Log => dy - y.exp() * dot,
            };
            grad_input[offset] = blend(scales, value, grad_input[offset]);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn shape(n: usize, c: usize, h: usize, w: usize) -> ShapeSpec {
        ShapeSpec::new(n, c, h, w).expect("valid shape")
    }

    fn ramp(count: usize) -> Vec<f32> {
        (0..count).map(|i| (i % 7) as f32 * 0.125).collect()
    }

    fn group_sums(values: &[f32], shape: ShapeSpec, mode: ReductionMode) -> Vec<f64> {
        let layout = ReductionLayout::new(shape, mode);
        (0..layout.groups())
            .map(|g| layout.offsets(g).map(|i| f64::from(values[i])).sum())
            .collect()
    }

    #[test]
    fn layout_channel_strides_over_spatial_positions() {
        let layout = ReductionLayout::new(shape(2, 3, 1, 2), ReductionMode::Channel);
        assert_eq!(layout.groups(), 4);
        assert_eq!(layout.offsets(0).collect::<Vec<_>>(), vec![0, 2, 4]);
        assert_eq!(layout.offsets(1).collect::<Vec<_>>(), vec![1, 3, 5]);
        assert_eq!(layout.offsets(2).collect::<Vec<_>>(), vec![6, 8, 10]);
    }

    #[test]
    fn layout_instance_is_contiguous() {
        let layout = ReductionLayout::new(shape(2, 3, 1, 2), ReductionMode::Instance);
        assert_eq!(layout.groups(), 2);
        assert_eq!(layout.offsets(1).collect::<Vec<_>>(), vec![6, 7, 8, 9, 10, 11]);
    }

    #[test]
    fn accurate_groups_sum_to_one() {
        let nchw = shape(1, 2, 3, 4);
        for &mode in ReductionMode::ALL {
            let mut out = vec![f32::NAN; 24];
            softmax_forward(
                &ramp(24),
                nchw,
                AlgorithmVariant::Accurate,
                mode,
                ScalePair::identity(),
                &mut out,
            )
            .expect("forward");
            assert!(out.iter().all(|v| v.is_finite()), "beta=0 must not read NaN prior");
            for sum in group_sums(&out, nchw, mode) {
                assert!((sum - 1.0).abs() < 1e-6, "{mode}: group sum {sum}");
            }
        }
    }

    #[test]
    fn fast_matches_accurate_on_small_inputs() {
        let nchw = shape(2, 3, 2, 2);
        let input = ramp(nchw.element_count());
        let mut fast = vec![0.0; input.len()];
        let mut accurate = vec![0.0; input.len()];
        let scales = ScalePair::identity();
        softmax_forward(
            &input,
            nchw,
            AlgorithmVariant::Fast,
            ReductionMode::Channel,
            scales,
            &mut fast,
        )
        .expect("fast");
        softmax_forward(
            &input,
            nchw,
            AlgorithmVariant::Accurate,
            ReductionMode::Channel,
            scales,
            &mut accurate,
        )
        .expect("accurate");
        for (a, b) in fast.iter().zip(&accurate) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn log_is_log_of_accurate() {
        let nchw = shape(1, 4, 1, 1);
        let input = [0.1_f32, 0.9, 0.4, 0.3];
        let mut log = [0.0_f32; 4];
        let mut accurate = [0.0_f32; 4];
        let scales = ScalePair::identity();
        softmax_forward(
            &input,
            nchw,
            AlgorithmVariant::Log,
            ReductionMode::Instance,
            scales,
            &mut log,
        )
        .expect("log");
        softmax_forward(
            &input,
            nchw,
            AlgorithmVariant::Accurate,
            ReductionMode::Instance,
            scales,
            &mut accurate,
        )
        .expect("accurate");
        for (l, a) in log.iter().zip(&accurate) {
            assert!((l.exp() - a).abs() < 1e-6);
        }
    }

    #[test]
    fn beta_blends_prior_output() {
        let nchw = shape(1, 2, 1, 1);
        let mut out = [0.4_f32, 0.8];
        softmax_forward(
            &[0.0, 0.0],
            nchw,
            AlgorithmVariant::Accurate,
            ReductionMode::Channel,
            ScalePair::new(0.5, 0.5).expect("finite"),
            &mut out,
        )
        .expect("forward");
        // 0.5 * 0.5 + 0.5 * prior
        assert!((out[0] - 0.45).abs() < 1e-6);
        assert!((out[1] - 0.65).abs() < 1e-6);
    }

    #[test]
    fn backward_of_uniform_gradient_is_zero() {
        let nchw = shape(1, 3, 2, 1);
        let input = ramp(nchw.element_count());
        let mut y = vec![0.0; input.len()];
        let scales = ScalePair::identity();
        softmax_forward(
            &input,
            nchw,
            AlgorithmVariant::Accurate,
            ReductionMode::Channel,
            scales,
            &mut y,
        )
        .expect("forward");
        let dy = vec![1.0; input.len()];
        let mut dx = vec![f32::NAN; input.len()];
        softmax_backward(
            &y,
            &dy,
            nchw,
            AlgorithmVariant::Accurate,
            ReductionMode::Channel,
            scales,
            &mut dx,
        )
        .expect("backward");
        assert!(dx.iter().all(|v| v.abs() < 1e-6), "{dx:?}");
    }

    #[test]
    fn log_backward_uses_exp_of_output() {
        let nchw = shape(1, 2, 1, 1);
        let y = [(0.25_f32).ln(), (0.75_f32).ln()];
        let dy = [1.0_f32, 0.0];
        let mut dx = [0.0_f32; 2];
        softmax_backward(
            &y,
            &dy,
            nchw,
            AlgorithmVariant::Log,
            ReductionMode::Instance,
            ScalePair::identity(),
            &mut dx,
        )
        .expect("backward");
        assert!((dx[0] - 0.75).abs() < 1e-6);
        assert!((dx[1] + 0.75).abs() < 1e-6);
    }

    #[test]
    fn length_mismatch_is_reported() {
        let mut out = [0.0_f32; 3];
        let err = softmax_forward(
            &[0.0; 24],
            shape(1, 2, 3, 4),
            AlgorithmVariant::Fast,
            ReductionMode::Instance,
            ScalePair::identity(),
            &mut out,
        )
        .expect_err("short output");
        assert_eq!(err, ReferenceError::LengthMismatch {
            operand: "output",
            expected: 24,
            actual: 3,
        });
    }

    proptest! {
        #[test]
        fn accurate_output_is_a_distribution(
            values in proptest::collection::vec(-50.0f32..50.0, 12),
            channel in any::<bool>(),
        ) {
            let nchw = shape(1, 3, 2, 2);
            let mode = if channel { ReductionMode::Channel } else { ReductionMode::Instance };
            let mut out = vec![0.0; 12];
            let scales = ScalePair::identity();
            softmax_forward(&values, nchw, AlgorithmVariant::Accurate, mode, scales, &mut out)
                .expect("forward");
            prop_assert!(out.iter().all(|v| (0.0..=1.0).contains(v)));
            for sum in group_sums(&out, nchw, mode) {
                prop_assert!((sum - 1.0).abs() < 1e-4);
            }
        }
    }
}
