//! Numerical comparison of operator output against the host reference.

use serde::{Deserialize, Serialize};
use smx_core::AlgorithmVariant;

/// Absolute and relative tolerance: `|a - e| <= atol + rtol * |e|`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tolerance {
    pub atol: f64,
    pub rtol: f64,
}

impl Tolerance {
    #[must_use]
    pub const fn exact() -> Self {
        Self {
            atol: 0.0,
            rtol: 0.0,
        }
    }

    /// Default tolerance for an algorithm variant.
    ///
    /// `fast` skips max subtraction and loses precision on large inputs, so
    /// it gets a looser band than the max-subtracted variants.
    #[must_use]
    pub const fn for_algorithm(algorithm: AlgorithmVariant) -> Self {
        match algorithm {
            AlgorithmVariant::Fast => Self {
                atol: 1e-4,
                rtol: 1e-4,
            },
            AlgorithmVariant::Accurate | AlgorithmVariant::Log => Self {
                atol: 1e-5,
                rtol: 1e-5,
            },
        }
    }

    /// Whether `actual` is within tolerance of `expected`. NaN on either
    /// side never matches.
    #[must_use]
    pub fn accepts(&self, actual: f32, expected: f32) -> bool {
        if actual.is_nan() || expected.is_nan() {
            return false;
        }
        if actual.is_infinite() || expected.is_infinite() {
            return actual == expected;
        }
        let (actual, expected) = (f64::from(actual), f64::from(expected));
        (actual - expected).abs() <= self.atol + self.rtol * expected.abs()
    }
}

/// Where and how badly a comparison failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MismatchDetail {
    pub first_index: usize,
    pub actual: Option<f32>,
    pub expected: Option<f32>,
    pub mismatched: usize,
    pub total: usize,
    /// Largest finite absolute error over all compared elements.
    pub max_abs_error: f64,
}

impl std::fmt::Display for MismatchDetail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let show = |value: Option<f32>| match value {
            Some(value) => value.to_string(),
            None => "<missing>".to_owned(),
        };
        write!(
            f,
            "{}/{} elements out of tolerance; first at [{}]: \
             actual {} vs expected {} (max abs error {:.3e})",
            self.mismatched,
            self.total,
            self.first_index,
            show(self.actual),
            show(self.expected),
            self.max_abs_error
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Comparison {
    Match { max_abs_error: f64 },
    Mismatch(MismatchDetail),
}

impl Comparison {
    #[must_use]
    pub fn is_match(&self) -> bool {
        matches!(self, Self::Match { .. })
    }
}

/// Comparison seam of the harness. The runner never compares values itself.
pub trait Comparator: Send + Sync {
    fn compare(&self, actual: &[f32], expected: &[f32], tolerance: Tolerance) -> Comparison;
}

/// Element-by-element tolerance check. Length differences count every
/// unpaired element as a mismatch.
#[derive(Debug, Clone, Copy, Default)]
pub struct ElementwiseComparator;

impl Comparator for ElementwiseComparator {
    fn compare(&self, actual: &[f32], expected: &[f32], tolerance: Tolerance) -> Comparison {
        let total = actual.len().max(expected.len());
        let mut mismatched = 0_usize;
        let mut first: Option<usize> = None;
        let mut max_abs_error = 0.0_f64;

        for index in 0..total {
            let a = actual.get(index).copied();
            let e = expected.get(index).copied();
            let ok = match (a, e) {
                (Some(a), Some(e)) => {
                    let err = (f64::from(a) - f64::from(e)).abs();
                    if err.is_finite() {
                        max_abs_error = max_abs_error.max(err);
                    }
                    tolerance.accepts(a, e)
                }
                _ => false,
            };
            if !ok {
                mismatched += 1;
                first.get_or_insert(index);
            }
        }

        match first {
            None => Comparison::Match { max_abs_error },
            Some(first_index) => Comparison::Mismatch(MismatchDetail {
                first_index,
                actual: actual.get(first_index).copied(),
                expected: expected.get(first_index).copied(),
                mismatched,
                total,
                max_abs_error,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compare(actual: &[f32], expected: &[f32]) -> Comparison {
        let tolerance = Tolerance::for_algorithm(AlgorithmVariant::Accurate);
        ElementwiseComparator.compare(actual, expected, tolerance)
    }

    #[test]
    fn tolerances_per_algorithm() {
        assert_eq!(Tolerance::for_algorithm(AlgorithmVariant::Fast).atol, 1e-4);
        assert_eq!(Tolerance::for_algorithm(AlgorithmVariant::Accurate).rtol, 1e-5);
        assert_eq!(
            Tolerance::for_algorithm(AlgorithmVariant::Log),
            Tolerance::for_algorithm(AlgorithmVariant::Accurate)
        );
    }

    #[test]
    fn within_tolerance_matches() {
        let result = compare(&[0.25, 0.75], &[0.250_001, 0.75]);
        assert!(result.is_match());
    }

    #[test]
    fn nan_never_matches_even_against_nan() {
        let tol = Tolerance::exact();
        assert!(!tol.accepts(f32::NAN, f32::NAN));
        assert!(!tol.accepts(f32::NAN, 1.0));
        assert!(!tol.accepts(1.0, f32::NAN));

        let Comparison::Mismatch(detail) = compare(&[0.5, f32::NAN], &[0.5, f32::NAN]) else {
            panic!("NaN must not compare equal");
        };
        assert_eq!(detail.first_index, 1);
        assert_eq!(detail.mismatched, 1);
    }

    #[test]
    fn out_of_tolerance_reports_first_and_count() {
        let Comparison::Mismatch(detail) = compare(&[0.1, 0.2, 0.9, 0.9], &[0.1, 0.3, 0.9, 0.1])
        else {
            panic!("expected mismatch");
        };
        assert_eq!(detail.first_index, 1);
        assert_eq!(detail.mismatched, 2);
        assert_eq!(detail.total, 4);
        assert!((detail.max_abs_error - 0.8).abs() < 1e-6);
        assert!(detail.to_string().contains("2/4"));
    }

    #[test]
    fn length_difference_is_a_mismatch() {
        let Comparison::Mismatch(detail) = compare(&[0.5], &[0.5, 0.5]) else {
            panic!("expected mismatch");
        };
        assert_eq!(detail.first_index, 1);
        assert_eq!(detail.actual, None);
        assert!(detail.to_string().contains("<missing>"));
    }

    #[test]
    fn matching_infinities_are_equal() {
        let tol = Tolerance::exact();
        assert!(tol.accepts(f32::NEG_INFINITY, f32::NEG_INFINITY));
        assert!(!tol.accepts(f32::INFINITY, f32::NEG_INFINITY));
    }
}
