//! Case execution.
//!
//! One case walks `Enumerated → FixtureBuilt → Staged → Invoked → Compared
//! → Reported → TornDown`. Whatever happens along the way, the case ends
//! with exactly one [`CaseReport`] and every device allocation it made is
//! released before the next case on the same device starts.

use crate::compare::{Comparison, MismatchDetail, Tolerance};
use crate::Harness;
use crate::fixture::{
    FixtureBuilder, FixtureError, FixturePlan, TensorFixture, count_sentinels, first_sentinel,
};
use crate::matrix::{ParameterAxes, TestMatrix};
use crate::report::{SuiteReport, render_case_line, render_outcome_line};
use serde::Serialize;
use smx_core::{BufferRole, ParameterCombination};
use smx_reference::{ReferenceError, softmax_backward, softmax_forward};
use smx_runtime::{
    BackwardArgs, DeviceId, DeviceStaging, ForwardArgs, OperatorError, StagingError, shard_device,
};
use smx_test_utils::{PhaseTimings, fixture_id_from_json};
use std::sync::mpsc;
use std::time::Instant;
use tracing::{debug, info, warn};

// ── States and outcomes ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseState {
    Enumerated,
    FixtureBuilt,
    Staged,
    Invoked,
    Compared,
    Reported,
    TornDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Pass {
    Forward,
    Backward,
}

impl Pass {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Forward => "forward",
            Self::Backward => "backward",
        }
    }
}

impl std::fmt::Display for Pass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a case that ran to comparison did not pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ForwardMismatch,
    BackwardMismatch,
}

/// Why a case could not be run to a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Setup,
    Staging,
    Invocation,
    Teardown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "status", content = "kind", rename_all = "snake_case")]
pub enum CaseOutcome {
    Passed,
    Failed(FailureKind),
    Erred(ErrorKind),
}

impl CaseOutcome {
    #[must_use]
    pub fn is_pass(self) -> bool {
        self == Self::Passed
    }

    #[must_use]
    pub fn label(self) -> String {
        match self {
            Self::Passed => "passed".to_owned(),
            Self::Failed(FailureKind::ForwardMismatch) => "failed(forward_mismatch)".to_owned(),
            Self::Failed(FailureKind::BackwardMismatch) => "failed(backward_mismatch)".to_owned(),
            Self::Erred(kind) => format!("erred({})", error_kind_str(kind)),
        }
    }
}

fn error_kind_str(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::Setup => "setup",
        ErrorKind::Staging => "staging",
        ErrorKind::Invocation => "invocation",
        ErrorKind::Teardown => "teardown",
    }
}

// ── Errors ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvocationError {
    Operator(OperatorError),
    /// The operator reported success but left sentinel values behind.
    SentinelSurvived {
        role: BufferRole,
        count: usize,
        first_index: usize,
    },
}

impl std::fmt::Display for InvocationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Operator(err) => write!(f, "operator error: {err}"),
            Self::SentinelSurvived {
                role,
                count,
                first_index,
            } => write!(
                f,
                "{count} sentinel values survived in `{role}` (first at [{first_index}])"
            ),
        }
    }
}

impl std::error::Error for InvocationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Operator(err) => Some(err),
            Self::SentinelSurvived { .. } => None,
        }
    }
}

/// Infrastructure failure of one case. Never a pass, never a mismatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaseError {
    Setup(FixtureError),
    /// Host reference could not be computed for the fixture.
    Reference(ReferenceError),
    Staging {
        pass: Pass,
        source: StagingError,
    },
    Invocation {
        pass: Pass,
        source: InvocationError,
    },
}

impl CaseError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Setup(_) | Self::Reference(_) => ErrorKind::Setup,
            Self::Staging { .. } => ErrorKind::Staging,
            Self::Invocation { .. } => ErrorKind::Invocation,
        }
    }
}

impl std::fmt::Display for CaseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Setup(err) => write!(f, "setup: {err}"),
            Self::Reference(err) => write!(f, "setup: host reference: {err}"),
            Self::Staging { pass, source } => write!(f, "{pass} staging: {source}"),
            Self::Invocation { pass, source } => write!(f, "{pass} invocation: {source}"),
        }
    }
}

impl std::error::Error for CaseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Setup(err) => Some(err),
            Self::Reference(err) => Some(err),
            Self::Staging { source, .. } => Some(source),
            Self::Invocation { source, .. } => Some(source),
        }
    }
}

// ── Reports ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaseReport {
    pub case: ParameterCombination,
    pub name: String,
    pub outcome: CaseOutcome,
    /// Furthest state reached before the outcome was decided.
    pub last_state: CaseState,
    pub detail: Option<String>,
    /// Device context index the case ran on.
    pub device: u32,
    pub seed: u64,
    pub fixture_id: String,
    pub forward_max_abs_error: Option<f64>,
    pub backward_max_abs_error: Option<f64>,
    /// All device allocations of the case were released.
    pub released_cleanly: bool,
    pub timings: PhaseTimings,
}

impl CaseReport {
    /// The parts of a report that must not depend on scheduling.
    #[must_use]
    pub fn verdict(&self) -> (usize, &str, CaseOutcome, CaseState, Option<&str>) {
        (
            self.case.index,
            &self.name,
            self.outcome,
            self.last_state,
            self.detail.as_deref(),
        )
    }
}

// ── Per-case trail ─────────────────────────────────────────────────

struct Trail {
    state: CaseState,
    timings: PhaseTimings,
    forward_max_abs_error: Option<f64>,
    backward_max_abs_error: Option<f64>,
}

impl Trail {
    fn new() -> Self {
        Self {
            state: CaseState::Enumerated,
            timings: PhaseTimings::default(),
            forward_max_abs_error: None,
            backward_max_abs_error: None,
        }
    }

    // The backward pass re-enters Staged; the trail keeps the furthest state.
    fn advance(&mut self, state: CaseState) {
        debug!(target: "smx::case", state = ?state, "case state");
        self.state = self.state.max(state);
    }
}

fn elapsed_us(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_micros()).unwrap_or(u64::MAX)
}

enum Verdict {
    Passed,
    Mismatch(Pass, MismatchDetail),
}

// ── Running ────────────────────────────────────────────────────────

impl Harness {
    /// Run one case on `device`.
    #[must_use]
    pub fn run_case(&self, case: &ParameterCombination, device: DeviceId) -> CaseReport {
        let config = self.config();
        let mut trail = Trail::new();
        info!(target: "smx::case", device = %device, "{}", render_case_line(case));

        let setup_start = Instant::now();
        let builder =
            FixtureBuilder::new(config.seed).with_element_ceiling(config.max_fixture_elements);
        let plan = FixturePlan::for_case(case, config.backward);
        let fixture_id = fixture_id_from_json(case)
            .unwrap_or_else(|err| format!("<fixture id error: {err}>"));
        let built = builder.build(case, &plan);
        trail.timings.setup_us = elapsed_us(setup_start);

        let mut owned = None;
        let result = match built {
            Err(err) => Err(CaseError::Setup(err)),
            Ok(mut fixture) => {
                trail.advance(CaseState::FixtureBuilt);
                let mut staging = DeviceStaging::new(self.backend(), device);
                let result = self.execute(case, &mut fixture, &mut staging, &mut trail);
                owned = Some((staging, fixture));
                result
            }
        };
        let last_state = trail.state;

        let (mut outcome, mut detail) = match result {
            Ok(Verdict::Passed) => (CaseOutcome::Passed, None),
            Ok(Verdict::Mismatch(pass, detail)) => {
                let kind = match pass {
                    Pass::Forward => FailureKind::ForwardMismatch,
                    Pass::Backward => FailureKind::BackwardMismatch,
                };
                (CaseOutcome::Failed(kind), Some(format!("{pass}: {detail}")))
            }
            Err(err) => {
                warn!(case = %case, error = %err, "case erred");
                (CaseOutcome::Erred(err.kind()), Some(err.to_string()))
            }
        };
        info!(
            target: "smx::case",
            "{}",
            render_outcome_line(case, outcome, detail.as_deref())
        );
        trail.advance(CaseState::Reported);

        let mut released_cleanly = true;
        if let Some((mut staging, fixture)) = owned {
            let teardown_start = Instant::now();
            for (role, err) in staging.release_all() {
                released_cleanly = false;
                warn!(case = %case, role = role.as_str(), error = %err, "device release failed");
            }
            drop(staging);
            drop(fixture);
            trail.timings.teardown_us = elapsed_us(teardown_start);
        }
        trail.advance(CaseState::TornDown);

        // A leak is an infrastructure error even when the values matched.
        if !released_cleanly && outcome.is_pass() {
            outcome = CaseOutcome::Erred(ErrorKind::Teardown);
            detail = Some("device allocations could not be released".to_owned());
        }

        CaseReport {
            case: *case,
            name: case.name(),
            outcome,
            last_state,
            detail,
            device: device.0,
            seed: builder.suite_seed(),
            fixture_id,
            forward_max_abs_error: trail.forward_max_abs_error,
            backward_max_abs_error: trail.backward_max_abs_error,
            released_cleanly,
            timings: trail.timings,
        }
    }

    fn tolerance(&self, case: &ParameterCombination) -> Tolerance {
        self.config()
            .tolerance
            .unwrap_or_else(|| Tolerance::for_algorithm(case.algorithm))
    }

    fn execute(
        &self,
        case: &ParameterCombination,
        fixture: &mut TensorFixture,
        staging: &mut DeviceStaging<'_>,
        trail: &mut Trail,
    ) -> Result<Verdict, CaseError> {
        if let Some(detail) = self.forward(case, fixture, staging, trail)? {
            return Ok(Verdict::Mismatch(Pass::Forward, detail));
        }
        if self.config().backward
            && let Some(detail) = self.backward(case, fixture, staging, trail)?
        {
            return Ok(Verdict::Mismatch(Pass::Backward, detail));
        }
        Ok(Verdict::Passed)
    }

    fn forward(
        &self,
        case: &ParameterCombination,
        fixture: &mut TensorFixture,
        staging: &mut DeviceStaging<'_>,
        trail: &mut Trail,
    ) -> Result<Option<MismatchDetail>, CaseError> {
        let pass = Pass::Forward;
        let staging_err = |source| CaseError::Staging { pass, source };

        let stage_start = Instant::now();
        let input = staging
            .stage_in(BufferRole::Input, case.input_shape, fixture.input.values())
            .map_err(staging_err)?;
        let output = staging
            .stage_in(BufferRole::Output, case.output_shape, fixture.output.values())
            .map_err(staging_err)?;
        trail.timings.stage_us += elapsed_us(stage_start);
        trail.advance(CaseState::Staged);

        let invoke_start = Instant::now();
        self.operator()
            .forward(&ForwardArgs {
                input,
                output,
                algorithm: case.algorithm,
                mode: case.mode,
                scales: case.scales,
            })
            .map_err(|err| CaseError::Invocation {
                pass,
                source: InvocationError::Operator(err),
            })?;
        trail.timings.invoke_us += elapsed_us(invoke_start);

        let readback_start = Instant::now();
        staging
            .stage_out(BufferRole::Output, fixture.output.values_mut())
            .map_err(staging_err)?;
        trail.timings.stage_us += elapsed_us(readback_start);
        trail.advance(CaseState::Invoked);
        sentinel_guard(pass, BufferRole::Output, fixture.output.values())?;

        let compare_start = Instant::now();
        softmax_forward(
            fixture.input.values(),
            case.input_shape,
            case.algorithm,
            case.mode,
            case.scales,
            fixture.reference_output.values_mut(),
        )
        .map_err(CaseError::Reference)?;
        let comparison = self.comparator().compare(
            fixture.output.values(),
            fixture.reference_output.values(),
            self.tolerance(case),
        );
        trail.timings.compare_us += elapsed_us(compare_start);
        trail.advance(CaseState::Compared);

        Ok(match comparison {
            Comparison::Match { max_abs_error } => {
                trail.forward_max_abs_error = Some(max_abs_error);
                None
            }
            Comparison::Mismatch(detail) => {
                trail.forward_max_abs_error = Some(detail.max_abs_error);
                Some(detail)
            }
        })
    }

    fn backward(
        &self,
        case: &ParameterCombination,
        fixture: &mut TensorFixture,
        staging: &mut DeviceStaging<'_>,
        trail: &mut Trail,
    ) -> Result<Option<MismatchDetail>, CaseError> {
        let pass = Pass::Backward;
        let staging_err = |source| CaseError::Staging { pass, source };

        let stage_start = Instant::now();
        let grad_output = staging
            .stage_in(BufferRole::GradOutput, case.output_shape, fixture.grad_output.values())
            .map_err(staging_err)?;
        let grad_input = staging
            .stage_in(BufferRole::GradInput, case.input_shape, fixture.grad_input.values())
            .map_err(staging_err)?;
        // y is still resident from the forward pass.
        let output = staging.arg(BufferRole::Output).map_err(staging_err)?;
        let input = if case.algorithm.backward_reads_forward_input() {
            Some(staging.arg(BufferRole::Input).map_err(staging_err)?)
        } else {
            None
        };
        trail.timings.stage_us += elapsed_us(stage_start);

        let invoke_start = Instant::now();
        self.operator()
            .backward(&BackwardArgs {
                output,
                grad_output,
                grad_input,
                input,
                algorithm: case.algorithm,
                mode: case.mode,
                scales: case.scales,
            })
            .map_err(|err| CaseError::Invocation {
                pass,
                source: InvocationError::Operator(err),
            })?;
        trail.timings.invoke_us += elapsed_us(invoke_start);

        let readback_start = Instant::now();
        staging
            .stage_out(BufferRole::GradInput, fixture.grad_input.values_mut())
            .map_err(staging_err)?;
        trail.timings.stage_us += elapsed_us(readback_start);
        sentinel_guard(pass, BufferRole::GradInput, fixture.grad_input.values())?;

        let compare_start = Instant::now();
        softmax_backward(
            fixture.output.values(),
            fixture.grad_output.values(),
            case.output_shape,
            case.algorithm,
            case.mode,
            case.scales,
            fixture.reference_grad_input.values_mut(),
        )
        .map_err(CaseError::Reference)?;
        let comparison = self.comparator().compare(
            fixture.grad_input.values(),
            fixture.reference_grad_input.values(),
            self.tolerance(case),
        );
        trail.timings.compare_us += elapsed_us(compare_start);

        Ok(match comparison {
            Comparison::Match { max_abs_error } => {
                trail.backward_max_abs_error = Some(max_abs_error);
                None
            }
            Comparison::Mismatch(detail) => {
                trail.backward_max_abs_error = Some(detail.max_abs_error);
                Some(detail)
            }
        })
    }

    /// Run every case of `matrix` in index order on the default device.
    #[must_use]
    pub fn run_matrix(&self, matrix: &TestMatrix) -> Vec<CaseReport> {
        let device = self.backend().default_device();
        matrix
            .cases()
            .iter()
            .map(|case| self.run_case(case, device))
            .collect()
    }

    /// Run `matrix` with one worker per device context.
    ///
    /// Case `i` runs on device `i % devices`; a device context executes its
    /// cases one at a time. Reports come back ordered by case index.
    #[must_use]
    pub fn run_matrix_parallel(&self, matrix: &TestMatrix) -> Vec<CaseReport> {
        let devices = self.backend().devices();
        if devices.len() <= 1 {
            return self.run_matrix(matrix);
        }

        let (tx, rx) = mpsc::channel::<CaseReport>();
        std::thread::scope(|scope| {
            for info in &devices {
                let tx = tx.clone();
                let devices = &devices;
                scope.spawn(move || {
                    debug!(
                        device = %info.id,
                        platform = %info.platform,
                        label = %info.label,
                        "device worker started"
                    );
                    for case in matrix
                        .cases()
                        .iter()
                        .filter(|case| shard_device(case.index, devices) == Some(info.id))
                    {
                        let _ = tx.send(self.run_case(case, info.id));
                    }
                });
            }
        });
        drop(tx);

        let mut reports: Vec<CaseReport> = rx.into_iter().collect();
        reports.sort_by_key(|report| report.case.index);
        reports
    }

    /// Build the matrix from `axes` and run it. Configuration errors yield
    /// a misconfigured report with zero executed cases.
    #[must_use]
    pub fn run(&self, axes: &ParameterAxes) -> SuiteReport {
        let matrix = match TestMatrix::build(axes, self.config()) {
            Ok(matrix) => matrix,
            Err(err) => {
                warn!(error = %err, "suite misconfigured; no cases executed");
                return SuiteReport::misconfigured(self, &err);
            }
        };
        info!(
            cases = matrix.len(),
            total = matrix.total_combinations(),
            backend = self.backend().name(),
            "running softmax conformance matrix"
        );
        let reports = if self.config().parallel {
            self.run_matrix_parallel(&matrix)
        } else {
            self.run_matrix(&matrix)
        };
        SuiteReport::from_cases(self, reports)
    }
}

fn sentinel_guard(pass: Pass, role: BufferRole, values: &[f32]) -> Result<(), CaseError> {
    match first_sentinel(values) {
        None => Ok(()),
        Some(first_index) => Err(CaseError::Invocation {
            pass,
            source: InvocationError::SentinelSurvived {
                role,
                count: count_sentinels(values),
                first_index,
            },
        }),
    }
}
