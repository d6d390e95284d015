//! Diagnostics and suite reports.
//!
//! Rendering never influences control flow: the runner calls these after
//! it has already decided what to do.

use crate::runner::{CaseOutcome, CaseReport};
use crate::{Harness, ShapePolicy};
use serde::Serialize;
use smx_core::{ConfigError, ParameterCombination};
use smx_test_utils::{TestLogV1, TestResult, test_id};
use std::fmt::Write as _;
use std::io::Write as _;
use std::path::Path;

pub const SUITE_REPORT_SCHEMA_VERSION: &str = "smx.suite-report.v1";
pub const SUITE_NAME: &str = "softmax";

/// One-line description of a case, emitted before it runs.
///
/// `softmax #3 (N: 1 C:2 H:3 W:4) accurate channel (alpha: 1 beta:0)`
#[must_use]
pub fn render_case_line(case: &ParameterCombination) -> String {
    let mut line = format!("{SUITE_NAME} #{} {}", case.index, case.input_shape);
    if !case.shapes_tied() {
        let _ = write!(line, " -> {}", case.output_shape);
    }
    let _ = write!(line, " {} {} {}", case.algorithm, case.mode, case.scales);
    line
}

/// One-line verdict for a case, emitted after it ran.
#[must_use]
pub fn render_outcome_line(
    case: &ParameterCombination,
    outcome: CaseOutcome,
    detail: Option<&str>,
) -> String {
    match detail {
        Some(detail) => format!("{case} {}: {detail}", outcome.label()),
        None => format!("{case} {}", outcome.label()),
    }
}

// ── Suite report ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SuiteGate {
    Green,
    Red,
    /// The matrix could not be built, or selected nothing. Never green.
    Misconfigured,
}

impl SuiteGate {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Green => "green",
            Self::Red => "red",
            Self::Misconfigured => "misconfigured",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SuiteReport {
    pub schema_version: String,
    pub suite: String,
    pub backend: String,
    pub backend_version: String,
    pub operator: String,
    pub seed: u64,
    pub shape_policy: ShapePolicy,
    pub backward: bool,
    pub total_cases: usize,
    pub passed: usize,
    pub failed: usize,
    pub erred: usize,
    pub gate: SuiteGate,
    pub config_error: Option<String>,
    pub cases: Vec<CaseReport>,
}

impl SuiteReport {
    fn header(harness: &Harness) -> Self {
        let config = harness.config();
        Self {
            schema_version: SUITE_REPORT_SCHEMA_VERSION.to_owned(),
            suite: SUITE_NAME.to_owned(),
            backend: harness.backend().name().to_owned(),
            backend_version: harness.backend().version().to_owned(),
            operator: harness.operator().name().to_owned(),
            seed: config.seed,
            shape_policy: config.shape_policy,
            backward: config.backward,
            total_cases: 0,
            passed: 0,
            failed: 0,
            erred: 0,
            gate: SuiteGate::Misconfigured,
            config_error: None,
            cases: Vec::new(),
        }
    }

    #[must_use]
    pub fn from_cases(harness: &Harness, cases: Vec<CaseReport>) -> Self {
        let mut report = Self::header(harness);
        for case in &cases {
            match case.outcome {
                CaseOutcome::Passed => report.passed += 1,
                CaseOutcome::Failed(_) => report.failed += 1,
                CaseOutcome::Erred(_) => report.erred += 1,
            }
        }
        report.total_cases = cases.len();
        report.gate = if cases.is_empty() {
            SuiteGate::Misconfigured
        } else if report.passed == cases.len() {
            SuiteGate::Green
        } else {
            SuiteGate::Red
        };
        report.cases = cases;
        report
    }

    #[must_use]
    pub fn misconfigured(harness: &Harness, err: &ConfigError) -> Self {
        let mut report = Self::header(harness);
        report.config_error = Some(err.to_string());
        report
    }

    #[must_use]
    pub fn is_green(&self) -> bool {
        self.gate == SuiteGate::Green
    }

    #[must_use]
    pub fn summary_line(&self) -> String {
        match &self.config_error {
            Some(err) => format!("{SUITE_NAME}: misconfigured, 0 cases executed: {err}"),
            None => format!(
                "{SUITE_NAME}: {} ({} cases: {} passed, {} failed, {} erred)",
                self.gate.as_str(),
                self.total_cases,
                self.passed,
                self.failed,
                self.erred
            ),
        }
    }
}

pub fn emit_suite_json(path: &Path, report: &SuiteReport) -> Result<(), std::io::Error> {
    let raw = serde_json::to_string_pretty(report).map_err(std::io::Error::other)?;
    std::fs::write(path, raw)
}

#[must_use]
pub fn emit_suite_markdown(report: &SuiteReport) -> String {
    let mut md = String::new();
    let _ = writeln!(md, "# Softmax conformance report");
    let _ = writeln!(md);
    let _ = writeln!(
        md,
        "- **Backend**: {} ({})",
        report.backend, report.backend_version
    );
    let _ = writeln!(md, "- **Operator**: {}", report.operator);
    let _ = writeln!(md, "- **Seed**: {}", report.seed);
    let _ = writeln!(md, "- **Shape policy**: {}", report.shape_policy.as_str());
    let _ = writeln!(md, "- **Gate**: {}", report.gate.as_str());
    if let Some(err) = &report.config_error {
        let _ = writeln!(md, "- **Configuration error**: {err}");
        return md;
    }
    let _ = writeln!(
        md,
        "- **Cases**: {} ({} passed, {} failed, {} erred)",
        report.total_cases, report.passed, report.failed, report.erred
    );

    let problems: Vec<&CaseReport> = report
        .cases
        .iter()
        .filter(|case| !case.outcome.is_pass())
        .collect();
    if problems.is_empty() {
        return md;
    }
    let _ = writeln!(md);
    let _ = writeln!(md, "| # | Case | Outcome | Detail |");
    let _ = writeln!(md, "|---|------|---------|--------|");
    for case in problems {
        let _ = writeln!(
            md,
            "| {} | `{}` | {} | {} |",
            case.case.index,
            case.name,
            case.outcome.label(),
            case.detail.as_deref().unwrap_or("").replace('|', "\\|")
        );
    }
    md
}

// ── Structured case logs ───────────────────────────────────────────

#[must_use]
/// One log record per case. Every record references `artifacts`, the
/// suite-level files written alongside the log.
pub fn case_logs(report: &SuiteReport, artifacts: &[String]) -> Vec<TestLogV1> {
    report
        .cases
        .iter()
        .map(|case| {
            let result = match case.outcome {
                CaseOutcome::Passed => TestResult::Pass,
                CaseOutcome::Failed(_) => TestResult::Fail,
                CaseOutcome::Erred(_) => TestResult::Error,
            };
            let mut log = TestLogV1::case(
                test_id(SUITE_NAME, &case.name),
                case.fixture_id.clone(),
                Some(case.seed),
                result,
                case.timings.clone(),
            )
            .with_device(format!("device:{}", case.device));
            if let Some(detail) = &case.detail {
                log = log.with_details(detail.clone());
            }
            artifacts
                .iter()
                .fold(log, |log, artifact| log.with_artifact(artifact.clone()))
        })
        .collect()
}

/// Write one JSON line per record.
pub fn write_case_logs(path: &Path, logs: &[TestLogV1]) -> Result<(), std::io::Error> {
    let mut file = std::io::BufWriter::new(std::fs::File::create(path)?);
    for log in logs {
        let line = log.to_json_line().map_err(std::io::Error::other)?;
        writeln!(file, "{line}")?;
    }
    file.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{HarnessConfig, ParameterAxes};
    use smx_core::{AlgorithmVariant, Axis, ReductionMode, ScalePair, ShapeSpec};

    fn case(output: ShapeSpec) -> ParameterCombination {
        ParameterCombination {
            index: 3,
            input_shape: ShapeSpec::new(1, 2, 3, 4).expect("valid"),
            output_shape: output,
            algorithm: AlgorithmVariant::Accurate,
            mode: ReductionMode::Channel,
            scales: ScalePair::identity(),
        }
    }

    #[test]
    fn case_line_matches_legacy_print_format() {
        let line = render_case_line(&case(ShapeSpec::new(1, 2, 3, 4).expect("valid")));
        assert_eq!(
            line,
            "softmax #3 (N: 1 C:2 H:3 W:4) accurate channel (alpha: 1 beta:0)"
        );
    }

    #[test]
    fn case_line_shows_untied_output_shape() {
        let line = render_case_line(&case(ShapeSpec::new(1, 3, 2, 4).expect("valid")));
        assert!(line.contains("-> (N: 1 C:3 H:2 W:4)"));
    }

    #[test]
    fn outcome_line_carries_name_and_detail() {
        let line = render_outcome_line(
            &case(ShapeSpec::new(1, 2, 3, 4).expect("valid")),
            CaseOutcome::Passed,
            None,
        );
        assert_eq!(
            line,
            "#3 softmax/n1_c2_h3_w4/accurate/channel/a1_b0 passed"
        );
    }

    #[test]
    fn misconfigured_report_is_never_green() {
        let harness = Harness::cpu(HarnessConfig::default());
        let report = SuiteReport::misconfigured(&harness, &ConfigError::EmptyAxis {
            axis: Axis::Algorithms,
        });
        assert_eq!(report.gate, SuiteGate::Misconfigured);
        assert_eq!(report.total_cases, 0);
        assert!(!report.is_green());
        assert!(report.summary_line().contains("algorithms"));
        assert!(emit_suite_markdown(&report).contains("Configuration error"));
    }

    #[test]
    fn empty_case_list_is_misconfigured() {
        let harness = Harness::cpu(HarnessConfig::default());
        let report = SuiteReport::from_cases(&harness, Vec::new());
        assert_eq!(report.gate, SuiteGate::Misconfigured);
    }

    #[test]
    fn json_and_logs_are_written() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut axes = ParameterAxes::smoke();
        axes.input_shapes.truncate(1);
        let harness = Harness::cpu(HarnessConfig::default());
        let report = harness.run(&axes);
        assert!(report.is_green(), "{}", report.summary_line());

        let json_path = dir.path().join("report.json");
        emit_suite_json(&json_path, &report).expect("write report");
        let raw = std::fs::read_to_string(&json_path).expect("read report");
        let parsed: serde_json::Value = serde_json::from_str(&raw).expect("valid json");
        assert_eq!(parsed["gate"], "green");
        assert_eq!(parsed["schema_version"], SUITE_REPORT_SCHEMA_VERSION);
        assert_eq!(parsed["cases"].as_array().map(Vec::len), Some(12));

        let artifacts = vec![json_path.display().to_string()];
        let logs = case_logs(&report, &artifacts);
        let log_path = dir.path().join("cases.jsonl");
        write_case_logs(&log_path, &logs).expect("write logs");
        let raw = std::fs::read_to_string(&log_path).expect("read logs");
        assert_eq!(raw.lines().count(), 12);
        for line in raw.lines() {
            let log: TestLogV1 = serde_json::from_str(line).expect("log line");
            assert_eq!(log.schema_version, "smx.test-log.v1");
            assert_eq!(log.artifact_refs, artifacts);
        }
    }
}
