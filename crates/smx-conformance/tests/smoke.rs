use smx_conformance::matrix::read_axes;
use smx_conformance::{Harness, HarnessConfig, ParameterAxes, SuiteGate};

#[test]
fn checked_in_axes_match_the_smoke_matrix() {
    let cfg = HarnessConfig::default_paths();
    let path = cfg.axes_path();
    assert!(path.exists(), "{} should exist", path.display());
    let axes = read_axes(&path).expect("axes file should parse");
    assert_eq!(axes, ParameterAxes::smoke());
}

#[test]
fn smoke_suite_is_green_on_cpu() {
    let cfg = HarnessConfig::default_paths();
    let axes = read_axes(&cfg.axes_path()).expect("axes file should parse");
    let harness = Harness::cpu(cfg);
    let report = harness.run(&axes);

    assert_eq!(report.gate, SuiteGate::Green, "{}", report.summary_line());
    assert_eq!(report.total_cases, 48);
    assert_eq!(report.passed, 48);
    assert_eq!(report.backend, "cpu");
    assert!(report.backend_version.starts_with("smx-backend-cpu/"));
    assert_eq!(harness.backend().live_allocations(), 0);
}

#[test]
fn every_report_is_in_index_order_with_a_fixture_id() {
    let harness = Harness::cpu(HarnessConfig::default_paths());
    let report = harness.run(&ParameterAxes::smoke());
    for (position, case) in report.cases.iter().enumerate() {
        assert_eq!(case.case.index, position);
        assert_eq!(case.fixture_id.len(), 64);
        assert!(case.released_cleanly);
    }
}
