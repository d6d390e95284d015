#![forbid(unsafe_code)]

//! Structured per-case log records shared by the conformance crates.
//!
//! One [`TestLogV1`] is written per executed case. Records are plain serde
//! structs so they can be emitted as JSON lines and diffed between runs.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::process::Command;
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

pub const TEST_LOG_SCHEMA_VERSION: &str = "smx.test-log.v1";

/// Environment variable carrying the suite seed.
pub const SEED_ENV: &str = "SMX_SEED";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestResult {
    Pass,
    Fail,
    /// The case could not be executed to a verdict.
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestLogEnv {
    pub rust_version: String,
    pub os: String,
    pub arch: String,
    pub timestamp_unix_ms: u64,
}

/// Wall time of each case stage, in microseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PhaseTimings {
    pub setup_us: u64,
    pub stage_us: u64,
    pub invoke_us: u64,
    pub compare_us: u64,
    pub teardown_us: u64,
}

impl PhaseTimings {
    #[must_use]
    pub fn total_us(&self) -> u64 {
        self.setup_us
            .saturating_add(self.stage_us)
            .saturating_add(self.invoke_us)
            .saturating_add(self.compare_us)
            .saturating_add(self.teardown_us)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestLogV1 {
    pub schema_version: String,
    pub test_id: String,
    pub fixture_id: String,
    pub seed: Option<u64>,
    pub device: Option<String>,
    pub env: TestLogEnv,
    pub artifact_refs: Vec<String>,
    pub result: TestResult,
    pub duration_us: u64,
    pub details: Option<String>,
    pub phase_timings: PhaseTimings,
}

impl TestLogV1 {
    #[must_use]
    pub fn case(
        test_id: impl Into<String>,
        fixture_id: impl Into<String>,
        seed: Option<u64>,
        result: TestResult,
        phase_timings: PhaseTimings,
    ) -> Self {
        Self {
            schema_version: TEST_LOG_SCHEMA_VERSION.to_owned(),
            test_id: test_id.into(),
            fixture_id: fixture_id.into(),
            seed,
            device: None,
            env: capture_env(),
            artifact_refs: Vec::new(),
            result,
            duration_us: phase_timings.total_us(),
            details: None,
            phase_timings,
        }
    }

    #[must_use]
    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.device = Some(device.into());
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    #[must_use]
    pub fn with_artifact(mut self, artifact: impl Into<String>) -> Self {
        self.artifact_refs.push(artifact.into());
        self
    }

    /// Serialize as one JSON line (no trailing newline).
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[must_use]
pub fn capture_env() -> TestLogEnv {
    TestLogEnv {
        rust_version: rust_version().to_owned(),
        os: std::env::consts::OS.to_owned(),
        arch: std::env::consts::ARCH.to_owned(),
        timestamp_unix_ms: now_unix_ms_u64(),
    }
}

/// Lowercase hex SHA-256 of the value's JSON encoding.
pub fn fixture_id_from_json<T: Serialize>(fixture: &T) -> Result<String, serde_json::Error> {
    let bytes = serde_json::to_vec(fixture)?;
    let digest = Sha256::digest(&bytes);
    Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
}

#[must_use]
pub fn property_test_case_count() -> u32 {
    if let Ok(raw) = std::env::var("SMX_PROPTEST_CASES")
        && let Ok(parsed) = raw.parse::<u32>()
        && parsed > 0
    {
        return parsed;
    }

    if std::env::var_os("CI").is_some() { 512 } else { 64 }
}

#[must_use]
pub fn test_id(suite: &str, case_name: &str) -> String {
    format!("{suite}::{case_name}")
}

fn now_unix_ms_u64() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .and_then(|duration| u64::try_from(duration.as_millis()).ok())
        .unwrap_or(0)
}

// rustc is spawned once per process; every case record reuses the answer.
fn rust_version() -> &'static str {
    static VERSION: OnceLock<String> = OnceLock::new();
    VERSION.get_or_init(|| match Command::new("rustc").arg("--version").output() {
        Ok(result) if result.status.success() => {
            String::from_utf8_lossy(&result.stdout).trim().to_owned()
        }
        _ => "rustc <unknown>".to_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixture_digest_is_stable_hex() {
        let fixture = serde_json::json!({
            "shape": [1, 2, 3, 4],
            "seed": 7
        });
        let a = fixture_id_from_json(&fixture).expect("digest should build");
        let b = fixture_id_from_json(&fixture).expect("digest should build");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn fixture_digest_changes_with_content() {
        let a = fixture_id_from_json(&serde_json::json!({"seed": 1})).expect("digest");
        let b = fixture_id_from_json(&serde_json::json!({"seed": 2})).expect("digest");
        assert_ne!(a, b);
    }

    #[test]
    fn duration_is_sum_of_phases() {
        let timings = PhaseTimings {
            setup_us: 1,
            stage_us: 2,
            invoke_us: 3,
            compare_us: 4,
            teardown_us: 5,
        };
        let log = TestLogV1::case("suite::case", "fx", Some(9), TestResult::Pass, timings);
        assert_eq!(log.duration_us, 15);
        assert_eq!(log.seed, Some(9));
    }

    #[test]
    fn log_line_round_trips_with_schema() {
        let log = TestLogV1::case(
            test_id("softmax", "n1_c2_h3_w4"),
            "fixture-id",
            None,
            TestResult::Error,
            PhaseTimings::default(),
        )
        .with_device("device:0")
        .with_details("staging `input` host→device failed")
        .with_artifact("report.json");

        let line = log.to_json_line().expect("serialize");
        assert!(!line.contains('\n'));
        assert!(line.contains("\"result\":\"error\""));
        let decoded: TestLogV1 = serde_json::from_str(&line).expect("deserialize");
        assert_eq!(decoded.schema_version, TEST_LOG_SCHEMA_VERSION);
        assert_eq!(decoded, log);
    }

    #[test]
    fn property_case_count_is_positive() {
        assert!(property_test_case_count() > 0);
    }
}
