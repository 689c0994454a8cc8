//! Scenario and suite reports

use std::fmt::Display;

use serde::Serialize;
use tokio::time::Instant;
use uuid::Uuid;

use crate::control::ControlSession;
use crate::process::ExitReport;
use crate::runner::CaseOutcome;

/// Result of one scenario
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScenarioReport {
    pub name: String,
    pub passed: bool,
    pub skipped: bool,
    /// Case errors plus scenario-level failures
    pub error_count: u32,
    pub cases: Vec<CaseOutcome>,
    pub failures: Vec<String>,
    pub control: Option<ControlSession>,
    pub server_exit: Option<ExitReport>,
    pub ui_exit: Option<ExitReport>,
    pub duration_ms: u64,
}

impl ScenarioReport {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// A scenario that had nothing to do in this configuration
    pub fn skipped(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: true,
            skipped: true,
            ..Self::default()
        }
    }

    /// Record a joined case. Failures of tolerated cases are kept in the
    /// outcome but not counted.
    pub fn record_case(&mut self, outcome: CaseOutcome, tolerated: bool) {
        let failures = outcome.failures();
        if failures > 0 && !tolerated {
            self.error_count += failures;
            match &outcome.launch_error {
                Some(e) => self.failures.push(format!("{}: {}", outcome.name, e)),
                None => self
                    .failures
                    .push(format!("{}: {} errors", outcome.name, outcome.error_count)),
            }
        }
        self.cases.push(outcome);
    }

    pub fn fail(&mut self, failure: impl Display) {
        self.error_count += 1;
        self.failures.push(failure.to_string());
    }

    pub fn finish(mut self, started: Instant) -> Self {
        self.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.passed = self.error_count == 0 && self.failures.is_empty();
        self
    }
}

/// Results of a whole suite run
#[derive(Debug, Clone, Serialize)]
pub struct SuiteReport {
    pub run_id: Uuid,
    pub scenarios: Vec<ScenarioReport>,
    pub duration_ms: u64,
}

impl SuiteReport {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            scenarios: Vec::new(),
            duration_ms: 0,
        }
    }

    pub fn passed(&self) -> bool {
        self.scenarios.iter().all(|s| s.passed)
    }

    pub fn failed(&self) -> impl Iterator<Item = &ScenarioReport> {
        self.scenarios.iter().filter(|s| !s.passed)
    }

    /// Process exit code: 0 when every scenario passed
    pub fn exit_code(&self) -> u8 {
        if self.passed() {
            0
        } else {
            1
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// One line per scenario followed by the totals
    pub fn summary(&self) -> String {
        let mut out = String::new();
        for scenario in &self.scenarios {
            let status = if scenario.skipped {
                "SKIP"
            } else if scenario.passed {
                "PASS"
            } else {
                "FAIL"
            };
            out.push_str(&format!(
                "{} {} ({} errors, {} ms)\n",
                status, scenario.name, scenario.error_count, scenario.duration_ms
            ));
            for failure in &scenario.failures {
                out.push_str(&format!("    {}\n", failure));
            }
        }
        let failed = self.failed().count();
        out.push_str(&format!(
            "{} scenarios, {} failed, run {}\n",
            self.scenarios.len(),
            failed,
            self.run_id
        ));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PipelineState;

    fn outcome(name: &str, errors: u32, launch_error: Option<&str>) -> CaseOutcome {
        CaseOutcome {
            name: name.to_string(),
            state: PipelineState::Done,
            error_count: errors,
            launch_error: launch_error.map(str::to_string),
            elapsed_ms: 10,
            transitions: 5,
        }
    }

    #[test]
    fn test_case_errors_fail_scenario() {
        let mut report = ScenarioReport::new("video");
        report.record_case(outcome("test-video-source1", 0, None), false);
        report.record_case(outcome("test_video_preview_sink1", 2, None), false);
        let report = report.finish(Instant::now());

        assert!(!report.passed);
        assert_eq!(report.error_count, 2);
        assert_eq!(report.failures, vec!["test_video_preview_sink1: 2 errors"]);
        assert_eq!(report.cases.len(), 2);
    }

    #[test]
    fn test_tolerated_failures_do_not_count() {
        let mut report = ScenarioReport::new("fuzz");
        report.record_case(outcome("fuzz-malformed-1", 0, Some("parse error")), true);
        let report = report.finish(Instant::now());
        assert!(report.passed);
        assert_eq!(report.error_count, 0);
    }

    #[test]
    fn test_suite_exit_code() {
        let mut suite = SuiteReport::new(Uuid::new_v4());
        suite.scenarios.push(ScenarioReport::new("controller").finish(Instant::now()));
        suite.scenarios.push(ScenarioReport::skipped("recording-result"));
        assert_eq!(suite.exit_code(), 0);

        let mut failed = ScenarioReport::new("audio");
        failed.fail("server exited");
        suite.scenarios.push(failed.finish(Instant::now()));
        assert_eq!(suite.exit_code(), 1);

        let summary = suite.summary();
        assert!(summary.contains("PASS controller"));
        assert!(summary.contains("SKIP recording-result"));
        assert!(summary.contains("FAIL audio (1 errors"));
        assert!(summary.contains("3 scenarios, 1 failed"));

        let json: serde_json::Value = serde_json::from_str(&suite.to_json().unwrap()).unwrap();
        assert_eq!(json["scenarios"][2]["failures"][0], "server exited");
    }
}
