//! Test case runner
//!
//! A [`TestCase`] owns one pipeline, a lifetime countdown and an error
//! counter, and runs on its own task. `run` starts it, `join` waits for it.

mod testcase;

pub use testcase::{CaseOutcome, TestCase, TransitionObserver, DEFAULT_STOP_CONFIRM};

use std::sync::Arc;

use thiserror::Error;

use crate::pipeline::PipelineEngine;

/// Errors starting a test case
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RunnerError {
    #[error("Test case {0} is already running")]
    AlreadyRunning(String),

    #[error("Test case {0} has no pipeline description")]
    MissingDescription(String),

    /// The run finished but its outcome was gone by the time it was
    /// read, because another handle started the case again
    #[error("Test case {0} finished without an outcome")]
    OutcomeLost(String),
}

/// Start every case, then join them all. Cases that fail to start are
/// reported in place of an outcome.
pub async fn run_all(
    cases: &[TestCase],
    engine: &Arc<dyn PipelineEngine>,
) -> Vec<Result<CaseOutcome, RunnerError>> {
    let started: Vec<Result<(), RunnerError>> =
        cases.iter().map(|case| case.run(engine.clone())).collect();

    let mut outcomes = Vec::with_capacity(cases.len());
    for (case, started) in cases.iter().zip(started) {
        outcomes.push(match started {
            Ok(()) => case
                .join()
                .await
                .ok_or_else(|| RunnerError::OutcomeLost(case.name())),
            Err(e) => Err(e),
        });
    }
    outcomes
}
