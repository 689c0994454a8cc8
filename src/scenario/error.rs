//! Scenario error types

use std::path::PathBuf;

use thiserror::Error;

use super::scheduler::Role;
use crate::control::ConnectError;
use crate::pipeline::LaunchError;
use crate::process::{ProcessError, SpawnError};
use crate::runner::RunnerError;

/// Recording artifact in the wrong state
#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("Expected recording {} does not exist", .0.display())]
    Missing(PathBuf),

    #[error("Recording {} still exists after cleanup", .0.display())]
    StillPresent(PathBuf),

    #[error("Failed to remove {}: {source}", path.display())]
    Remove {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors failing a scenario
#[derive(Error, Debug)]
pub enum ScenarioError {
    #[error("Stage {stage} starts {role} pipelines after {previous} pipelines")]
    StartOrder {
        stage: usize,
        role: Role,
        previous: Role,
    },

    #[error("Failed to build pipeline: {0}")]
    Description(#[from] LaunchError),

    #[error("Failed to launch process: {0}")]
    Spawn(#[from] SpawnError),

    #[error("Failed to stop process: {0}")]
    Process(#[from] ProcessError),

    #[error("Control session failed: {0}")]
    Connect(#[from] ConnectError),

    #[error("Failed to start test case: {0}")]
    Runner(#[from] RunnerError),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error("Server exited before the scenario finished")]
    ServerExited,

    #[error("{0} control clients still alive at scenario end")]
    LiveClients(usize),

    #[error("Worker {name} failed: {message}")]
    Worker { name: String, message: String },

    #[error("Test case {name} did not clear its run: {leftover}")]
    NotCleared { name: String, leftover: String },
}
