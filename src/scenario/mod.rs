//! Integration scenarios
//!
//! - `scheduler`: scenario, stage and worker builders and the execution order
//! - `catalog`: the named scenarios of the suite
//! - `context`: configuration, engine and supervisor shared across scenarios
//! - `suite`: runs the catalog and collects reports

mod artifact;
pub mod catalog;
mod context;
mod error;
mod expect;
mod report;
mod scheduler;
mod suite;

pub use artifact::Artifact;
pub use context::{engine_for, CaseStarter, HarnessContext};
pub use error::{ArtifactError, ScenarioError};
pub use expect::ControlExpectations;
pub use report::{ScenarioReport, SuiteReport};
pub use scheduler::{CaseSpec, Role, Scenario, Stage, Worker, WorkerOutcome};
pub use suite::{run_scenarios, run_suite, Category, SuiteOptions};
