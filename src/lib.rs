//! switch-harness - Integration-test harness for a media switching server
//!
//! Drives the server with synthetic source and sink pipelines and a control
//! client while supervising the server and UI as child processes.

pub mod config;
pub mod control;
pub mod pipeline;
pub mod process;
pub mod runner;
pub mod scenario;

pub use config::HarnessConfig;
pub use runner::TestCase;
pub use scenario::{run_suite, HarnessContext, Scenario, SuiteOptions};
