//! Supervision of the external server and UI processes

mod error;
pub mod signal;
mod supervisor;

pub use error::{ProcessError, SpawnError};
pub use supervisor::{
    ExitReport, ManagedProcess, Supervisor, DEFAULT_EXIT_TIMEOUT, DEFAULT_GRACE, DEFAULT_LOG_PREFIX,
};
