//! Process supervision error types

use std::path::PathBuf;

use thiserror::Error;

/// The process could not be started
#[derive(Error, Debug)]
pub enum SpawnError {
    #[error("Empty argument vector")]
    EmptyArgv,

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to create output log {}: {source}", path.display())]
    LogFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Failures while stopping a supervised process
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Failed to signal process {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: nix::errno::Errno,
    },

    #[error("Failed to reap process {pid}: {message}")]
    Wait { pid: u32, message: String },

    #[error("Output of process {pid} could not be logged: {message}")]
    OutputCopy { pid: u32, message: String },
}
