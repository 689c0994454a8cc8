//! Pipeline error types

use thiserror::Error;

/// Errors that prevent a pipeline from being launched
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LaunchError {
    #[error("Parse error at byte {position}: {message}")]
    ParseError { position: usize, message: String },

    #[error("Invalid property {property}: {message}")]
    InvalidProperty { property: String, message: String },

    #[error("Engine refused pipeline: {0}")]
    Engine(String),
}

impl LaunchError {
    pub(crate) fn parse(position: usize, message: impl Into<String>) -> Self {
        Self::ParseError {
            position,
            message: message.into(),
        }
    }

    pub(crate) fn property(property: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidProperty {
            property: property.into(),
            message: message.into(),
        }
    }
}

/// An error reported by a pipeline element while the pipeline is running.
///
/// These are counted by the runner, never fatal to the run itself.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{element}: {message}")]
pub struct RuntimeElementError {
    /// Element that posted the error (or "pipeline" when unknown)
    pub element: String,
    /// Human readable message
    pub message: String,
}

impl RuntimeElementError {
    pub fn new(element: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            element: element.into(),
            message: message.into(),
        }
    }
}
