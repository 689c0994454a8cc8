//! Seam between the harness and whatever actually runs pipelines

use tokio::sync::mpsc;

use super::description::PipelineGraph;
use super::error::{LaunchError, RuntimeElementError};
use super::state::{Level, PipelineEvent};

/// Builds runnable pipelines from parsed descriptions
pub trait PipelineEngine: Send + Sync {
    /// Short name for logs and reports
    fn name(&self) -> &'static str;

    /// Build the element graph and return a handle to drive it.
    ///
    /// Called from inside the runtime; implementations may spawn tasks.
    fn build(
        &self,
        name: &str,
        graph: &PipelineGraph,
        description: &str,
    ) -> Result<PipelineHandle, LaunchError>;
}

/// Level requests towards a running pipeline
pub trait PipelineControl: Send {
    /// Ask the pipeline to move to `level`. Returns once the request has
    /// been issued, not when the level is reached; completion is reported
    /// through the event stream.
    fn request_level(&mut self, level: Level) -> Result<(), RuntimeElementError>;
}

/// A built pipeline: control half plus its event stream
pub struct PipelineHandle {
    pub control: Box<dyn PipelineControl>,
    pub events: mpsc::UnboundedReceiver<PipelineEvent>,
}

impl PipelineHandle {
    pub fn new(
        control: Box<dyn PipelineControl>,
        events: mpsc::UnboundedReceiver<PipelineEvent>,
    ) -> Self {
        Self { control, events }
    }
}

impl std::fmt::Debug for PipelineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineHandle").finish_non_exhaustive()
    }
}
