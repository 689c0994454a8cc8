//! Media pipelines driven through a state machine
//!
//! - `description`: the textual description language and its parser
//! - `presets`: descriptions for the synthetic sources and sinks
//! - `state`: the pure lifecycle state machine
//! - `engine`: the trait seam to the engine that runs pipelines
//! - `simulated` / `launch`: the two engines

pub mod description;
pub mod engine;
pub mod error;
pub mod launch;
pub mod presets;
pub mod simulated;
pub mod state;

pub use description::{Element, PipelineDescription, PipelineGraph};
pub use engine::{PipelineControl, PipelineEngine, PipelineHandle};
pub use error::{LaunchError, RuntimeElementError};
pub use launch::GstLaunchEngine;
pub use simulated::SimulatedEngine;
pub use state::{Level, PipelineEvent, PipelineState, StateMachine, Transition};

use tokio::sync::mpsc;
use tracing::{debug, warn};

/// A launched pipeline bound to its state machine
pub struct Pipeline {
    name: String,
    description: String,
    machine: StateMachine,
    control: Box<dyn PipelineControl>,
    events: mpsc::UnboundedReceiver<PipelineEvent>,
}

impl Pipeline {
    /// Parse `description`, build it with `engine` and request the ready level.
    ///
    /// A malformed description never leaves Idle. Every transition taken
    /// during the launch is passed to `observe`.
    pub fn launch(
        engine: &dyn PipelineEngine,
        name: &str,
        description: String,
        observe: &mut dyn FnMut(&Transition),
    ) -> Result<Self, LaunchError> {
        let graph = description::parse(&description)?;
        let mut machine = StateMachine::new();
        observe(&machine.begin_launch());

        let handle = match engine.build(name, &graph, &description) {
            Ok(handle) => handle,
            Err(e) => {
                observe(&machine.launch_failed());
                return Err(e);
            }
        };

        let mut pipeline = Self {
            name: name.to_string(),
            description,
            machine,
            control: handle.control,
            events: handle.events,
        };
        let t = pipeline.machine.launched();
        let t = pipeline.perform(t);
        observe(&t);
        debug!(
            "{}: launched {} elements on {}",
            pipeline.name,
            graph.element_count(),
            engine.name()
        );
        Ok(pipeline)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn state(&self) -> PipelineState {
        self.machine.state()
    }

    pub fn error_count(&self) -> u32 {
        self.machine.error_count()
    }

    pub fn stop_requested(&self) -> bool {
        self.machine.stop_requested()
    }

    /// Wait for the next event; `None` once the engine has gone away
    pub async fn next_event(&mut self) -> Option<PipelineEvent> {
        self.events.recv().await
    }

    /// Feed one event through the state machine and carry out its request
    pub fn dispatch(&mut self, event: PipelineEvent) -> Transition {
        if let PipelineEvent::Error(e) = &event {
            warn!("{}: element error: {}", self.name, e);
        }
        let t = self.machine.on_event(&event);
        self.perform(t)
    }

    /// Request a graceful stop; completion arrives as an idle state change.
    ///
    /// The returned transition carries no request when the idle request
    /// could not be issued, in which case no confirmation will arrive.
    pub fn stop(&mut self) -> Transition {
        let t = self.machine.request_stop();
        self.perform(t)
    }

    /// Count an error that did not come from the engine
    pub fn record_error(&mut self) -> Transition {
        self.machine.record_error()
    }

    /// Issue the level request of `t`. A refused request counts as an
    /// error, and the transition that error produced replaces `t`.
    fn perform(&mut self, t: Transition) -> Transition {
        let Some(level) = t.request else {
            return t;
        };
        match self.control.request_level(level) {
            Ok(()) => t,
            Err(e) => {
                warn!("{}: request for {:?} failed: {}", self.name, level, e);
                let failed = self.machine.record_error();
                Transition {
                    from: t.from,
                    to: failed.to,
                    request: None,
                    finished: t.finished,
                }
            }
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("state", &self.machine.state())
            .field("error_count", &self.machine.error_count())
            .finish()
    }
}
