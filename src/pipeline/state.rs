//! Pipeline state machine
//!
//! The machine is a pure transition function over [`PipelineEvent`]s. It never
//! touches the pipeline itself: each step returns a [`Transition`] saying which
//! level (if any) the caller should request next and whether the run is over.

use serde::{Deserialize, Serialize};

use super::error::RuntimeElementError;

/// Levels a pipeline can be asked to reach, lowest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Idle,
    Ready,
    Paused,
    Playing,
}

impl Level {
    /// Next level towards `target`, or `None` when already there
    pub fn step_towards(self, target: Level) -> Option<Level> {
        use std::cmp::Ordering::*;
        let next = match self.cmp(&target) {
            Equal => return None,
            Less => self as u8 + 1,
            Greater => self as u8 - 1,
        };
        Some(Self::from_u8(next))
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => Level::Idle,
            1 => Level::Ready,
            2 => Level::Paused,
            _ => Level::Playing,
        }
    }
}

/// Asynchronous status reported by a running pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    /// The pipeline finished a single level change
    StateChanged { from: Level, to: Level },
    /// An element posted an error
    Error(RuntimeElementError),
    /// All sources ran dry
    EndOfStream,
}

/// Lifecycle state of a test pipeline
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    #[default]
    Idle,
    Launching,
    Ready,
    Paused,
    Playing,
    Stopping,
    Done,
    Failed,
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Done)
    }
}

/// Result of a single state machine step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: PipelineState,
    pub to: PipelineState,
    /// Level the caller must request from the pipeline
    pub request: Option<Level>,
    /// The run is over and the event loop should exit
    pub finished: bool,
}

impl Transition {
    fn new(from: PipelineState, to: PipelineState) -> Self {
        Self {
            from,
            to,
            request: None,
            finished: false,
        }
    }

    fn request(mut self, level: Level) -> Self {
        self.request = Some(level);
        self
    }

    fn finish(mut self) -> Self {
        self.finished = true;
        self
    }

    /// Whether the state actually changed
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

/// Per-pipeline state machine
#[derive(Debug, Default)]
pub struct StateMachine {
    state: PipelineState,
    error_count: u32,
    stop_requested: bool,
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested
    }

    fn go(&mut self, to: PipelineState) -> Transition {
        let t = Transition::new(self.state, to);
        self.state = to;
        t
    }

    /// The description parsed; the engine is building the element graph
    pub fn begin_launch(&mut self) -> Transition {
        self.go(PipelineState::Launching)
    }

    /// The engine built the pipeline; ask it to reach the ready level
    pub fn launched(&mut self) -> Transition {
        self.go(PipelineState::Ready).request(Level::Ready)
    }

    /// The engine refused the pipeline
    pub fn launch_failed(&mut self) -> Transition {
        self.go(PipelineState::Idle)
    }

    /// Record a runtime error that did not come through the event stream
    pub fn record_error(&mut self) -> Transition {
        self.error_count += 1;
        if self.state.is_terminal() {
            return Transition::new(self.state, self.state);
        }
        self.go(PipelineState::Failed)
    }

    /// Begin the two-phase shutdown: request idle and wait for confirmation
    pub fn request_stop(&mut self) -> Transition {
        if self.state.is_terminal() || self.stop_requested {
            return Transition::new(self.state, self.state);
        }
        self.stop_requested = true;
        let to = match self.state {
            PipelineState::Failed => PipelineState::Failed,
            _ => PipelineState::Stopping,
        };
        self.go(to).request(Level::Idle)
    }

    /// Apply one pipeline event
    pub fn on_event(&mut self, event: &PipelineEvent) -> Transition {
        use PipelineState::*;

        if self.state.is_terminal() {
            return Transition::new(self.state, self.state);
        }

        match event {
            PipelineEvent::Error(_) => self.record_error(),
            PipelineEvent::EndOfStream => self.go(Done).request(Level::Idle).finish(),
            PipelineEvent::StateChanged { to: Level::Idle, .. } => self.go(Done).finish(),
            PipelineEvent::StateChanged { from, to } => match (self.state, from, to) {
                (Ready, Level::Idle, Level::Ready) => self.go(Paused).request(Level::Paused),
                (Paused, Level::Ready, Level::Paused) => self.go(Playing).request(Level::Playing),
                _ => Transition::new(self.state, self.state),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn changed(from: Level, to: Level) -> PipelineEvent {
        PipelineEvent::StateChanged { from, to }
    }

    fn element_error() -> PipelineEvent {
        PipelineEvent::Error(RuntimeElementError::new("tcpclientsink0", "Could not connect"))
    }

    #[test]
    fn test_level_steps() {
        assert_eq!(Level::Idle.step_towards(Level::Playing), Some(Level::Ready));
        assert_eq!(Level::Playing.step_towards(Level::Idle), Some(Level::Paused));
        assert_eq!(Level::Paused.step_towards(Level::Paused), None);
    }

    #[test]
    fn test_auto_advance_to_playing() {
        let mut machine = StateMachine::new();
        machine.begin_launch();
        let t = machine.launched();
        assert_eq!(t.to, PipelineState::Ready);
        assert_eq!(t.request, Some(Level::Ready));

        let t = machine.on_event(&changed(Level::Idle, Level::Ready));
        assert_eq!(t.to, PipelineState::Paused);
        assert_eq!(t.request, Some(Level::Paused));

        let t = machine.on_event(&changed(Level::Ready, Level::Paused));
        assert_eq!(t.to, PipelineState::Playing);
        assert_eq!(t.request, Some(Level::Playing));

        let t = machine.on_event(&changed(Level::Paused, Level::Playing));
        assert_eq!(t.to, PipelineState::Playing);
        assert_eq!(t.request, None);
        assert!(!t.finished);
    }

    #[test]
    fn test_two_phase_stop() {
        let mut machine = StateMachine::new();
        machine.begin_launch();
        machine.launched();
        machine.on_event(&changed(Level::Idle, Level::Ready));
        machine.on_event(&changed(Level::Ready, Level::Paused));
        machine.on_event(&changed(Level::Paused, Level::Playing));

        let t = machine.request_stop();
        assert_eq!(t.to, PipelineState::Stopping);
        assert_eq!(t.request, Some(Level::Idle));
        assert!(!t.finished);

        // Intermediate downward steps do not finish the run
        assert!(!machine.on_event(&changed(Level::Playing, Level::Paused)).finished);
        assert!(!machine.on_event(&changed(Level::Paused, Level::Ready)).finished);

        let t = machine.on_event(&changed(Level::Ready, Level::Idle));
        assert_eq!(t.to, PipelineState::Done);
        assert!(t.finished);
    }

    #[test]
    fn test_error_counts_without_teardown() {
        let mut machine = StateMachine::new();
        machine.begin_launch();
        machine.launched();
        machine.on_event(&changed(Level::Idle, Level::Ready));

        let t = machine.on_event(&element_error());
        assert_eq!(t.to, PipelineState::Failed);
        assert_eq!(t.request, None);
        assert!(!t.finished);
        assert_eq!(machine.error_count(), 1);

        machine.on_event(&element_error());
        assert_eq!(machine.error_count(), 2);

        // Failed, then stopped
        let t = machine.request_stop();
        assert_eq!(t.to, PipelineState::Failed);
        assert_eq!(t.request, Some(Level::Idle));
        let t = machine.on_event(&changed(Level::Ready, Level::Idle));
        assert_eq!(t.to, PipelineState::Done);
        assert!(t.finished);
        assert_eq!(machine.error_count(), 2);
    }

    #[test]
    fn test_end_of_stream_finishes() {
        let mut machine = StateMachine::new();
        machine.begin_launch();
        machine.launched();
        let t = machine.on_event(&PipelineEvent::EndOfStream);
        assert_eq!(t.to, PipelineState::Done);
        assert_eq!(t.request, Some(Level::Idle));
        assert!(t.finished);
    }

    #[test]
    fn test_events_after_done_are_ignored() {
        let mut machine = StateMachine::new();
        machine.begin_launch();
        machine.launched();
        machine.on_event(&PipelineEvent::EndOfStream);

        let t = machine.on_event(&element_error());
        assert!(!t.changed());
        assert_eq!(machine.error_count(), 0);
        assert!(!machine.request_stop().changed());
    }

    #[test]
    fn test_launch_failure_returns_to_idle() {
        let mut machine = StateMachine::new();
        machine.begin_launch();
        let t = machine.launch_failed();
        assert_eq!(t.to, PipelineState::Idle);
        assert_eq!(machine.state(), PipelineState::Idle);
    }
}
