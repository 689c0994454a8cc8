//! Assertions on a recorded control session

use crate::control::{ChannelKind, ControlSession, EventKind, ExpectedPorts, SessionState};

/// Values a control session must have recorded by the end of a scenario
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlExpectations {
    /// Compose and encode ports reported on connect
    pub initial: ExpectedPorts,
    pub compose_port: Option<u16>,
    pub compose_changes: Option<u32>,
    pub audio_port: Option<u16>,
    pub audio_changes: Option<u32>,
    /// Expected port of preview slot 1, slot 2, ...
    pub preview_slots: Vec<u16>,
    pub preview_additions: Option<u32>,
}

impl ControlExpectations {
    pub fn new(initial: ExpectedPorts) -> Self {
        Self {
            initial,
            compose_port: None,
            compose_changes: None,
            audio_port: None,
            audio_changes: None,
            preview_slots: Vec::new(),
            preview_additions: None,
        }
    }

    pub fn compose(mut self, port: u16, changes: u32) -> Self {
        self.compose_port = Some(port);
        self.compose_changes = Some(changes);
        self
    }

    pub fn audio(mut self, port: u16, changes: u32) -> Self {
        self.audio_port = Some(port);
        self.audio_changes = Some(changes);
        self
    }

    pub fn previews(mut self, slots: Vec<u16>, additions: u32) -> Self {
        self.preview_slots = slots;
        self.preview_additions = Some(additions);
        self
    }

    /// Every mismatch between `session` and the expected values
    pub fn check(&self, session: &ControlSession) -> Vec<String> {
        let mut failures = Vec::new();

        if session.state == SessionState::Disconnected {
            failures.push("control session never connected".to_string());
        }

        check_value(
            &mut failures,
            "compose port",
            self.compose_port,
            session.port(ChannelKind::Compose),
        );
        check_value(
            &mut failures,
            "compose port changes",
            self.compose_changes,
            Some(session.count(EventKind::ComposePortChanged)),
        );
        check_value(
            &mut failures,
            "audio port",
            self.audio_port,
            session.port(ChannelKind::Audio),
        );
        check_value(
            &mut failures,
            "audio port changes",
            self.audio_changes,
            Some(session.count(EventKind::AudioPortChanged)),
        );
        for (index, port) in self.preview_slots.iter().enumerate() {
            let slot = index + 1;
            check_value(
                &mut failures,
                &format!("preview slot {}", slot),
                Some(*port),
                session.preview_slot(slot),
            );
        }
        check_value(
            &mut failures,
            "preview port additions",
            self.preview_additions,
            Some(session.count(EventKind::PreviewPortAdded)),
        );

        failures
    }
}

fn check_value<T>(failures: &mut Vec<String>, what: &str, expected: Option<T>, actual: Option<T>)
where
    T: PartialEq + std::fmt::Debug,
{
    if let Some(expected) = expected {
        if actual.as_ref() != Some(&expected) {
            failures.push(format!("{}: expected {:?}, got {:?}", what, expected, actual));
        }
    }
}
