//! Control-client harness
//!
//! Connects to the switch server's control endpoint, checks the initial
//! port assignments and records every event the server pushes so a
//! scenario can assert on them after the session ends.

mod client;
mod error;
mod harness;
pub mod protocol;

pub use client::{ControlClient, ControlConnection};
pub use error::{ConnectError, ControlError};
pub use harness::{
    ControlEvents, ControlHarness, ControlSession, ControlTask, ExpectedPorts, InitialPorts,
    LiveClients, SessionState,
};
pub use protocol::{ChannelKind, ControlMessage, EventKind, PreviewKind};
