//! Long-lived control session recording what the server pushes

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::client::{ControlClient, ControlConnection};
use super::error::{ConnectError, ControlError};
use super::protocol::{ChannelKind, ControlMessage, EventKind, PreviewKind};

/// Callbacks for events pushed by the server
pub trait ControlEvents: Send {
    fn on_connection_closed(&mut self, error: Option<String>);
    fn on_compose_port_changed(&mut self, port: u16);
    fn on_audio_port_changed(&mut self, port: u16);
    fn on_preview_port_added(&mut self, port: u16, kind: PreviewKind);
}

/// Ports reported right after connecting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InitialPorts {
    pub compose: u16,
    pub encode: u16,
    pub audio: u16,
}

/// Ports a freshly started server must report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpectedPorts {
    pub compose: u16,
    pub encode: u16,
}

/// Connection state of a control session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    #[default]
    Disconnected,
    Connected,
    Closed,
}

/// Records everything observed on one control connection
#[derive(Debug, Clone, Default, Serialize)]
pub struct ControlSession {
    pub state: SessionState,
    pub initial: Option<InitialPorts>,
    pub observed_ports: BTreeMap<ChannelKind, u16>,
    /// Preview ports in arrival order; index 0 is slot 1
    pub preview_ports: Vec<(u16, PreviewKind)>,
    pub event_counts: BTreeMap<EventKind, u32>,
    pub close_error: Option<String>,
}

impl ControlSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, kind: EventKind) -> u32 {
        self.event_counts.get(&kind).copied().unwrap_or(0)
    }

    pub fn port(&self, channel: ChannelKind) -> Option<u16> {
        self.observed_ports.get(&channel).copied()
    }

    /// Port of preview slot `slot` (1-based)
    pub fn preview_slot(&self, slot: usize) -> Option<u16> {
        slot.checked_sub(1)
            .and_then(|index| self.preview_ports.get(index))
            .map(|(port, _)| *port)
    }

    fn connected(&mut self, initial: InitialPorts) {
        self.state = SessionState::Connected;
        self.initial = Some(initial);
        self.observed_ports.insert(ChannelKind::Compose, initial.compose);
        self.observed_ports.insert(ChannelKind::Encode, initial.encode);
        self.observed_ports.insert(ChannelKind::Audio, initial.audio);
    }

    fn bump(&mut self, kind: EventKind) {
        *self.event_counts.entry(kind).or_insert(0) += 1;
    }
}

impl ControlEvents for ControlSession {
    fn on_connection_closed(&mut self, error: Option<String>) {
        self.state = SessionState::Closed;
        self.close_error = error;
        self.bump(EventKind::ConnectionClosed);
    }

    fn on_compose_port_changed(&mut self, port: u16) {
        self.observed_ports.insert(ChannelKind::Compose, port);
        self.bump(EventKind::ComposePortChanged);
    }

    fn on_audio_port_changed(&mut self, port: u16) {
        self.observed_ports.insert(ChannelKind::Audio, port);
        self.bump(EventKind::AudioPortChanged);
    }

    fn on_preview_port_added(&mut self, port: u16, kind: PreviewKind) {
        self.preview_ports.push((port, kind));
        self.bump(EventKind::PreviewPortAdded);
    }
}

/// Drives a control connection and feeds pushed events to `E`
pub struct ControlHarness<E: ControlEvents> {
    client: ControlClient,
    expected: Option<ExpectedPorts>,
    connection: Option<ControlConnection>,
    initial: Option<InitialPorts>,
    events: E,
}

impl<E: ControlEvents> ControlHarness<E> {
    pub fn new(client: ControlClient, events: E) -> Self {
        Self {
            client,
            expected: None,
            connection: None,
            initial: None,
            events,
        }
    }

    /// Check the initial compose and encode ports on connect
    pub fn expect_ports(mut self, expected: ExpectedPorts) -> Self {
        self.expected = Some(expected);
        self
    }

    pub fn initial_ports(&self) -> Option<InitialPorts> {
        self.initial
    }

    pub fn events(&self) -> &E {
        &self.events
    }

    pub fn events_mut(&mut self) -> &mut E {
        &mut self.events
    }

    pub fn into_events(self) -> E {
        self.events
    }

    /// Connect and query the initial ports
    pub async fn connect(&mut self) -> Result<(), ConnectError> {
        let mut connection = self.client.connect().await?;
        let initial = InitialPorts {
            compose: connection.get_compose_port().await?,
            encode: connection.get_encode_port().await?,
            audio: connection.get_audio_port().await?,
        };
        info!(
            "Control ports: compose {}, encode {}, audio {}",
            initial.compose, initial.encode, initial.audio
        );

        if let Some(expected) = self.expected {
            check_port(ChannelKind::Compose, expected.compose, initial.compose)?;
            check_port(ChannelKind::Encode, expected.encode, initial.encode)?;
        }

        self.initial = Some(initial);
        self.connection = Some(connection);
        Ok(())
    }

    /// Dispatch pushed events until the connection closes
    pub async fn run(&mut self) -> Result<(), ConnectError> {
        self.run_until(std::future::pending()).await
    }

    /// Dispatch pushed events until the connection closes or `shutdown`
    /// completes, in which case the connection is closed from this side
    pub async fn run_until<F>(&mut self, shutdown: F) -> Result<(), ConnectError>
    where
        F: Future<Output = ()>,
    {
        let mut connection = self.connection.take().ok_or(ConnectError::NotConnected)?;
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                msg = connection.recv() => match msg {
                    Ok(msg) => self.dispatch(msg),
                    Err(ControlError::Closed) => {
                        debug!("Control connection closed by server");
                        self.events.on_connection_closed(None);
                        return Ok(());
                    }
                    Err(e) => {
                        warn!("Control connection failed: {}", e);
                        self.events.on_connection_closed(Some(e.to_string()));
                        return Ok(());
                    }
                },
                _ = &mut shutdown => {
                    let error = connection.close().await.err().map(|e| e.to_string());
                    self.events.on_connection_closed(error);
                    return Ok(());
                }
            }
        }
    }

    /// Close a connection that is not running
    pub async fn close(&mut self) {
        if let Some(connection) = self.connection.take() {
            let error = connection.close().await.err().map(|e| e.to_string());
            self.events.on_connection_closed(error);
        }
    }

    fn dispatch(&mut self, msg: ControlMessage) {
        match msg {
            ControlMessage::SetComposePort { port } => self.events.on_compose_port_changed(port),
            ControlMessage::SetAudioPort { port } => self.events.on_audio_port_changed(port),
            ControlMessage::AddPreviewPort { port, kind } => {
                self.events.on_preview_port_added(port, kind)
            }
            ControlMessage::Error { message } => warn!("Control server error: {}", message),
            other => debug!("Ignoring control message {:?}", other),
        }
    }
}

fn check_port(channel: ChannelKind, expected: u16, actual: u16) -> Result<(), ConnectError> {
    if expected != actual {
        return Err(ConnectError::UnexpectedPort {
            channel,
            expected,
            actual,
        });
    }
    Ok(())
}

/// Number of control client tasks alive in the current scenario
#[derive(Debug, Clone, Default)]
pub struct LiveClients(Arc<AtomicUsize>);

impl LiveClients {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    fn enter(&self) -> LiveGuard {
        self.0.fetch_add(1, Ordering::SeqCst);
        LiveGuard(self.0.clone())
    }
}

struct LiveGuard(Arc<AtomicUsize>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A control session running on its own task
pub struct ControlTask {
    handle: JoinHandle<Result<ControlSession, ConnectError>>,
    shutdown: Option<oneshot::Sender<()>>,
    connected: Option<oneshot::Receiver<()>>,
}

impl ControlTask {
    /// Connect to `url` and record events until the connection ends
    pub fn spawn(url: &str, expected: Option<ExpectedPorts>, live: &LiveClients) -> Self {
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (connected_tx, connected_rx) = oneshot::channel::<()>();
        let guard = live.enter();
        let mut harness = ControlHarness::new(ControlClient::new(url), ControlSession::new());
        if let Some(expected) = expected {
            harness = harness.expect_ports(expected);
        }

        let handle = tokio::spawn(async move {
            let _guard = guard;
            harness.connect().await?;
            if let Some(initial) = harness.initial_ports() {
                harness.events_mut().connected(initial);
            }
            let _ = connected_tx.send(());
            harness
                .run_until(async {
                    let _ = shutdown_rx.await;
                })
                .await?;
            Ok(harness.into_events())
        });

        Self {
            handle,
            shutdown: Some(shutdown_tx),
            connected: Some(connected_rx),
        }
    }

    /// Wait until the initial ports have been queried. False if the
    /// session failed to come up.
    pub async fn wait_connected(&mut self) -> bool {
        match self.connected.take() {
            Some(connected) => connected.await.is_ok(),
            None => false,
        }
    }

    /// Ask the task to close its connection
    pub fn close(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the task and return what it recorded
    pub async fn join(self) -> Result<ControlSession, ConnectError> {
        // Keep the shutdown sender alive until the task is done
        let _shutdown = self.shutdown;
        self.handle
            .await
            .map_err(|e| ConnectError::Task(e.to_string()))?
    }
}
