//! In-process pipeline engine
//!
//! Walks the level ladder one step at a time with a fixed latency and makes
//! the network side real: `tcpclientsink` elements connect to their port and
//! push filler data, `tcpclientsrc` elements connect and read until the peer
//! closes. A refused connection therefore shows up as an element error and a
//! closed peer as end-of-stream, exactly the failures the scenarios care about.
//! `filesrc` elements check their file exists and run dry shortly after
//! playing starts.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, trace};

use super::description::PipelineGraph;
use super::engine::{PipelineControl, PipelineEngine, PipelineHandle};
use super::error::{LaunchError, RuntimeElementError};
use super::state::{Level, PipelineEvent};

/// Bytes written per push
const CHUNK_SIZE: usize = 188 * 7;

/// Pause between pushes
const PUSH_INTERVAL: Duration = Duration::from_millis(40);

/// Upper bound on a single TCP connect
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Port used by tcp elements without a `port` property
const DEFAULT_TCP_PORT: u16 = 4953;

/// Engine running pipelines as tasks inside the harness
#[derive(Debug, Clone)]
pub struct SimulatedEngine {
    host: String,
    latency: Duration,
    failures: HashMap<String, String>,
    rejected: Vec<String>,
    eos_after: Option<Duration>,
}

impl Default for SimulatedEngine {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            latency: Duration::from_millis(10),
            failures: HashMap::new(),
            rejected: Vec::new(),
            eos_after: None,
        }
    }
}

impl SimulatedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Host used by tcp elements without a `host` property
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Time taken by each single level step
    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Post an error from every `factory` element once the pipeline plays
    pub fn fail_element(mut self, factory: impl Into<String>, message: impl Into<String>) -> Self {
        self.failures.insert(factory.into(), message.into());
        self
    }

    /// Refuse to build pipelines that contain `factory`
    pub fn reject_element(mut self, factory: impl Into<String>) -> Self {
        self.rejected.push(factory.into());
        self
    }

    /// Post end-of-stream after playing for `after`
    pub fn eos_after(mut self, after: Duration) -> Self {
        self.eos_after = Some(after);
        self
    }

    fn endpoints(&self, graph: &PipelineGraph) -> Result<Vec<Endpoint>, LaunchError> {
        let mut counters: HashMap<&str, usize> = HashMap::new();
        let mut endpoints = Vec::new();

        for element in graph.elements() {
            let index = counters.entry(element.factory.as_str()).or_insert(0);
            let name = element
                .name()
                .map(str::to_string)
                .unwrap_or_else(|| format!("{}{}", element.factory, index));
            *index += 1;

            let direction = match element.factory.as_str() {
                "tcpclientsink" => Direction::Push,
                "tcpclientsrc" => Direction::Pull,
                _ => continue,
            };
            let port = match element.property("port") {
                Some(value) => match value.parse::<u16>() {
                    Ok(port) if port > 0 => port,
                    _ => {
                        return Err(LaunchError::property(
                            "port",
                            format!("{}: invalid port '{}'", name, value),
                        ))
                    }
                },
                None => DEFAULT_TCP_PORT,
            };
            let host = element.property("host").unwrap_or(&self.host).to_string();

            endpoints.push(Endpoint {
                element: name,
                direction,
                host,
                port,
            });
        }

        Ok(endpoints)
    }

    fn files(&self, graph: &PipelineGraph) -> Vec<(String, PathBuf)> {
        graph
            .elements_of("filesrc")
            .map(|element| {
                let name = element.name().unwrap_or("filesrc").to_string();
                let location = element.property("location").unwrap_or_default();
                (name, PathBuf::from(location))
            })
            .collect()
    }

    fn injected_errors(&self, graph: &PipelineGraph) -> Vec<RuntimeElementError> {
        graph
            .elements()
            .filter_map(|element| {
                self.failures.get(&element.factory).map(|message| {
                    let name = element.name().unwrap_or(&element.factory);
                    RuntimeElementError::new(name, message.clone())
                })
            })
            .collect()
    }
}

impl PipelineEngine for SimulatedEngine {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn build(
        &self,
        name: &str,
        graph: &PipelineGraph,
        _description: &str,
    ) -> Result<PipelineHandle, LaunchError> {
        if let Some(element) = graph
            .elements()
            .find(|e| self.rejected.contains(&e.factory))
        {
            return Err(LaunchError::Engine(format!(
                "no element \"{}\"",
                element.factory
            )));
        }

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let simulation = Simulation {
            name: name.to_string(),
            latency: self.latency,
            endpoints: self.endpoints(graph)?,
            files: self.files(graph),
            injected: self.injected_errors(graph),
            eos_after: self.eos_after,
            events: event_tx,
            level: Level::Idle,
            io: Vec::new(),
            finished_pulls: 0,
        };
        tokio::spawn(simulation.run(command_rx));

        Ok(PipelineHandle::new(
            Box::new(SimulatedControl {
                commands: command_tx,
            }),
            event_rx,
        ))
    }
}

struct SimulatedControl {
    commands: mpsc::UnboundedSender<Level>,
}

impl PipelineControl for SimulatedControl {
    fn request_level(&mut self, level: Level) -> Result<(), RuntimeElementError> {
        self.commands
            .send(level)
            .map_err(|_| RuntimeElementError::new("pipeline", "pipeline task has exited"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Push,
    Pull,
}

#[derive(Debug)]
struct Endpoint {
    element: String,
    direction: Direction,
    host: String,
    port: u16,
}

enum IoEvent {
    Eof,
    Failed(RuntimeElementError),
}

struct Simulation {
    name: String,
    latency: Duration,
    endpoints: Vec<Endpoint>,
    files: Vec<(String, PathBuf)>,
    injected: Vec<RuntimeElementError>,
    eos_after: Option<Duration>,
    events: mpsc::UnboundedSender<PipelineEvent>,
    level: Level,
    io: Vec<JoinHandle<()>>,
    finished_pulls: usize,
}

impl Simulation {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Level>) {
        let (io_tx, mut io_rx) = mpsc::unbounded_channel();
        let mut target = Level::Idle;
        let mut stalled = false;
        let mut eos_at: Option<Instant> = None;

        loop {
            let step = if stalled {
                None
            } else {
                self.level.step_towards(target)
            };

            tokio::select! {
                command = commands.recv() => match command {
                    Some(level) => {
                        trace!("{}: requested {:?}", self.name, level);
                        if level < self.level {
                            stalled = false;
                        }
                        target = level;
                    }
                    None => break,
                },
                _ = sleep(self.latency), if step.is_some() => {
                    let Some(next) = step else { continue };
                    let from = self.level;
                    match self.enter(next, &io_tx).await {
                        Ok(()) => {
                            self.level = next;
                            self.emit(PipelineEvent::StateChanged { from, to: next });
                            if next == Level::Playing && from == Level::Paused {
                                for error in self.injected.clone() {
                                    self.emit(PipelineEvent::Error(error));
                                }
                                eos_at = match (self.eos_after, self.files.is_empty()) {
                                    (Some(after), _) => Some(Instant::now() + after),
                                    (None, false) => Some(Instant::now() + self.latency),
                                    (None, true) => None,
                                };
                            }
                            if next < from {
                                eos_at = None;
                            }
                        }
                        Err(error) => {
                            stalled = true;
                            self.emit(PipelineEvent::Error(error));
                        }
                    }
                }
                Some(event) = io_rx.recv() => match event {
                    IoEvent::Eof => {
                        self.finished_pulls += 1;
                        let pulls = self
                            .endpoints
                            .iter()
                            .filter(|e| e.direction == Direction::Pull)
                            .count();
                        if self.finished_pulls == pulls {
                            self.emit(PipelineEvent::EndOfStream);
                        }
                    }
                    IoEvent::Failed(error) => self.emit(PipelineEvent::Error(error)),
                },
                _ = expire(eos_at) => {
                    eos_at = None;
                    self.emit(PipelineEvent::EndOfStream);
                }
            }
        }

        self.disconnect();
        debug!("{}: simulation finished", self.name);
    }

    async fn enter(
        &mut self,
        next: Level,
        io_tx: &mpsc::UnboundedSender<IoEvent>,
    ) -> Result<(), RuntimeElementError> {
        match (self.level, next) {
            (Level::Ready, Level::Paused) => {
                self.open_files().await?;
                self.connect(io_tx).await
            }
            (Level::Paused, Level::Ready) => {
                self.disconnect();
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn connect(&mut self, io_tx: &mpsc::UnboundedSender<IoEvent>) -> Result<(), RuntimeElementError> {
        let mut failure = None;
        for endpoint in &self.endpoints {
            let address = format!("{}:{}", endpoint.host, endpoint.port);
            let stream = match timeout(CONNECT_TIMEOUT, TcpStream::connect(&address)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    failure = Some(RuntimeElementError::new(
                        &endpoint.element,
                        format!("Could not open resource for reading and writing: {} ({})", address, e),
                    ));
                    break;
                }
                Err(_) => {
                    failure = Some(RuntimeElementError::new(
                        &endpoint.element,
                        format!("Timed out connecting to {}", address),
                    ));
                    break;
                }
            };
            debug!("{}: {} connected to {}", self.name, endpoint.element, address);

            let element = endpoint.element.clone();
            let io_tx = io_tx.clone();
            let task = match endpoint.direction {
                Direction::Push => tokio::spawn(push(stream, element, io_tx)),
                Direction::Pull => tokio::spawn(pull(stream, element, io_tx)),
            };
            self.io.push(task);
        }

        match failure {
            Some(error) => {
                self.disconnect();
                Err(error)
            }
            None => Ok(()),
        }
    }

    async fn open_files(&self) -> Result<(), RuntimeElementError> {
        for (element, path) in &self.files {
            if let Err(e) = tokio::fs::metadata(path).await {
                return Err(RuntimeElementError::new(
                    element,
                    format!("Could not open file \"{}\" for reading: {}", path.display(), e),
                ));
            }
        }
        Ok(())
    }

    fn disconnect(&mut self) {
        for task in self.io.drain(..) {
            task.abort();
        }
        self.finished_pulls = 0;
    }

    fn emit(&self, event: PipelineEvent) {
        let _ = self.events.send(event);
    }
}

async fn push(mut stream: TcpStream, element: String, io_tx: mpsc::UnboundedSender<IoEvent>) {
    let chunk = [0u8; CHUNK_SIZE];
    loop {
        if let Err(e) = stream.write_all(&chunk).await {
            let error = RuntimeElementError::new(element, format!("Error while sending data: {}", e));
            let _ = io_tx.send(IoEvent::Failed(error));
            return;
        }
        sleep(PUSH_INTERVAL).await;
    }
}

async fn pull(mut stream: TcpStream, element: String, io_tx: mpsc::UnboundedSender<IoEvent>) {
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        match stream.read(&mut buffer).await {
            Ok(0) => {
                let _ = io_tx.send(IoEvent::Eof);
                return;
            }
            Ok(_) => continue,
            Err(e) => {
                let error = RuntimeElementError::new(element, format!("Error while reading data: {}", e));
                let _ = io_tx.send(IoEvent::Failed(error));
                return;
            }
        }
    }
}

async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
