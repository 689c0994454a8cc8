//! Engine backed by `gst-launch-1.0`
//!
//! Every pipeline is one `gst-launch-1.0 -e <description>` child. The tool
//! walks to PLAYING on its own; its status lines are mapped back to level
//! changes, errors and end-of-stream. A graceful stop is SIGINT, which with
//! `-e` makes the tool push EOS and shut down to NULL.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nix::sys::signal::Signal;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use super::description::PipelineGraph;
use super::engine::{PipelineControl, PipelineEngine, PipelineHandle};
use super::error::{LaunchError, RuntimeElementError};
use super::state::{Level, PipelineEvent};
use crate::process::signal;

/// Engine running each pipeline through the command line launcher
#[derive(Debug, Clone)]
pub struct GstLaunchEngine {
    program: String,
    args: Vec<String>,
}

impl Default for GstLaunchEngine {
    fn default() -> Self {
        Self {
            program: "gst-launch-1.0".to_string(),
            args: vec!["-e".to_string()],
        }
    }
}

impl GstLaunchEngine {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

impl PipelineEngine for GstLaunchEngine {
    fn name(&self) -> &'static str {
        "gst-launch"
    }

    fn build(
        &self,
        name: &str,
        _graph: &PipelineGraph,
        description: &str,
    ) -> Result<PipelineHandle, LaunchError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(description)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| LaunchError::Engine(format!("{}: {}", self.program, e)))?;

        let pid = child
            .id()
            .ok_or_else(|| LaunchError::Engine(format!("{} exited immediately", self.program)))?;
        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(LaunchError::Engine("output pipes unavailable".to_string()));
        };
        debug!("{}: {} started with pid {}", name, self.program, pid);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let exited = Arc::new(AtomicBool::new(false));
        tokio::spawn(watch_output(
            name.to_string(),
            child,
            stdout,
            stderr,
            event_tx,
            exited.clone(),
        ));

        Ok(PipelineHandle::new(
            Box::new(LaunchControl { pid, exited }),
            event_rx,
        ))
    }
}

struct LaunchControl {
    pid: u32,
    exited: Arc<AtomicBool>,
}

impl PipelineControl for LaunchControl {
    fn request_level(&mut self, level: Level) -> Result<(), RuntimeElementError> {
        if level != Level::Idle || self.exited.load(Ordering::Acquire) {
            return Ok(());
        }
        signal::send(self.pid, Signal::SIGINT)
            .map(|_| ())
            .map_err(|e| RuntimeElementError::new("pipeline", format!("SIGINT failed: {}", e)))
    }
}

impl Drop for LaunchControl {
    fn drop(&mut self) {
        if !self.exited.load(Ordering::Acquire) {
            let _ = signal::send(self.pid, Signal::SIGKILL);
        }
    }
}

/// What a single output line of the launcher means
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineEvent {
    Reached(Level),
    Error(RuntimeElementError),
    EndOfStream,
}

/// Classify one line printed by `gst-launch-1.0`
pub fn classify_line(line: &str) -> Option<LineEvent> {
    let line = line.trim();

    if line.starts_with("Setting pipeline to PAUSED") {
        return Some(LineEvent::Reached(Level::Ready));
    }
    if line.starts_with("Pipeline is PREROLLED")
        || line.starts_with("Pipeline is live and does not need PREROLL")
    {
        return Some(LineEvent::Reached(Level::Paused));
    }
    if line.starts_with("Setting pipeline to PLAYING") {
        return Some(LineEvent::Reached(Level::Playing));
    }
    if line.starts_with("Setting pipeline to NULL") {
        return Some(LineEvent::Reached(Level::Idle));
    }
    if line.starts_with("Got EOS from element") {
        return Some(LineEvent::EndOfStream);
    }
    if let Some(rest) = line.strip_prefix("ERROR: from element ") {
        let (path, message) = rest.split_once(": ").unwrap_or((rest, ""));
        let element = path
            .rsplit('/')
            .next()
            .and_then(|segment| segment.rsplit(':').next())
            .unwrap_or("pipeline");
        return Some(LineEvent::Error(RuntimeElementError::new(element, message)));
    }
    if let Some(message) = line.strip_prefix("ERROR: ") {
        return Some(LineEvent::Error(RuntimeElementError::new("pipeline", message)));
    }
    None
}

/// Turns line events into pipeline events, tracking the current level
#[derive(Debug, Default)]
pub struct LineTracker {
    level: Option<Level>,
}

impl LineTracker {
    pub fn level(&self) -> Level {
        self.level.unwrap_or(Level::Idle)
    }

    pub fn feed(&mut self, line: &str) -> Option<PipelineEvent> {
        match classify_line(line)? {
            LineEvent::Reached(to) => self.reach(to),
            LineEvent::Error(e) => Some(PipelineEvent::Error(e)),
            LineEvent::EndOfStream => Some(PipelineEvent::EndOfStream),
        }
    }

    /// The launcher exited
    pub fn exited(&mut self) -> Option<PipelineEvent> {
        self.reach(Level::Idle)
    }

    fn reach(&mut self, to: Level) -> Option<PipelineEvent> {
        let from = self.level();
        if from == to {
            return None;
        }
        self.level = Some(to);
        Some(PipelineEvent::StateChanged { from, to })
    }
}

async fn watch_output(
    name: String,
    mut child: Child,
    stdout: ChildStdout,
    stderr: ChildStderr,
    events: mpsc::UnboundedSender<PipelineEvent>,
    exited: Arc<AtomicBool>,
) {
    let mut stdout = BufReader::new(stdout).lines();
    let mut stderr = BufReader::new(stderr).lines();
    let mut stdout_open = true;
    let mut stderr_open = true;
    let mut tracker = LineTracker::default();

    while stdout_open || stderr_open {
        let (from_stdout, line) = tokio::select! {
            line = stdout.next_line(), if stdout_open => (true, line),
            line = stderr.next_line(), if stderr_open => (false, line),
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) | Err(_) => {
                if from_stdout {
                    stdout_open = false;
                } else {
                    stderr_open = false;
                }
                continue;
            }
        };
        trace!("{}: {}", name, line);
        if let Some(event) = tracker.feed(&line) {
            let _ = events.send(event);
        }
    }

    match child.wait().await {
        Ok(status) => debug!("{}: launcher exited with {}", name, status),
        Err(e) => warn!("{}: failed to reap launcher: {}", name, e),
    }
    exited.store(true, Ordering::Release);
    if let Some(event) = tracker.exited() {
        let _ = events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_state_lines() {
        assert_eq!(
            classify_line("Setting pipeline to PAUSED ..."),
            Some(LineEvent::Reached(Level::Ready))
        );
        assert_eq!(
            classify_line("Pipeline is PREROLLED ..."),
            Some(LineEvent::Reached(Level::Paused))
        );
        assert_eq!(
            classify_line("Pipeline is live and does not need PREROLL ..."),
            Some(LineEvent::Reached(Level::Paused))
        );
        assert_eq!(
            classify_line("Setting pipeline to PLAYING ..."),
            Some(LineEvent::Reached(Level::Playing))
        );
        assert_eq!(classify_line("New clock: GstSystemClock"), None);
    }

    #[test]
    fn test_classify_element_error() {
        let line = "ERROR: from element /GstPipeline:pipeline0/GstTCPClientSink:tcpclientsink0: \
                    Could not open resource for reading and writing.";
        assert_eq!(
            classify_line(line),
            Some(LineEvent::Error(RuntimeElementError::new(
                "tcpclientsink0",
                "Could not open resource for reading and writing."
            )))
        );

        let line = "ERROR: pipeline could not be constructed: no element \"foo\".";
        match classify_line(line) {
            Some(LineEvent::Error(e)) => assert_eq!(e.element, "pipeline"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_classify_eos() {
        assert_eq!(
            classify_line("Got EOS from element \"pipeline0\"."),
            Some(LineEvent::EndOfStream)
        );
    }

    #[test]
    fn test_tracker_emits_level_changes_once() {
        let mut tracker = LineTracker::default();
        assert_eq!(
            tracker.feed("Setting pipeline to PAUSED ..."),
            Some(PipelineEvent::StateChanged {
                from: Level::Idle,
                to: Level::Ready
            })
        );
        assert_eq!(
            tracker.feed("Pipeline is PREROLLED ..."),
            Some(PipelineEvent::StateChanged {
                from: Level::Ready,
                to: Level::Paused
            })
        );
        assert_eq!(
            tracker.feed("Setting pipeline to PLAYING ..."),
            Some(PipelineEvent::StateChanged {
                from: Level::Paused,
                to: Level::Playing
            })
        );
        assert_eq!(
            tracker.feed("Setting pipeline to NULL ..."),
            Some(PipelineEvent::StateChanged {
                from: Level::Playing,
                to: Level::Idle
            })
        );
        // Exit after NULL adds nothing
        assert_eq!(tracker.exited(), None);
    }

    #[test]
    fn test_tracker_exit_without_null() {
        let mut tracker = LineTracker::default();
        tracker.feed("Setting pipeline to PAUSED ...");
        assert_eq!(
            tracker.exited(),
            Some(PipelineEvent::StateChanged {
                from: Level::Ready,
                to: Level::Idle
            })
        );
    }

    #[tokio::test]
    async fn test_missing_launcher_is_engine_error() {
        let engine = GstLaunchEngine::new("/nonexistent/gst-launch-1.0", Vec::new());
        let graph = crate::pipeline::description::parse("fakesrc ! fakesink").unwrap();
        let result = engine.build("test", &graph, "fakesrc ! fakesink");
        assert!(matches!(result, Err(LaunchError::Engine(_))));
    }
}
