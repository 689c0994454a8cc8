//! A single pipeline test case running on its own task

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::RunnerError;
use crate::pipeline::{Pipeline, PipelineEngine, PipelineState, Transition};

/// Default wait for the idle confirmation after a stop request
pub const DEFAULT_STOP_CONFIRM: Duration = Duration::from_secs(10);

/// Callback receiving every transition of a case
pub type TransitionObserver = Arc<dyn Fn(&str, &Transition) + Send + Sync>;

/// Final record of one run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaseOutcome {
    pub name: String,
    pub state: PipelineState,
    pub error_count: u32,
    pub launch_error: Option<String>,
    pub elapsed_ms: u64,
    pub transitions: u32,
}

impl CaseOutcome {
    /// The pipeline launched and ran without element errors
    pub fn passed(&self) -> bool {
        self.launch_error.is_none() && self.error_count == 0
    }

    /// Errors this run contributes to a scenario tally
    pub fn failures(&self) -> u32 {
        self.error_count + u32::from(self.launch_error.is_some())
    }
}

struct Inner {
    name: String,
    description: String,
    lifetime: u64,
    timer: u64,
    error_count: u32,
    state: PipelineState,
    transitions: u32,
    has_pipeline: bool,
    stop_confirm: Duration,
    observer: Option<TransitionObserver>,
    running: Option<watch::Receiver<bool>>,
    outcome: Option<CaseOutcome>,
}

/// Handle to a test case. Clones share the same case.
#[derive(Clone)]
pub struct TestCase {
    inner: Arc<Mutex<Inner>>,
}

impl std::fmt::Debug for TestCase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("TestCase")
            .field("name", &inner.name)
            .field("state", &inner.state)
            .field("error_count", &inner.error_count)
            .field("timer", &inner.timer)
            .finish()
    }
}

impl TestCase {
    /// Create a case running `description` for `lifetime` seconds
    /// (0 runs until end-of-stream or the first error)
    pub fn new(name: impl Into<String>, description: impl Into<String>, lifetime: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                name: name.into(),
                description: description.into(),
                lifetime,
                timer: 0,
                error_count: 0,
                state: PipelineState::Idle,
                transitions: 0,
                has_pipeline: false,
                stop_confirm: DEFAULT_STOP_CONFIRM,
                observer: None,
                running: None,
                outcome: None,
            })),
        }
    }

    /// A case with no description yet
    pub fn named(name: impl Into<String>) -> Self {
        Self::new(name, String::new(), 0)
    }

    pub fn set_description(&self, description: impl Into<String>) {
        self.inner.lock().description = description.into();
    }

    pub fn set_lifetime(&self, lifetime: u64) {
        self.inner.lock().lifetime = lifetime;
    }

    pub fn set_stop_confirm(&self, timeout: Duration) {
        self.inner.lock().stop_confirm = timeout;
    }

    pub fn set_observer(&self, observer: TransitionObserver) {
        self.inner.lock().observer = Some(observer);
    }

    pub fn name(&self) -> String {
        self.inner.lock().name.clone()
    }

    pub fn description(&self) -> String {
        self.inner.lock().description.clone()
    }

    /// Seconds left on the countdown
    pub fn timer(&self) -> u64 {
        self.inner.lock().timer
    }

    pub fn has_pipeline(&self) -> bool {
        self.inner.lock().has_pipeline
    }

    pub fn error_count(&self) -> u32 {
        self.inner.lock().error_count
    }

    pub fn state(&self) -> PipelineState {
        self.inner.lock().state
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().running.is_some()
    }

    /// Outcome of the last finished run
    pub fn outcome(&self) -> Option<CaseOutcome> {
        self.inner.lock().outcome.clone()
    }

    /// Start the case on its own task
    pub fn run(&self, engine: Arc<dyn PipelineEngine>) -> Result<(), RunnerError> {
        let (done_tx, done_rx) = watch::channel(false);
        let description = {
            let mut inner = self.inner.lock();
            if inner.running.is_some() {
                return Err(RunnerError::AlreadyRunning(inner.name.clone()));
            }
            if inner.description.trim().is_empty() {
                return Err(RunnerError::MissingDescription(inner.name.clone()));
            }
            inner.running = Some(done_rx);
            inner.outcome = None;
            inner.error_count = 0;
            inner.transitions = 0;
            inner.state = PipelineState::Idle;
            inner.timer = inner.lifetime;
            inner.description.clone()
        };

        tokio::spawn(drive(self.clone(), engine, description, done_tx));
        Ok(())
    }

    /// Wait for the running task, if any, and return the last outcome.
    ///
    /// Any number of callers may join concurrently.
    pub async fn join(&self) -> Option<CaseOutcome> {
        let running = self.inner.lock().running.clone();
        if let Some(mut done) = running {
            // Err means the task is gone, which is completion too
            let _ = done.wait_for(|finished| *finished).await;
        }
        self.outcome()
    }

    fn publish(&self, t: &Transition, error_count: u32) {
        let (name, observer) = {
            let mut inner = self.inner.lock();
            inner.state = t.to;
            inner.error_count = error_count;
            inner.transitions += 1;
            (inner.name.clone(), inner.observer.clone())
        };
        if t.changed() {
            debug!("{}: {:?} -> {:?}", name, t.from, t.to);
        }
        if let Some(observer) = observer {
            observer(&name, t);
        }
    }

    fn sync_errors(&self, error_count: u32) {
        self.inner.lock().error_count = error_count;
    }

    /// Count down one second; true when the countdown reached zero
    fn tick(&self) -> bool {
        let mut inner = self.inner.lock();
        inner.timer = inner.timer.saturating_sub(1);
        inner.timer == 0
    }
}

/// Resets the case and signals joiners when the task ends, even by panic
struct Finish {
    case: TestCase,
    done: watch::Sender<bool>,
    started: Instant,
    launch_error: Option<String>,
}

impl Drop for Finish {
    fn drop(&mut self) {
        let elapsed_ms = u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX);
        {
            let mut inner = self.case.inner.lock();
            inner.description.clear();
            inner.timer = 0;
            inner.has_pipeline = false;
            inner.outcome = Some(CaseOutcome {
                name: inner.name.clone(),
                state: inner.state,
                error_count: inner.error_count,
                launch_error: self.launch_error.take(),
                elapsed_ms,
                transitions: inner.transitions,
            });
            inner.running = None;
        }
        self.done.send_replace(true);
    }
}

async fn drive(
    case: TestCase,
    engine: Arc<dyn PipelineEngine>,
    description: String,
    done: watch::Sender<bool>,
) {
    let mut finish = Finish {
        case: case.clone(),
        done,
        started: Instant::now(),
        launch_error: None,
    };
    let name = case.name();
    let (lifetime, stop_confirm) = {
        let inner = case.inner.lock();
        (inner.lifetime, inner.stop_confirm)
    };
    info!("========== {}", name);

    let launched = Pipeline::launch(engine.as_ref(), &name, description, &mut |t| {
        case.publish(t, 0)
    });
    let mut pipeline = match launched {
        Ok(pipeline) => pipeline,
        Err(e) => {
            error!("{}: launch failed: {}", name, e);
            finish.launch_error = Some(e.to_string());
            return;
        }
    };
    case.sync_errors(pipeline.error_count());
    case.inner.lock().has_pipeline = true;

    let mut countdown = (lifetime > 0).then(|| {
        let period = Duration::from_secs(1);
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });
    let mut confirm_by: Option<Instant> = None;

    if lifetime == 0 && pipeline.state() == PipelineState::Failed {
        info!("{}: stopping after error", name);
        match begin_stop(&case, &mut pipeline, stop_confirm) {
            Some(deadline) => confirm_by = Some(deadline),
            None => {
                finish_run(&name, pipeline);
                return;
            }
        }
    }

    loop {
        tokio::select! {
            event = pipeline.next_event() => {
                let Some(event) = event else {
                    warn!("{}: event stream ended early", name);
                    let t = pipeline.record_error();
                    case.publish(&t, pipeline.error_count());
                    break;
                };
                let t = pipeline.dispatch(event);
                case.publish(&t, pipeline.error_count());
                if t.finished {
                    break;
                }
                if lifetime == 0 && t.to == PipelineState::Failed && !pipeline.stop_requested() {
                    info!("{}: stopping after error", name);
                    match begin_stop(&case, &mut pipeline, stop_confirm) {
                        Some(deadline) => confirm_by = Some(deadline),
                        None => break,
                    }
                }
            }
            _ = next_tick(&mut countdown) => {
                if case.tick() {
                    countdown = None;
                    debug!("{}: lifetime over, stopping", name);
                    match begin_stop(&case, &mut pipeline, stop_confirm) {
                        Some(deadline) => confirm_by = Some(deadline),
                        None => break,
                    }
                }
            }
            _ = expire(confirm_by) => {
                warn!("{}: no idle confirmation within {:?}", name, stop_confirm);
                let t = pipeline.record_error();
                case.publish(&t, pipeline.error_count());
                break;
            }
        }
    }

    finish_run(&name, pipeline);
}

/// Request the graceful stop and return the confirmation deadline, or
/// `None` when the request was refused and no confirmation can arrive
fn begin_stop(
    case: &TestCase,
    pipeline: &mut Pipeline,
    stop_confirm: Duration,
) -> Option<Instant> {
    let t = pipeline.stop();
    case.publish(&t, pipeline.error_count());
    if t.request.is_none() {
        warn!("{}: stop request refused, giving up", pipeline.name());
        return None;
    }
    Some(Instant::now() + stop_confirm)
}

fn finish_run(name: &str, pipeline: Pipeline) {
    let errors = pipeline.error_count();
    drop(pipeline);
    if errors > 0 {
        error!("{}: finished with {} errors", name, errors);
    } else {
        info!("{}: finished", name);
    }
}

async fn next_tick(countdown: &mut Option<Interval>) {
    match countdown {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
