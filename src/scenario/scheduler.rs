//! Scenario scheduler
//!
//! A scenario starts the server, the UI and a control session, fans out its
//! stages of test cases and joins them, then tears everything down in
//! reverse order:
//!
//! ```text
//! server -> ui -> control -> sources -> sinks -> join -> ui -> server
//! ```
//!
//! Sinks dial into ports the server only opens once sources are attached,
//! so stages must be ordered sources before sinks. Nothing is retried; the
//! first sign of trouble is recorded and the scenario fails.

use std::fmt;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use super::artifact::Artifact;
use super::context::{CaseStarter, HarnessContext};
use super::error::ScenarioError;
use super::expect::ControlExpectations;
use super::report::ScenarioReport;
use crate::control::ControlTask;
use crate::pipeline::{PipelineDescription, PipelineState};
use crate::process::ManagedProcess;
use crate::runner::{CaseOutcome, TestCase};

/// What a stage's pipelines do relative to the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Role {
    /// Pushes media into the server
    Source,
    /// Reads media the server produces
    Sink,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Source => f.write_str("source"),
            Role::Sink => f.write_str("sink"),
        }
    }
}

/// A test case to create when its stage starts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaseSpec {
    pub name: String,
    pub description: String,
    pub lifetime: u64,
    /// Errors of this case do not fail the scenario
    pub tolerated: bool,
}

impl CaseSpec {
    pub fn new(name: impl Into<String>, description: PipelineDescription, lifetime: u64) -> Self {
        Self::raw(name, description.into_string(), lifetime)
    }

    /// A case with a description string that may not even parse
    pub fn raw(name: impl Into<String>, description: impl Into<String>, lifetime: u64) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            lifetime,
            tolerated: false,
        }
    }

    pub fn tolerated(mut self) -> Self {
        self.tolerated = true;
        self
    }
}

/// A case that was started and must be joined
struct Started {
    case: TestCase,
    tolerated: bool,
}

impl Started {
    async fn join(self, failures: &mut Vec<ScenarioError>) -> Option<(CaseOutcome, bool)> {
        let outcome = self.case.join().await?;
        if let Err(e) = check_cleared(&self.case, &outcome) {
            failures.push(e);
        }
        Some((outcome, self.tolerated))
    }
}

/// A joined case must have dropped its description, countdown and
/// pipeline, and a case that passed must have ended in Done
fn check_cleared(case: &TestCase, outcome: &CaseOutcome) -> Result<(), ScenarioError> {
    let mut leftover = Vec::new();
    if !case.description().is_empty() {
        leftover.push("description".to_string());
    }
    if case.timer() != 0 {
        leftover.push(format!("timer at {}", case.timer()));
    }
    if case.has_pipeline() {
        leftover.push("pipeline".to_string());
    }
    if outcome.passed() && case.state() != PipelineState::Done {
        leftover.push(format!("state {:?}", case.state()));
    }
    if leftover.is_empty() {
        return Ok(());
    }
    Err(ScenarioError::NotCleared {
        name: outcome.name.clone(),
        leftover: leftover.join(", "),
    })
}

fn start_all(
    starter: &CaseStarter,
    specs: &[CaseSpec],
    failures: &mut Vec<ScenarioError>,
) -> Vec<Started> {
    let mut started = Vec::with_capacity(specs.len());
    for spec in specs {
        match starter.start(spec) {
            Ok(case) => started.push(Started {
                case,
                tolerated: spec.tolerated,
            }),
            Err(e) => failures.push(e.into()),
        }
    }
    started
}

async fn join_all(
    started: Vec<Started>,
    failures: &mut Vec<ScenarioError>,
) -> Vec<(CaseOutcome, bool)> {
    let mut outcomes = Vec::with_capacity(started.len());
    for case in started {
        if let Some(outcome) = case.join(failures).await {
            outcomes.push(outcome);
        }
    }
    outcomes
}

/// A sequence of case rounds run on its own task
#[derive(Debug, Clone, Default)]
pub struct Worker {
    name: String,
    start_delay: Duration,
    background: Option<CaseSpec>,
    settle: Duration,
    rounds: Vec<Vec<CaseSpec>>,
}

/// Everything a worker finished, plus the cases it could not start
#[derive(Default)]
pub struct WorkerOutcome {
    pub outcomes: Vec<(CaseOutcome, bool)>,
    pub failures: Vec<String>,
}

impl Worker {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Wait before doing anything
    pub fn start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    /// Keep `spec` running across all rounds, starting the rounds `settle`
    /// after it
    pub fn background(mut self, spec: CaseSpec, settle: Duration) -> Self {
        self.background = Some(spec);
        self.settle = settle;
        self
    }

    /// Add a round of cases started together and joined before the next
    pub fn round(mut self, cases: Vec<CaseSpec>) -> Self {
        self.rounds.push(cases);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rounds(&self) -> &[Vec<CaseSpec>] {
        &self.rounds
    }

    pub async fn run(self, starter: CaseStarter) -> WorkerOutcome {
        let mut result = WorkerOutcome::default();
        let mut errors = Vec::new();
        sleep(self.start_delay).await;

        let background = match &self.background {
            Some(spec) => {
                let started = start_all(&starter, std::slice::from_ref(spec), &mut errors);
                sleep(self.settle).await;
                started
            }
            None => Vec::new(),
        };

        for (index, round) in self.rounds.iter().enumerate() {
            debug!("{}: round {}", self.name, index + 1);
            let started = start_all(&starter, round, &mut errors);
            result.outcomes.extend(join_all(started, &mut errors).await);
        }

        result.outcomes.extend(join_all(background, &mut errors).await);
        result.failures = errors.into_iter().map(|e| e.to_string()).collect();
        result
    }
}

/// A group of cases and workers started together after a delay
#[derive(Debug, Clone)]
pub struct Stage {
    role: Role,
    delay: Duration,
    cases: Vec<CaseSpec>,
    workers: Vec<Worker>,
}

impl Stage {
    pub fn new(role: Role, delay: Duration) -> Self {
        Self {
            role,
            delay,
            cases: Vec::new(),
            workers: Vec::new(),
        }
    }

    pub fn sources(delay: Duration) -> Self {
        Self::new(Role::Source, delay)
    }

    pub fn sinks(delay: Duration) -> Self {
        Self::new(Role::Sink, delay)
    }

    pub fn case(mut self, spec: CaseSpec) -> Self {
        self.cases.push(spec);
        self
    }

    pub fn worker(mut self, worker: Worker) -> Self {
        self.workers.push(worker);
        self
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn cases(&self) -> &[CaseSpec] {
        &self.cases
    }

    pub fn workers(&self) -> &[Worker] {
        &self.workers
    }
}

/// A named integration scenario
#[derive(Debug, Clone)]
pub struct Scenario {
    name: String,
    server_warmup: Option<Duration>,
    ui_warmup: Option<Duration>,
    control: Option<ControlExpectations>,
    stages: Vec<Stage>,
    after_teardown: Vec<CaseSpec>,
    artifacts: Vec<Artifact>,
    server_must_survive: bool,
}

impl Scenario {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            server_warmup: None,
            ui_warmup: None,
            control: None,
            stages: Vec::new(),
            after_teardown: Vec::new(),
            artifacts: Vec::new(),
            server_must_survive: false,
        }
    }

    /// Launch the server and give it `warmup` to come up
    pub fn with_server(mut self, warmup: Duration) -> Self {
        self.server_warmup = Some(warmup);
        self
    }

    pub fn with_ui(mut self, warmup: Duration) -> Self {
        self.ui_warmup = Some(warmup);
        self
    }

    /// Run a control session and check what it recorded
    pub fn with_control(mut self, expectations: ControlExpectations) -> Self {
        self.control = Some(expectations);
        self
    }

    pub fn stage(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    /// Run `spec` once the server is gone
    pub fn after_teardown(mut self, spec: CaseSpec) -> Self {
        self.after_teardown.push(spec);
        self
    }

    pub fn artifact(mut self, artifact: Artifact) -> Self {
        self.artifacts.push(artifact);
        self
    }

    /// Fail unless the server is still running once all cases are joined
    pub fn require_server_alive(mut self) -> Self {
        self.server_must_survive = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn artifacts(&self) -> &[Artifact] {
        &self.artifacts
    }

    pub fn uses_server(&self) -> bool {
        self.server_warmup.is_some()
    }

    pub fn uses_ui(&self) -> bool {
        self.ui_warmup.is_some()
    }

    /// Check that no stage starts sources after sinks
    pub fn check_order(&self) -> Result<(), ScenarioError> {
        let mut previous = Role::Source;
        for (index, stage) in self.stages.iter().enumerate() {
            if stage.role < previous {
                return Err(ScenarioError::StartOrder {
                    stage: index + 1,
                    role: stage.role,
                    previous,
                });
            }
            previous = stage.role;
        }
        Ok(())
    }

    /// Run the scenario to completion. Failures are collected in the
    /// report; processes are torn down on every path.
    pub async fn execute(&self, ctx: &mut HarnessContext) -> ScenarioReport {
        let started = Instant::now();
        let mut report = ScenarioReport::new(&self.name);
        let external_server = ctx.options().external_server;
        let external_ui = ctx.options().external_ui;

        if let Err(e) = self.check_order() {
            report.fail(e);
            return report.finish(started);
        }

        let nothing_to_do = self.stages.is_empty()
            && self.after_teardown.is_empty()
            && self.control.is_none()
            && (external_server || self.artifacts.is_empty());
        if nothing_to_do {
            info!("Scenario {}: nothing to run, skipping", self.name);
            return ScenarioReport::skipped(&self.name);
        }

        info!("Scenario {} starting", self.name);
        ctx.begin_scenario(&self.name);
        let mut failures: Vec<ScenarioError> = Vec::new();

        // 1. server
        let mut server: Option<ManagedProcess> = None;
        if let Some(warmup) = self.server_warmup.filter(|_| !external_server) {
            match ctx.supervisor().launch(ctx.config().server_argv()).await {
                Ok(process) => {
                    server = Some(process);
                    sleep(warmup).await;
                }
                Err(e) => {
                    error!("Scenario {}: server did not start: {}", self.name, e);
                    report.fail(ScenarioError::from(e));
                    ctx.end_scenario();
                    return report.finish(started);
                }
            }
        }

        // 2. ui
        let mut ui: Option<ManagedProcess> = None;
        if let Some(warmup) = self.ui_warmup.filter(|_| !external_ui) {
            match ctx.supervisor().launch(ctx.config().ui_argv()).await {
                Ok(process) => {
                    ui = Some(process);
                    sleep(warmup).await;
                }
                Err(e) => {
                    error!("Scenario {}: UI did not start: {}", self.name, e);
                    report.fail(ScenarioError::from(e));
                    self.teardown(ctx, None, server, &mut report).await;
                    ctx.end_scenario();
                    return report.finish(started);
                }
            }
        }

        // 3. control client
        let mut control = self.control.as_ref().map(|expectations| {
            ControlTask::spawn(
                &ctx.config().control_url,
                Some(expectations.initial),
                ctx.live_clients(),
            )
        });
        let mut control_up = true;
        if let Some(task) = control.as_mut() {
            if !task.wait_connected().await {
                error!(
                    "Scenario {}: control session did not come up, skipping stages",
                    self.name
                );
                control_up = false;
            }
        }

        // 4. sources, then sinks
        let starter = ctx.cases();
        let stages: &[Stage] = if control_up { &self.stages } else { &[] };
        let mut cases = Vec::new();
        let mut workers: Vec<(String, JoinHandle<WorkerOutcome>)> = Vec::new();
        for stage in stages {
            if !stage.delay.is_zero() {
                sleep(stage.delay).await;
            }
            debug!(
                "Scenario {}: starting {} {} cases, {} workers",
                self.name,
                stage.cases.len(),
                stage.role,
                stage.workers.len()
            );
            cases.extend(start_all(&starter, &stage.cases, &mut failures));
            for worker in &stage.workers {
                let name = worker.name.clone();
                let handle = tokio::spawn(worker.clone().run(starter.clone()));
                workers.push((name, handle));
            }
        }

        // 5. join
        for (outcome, tolerated) in join_all(cases, &mut failures).await {
            report.record_case(outcome, tolerated);
        }
        for (name, handle) in workers {
            match handle.await {
                Ok(outcome) => {
                    for (outcome, tolerated) in outcome.outcomes {
                        report.record_case(outcome, tolerated);
                    }
                    for message in outcome.failures {
                        failures.push(ScenarioError::Worker {
                            name: name.clone(),
                            message,
                        });
                    }
                }
                Err(e) => failures.push(ScenarioError::Worker {
                    name,
                    message: e.to_string(),
                }),
            }
        }

        if self.server_must_survive {
            if let Some(process) = &server {
                if process.has_exited() {
                    failures.push(ScenarioError::ServerExited);
                }
            }
        }

        // 6. tear down ui then server, which also ends the control session
        self.teardown(ctx, ui, server, &mut report).await;

        if let (Some(task), Some(expectations)) = (control.take(), &self.control) {
            let mut task = task;
            task.close();
            match task.join().await {
                Ok(session) => {
                    for mismatch in expectations.check(&session) {
                        report.fail(format!("control: {}", mismatch));
                    }
                    report.control = Some(session);
                }
                Err(e) => failures.push(e.into()),
            }
        }

        // 7. cases that need the server gone
        if control_up && !self.after_teardown.is_empty() {
            let started = start_all(&starter, &self.after_teardown, &mut failures);
            for (outcome, tolerated) in join_all(started, &mut failures).await {
                report.record_case(outcome, tolerated);
            }
        }

        // 8. artifacts
        if external_server {
            if !self.artifacts.is_empty() {
                debug!("Scenario {}: external server, not checking artifacts", self.name);
            }
        } else {
            for artifact in &self.artifacts {
                if let Err(e) = artifact.verify() {
                    failures.push(e.into());
                }
            }
        }

        let alive = ctx.end_scenario();
        if alive > 0 {
            failures.push(ScenarioError::LiveClients(alive));
        }

        for failure in failures {
            report.fail(failure);
        }
        let report = report.finish(started);
        if report.passed {
            info!("Scenario {} passed", self.name);
        } else {
            error!(
                "Scenario {} failed with {} errors",
                self.name, report.error_count
            );
        }
        report
    }

    async fn teardown(
        &self,
        ctx: &HarnessContext,
        ui: Option<ManagedProcess>,
        server: Option<ManagedProcess>,
        report: &mut ScenarioReport,
    ) {
        if let Some(process) = ui {
            match ctx.supervisor().terminate(process).await {
                Ok(exit) => report.ui_exit = Some(exit),
                Err(e) => {
                    warn!("Scenario {}: UI teardown failed: {}", self.name, e);
                    report.fail(ScenarioError::from(e));
                }
            }
        }
        if let Some(process) = server {
            match ctx.supervisor().terminate(process).await {
                Ok(exit) => report.server_exit = Some(exit),
                Err(e) => {
                    warn!("Scenario {}: server teardown failed: {}", self.name, e);
                    report.fail(ScenarioError::from(e));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::HarnessConfig;
    use crate::control::ExpectedPorts;
    use crate::pipeline::{PipelineEngine, PipelineState, SimulatedEngine};
    use crate::scenario::SuiteOptions;

    fn context() -> HarnessContext {
        let engine: Arc<dyn PipelineEngine> =
            Arc::new(SimulatedEngine::new().latency(Duration::from_millis(5)));
        HarnessContext::new(HarnessConfig::default(), SuiteOptions::default()).with_engine(engine)
    }

    fn fake(name: &str, lifetime: u64) -> CaseSpec {
        CaseSpec::raw(name, "fakesrc ! fakesink", lifetime)
    }

    #[test]
    fn test_sinks_before_sources_rejected() {
        let scenario = Scenario::new("backwards")
            .stage(Stage::sinks(Duration::ZERO).case(fake("sink", 1)))
            .stage(Stage::sources(Duration::ZERO).case(fake("source", 1)));

        assert!(matches!(
            scenario.check_order(),
            Err(ScenarioError::StartOrder {
                stage: 2,
                role: Role::Source,
                previous: Role::Sink,
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_order_launches_nothing() {
        let mut ctx = context();
        let scenario = Scenario::new("backwards")
            .stage(Stage::sinks(Duration::ZERO).case(fake("sink", 1)))
            .stage(Stage::sources(Duration::ZERO).case(fake("source", 1)));

        let report = scenario.execute(&mut ctx).await;
        assert!(!report.passed);
        assert!(report.cases.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stages_join_all_cases() {
        let mut ctx = context();
        let scenario = Scenario::new("fan-out")
            .stage(Stage::sources(Duration::ZERO).case(fake("source1", 2)))
            .stage(
                Stage::sources(Duration::from_secs(1))
                    .case(fake("source2", 2))
                    .case(fake("source3", 2)),
            )
            .stage(Stage::sinks(Duration::from_secs(1)).case(fake("sink", 1)));

        let report = scenario.execute(&mut ctx).await;
        assert!(report.passed, "{:?}", report.failures);
        assert_eq!(report.cases.len(), 4);
        assert!(report
            .cases
            .iter()
            .all(|case| case.state == PipelineState::Done));
    }

    #[tokio::test(start_paused = true)]
    async fn test_case_errors_fail_scenario() {
        let engine: Arc<dyn PipelineEngine> = Arc::new(
            SimulatedEngine::new()
                .latency(Duration::from_millis(5))
                .fail_element("fakesink", "Internal data stream error"),
        );
        let mut ctx = context().with_engine(engine);
        let scenario =
            Scenario::new("broken").stage(Stage::sources(Duration::ZERO).case(fake("source", 1)));

        let report = scenario.execute(&mut ctx).await;
        assert!(!report.passed);
        assert_eq!(report.error_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tolerated_launch_errors() {
        let mut ctx = context();
        let scenario = Scenario::new("fuzz").stage(
            Stage::sources(Duration::ZERO)
                .case(fake("valid", 1))
                .case(CaseSpec::raw("malformed", "fakesrc ! ! fakesink", 1).tolerated()),
        );

        let report = scenario.execute(&mut ctx).await;
        assert!(report.passed, "{:?}", report.failures);
        assert!(report.cases.iter().any(|case| case.launch_error.is_some()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_workers_run_rounds_in_sequence() {
        let mut ctx = context();
        let worker = Worker::new("worker1")
            .background(fake("anchor", 5), Duration::from_secs(1))
            .round(vec![fake("video-1", 1), fake("audio-1", 2)])
            .round(vec![fake("video-2", 1), fake("audio-2", 1)]);
        let scenario =
            Scenario::new("random").stage(Stage::sources(Duration::ZERO).worker(worker));

        let report = scenario.execute(&mut ctx).await;
        assert!(report.passed, "{:?}", report.failures);
        let names: Vec<&str> = report.cases.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["video-1", "audio-1", "video-2", "audio-2", "anchor"]);
        // anchor outlives both rounds
        assert!(report.duration_ms >= 5000);
    }

    fn outcome(name: &str, state: PipelineState) -> CaseOutcome {
        CaseOutcome {
            name: name.to_string(),
            state,
            error_count: 0,
            launch_error: None,
            elapsed_ms: 0,
            transitions: 0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_joined_case_is_cleared() {
        let ctx = context();
        let case = ctx.cases().start(&fake("cleared", 1)).unwrap();
        let finished = case.join().await.unwrap();

        assert!(check_cleared(&case, &finished).is_ok());
        assert!(case.description().is_empty());
        assert_eq!(case.timer(), 0);
        assert!(!case.has_pipeline());
        assert_eq!(case.state(), PipelineState::Done);
    }

    #[test]
    fn test_uncleared_case_is_reported() {
        let case = TestCase::new("stale", "fakesrc ! fakesink", 3);

        let err = check_cleared(&case, &outcome("stale", PipelineState::Idle)).unwrap_err();
        match err {
            ScenarioError::NotCleared { name, leftover } => {
                assert_eq!(name, "stale");
                assert!(leftover.contains("description"));
                assert!(leftover.contains("state Idle"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_failed_case_need_not_be_done() {
        let case = TestCase::named("failed");
        let mut failed = outcome("failed", PipelineState::Failed);
        failed.error_count = 1;
        assert!(check_cleared(&case, &failed).is_ok());
    }

    #[tokio::test]
    async fn test_unreachable_control_skips_stages() {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let mut config = HarnessConfig::default();
        config.control_url = format!("ws://127.0.0.1:{}", port);
        let engine: Arc<dyn PipelineEngine> =
            Arc::new(SimulatedEngine::new().latency(Duration::from_millis(5)));
        let mut ctx =
            HarnessContext::new(config, SuiteOptions::default()).with_engine(engine);

        let scenario = Scenario::new("no-control")
            .with_control(ControlExpectations::new(ExpectedPorts {
                compose: 3001,
                encode: 3002,
            }))
            .stage(Stage::sources(Duration::ZERO).case(fake("source", 30)));

        let started = Instant::now();
        let report = scenario.execute(&mut ctx).await;
        assert!(!report.passed);
        assert!(report.cases.is_empty());
        assert!(report
            .failures
            .iter()
            .any(|f| f.starts_with("Control session failed")));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_empty_scenario_is_skipped() {
        let mut ctx = context();
        let report = Scenario::new("empty").execute(&mut ctx).await;
        assert!(report.skipped);
        assert!(report.passed);
    }
}
