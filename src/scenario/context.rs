//! State shared by the scenarios of one suite run

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::scheduler::CaseSpec;
use super::suite::SuiteOptions;
use crate::config::{EngineKind, HarnessConfig};
use crate::control::LiveClients;
use crate::pipeline::{GstLaunchEngine, PipelineEngine, SimulatedEngine};
use crate::process::Supervisor;
use crate::runner::{RunnerError, TestCase};

/// Configuration, engine, supervisor and the scenario-scoped client count
pub struct HarnessContext {
    config: HarnessConfig,
    options: SuiteOptions,
    engine: Arc<dyn PipelineEngine>,
    supervisor: Supervisor,
    live: LiveClients,
    scenario: Option<String>,
}

impl HarnessContext {
    pub fn new(config: HarnessConfig, options: SuiteOptions) -> Self {
        let engine = engine_for(&config);
        let supervisor = Supervisor::new(config.log_dir.clone()).with_grace(config.grace());
        Self {
            config,
            options,
            engine,
            supervisor,
            live: LiveClients::new(),
            scenario: None,
        }
    }

    /// Replace the pipeline engine chosen by the configuration
    pub fn with_engine(mut self, engine: Arc<dyn PipelineEngine>) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_supervisor(mut self, supervisor: Supervisor) -> Self {
        self.supervisor = supervisor;
        self
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn options(&self) -> &SuiteOptions {
        &self.options
    }

    pub fn engine(&self) -> Arc<dyn PipelineEngine> {
        self.engine.clone()
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn live_clients(&self) -> &LiveClients {
        &self.live
    }

    pub fn cases(&self) -> CaseStarter {
        CaseStarter {
            engine: self.engine.clone(),
            stop_confirm: self.config.stop_confirm(),
        }
    }

    /// Name of the scenario in progress
    pub fn scenario(&self) -> Option<&str> {
        self.scenario.as_deref()
    }

    /// Start a scenario with a fresh live-client counter
    pub fn begin_scenario(&mut self, name: &str) {
        self.live = LiveClients::new();
        self.scenario = Some(name.to_string());
    }

    /// End the scenario, returning how many control clients are still alive
    pub fn end_scenario(&mut self) -> usize {
        let alive = self.live.count();
        if let Some(name) = self.scenario.take() {
            debug!("Scenario {} ended with {} live clients", name, alive);
        }
        alive
    }
}

/// Engine selected by the configuration
pub fn engine_for(config: &HarnessConfig) -> Arc<dyn PipelineEngine> {
    match config.engine {
        EngineKind::Simulated => Arc::new(SimulatedEngine::new().host(config.host.clone())),
        EngineKind::GstLaunch => Arc::new(GstLaunchEngine::new(
            config.gst_launch.program.clone(),
            config.gst_launch.args.clone(),
        )),
    }
}

/// Creates and starts test cases on one engine
#[derive(Clone)]
pub struct CaseStarter {
    engine: Arc<dyn PipelineEngine>,
    stop_confirm: Duration,
}

impl CaseStarter {
    pub fn start(&self, spec: &CaseSpec) -> Result<TestCase, RunnerError> {
        let case = TestCase::new(spec.name.clone(), spec.description.clone(), spec.lifetime);
        case.set_stop_confirm(self.stop_confirm);
        case.run(self.engine.clone())?;
        Ok(case)
    }
}
