//! switch-harness - Integration tests for a media switching server

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use switch_harness::config::{EngineKind, HarnessConfig};
use switch_harness::scenario::{run_suite, Category, HarnessContext, SuiteOptions};

#[derive(Parser)]
#[command(name = "switch-harness")]
#[command(about = "Integration tests for a media switching server")]
#[command(version)]
struct Cli {
    /// Disable testing controller
    #[arg(long)]
    disable_test_controller: bool,

    /// Disable testing video
    #[arg(long)]
    disable_test_video: bool,

    /// Disable testing audio
    #[arg(long)]
    disable_test_audio: bool,

    /// Disable testing UI integration
    #[arg(long)]
    disable_test_ui_integration: bool,

    /// Disable testing random connection
    #[arg(long)]
    disable_test_random_connection: bool,

    /// Disable testing switching
    #[arg(long)]
    disable_test_switching: bool,

    /// Disable testing fuzz input
    #[arg(long)]
    disable_test_fuzz_ui: bool,

    /// Disable testing checking timestamps
    #[arg(long)]
    disable_test_checking_timestamps: bool,

    /// Test a server that is already running
    #[arg(long)]
    test_external_server: bool,

    /// Test with a UI that is already running
    #[arg(long)]
    test_external_ui: bool,

    /// Configuration file (TOML)
    #[arg(short, long, env = "SWITCH_HARNESS_CONFIG")]
    config: Option<PathBuf>,

    /// Pipeline engine: gst-launch or simulated
    #[arg(long)]
    engine: Option<EngineKind>,

    /// Write the suite report as JSON to this file
    #[arg(long)]
    report: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn options(&self) -> SuiteOptions {
        let toggles = [
            (self.disable_test_controller, Category::Controller),
            (self.disable_test_video, Category::Video),
            (self.disable_test_audio, Category::Audio),
            (self.disable_test_ui_integration, Category::UiIntegration),
            (self.disable_test_random_connection, Category::RandomConnection),
            (self.disable_test_switching, Category::Switching),
            (self.disable_test_fuzz_ui, Category::Fuzz),
            (self.disable_test_checking_timestamps, Category::CheckingTimestamps),
        ];
        SuiteOptions {
            disabled: toggles
                .into_iter()
                .filter(|(disabled, _)| *disabled)
                .map(|(_, category)| category)
                .collect(),
            external_server: self.test_external_server,
            external_ui: self.test_external_ui,
        }
    }
}

fn setup_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let mut config = match &cli.config {
        Some(path) => HarnessConfig::load(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => HarnessConfig::default(),
    };
    if let Some(engine) = cli.engine {
        config.engine = engine;
    }

    let options = cli.options();
    for category in &options.disabled {
        info!("Category {} disabled", category);
    }

    let mut ctx = HarnessContext::new(config, options);
    let report = run_suite(&mut ctx)
        .await
        .context("Failed to build the scenario catalog")?;

    print!("{}", report.summary());

    if let Some(path) = &cli.report {
        let json = report.to_json().context("Failed to serialize report")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write report to {}", path.display()))?;
        info!("Report written to {}", path.display());
    }

    for scenario in report.failed() {
        error!(
            "Scenario {} failed with {} errors",
            scenario.name, scenario.error_count
        );
    }

    Ok(ExitCode::from(report.exit_code()))
}
