//! Sequential suite runner

use std::collections::BTreeSet;
use std::fmt;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::time::Instant;
use tracing::info;
use uuid::Uuid;

use super::catalog;
use super::context::HarnessContext;
use super::error::ScenarioError;
use super::report::SuiteReport;
use super::scheduler::Scenario;

/// Scenario categories that can be switched off
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Category {
    Controller,
    Video,
    Audio,
    UiIntegration,
    Switching,
    RandomConnection,
    Fuzz,
    CheckingTimestamps,
}

impl Category {
    /// Every category in suite order
    pub const ALL: [Category; 8] = [
        Category::Controller,
        Category::Video,
        Category::Audio,
        Category::UiIntegration,
        Category::Switching,
        Category::RandomConnection,
        Category::Fuzz,
        Category::CheckingTimestamps,
    ];
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Category::Controller => "controller",
            Category::Video => "video",
            Category::Audio => "audio",
            Category::UiIntegration => "ui-integration",
            Category::Switching => "switching",
            Category::RandomConnection => "random-connection",
            Category::Fuzz => "fuzz",
            Category::CheckingTimestamps => "checking-timestamps",
        };
        f.write_str(name)
    }
}

/// Which categories run and which processes are managed elsewhere
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SuiteOptions {
    pub disabled: BTreeSet<Category>,
    /// The server is already running; do not launch or stop it
    pub external_server: bool,
    /// The UI is already running; do not launch or stop it
    pub external_ui: bool,
}

impl SuiteOptions {
    pub fn disable(mut self, category: Category) -> Self {
        self.disabled.insert(category);
        self
    }

    pub fn enabled(&self, category: Category) -> bool {
        !self.disabled.contains(&category)
    }
}

/// Build the catalog for the enabled categories and run it
pub async fn run_suite(ctx: &mut HarnessContext) -> Result<SuiteReport, ScenarioError> {
    let mut rng = StdRng::from_entropy();
    let scenarios = catalog::suite(ctx.config(), ctx.options(), &mut rng)?;
    Ok(run_scenarios(ctx, &scenarios).await)
}

/// Run scenarios one after another. Each is fully torn down before the
/// next begins.
pub async fn run_scenarios(ctx: &mut HarnessContext, scenarios: &[Scenario]) -> SuiteReport {
    let started = Instant::now();
    let mut report = SuiteReport::new(Uuid::new_v4());
    info!(
        "Suite run {}: {} scenarios, engine {}",
        report.run_id,
        scenarios.len(),
        ctx.engine().name()
    );

    for scenario in scenarios {
        info!("========== scenario {}", scenario.name());
        let result = scenario.execute(ctx).await;
        report.scenarios.push(result);
    }

    report.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_enabled_by_default() {
        let options = SuiteOptions::default();
        assert!(Category::ALL.iter().all(|c| options.enabled(*c)));

        let options = options.disable(Category::Fuzz);
        assert!(!options.enabled(Category::Fuzz));
        assert!(options.enabled(Category::Video));
    }

    #[test]
    fn test_category_names() {
        assert_eq!(Category::UiIntegration.to_string(), "ui-integration");
        assert_eq!(Category::CheckingTimestamps.to_string(), "checking-timestamps");
    }
}
