//! Harness configuration
//!
//! Every value has a default matching the conventional server setup, so the
//! configuration file is optional and may set only what differs:
//!
//! ```toml
//! engine = "simulated"
//! grace_ms = 500
//!
//! [server]
//! program = "./target/debug/mock-switch-server"
//!
//! [timings]
//! delay_scale = 0.25
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors loading or validating a configuration file
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Which engine runs test pipelines
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EngineKind {
    /// `gst-launch-1.0` child processes
    #[default]
    GstLaunch,
    /// In-process simulation with real TCP connections
    Simulated,
}

impl std::str::FromStr for EngineKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gst-launch" => Ok(EngineKind::GstLaunch),
            "simulated" => Ok(EngineKind::Simulated),
            other => Err(format!(
                "Unknown engine: {}. Valid values are gst-launch, simulated",
                other
            )),
        }
    }
}

/// An external program and its arguments
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl ProcessConfig {
    fn server() -> Self {
        Self {
            program: "./tools/gst-switch-srv".to_string(),
            args: vec!["-v".to_string(), "--gst-debug-no-color".to_string()],
        }
    }

    fn ui() -> Self {
        Self {
            program: "./tools/gst-switch-ui".to_string(),
            args: vec!["-v".to_string(), "--gst-debug-no-color".to_string()],
        }
    }

    fn gst_launch() -> Self {
        Self {
            program: "gst-launch-1.0".to_string(),
            args: vec!["-e".to_string()],
        }
    }

    fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }
}

/// Ports of the switch server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortConfig {
    pub video: u16,
    pub audio: u16,
    pub compose: u16,
    pub encode: u16,
    /// First preview port; later previews count up from here
    pub preview_base: u16,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            video: 3000,
            audio: 4000,
            compose: 3001,
            encode: 3002,
            preview_base: 3003,
        }
    }
}

impl PortConfig {
    /// Port of the `n`th preview (1-based)
    pub fn preview(&self, n: u16) -> u16 {
        self.preview_base.saturating_add(n.saturating_sub(1))
    }
}

/// Resolution of the synthetic video sources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    pub width: u32,
    pub height: u32,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
        }
    }
}

/// Element names used to render received streams
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    pub video: String,
    pub audio: String,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            video: "xvimagesink".to_string(),
            audio: "alsasink".to_string(),
        }
    }
}

/// Scenario lifetimes in seconds and the random-connection parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timings {
    pub controller_secs: u64,
    pub video_secs: u64,
    pub audio_secs: u64,
    pub ui_integrated_secs: u64,
    pub switching_secs: u64,
    pub timestamps_secs: u64,
    pub fuzz_secs: u64,
    pub fuzz_cases: usize,
    /// Background audio source kept alive by the first random worker
    pub random_anchor_secs: u64,
    /// Rounds each random worker runs
    pub random_rounds: usize,
    pub random_long_video_secs: u64,
    pub random_long_audio_secs: u64,
    pub random_short_video_secs: u64,
    pub random_short_audio_secs: u64,
    /// Multiplier applied to every warm-up and stagger delay
    pub delay_scale: f64,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            controller_secs: 10,
            video_secs: 10,
            audio_secs: 20,
            ui_integrated_secs: 10,
            switching_secs: 180,
            timestamps_secs: 300,
            fuzz_secs: 5,
            fuzz_cases: 8,
            random_anchor_secs: 102,
            random_rounds: 9,
            random_long_video_secs: 5,
            random_long_audio_secs: 7,
            random_short_video_secs: 2,
            random_short_audio_secs: 3,
            delay_scale: 1.0,
        }
    }
}

/// Largest accepted `delay_scale`
pub const MAX_DELAY_SCALE: f64 = 100.0;

impl Timings {
    /// A fixed delay of `millis`, scaled. Saturates instead of overflowing
    /// for scales that never went through validation.
    pub fn delay(&self, millis: u64) -> Duration {
        let secs = Duration::from_millis(millis).as_secs_f64() * self.delay_scale;
        Duration::try_from_secs_f64(secs).unwrap_or(if secs > 0.0 {
            Duration::MAX
        } else {
            Duration::ZERO
        })
    }
}

/// Complete harness configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub server: ProcessConfig,
    pub ui: ProcessConfig,
    /// Recording written by the server, relative to its working directory
    pub record_path: PathBuf,
    /// Directory receiving `test-server-<pid>.log` files
    pub log_dir: PathBuf,
    pub control_url: String,
    pub host: String,
    pub ports: PortConfig,
    pub video: VideoConfig,
    pub sinks: SinkConfig,
    pub timings: Timings,
    pub grace_ms: u64,
    pub stop_confirm_ms: u64,
    pub engine: EngineKind,
    pub gst_launch: ProcessConfig,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            server: ProcessConfig::server(),
            ui: ProcessConfig::ui(),
            record_path: PathBuf::from("test-recording.data"),
            log_dir: PathBuf::from("."),
            control_url: "ws://127.0.0.1:5000".to_string(),
            host: "127.0.0.1".to_string(),
            ports: PortConfig::default(),
            video: VideoConfig::default(),
            sinks: SinkConfig::default(),
            timings: Timings::default(),
            grace_ms: 2000,
            stop_confirm_ms: 10_000,
            engine: EngineKind::default(),
            gst_launch: ProcessConfig::gst_launch(),
        }
    }
}

impl HarnessConfig {
    /// Load and validate a TOML configuration file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: HarnessConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.program.is_empty() || self.ui.program.is_empty() {
            return Err(ConfigError::Invalid("program paths must not be empty".to_string()));
        }

        if !self.control_url.starts_with("ws://") && !self.control_url.starts_with("wss://") {
            return Err(ConfigError::Invalid(format!(
                "control URL {} must start with ws:// or wss://",
                self.control_url
            )));
        }

        let ports = [
            ("video", self.ports.video),
            ("audio", self.ports.audio),
            ("compose", self.ports.compose),
            ("encode", self.ports.encode),
            ("preview_base", self.ports.preview_base),
        ];
        if let Some((name, _)) = ports.iter().find(|(_, port)| *port == 0) {
            return Err(ConfigError::Invalid(format!("{} port must not be 0", name)));
        }

        if self.video.width == 0 || self.video.height == 0 {
            return Err(ConfigError::Invalid(format!(
                "video resolution {}x{} must be positive",
                self.video.width, self.video.height
            )));
        }

        let scale = self.timings.delay_scale;
        if !scale.is_finite() || !(0.0..=MAX_DELAY_SCALE).contains(&scale) {
            return Err(ConfigError::Invalid(format!(
                "delay_scale {} must be between 0 and {}",
                scale, MAX_DELAY_SCALE
            )));
        }

        if self.record_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("record_path must not be empty".to_string()));
        }

        Ok(())
    }

    /// Server command line, recording to `record_path`
    pub fn server_argv(&self) -> Vec<String> {
        let mut argv = self.server.argv();
        argv.push(format!("--record={}", self.record_path.display()));
        argv
    }

    pub fn ui_argv(&self) -> Vec<String> {
        self.ui.argv()
    }

    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    pub fn stop_confirm(&self) -> Duration {
        Duration::from_millis(self.stop_confirm_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_argv() {
        let config = HarnessConfig::default();
        assert_eq!(
            config.server_argv(),
            vec![
                "./tools/gst-switch-srv",
                "-v",
                "--gst-debug-no-color",
                "--record=test-recording.data"
            ]
        );
        assert_eq!(
            config.ui_argv(),
            vec!["./tools/gst-switch-ui", "-v", "--gst-debug-no-color"]
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = HarnessConfig::from_toml(
            r#"
            engine = "simulated"
            grace_ms = 100

            [ports]
            video = 13000

            [timings]
            delay_scale = 0.5
            "#,
        )
        .unwrap();

        assert_eq!(config.engine, EngineKind::Simulated);
        assert_eq!(config.grace(), Duration::from_millis(100));
        assert_eq!(config.ports.video, 13000);
        assert_eq!(config.ports.compose, 3001);
        assert_eq!(config.timings.delay(2000), Duration::from_secs(1));
        assert_eq!(config.timings.switching_secs, 180);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(HarnessConfig::from_toml("control_url = \"http://localhost\"").is_err());
        assert!(HarnessConfig::from_toml("[ports]\ncompose = 0").is_err());
        assert!(HarnessConfig::from_toml("[video]\nwidth = 0").is_err());
        assert!(HarnessConfig::from_toml("[timings]\ndelay_scale = -1.0").is_err());
        assert!(HarnessConfig::from_toml("[timings]\ndelay_scale = 1e300").is_err());
        assert!(HarnessConfig::from_toml("[timings]\ndelay_scale = 100.0").is_ok());
        assert!(matches!(
            HarnessConfig::from_toml("grace_ms = \"soon\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_huge_delay_scale_saturates() {
        let timings = Timings {
            delay_scale: 1e300,
            ..Timings::default()
        };
        assert_eq!(timings.delay(3000), Duration::MAX);

        let timings = Timings {
            delay_scale: f64::NAN,
            ..Timings::default()
        };
        assert_eq!(timings.delay(3000), Duration::ZERO);
        assert_eq!(Timings::default().delay(1500), Duration::from_millis(1500));
    }

    #[test]
    fn test_preview_ports_count_up() {
        let ports = PortConfig::default();
        assert_eq!(ports.preview(1), 3003);
        assert_eq!(ports.preview(3), 3005);
    }

    #[test]
    fn test_engine_from_str() {
        assert_eq!("simulated".parse::<EngineKind>(), Ok(EngineKind::Simulated));
        assert!("gstreamer".parse::<EngineKind>().is_err());
    }
}
