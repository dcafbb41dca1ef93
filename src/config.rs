//! Configuration module for latency-probe.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::clock::ClockSource;
use crate::probe::DesyncPolicy;
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Event-loop backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    /// mio readiness loop (epoll on Linux, kqueue on macOS)
    #[default]
    Mio,
    /// tokio current-thread runtime
    Tokio,
}

/// Command-line arguments for the probe
#[derive(Parser, Debug)]
#[command(name = "latency-probe")]
#[command(author = "latency-probe authors")]
#[command(version = "0.1.0")]
#[command(about = "Measure TCP round-trip latency against an echo server", long_about = None)]
pub struct CliArgs {
    /// Echo server host name or address
    pub target: Option<String>,

    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Echo server port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Number of probes to send
    #[arg(short = 'n', long)]
    pub count: Option<u64>,

    /// Milliseconds between probes
    #[arg(short, long)]
    pub interval_ms: Option<u64>,

    /// Minimum delay before the first probe, in milliseconds
    #[arg(long)]
    pub initial_delay_ms: Option<u64>,

    /// Random extra delay (0..=jitter) added before the first probe
    #[arg(long)]
    pub jitter_ms: Option<u64>,

    /// Latency above which a diagnostic line is printed
    #[arg(long)]
    pub anomaly_threshold_ms: Option<f64>,

    /// Handling of a stream that loses frame alignment
    #[arg(long, value_enum)]
    pub desync: Option<DesyncPolicy>,

    /// Event-loop backend
    #[arg(long, value_enum)]
    pub runtime: Option<RuntimeType>,

    /// Clock used for timestamps
    #[arg(long, value_enum)]
    pub clock: Option<ClockSource>,

    /// Log level (trace, debug, info, warn, error) [default: info]
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub target: TargetConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Echo endpoint
#[derive(Debug, Deserialize)]
pub struct TargetConfig {
    pub host: Option<String>,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: default_port(),
        }
    }
}

/// Probe schedule and reporting
#[derive(Debug, Deserialize)]
pub struct ProbeConfig {
    #[serde(default = "default_count")]
    pub count: u64,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
    #[serde(default = "default_anomaly_threshold_ms")]
    pub anomaly_threshold_ms: f64,
    #[serde(default)]
    pub desync: DesyncPolicy,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            count: default_count(),
            interval_ms: default_interval_ms(),
            initial_delay_ms: default_initial_delay_ms(),
            jitter_ms: default_jitter_ms(),
            anomaly_threshold_ms: default_anomaly_threshold_ms(),
            desync: DesyncPolicy::default(),
        }
    }
}

/// Backend selection
#[derive(Debug, Deserialize, Default)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub kind: RuntimeType,
    #[serde(default)]
    pub clock: ClockSource,
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_port() -> u16 {
    7000
}

fn default_count() -> u64 {
    1000
}

fn default_interval_ms() -> u64 {
    150
}

fn default_initial_delay_ms() -> u64 {
    5000
}

fn default_jitter_ms() -> u64 {
    3000
}

fn default_anomaly_threshold_ms() -> f64 {
    500.0
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub count: u64,
    pub interval: Duration,
    pub initial_delay: Duration,
    pub jitter: Duration,
    pub anomaly_threshold_ms: f64,
    pub desync: DesyncPolicy,
    pub runtime: RuntimeType,
    pub clock: ClockSource,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    /// Merge CLI args with TOML config (CLI takes precedence) and validate.
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let host = cli
            .target
            .or(toml_config.target.host)
            .ok_or(ConfigError::MissingTarget)?;

        let interval_ms = cli.interval_ms.unwrap_or(toml_config.probe.interval_ms);
        if interval_ms == 0 {
            return Err(ConfigError::Invalid("interval_ms must be greater than 0"));
        }

        let anomaly_threshold_ms = cli
            .anomaly_threshold_ms
            .unwrap_or(toml_config.probe.anomaly_threshold_ms);
        if !anomaly_threshold_ms.is_finite() || anomaly_threshold_ms < 0.0 {
            return Err(ConfigError::Invalid(
                "anomaly_threshold_ms must be a non-negative number",
            ));
        }

        Ok(Config {
            host,
            port: cli.port.unwrap_or(toml_config.target.port),
            count: cli.count.unwrap_or(toml_config.probe.count),
            interval: Duration::from_millis(interval_ms),
            initial_delay: Duration::from_millis(
                cli.initial_delay_ms
                    .unwrap_or(toml_config.probe.initial_delay_ms),
            ),
            jitter: Duration::from_millis(cli.jitter_ms.unwrap_or(toml_config.probe.jitter_ms)),
            anomaly_threshold_ms,
            desync: cli.desync.unwrap_or(toml_config.probe.desync),
            runtime: cli.runtime.unwrap_or(toml_config.runtime.kind),
            clock: cli.clock.unwrap_or(toml_config.runtime.clock),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        })
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    MissingTarget,
    Invalid(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::MissingTarget => {
                write!(f, "No target given (pass a host or set [target] host)")
            }
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> CliArgs {
        CliArgs::try_parse_from(std::iter::once("latency-probe").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.target.host, None);
        assert_eq!(config.target.port, 7000);
        assert_eq!(config.probe.count, 1000);
        assert_eq!(config.probe.interval_ms, 150);
        assert_eq!(config.probe.initial_delay_ms, 5000);
        assert_eq!(config.probe.jitter_ms, 3000);
        assert_eq!(config.probe.anomaly_threshold_ms, 500.0);
        assert_eq!(config.probe.desync, DesyncPolicy::Halt);
        assert_eq!(config.runtime.kind, RuntimeType::Mio);
        assert_eq!(config.runtime.clock, ClockSource::Monotonic);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [target]
            host = "10.0.0.5"
            port = 9000

            [probe]
            count = 50
            interval_ms = 20
            jitter_ms = 0
            anomaly_threshold_ms = 12.5
            desync = "resync"

            [runtime]
            kind = "tokio"
            clock = "realtime"

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.target.host.as_deref(), Some("10.0.0.5"));
        assert_eq!(config.target.port, 9000);
        assert_eq!(config.probe.count, 50);
        assert_eq!(config.probe.interval_ms, 20);
        assert_eq!(config.probe.initial_delay_ms, 5000);
        assert_eq!(config.probe.jitter_ms, 0);
        assert_eq!(config.probe.anomaly_threshold_ms, 12.5);
        assert_eq!(config.probe.desync, DesyncPolicy::Resync);
        assert_eq!(config.runtime.kind, RuntimeType::Tokio);
        assert_eq!(config.runtime.clock, ClockSource::Realtime);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_only() {
        let config = Config::merge(cli(&["echo.local"]), TomlConfig::default()).unwrap();
        assert_eq!(config.host, "echo.local");
        assert_eq!(config.port, 7000);
        assert_eq!(config.count, 1000);
        assert_eq!(config.interval, Duration::from_millis(150));
        assert_eq!(config.initial_delay, Duration::from_millis(5000));
        assert_eq!(config.jitter, Duration::from_millis(3000));
        assert_eq!(config.runtime, RuntimeType::Mio);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_cli_overrides_toml() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [target]
            host = "from-file"
            port = 9000
            [probe]
            count = 50
            [logging]
            level = "warn"
        "#,
        )
        .unwrap();

        let args = cli(&[
            "from-cli",
            "-p",
            "7100",
            "--runtime",
            "tokio",
            "--desync",
            "resync",
            "--log-level",
            "trace",
        ]);
        let config = Config::merge(args, toml_config).unwrap();
        assert_eq!(config.host, "from-cli");
        assert_eq!(config.port, 7100);
        assert_eq!(config.count, 50);
        assert_eq!(config.runtime, RuntimeType::Tokio);
        assert_eq!(config.desync, DesyncPolicy::Resync);
        assert_eq!(config.log_level, "trace");
    }

    #[test]
    fn test_toml_log_level_used_when_cli_omits_it() {
        let toml_config: TomlConfig = toml::from_str("[logging]\nlevel = \"warn\"").unwrap();
        let config = Config::merge(cli(&["h"]), toml_config).unwrap();
        assert_eq!(config.log_level, "warn");
    }

    #[test]
    fn test_explicit_cli_log_level_overrides_toml() {
        let toml_config: TomlConfig = toml::from_str("[logging]\nlevel = \"warn\"").unwrap();
        let config = Config::merge(cli(&["h", "--log-level", "info"]), toml_config).unwrap();
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_missing_target() {
        let err = Config::merge(cli(&[]), TomlConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingTarget));
    }

    #[test]
    fn test_invalid_values() {
        let err = Config::merge(cli(&["h", "-i", "0"]), TomlConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = Config::merge(
            cli(&["h", "--anomaly-threshold-ms=-1"]),
            TomlConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
