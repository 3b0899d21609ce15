//! Configuration loader: CLI flags merged over an optional TOML file.
//!
//! CLI flags always win when both are present; a field missing from both
//! and without a hard-coded default (`brokers`, `command_topic`) aborts
//! startup with [`forwarder_core::error::ConfigError`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use forwarder_core::error::ConfigError;
use forwarder_core::model::StreamSpecWire;
use serde::Deserialize;

const DEFAULT_CONVERSION_THREADS: usize = 4;
const DEFAULT_CONVERSION_QUEUE_SIZE: usize = 1024;
const DEFAULT_MAIN_POLL_INTERVAL_MS: u64 = 10;
const DEFAULT_BROKER_INSTANCES: usize = 2;

/// Command-line arguments for the forwarding engine binary.
#[derive(Parser, Debug, Default)]
#[command(name = "pv-kafka-forwarder")]
#[command(about = "Forwards process-variable updates to a Kafka-like broker")]
struct Cli {
    /// Path to an optional TOML configuration file.
    ///
    /// CLI flags override any value also present in this file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Broker bootstrap server list (e.g. "localhost:9092").
    #[arg(long)]
    brokers: Option<String>,

    /// Number of producer instances in the Broker Client Pool.
    #[arg(long = "broker-instances")]
    broker_instances: Option<usize>,

    /// Topic the Command Listener subscribes to for live reconfiguration.
    #[arg(long = "command-topic")]
    command_topic: Option<String>,

    /// Topic status JSON is published to, if set.
    #[arg(long = "status-topic")]
    status_topic: Option<String>,

    /// Number of Conversion Worker Pool threads.
    #[arg(long = "conversion-threads")]
    conversion_threads: Option<usize>,

    /// Bounded capacity of the conversion task queue.
    #[arg(long = "conversion-queue-size")]
    conversion_queue_size: Option<usize>,

    /// Supervisor main loop tick interval, in milliseconds.
    #[arg(long = "main-poll-interval-ms")]
    main_poll_interval_ms: Option<u64>,

    /// Liveness re-emit period, in milliseconds; 0 or omitted disables it.
    #[arg(long = "period-ms")]
    period_ms: Option<u64>,

    /// Synthetic PV update generation period, in milliseconds; 0 or omitted
    /// disables synthetic mode.
    #[arg(long = "fake-pv-period-ms")]
    fake_pv_period_ms: Option<u64>,

    /// InfluxDB-compatible HTTP endpoint to POST stats to, if set.
    #[arg(long = "influx-url")]
    influx_url: Option<String>,
}

/// On-disk TOML shape; every field optional so it can be partially
/// overridden by CLI flags.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    brokers: Option<String>,
    broker_instances: Option<usize>,
    command_topic: Option<String>,
    status_topic: Option<String>,
    conversion_threads: Option<usize>,
    conversion_queue_size: Option<usize>,
    main_poll_interval_ms: Option<u64>,
    period_ms: Option<u64>,
    fake_pv_period_ms: Option<u64>,
    influx_url: Option<String>,
    #[serde(default)]
    streams: Vec<StreamSpecWire>,
}

/// The fully-resolved, effective configuration handed to `Forwarder::new`.
#[derive(Debug)]
pub struct EffectiveConfig {
    pub brokers: String,
    pub broker_instances: usize,
    pub command_topic: String,
    pub status_topic: Option<String>,
    pub conversion_threads: usize,
    pub conversion_queue_size: usize,
    pub main_poll_interval: Duration,
    pub period_ms: u64,
    pub fake_pv_period_ms: u64,
    pub influx_url: Option<String>,
    pub initial_streams: Vec<forwarder_core::model::StreamSpec>,
}

/// Parse `std::env::args()` and load the effective configuration.
pub fn load_from_env() -> Result<EffectiveConfig, ConfigError> {
    load(Cli::parse())
}

fn load(cli: Cli) -> Result<EffectiveConfig, ConfigError> {
    let file = match &cli.config {
        Some(path) => read_file_config(path)?,
        None => FileConfig::default(),
    };

    let brokers = cli
        .brokers
        .or(file.brokers)
        .ok_or(ConfigError::Missing("brokers"))?;
    let command_topic = cli
        .command_topic
        .or(file.command_topic)
        .ok_or(ConfigError::Missing("command_topic"))?;

    Ok(EffectiveConfig {
        brokers,
        broker_instances: cli
            .broker_instances
            .or(file.broker_instances)
            .unwrap_or(DEFAULT_BROKER_INSTANCES),
        command_topic,
        status_topic: cli.status_topic.or(file.status_topic),
        conversion_threads: cli
            .conversion_threads
            .or(file.conversion_threads)
            .unwrap_or(DEFAULT_CONVERSION_THREADS),
        conversion_queue_size: cli
            .conversion_queue_size
            .or(file.conversion_queue_size)
            .unwrap_or(DEFAULT_CONVERSION_QUEUE_SIZE),
        main_poll_interval: Duration::from_millis(
            cli.main_poll_interval_ms
                .or(file.main_poll_interval_ms)
                .unwrap_or(DEFAULT_MAIN_POLL_INTERVAL_MS),
        ),
        period_ms: cli.period_ms.or(file.period_ms).unwrap_or(0),
        fake_pv_period_ms: cli.fake_pv_period_ms.or(file.fake_pv_period_ms).unwrap_or(0),
        influx_url: cli.influx_url.or(file.influx_url),
        initial_streams: file.streams.into_iter().map(|w| w.into_spec()).collect(),
    })
}

fn read_file_config(path: &Path) -> Result<FileConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_brokers_and_command_topic_is_a_config_error() {
        let cli = Cli::default();
        assert!(load(cli).is_err());
    }

    #[test]
    fn cli_flags_override_file_values() {
        let mut dir = std::env::temp_dir();
        dir.push(format!("forwarder-config-test-{}.toml", std::process::id()));
        std::fs::write(
            &dir,
            "brokers = \"file-broker:9092\"\ncommand_topic = \"file-cmd\"\nconversion_threads = 2\n",
        )
        .unwrap();

        let cli = Cli {
            config: Some(dir.clone()),
            brokers: Some("cli-broker:9092".to_string()),
            conversion_threads: Some(8),
            ..Cli::default()
        };
        let config = load(cli).unwrap();
        assert_eq!(config.brokers, "cli-broker:9092");
        assert_eq!(config.command_topic, "file-cmd");
        assert_eq!(config.conversion_threads, 8);

        let _ = std::fs::remove_file(&dir);
    }

    #[test]
    fn defaults_apply_when_unset() {
        let cli = Cli {
            brokers: Some("b:9092".to_string()),
            command_topic: Some("cmd".to_string()),
            ..Cli::default()
        };
        let config = load(cli).unwrap();
        assert_eq!(config.conversion_threads, DEFAULT_CONVERSION_THREADS);
        assert_eq!(config.broker_instances, DEFAULT_BROKER_INSTANCES);
        assert_eq!(config.period_ms, 0);
        assert_eq!(config.fake_pv_period_ms, 0);
    }
}
