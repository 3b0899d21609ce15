//! # pv-kafka-forwarder
//!
//! Main binary for the PV-to-broker forwarding engine: loads configuration,
//! builds the `Forwarder` supervisor, installs signal handlers, and runs the
//! blocking main loop until `exit`, `SIGINT`, or `SIGTERM`.
//!
//! ## Usage
//!
//! ```bash
//! pv-kafka-forwarder --brokers localhost:9092 --command-topic commands
//! RUST_LOG=debug pv-kafka-forwarder --config forwarder.toml
//! ```

use std::process::ExitCode;
use std::sync::Arc;

use forwarder_core::forwarder::ForwarderConfig;
use forwarder_core::metrics::{HttpStatsSink, StatsSink};
use forwarder_core::Forwarder;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const EXIT_OK: u8 = 0;
const EXIT_CONFIG_ERROR: u8 = 1;
const EXIT_RUNTIME_ERROR: u8 = 2;

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match forwarder_config::load_from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "configuration error");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    let stats_sink: Arc<dyn StatsSink> = match &config.influx_url {
        Some(url) => Arc::new(HttpStatsSink::new(url.clone())),
        None => Arc::new(forwarder_core::metrics::NullSink),
    };

    let forwarder_config = ForwarderConfig {
        brokers: config.brokers,
        broker_instances: config.broker_instances,
        command_topic: config.command_topic,
        status_topic: config.status_topic,
        conversion_threads: config.conversion_threads,
        conversion_queue_size: config.conversion_queue_size,
        main_poll_interval: config.main_poll_interval,
        period_ms: config.period_ms,
        fake_pv_period_ms: config.fake_pv_period_ms,
        initial_streams: config.initial_streams,
    };

    // No concrete PV transport is wired in (pva/ca are external per spec);
    // running without `--fake-pv-period-ms` set means every `add` command
    // targeting a live channel will fail with `ClientInit`, logged per spec,
    // without aborting the supervisor.
    let forwarder = match Forwarder::new(forwarder_config, None, Some(stats_sink)) {
        Ok(forwarder) => Arc::new(forwarder),
        Err(err) => {
            error!(error = %err, "failed to start forwarder");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    let signal_forwarder = Arc::clone(&forwarder);
    if let Err(err) = ctrlc::set_handler(move || {
        info!("signal received, stopping");
        signal_forwarder.stop_forwarding_due_to_signal();
    }) {
        error!(error = %err, "failed to install signal handler");
        return ExitCode::from(EXIT_CONFIG_ERROR);
    }

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        forwarder.forward_to_broker();
    }));

    match result {
        Ok(()) => {
            info!("forwarder stopped normally");
            ExitCode::from(EXIT_OK)
        }
        Err(_) => {
            error!("forwarder main loop panicked");
            ExitCode::from(EXIT_RUNTIME_ERROR)
        }
    }
}
