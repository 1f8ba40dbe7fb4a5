// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use clap::{Parser, ValueEnum};
use meter_ingest::{
    config::AppConfig,
    csv_sink::CsvSink,
    influx_sink::InfluxSink,
    ingest::IngestLoop,
    sink::{ConsoleSink, Sink},
};
use std::env;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::{filter, EnvFilter};

/// MQTT subscriber for the ESP32 load meter (print / csv / influx).
#[derive(Parser)]
#[command(name = "meter-ingestd", version, about)]
struct Cli {
    /// Which sink to run with.
    #[arg(value_enum)]
    mode: Mode,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    /// Print every accepted message to stdout (debugging).
    Print,
    /// Append normalized rows to a CSV file.
    Csv,
    /// Write normalized points to InfluxDB 2.x.
    Influx,
}

fn die(msg: &str) -> ! {
    // Configuration can be fatal before the logging pipeline is installed;
    // fall back to stderr so the diagnostic is never lost.
    if tracing::dispatcher::has_been_set() {
        error!("{msg}");
    } else {
        eprintln!("meter-ingestd: {msg}");
    }
    std::process::exit(1)
}

/// Filter directives for the given level, with the chatty transport crates
/// silenced.
fn build_env_filter(log_level: &str) -> Result<EnvFilter, filter::ParseError> {
    EnvFilter::try_new(format!("rumqttc=off,hyper=off,rustls=off,{log_level}"))
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = env::var("LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());
    let env_filter = match build_env_filter(&log_level) {
        Ok(filter) => filter,
        Err(e) => die(&format!("invalid LOG_LEVEL '{log_level}': {e}")),
    };

    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(env_filter)
        .with_level(true)
        .with_target(true)
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("logging subsystem enabled");

    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => die(&format!("{e}")),
    };

    // Fatal configuration problems (missing secrets included) surface
    // here, before any connection attempt.
    let sink: Box<dyn Sink> = match cli.mode {
        Mode::Print => Box::new(ConsoleSink),
        Mode::Csv => match CsvSink::new(&config.csv.path, config.max_ct) {
            Ok(sink) => Box::new(sink),
            Err(e) => die(&format!("cannot open csv sink: {e}")),
        },
        Mode::Influx => match InfluxSink::new(&config.influx, config.max_ct) {
            Ok(sink) => Box::new(sink),
            Err(e) => die(&format!("{e}")),
        },
    };

    info!(
        "mqtt: {}:{} sub='{}' mode={:?}",
        config.mqtt.host,
        config.mqtt.port,
        config.mqtt.subscribe_topic(),
        cli.mode
    );

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    // Runs until the cancellation token fires, then disconnects and
    // closes the sink. Steady-state errors never reach this point.
    IngestLoop::new(&config.mqtt, sink, cancel).run().await;

    info!("shutdown complete");
}

/// Cancel the token on SIGINT or SIGTERM. The token is cancelled exactly
/// once; further signals are ignored rather than re-entering shutdown.
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(e) => {
                    error!("failed to install SIGTERM handler: {e}");
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }

        info!("shutdown signal received");
        cancel.cancel();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_env_filter_accepts_plain_levels() {
        for level in ["trace", "debug", "info", "warn", "error"] {
            assert!(build_env_filter(level).is_ok(), "level: {level}");
        }
    }

    #[test]
    fn test_build_env_filter_rejects_malformed_directives() {
        assert!(build_env_filter("info=extra=junk").is_err());
    }
}
