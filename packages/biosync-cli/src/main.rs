use anyhow::Context;
use biosync_rs::config::Config;
use biosync_rs::demo::{spawn_event_demo, spawn_sine_producer, spawn_spike_demo};
use biosync_rs::export::{CsvExportSink, ExportConfig};
use biosync_rs::plot::PlotStatsSink;
use biosync_rs::runtime::{stop_producers, Producer, ShutdownFlag};
use biosync_rs::sync::SyncController;
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod cli;

use cli::Cli;

const DEFAULT_CONFIG: &str = include_str!("../config/default.toml");

const EXIT_OK: i32 = 0;
const EXIT_STARTUP_FAILED: i32 = 1;
const EXIT_DEVICE_FAILED: i32 = 2;

/// Plot queue depth; overflow drops samples for the plot sink only.
const PLOT_QUEUE_CAPACITY: i64 = 4096;

fn main() {
    let cli = Cli::parse();

    let default_filter = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("{e:#}");
            std::process::exit(EXIT_STARTUP_FAILED);
        }
    };

    std::process::exit(run(cli, config));
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    match &cli.config {
        Some(path) => {
            info!(path = %path.display(), "loading configuration");
            Config::from_path(path).with_context(|| format!("loading {}", path.display()))
        }
        None => {
            info!("no --config given, using built-in demo configuration");
            Config::from_toml_str(DEFAULT_CONFIG, "built-in").context("built-in config")
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn run(cli: Cli, config: Config) -> i32 {
    let fs_max = biosync_rs::compute_fs_max(&config);
    let delta = 1.0 / fs_max;
    info!(fs_max, delta, "session grid derived");

    let controller = Arc::new(SyncController::new(&config));

    // Sinks register before the session starts.
    let plot_sink = if config.ui.plot_enable {
        let sink = PlotStatsSink::new(PLOT_QUEUE_CAPACITY);
        if let Err(e) = sink.start() {
            error!(error = %e, "failed to start plot sink");
            return EXIT_STARTUP_FAILED;
        }
        if let Err(e) = controller.add_plot_sink_queue(sink.sender()) {
            error!(error = %e, "failed to register plot sink");
            return EXIT_STARTUP_FAILED;
        }
        Some(sink)
    } else {
        None
    };

    let known_channels = biosync_rs::collect_known_channels(&config);
    if known_channels.is_empty() {
        warn!("no exportable channels found, continuing without export");
    }
    let export_sink = if !known_channels.is_empty() && config.export.export_enable {
        match CsvExportSink::new(delta, known_channels, ExportConfig::from_config(&config))
            .and_then(|sink| sink.start().map(|()| sink))
        {
            Ok(sink) => {
                if let Err(e) = controller.add_sink_queue(sink.sender()) {
                    error!(error = %e, "failed to register export sink");
                    return EXIT_STARTUP_FAILED;
                }
                Some(sink)
            }
            Err(e) => {
                error!(error = %e, "failed to start export sink");
                return EXIT_STARTUP_FAILED;
            }
        }
    } else {
        None
    };

    if let Err(e) = controller.start_session(delta) {
        error!(error = %e, "failed to start sync session");
        return EXIT_STARTUP_FAILED;
    }

    let shutdown = ShutdownFlag::new();
    let mut producers: Vec<Producer> = Vec::new();

    for kind in &config.devices {
        for instance in kind.instances.iter().filter(|i| i.enabled) {
            match kind.kind.as_str() {
                "demo_rand" => {
                    match spawn_sine_producer(
                        Arc::clone(&controller),
                        kind,
                        instance,
                        shutdown.clone(),
                    ) {
                        Ok(Some(producer)) => producers.push(producer),
                        Ok(None) => {}
                        Err(e) => {
                            error!(
                                device = %instance.device_name,
                                error = %e,
                                "device startup failed"
                            );
                            shutdown.request();
                            controller.stop_session();
                            return EXIT_DEVICE_FAILED;
                        }
                    }
                }
                other => {
                    // Hardware transports are wired in externally; nothing
                    // built in answers to this kind.
                    warn!(kind = other, device = %instance.device_name, "unknown device kind, skipping");
                }
            }
        }
    }

    for generator in config.marker_generators.iter().filter(|g| g.enabled) {
        let spawned = match generator.kind.as_str() {
            "event_demo" => {
                let labels: Vec<String> = config
                    .events
                    .event_keymap
                    .labels()
                    .skip(1) // first entry is the default, not a target
                    .map(str::to_string)
                    .collect();
                spawn_event_demo(
                    Arc::clone(&controller),
                    generator.generator_name.clone(),
                    generator.interval_s,
                    labels,
                    shutdown.clone(),
                )
                .map(Some)
            }
            "spike_demo" => {
                let labels: Vec<String> =
                    config.spikes.spike_keymap.labels().map(str::to_string).collect();
                spawn_spike_demo(
                    Arc::clone(&controller),
                    generator.generator_name.clone(),
                    generator.interval_s,
                    labels,
                    shutdown.clone(),
                )
                .map(Some)
            }
            other => {
                warn!(kind = other, "unknown marker generator kind, skipping");
                Ok(None)
            }
        };
        match spawned {
            Ok(Some(producer)) => producers.push(producer),
            Ok(None) => {}
            Err(e) => {
                error!(generator = %generator.generator_name, error = %e, "generator startup failed");
                shutdown.request();
                controller.stop_session();
                return EXIT_DEVICE_FAILED;
            }
        }
    }

    info!(producers = producers.len(), "acquisition running, Ctrl-C to stop");

    let run_for = async {
        match cli.duration {
            Some(seconds) => tokio::time::sleep(std::time::Duration::from_secs_f64(seconds)).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupt received, shutting down"),
        _ = run_for => info!("configured duration elapsed, shutting down"),
    }

    // Producers first so the queue quiesces, then the session, then the
    // sinks so buffered rows are committed.
    stop_producers(producers, &shutdown);
    let stats = controller.stats();
    controller.stop_session();
    if let Some(sink) = export_sink {
        sink.stop();
    }
    if let Some(sink) = plot_sink {
        sink.stop();
    }

    info!(
        consumed = stats.packets_consumed,
        ingress_dropped = stats.ingress_dropped,
        sink_dropped = stats.sink_dropped,
        anchor_resets = stats.anchor_resets,
        "session summary"
    );
    EXIT_OK
}
