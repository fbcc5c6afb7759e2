// End-to-end pipeline tests: producers → synchronizer → CSV exporter over
// real threads and real files.

use biosync_rs::config::{Config, KeyMap};
use biosync_rs::demo::spawn_sine_producer;
use biosync_rs::export::{CsvExportSink, ExportConfig};
use biosync_rs::queue::sink_channel;
use biosync_rs::runtime::ShutdownFlag;
use biosync_rs::sync::SyncController;
use biosync_rs::types::SyncPayload;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn read_lines(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect()
}

fn base_config() -> Config {
    let mut config = Config::default();
    config.events.event_keymap = KeyMap(vec![("0".into(), "REST".into()), ("1".into(), "TASK".into())]);
    config.ui.plot_decimate_hz = 0.0;
    config
}

fn export_config(dir: &TempDir, lookahead_sec: f64) -> ExportConfig {
    ExportConfig {
        lookahead_sec,
        flush_period_sec: 0.05,
        flush_rows: 0,
        idle_watermark_sec: 0.0,
        signal_csv: true,
        marker_csv: true,
        include_k: true,
        synced_dir: dir.path().join("synced"),
        markers_dir: dir.path().join("markers"),
        initial_event: "REST".into(),
    }
}

/// Two devices, one event, clean export: samples from both devices merge
/// into shared grid rows, the sticky event changes exactly at its bin, and
/// the markers sidecar records the transition.
#[test]
fn two_devices_one_event_clean_export() {
    let dir = TempDir::new().unwrap();
    let delta = 0.1; // coarse grid keeps test jitter inside half a bin

    let sink = CsvExportSink::with_session_id(
        delta,
        vec!["dev_a:chA".into(), "dev_b:chB".into()],
        export_config(&dir, 0.2),
        "s1",
    )
    .unwrap();
    sink.start().unwrap();

    let controller = SyncController::new(&base_config());
    controller.add_sink_queue(sink.sender()).unwrap();
    controller.start_session(delta).unwrap();

    // Both devices report within bin 0; dev_b's own clock is arbitrary.
    controller.enqueue_packet(0.0, "dev_a", vec![("chA".into(), Some(1.0))]);
    controller.enqueue_packet(100.0, "dev_b", vec![("chB".into(), Some(9.0))]);

    // Past half a bin, so the event and the second sample land in bin 1.
    std::thread::sleep(Duration::from_millis(60));
    let (new, prev) = controller.set_event("TASK", "keyboard").unwrap().unwrap();
    assert_eq!((new.as_str(), prev.as_str()), ("TASK", "REST"));
    controller.enqueue_packet(0.1, "dev_a", vec![("chA".into(), Some(2.0))]);

    std::thread::sleep(Duration::from_millis(300));
    controller.stop_session();
    sink.stop();

    let signal = read_lines(sink.signal_path());
    assert_eq!(signal[0], "k,t_q,dev_a:chA,dev_b:chB,spike,event");
    assert_eq!(signal[1], "0,0.00,1.00,9.00,,REST");
    assert_eq!(signal[2], "1,0.10,2.00,,,TASK");
    assert_eq!(signal.len(), 3);

    let markers = read_lines(sink.markers_path());
    assert_eq!(markers[0], "t_q,event,spike,source");
    assert!(markers.contains(&"0.00,REST,,sync".to_string()));
    assert!(markers.contains(&"0.10,TASK,,keyboard".to_string()));
}

/// A spike lands in its signal row's spike column and in the sidecar.
#[test]
fn spike_reaches_both_files() {
    let dir = TempDir::new().unwrap();
    let delta = 0.1;

    let sink = CsvExportSink::with_session_id(
        delta,
        vec!["dev_a:chA".into()],
        export_config(&dir, 0.2),
        "spike",
    )
    .unwrap();
    sink.start().unwrap();

    let controller = SyncController::new(&base_config());
    controller.add_sink_queue(sink.sender()).unwrap();
    controller.start_session(delta).unwrap();

    controller.enqueue_packet(0.0, "dev_a", vec![("chA".into(), Some(1.0))]);
    controller.trigger_spike("SPIKE_Q", "keyboard").unwrap().unwrap();

    std::thread::sleep(Duration::from_millis(200));
    controller.stop_session();
    sink.stop();

    let signal = read_lines(sink.signal_path());
    assert_eq!(signal[1], "0,0.00,1.00,SPIKE_Q,REST");

    let markers = read_lines(sink.markers_path());
    assert!(markers.contains(&"0.00,,SPIKE_Q,keyboard".to_string()));
}

/// Backward device clock mid-session: the anchor resets, the epoch bumps,
/// and the consumer keeps flowing.
#[test]
fn backward_clock_resets_and_continues() {
    let controller = SyncController::new(&base_config());
    let (tx, rx) = sink_channel(0, "capture");
    controller.add_sink_queue(tx).unwrap();
    controller.start_session(0.05).unwrap();

    controller.enqueue_packet(10.0, "dev_a", vec![("ch".into(), Some(1.0))]);
    controller.enqueue_packet(10.05, "dev_a", vec![("ch".into(), Some(2.0))]);
    controller.enqueue_packet(2.0, "dev_a", vec![("ch".into(), Some(3.0))]);
    controller.enqueue_packet(2.05, "dev_a", vec![("ch".into(), Some(4.0))]);

    let mut got = Vec::new();
    while got.len() < 4 {
        match rx.recv_timeout(Duration::from_secs(2)) {
            Ok(p) => got.push(p),
            Err(_) => break,
        }
    }
    assert_eq!(got.len(), 4, "consumer must survive the clock regression");
    assert_eq!(controller.stats().anchor_resets, 1);
    controller.stop_session();
}

/// The event bus broadcasts twice per trigger: once at call time and once
/// replayed by the consumer at the quantized instant.
#[test]
fn event_replay_through_consumer() {
    let controller = SyncController::new(&base_config());
    let immediate = Arc::new(AtomicUsize::new(0));
    let replayed = Arc::new(AtomicUsize::new(0));
    let (im, rep) = (Arc::clone(&immediate), Arc::clone(&replayed));
    controller.event_bus().subscribe(move |notice| {
        match notice.k {
            None => im.fetch_add(1, Ordering::Relaxed),
            Some(_) => rep.fetch_add(1, Ordering::Relaxed),
        };
        Ok(())
    });

    controller.start_session(0.01).unwrap();
    controller.set_event("TASK", "api").unwrap().unwrap();
    std::thread::sleep(Duration::from_millis(200));
    controller.stop_session();

    assert_eq!(immediate.load(Ordering::Relaxed), 1);
    assert_eq!(replayed.load(Ordering::Relaxed), 1);
}

/// Whole pipeline with synthetic producers: sine devices stream through the
/// synchronizer into the exporter and produce a plausible session file.
#[test]
fn sine_producers_to_csv() {
    let dir = TempDir::new().unwrap();
    let toml = r#"
[ui]
PLOT_DECIMATE_HZ = 0.0

[[devices]]
KIND = "demo_rand"

[[devices.INSTANCES]]
ENABLED = true
DEVICE_NAME = "demo_1"
FS = 50.0
CHANNELS = [["ch_1", true], ["ch_2", true]]

[devices.FILTERS.ch_1]
BANDPASS_ENABLE = true
BANDPASS_ORDER = 2
LOW_HZ = 0.5
HIGH_HZ = 10.0
"#;
    let config = Config::from_toml_str(toml, "test").unwrap();
    let fs_max = biosync_rs::compute_fs_max(&config);
    assert_eq!(fs_max, 50.0);
    let delta = 1.0 / fs_max;

    let schema = biosync_rs::collect_known_channels(&config);
    assert_eq!(schema, vec!["demo_1:ch_1", "demo_1:ch_2"]);

    let sink =
        CsvExportSink::with_session_id(delta, schema, export_config(&dir, 0.1), "demo").unwrap();
    sink.start().unwrap();

    let controller = Arc::new(SyncController::new(&config));
    controller.add_sink_queue(sink.sender()).unwrap();
    controller.start_session(delta).unwrap();

    let shutdown = ShutdownFlag::new();
    let kind = &config.devices[0];
    let producer = spawn_sine_producer(
        Arc::clone(&controller),
        kind,
        &kind.instances[0],
        shutdown.clone(),
    )
    .unwrap()
    .unwrap();

    std::thread::sleep(Duration::from_millis(500));
    shutdown.request();
    producer.join();
    std::thread::sleep(Duration::from_millis(100));
    controller.stop_session();
    sink.stop();

    let signal = read_lines(sink.signal_path());
    assert_eq!(signal[0], "k,t_q,demo_1:ch_1,demo_1:ch_2,spike,event");
    // ~25 rows in 500 ms at 50 Hz; scheduling slack allowed.
    assert!(signal.len() > 10, "expected streamed rows, got {}", signal.len());

    // Every data row ends with the default sticky event and parses back.
    for row in &signal[1..] {
        assert!(row.ends_with(",REST"));
        let cells: Vec<&str> = row.split(',').collect();
        assert_eq!(cells.len(), 6);
        let _: f64 = cells[1].parse().unwrap();
    }

    let stats = controller.stats();
    assert!(stats.packets_consumed > 10);
    assert_eq!(stats.ingress_dropped, 0);
}

/// Plot sinks observe decimated samples while markers always pass through,
/// end to end.
#[test]
fn plot_queue_protocol_end_to_end() {
    let mut config = base_config();
    config.ui.plot_decimate_hz = 5.0; // with delta 0.1 → bin width 2

    let controller = SyncController::new(&config);
    let (plot_tx, plot_rx) = sink_channel(0, "plot");
    controller.add_plot_sink_queue(plot_tx).unwrap();
    controller.start_session(0.1).unwrap();

    for i in 0..6 {
        controller.enqueue_packet(i as f64 * 0.1, "dev_a", vec![("ch".into(), Some(i as f64))]);
    }
    controller.set_event("TASK", "api").unwrap().unwrap();

    std::thread::sleep(Duration::from_millis(300));
    controller.stop_session();

    let mut sample_ks = Vec::new();
    let mut events = 0;
    while let Ok(p) = plot_rx.try_recv() {
        match p {
            SyncPayload::Sample { k, .. } => sample_ks.push(k),
            SyncPayload::Event { .. } => events += 1,
            SyncPayload::Spike { .. } => {}
        }
    }
    assert_eq!(sample_ks, vec![0, 2, 4]);
    assert_eq!(events, 1);
}
