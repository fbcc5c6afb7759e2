//! Synchronizer: bounded ingestion, per-device anchoring, grid quantization,
//! and fan-out to registered sinks.
//!
//! A single consumer thread drains the ingestion queue, projects each
//! device's clock onto the session grid through its anchor, and pushes
//! tagged payloads to every registered sink with non-blocking puts. Event
//! and spike triggers are quantized at call time and routed through the
//! same queue, so they interleave with samples in arrival order.

use crate::config::Config;
use crate::error::SyncError;
use crate::events::EventBus;
use crate::queue::{IngressQueue, SinkSender};
use crate::spikes::SpikeBus;
use crate::timebase::{self, Timebase};
use crate::types::{SamplePacket, SyncPayload, SyncStats};
use crossbeam_channel::RecvTimeoutError;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Consumer wake-up interval; keeps stop latency bounded.
const CONSUMER_POLL: Duration = Duration::from_millis(200);

/// In-band queue item. Markers travel through the same queue as samples so
/// downstream sinks observe them in arrival order.
enum Ingress {
    Packet(SamplePacket),
    Event {
        k: i64,
        t_q: f64,
        label: String,
        prev: String,
        source: String,
    },
    Spike {
        k: i64,
        t_q: f64,
        label: String,
        source: String,
    },
    Shutdown,
}

/// Immutable per-session timing shared between trigger callers and the
/// consumer thread.
struct SessionTiming {
    epoch: Instant,
    delta: f64,
    decimals: u32,
}

pub struct SyncController {
    queue: Arc<IngressQueue<Ingress>>,
    timing: RwLock<Option<Arc<SessionTiming>>>,
    started: AtomicBool,
    stop: Arc<AtomicBool>,
    consumer: Mutex<Option<JoinHandle<()>>>,
    sinks: Mutex<Vec<SinkSender<SyncPayload>>>,
    plot_sinks: Mutex<Vec<SinkSender<SyncPayload>>>,
    event_bus: Arc<EventBus>,
    spike_bus: Arc<SpikeBus>,
    plot_decimate_hz: f64,
    packets_consumed: Arc<AtomicU64>,
    anchor_resets: Arc<AtomicU64>,
}

impl SyncController {
    pub fn new(config: &Config) -> Self {
        let event_bus = Arc::new(EventBus::new(
            config.events.event_keymap.clone(),
            config.events.enable_triggers,
        ));
        let spike_bus = Arc::new(SpikeBus::new(
            config.spikes.spike_keymap.clone(),
            config.spikes.enable_triggers,
        ));
        Self {
            queue: Arc::new(IngressQueue::new(config.sync.max_queue)),
            timing: RwLock::new(None),
            started: AtomicBool::new(false),
            stop: Arc::new(AtomicBool::new(false)),
            consumer: Mutex::new(None),
            sinks: Mutex::new(Vec::new()),
            plot_sinks: Mutex::new(Vec::new()),
            event_bus,
            spike_bus,
            plot_decimate_hz: config.ui.plot_decimate_hz,
            packets_consumed: Arc::new(AtomicU64::new(0)),
            anchor_resets: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn spike_bus(&self) -> &Arc<SpikeBus> {
        &self.spike_bus
    }

    // ---- sink registration ------------------------------------------------

    /// Register a full-rate sink. Only valid between sessions; registering
    /// the same queue twice has the same effect as registering it once.
    pub fn add_sink_queue(&self, sender: SinkSender<SyncPayload>) -> Result<(), SyncError> {
        self.register(&self.sinks, sender, "full-rate")
    }

    /// Register a plot sink; samples are decimated, markers pass through.
    pub fn add_plot_sink_queue(&self, sender: SinkSender<SyncPayload>) -> Result<(), SyncError> {
        self.register(&self.plot_sinks, sender, "plot")
    }

    fn register(
        &self,
        slot: &Mutex<Vec<SinkSender<SyncPayload>>>,
        sender: SinkSender<SyncPayload>,
        kind: &str,
    ) -> Result<(), SyncError> {
        if self.started.load(Ordering::Acquire) {
            return Err(SyncError::SessionActive);
        }
        let mut sinks = slot.lock();
        if sinks.iter().any(|s| s.same_queue(&sender)) {
            return Ok(());
        }
        sinks.push(sender);
        info!(kind, n = sinks.len(), "sink registered");
        Ok(())
    }

    // ---- lifecycle --------------------------------------------------------

    /// Start the session: fix the host epoch and grid spacing, re-arm the
    /// sticky event, and launch the consumer thread.
    pub fn start_session(&self, delta: f64) -> Result<(), SyncError> {
        if !(delta > 0.0 && delta.is_finite()) {
            return Err(SyncError::InvalidDelta(delta));
        }
        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SyncError::AlreadyStarted);
        }

        // Leftovers from a previous session are discarded by contract.
        self.queue.clear();
        self.stop.store(false, Ordering::Release);
        self.event_bus.reset();

        let timing = Arc::new(SessionTiming {
            epoch: Instant::now(),
            delta,
            decimals: timebase::decimals_for(delta),
        });
        *self.timing.write() = Some(Arc::clone(&timing));

        let bin_width = if self.plot_decimate_hz > 0.0 {
            ((1.0 / (delta * self.plot_decimate_hz)).ceil() as i64).max(1)
        } else {
            0
        };

        let consumer = Consumer {
            queue: Arc::clone(&self.queue),
            timing: Arc::clone(&timing),
            stop: Arc::clone(&self.stop),
            event_bus: Arc::clone(&self.event_bus),
            spike_bus: Arc::clone(&self.spike_bus),
            sinks: self.sinks.lock().clone(),
            plot_sinks: self.plot_sinks.lock().clone(),
            bin_width,
            packets_consumed: Arc::clone(&self.packets_consumed),
            anchor_resets: Arc::clone(&self.anchor_resets),
        };

        let handle = std::thread::Builder::new()
            .name("sync-consumer".into())
            .spawn(move || consumer.run())
            .map_err(|e| {
                self.started.store(false, Ordering::Release);
                *self.timing.write() = None;
                SyncError::Spawn(e)
            })?;
        *self.consumer.lock() = Some(handle);

        info!(
            delta,
            decimals = timing.decimals,
            plot_bin_width = bin_width,
            default_event = self.event_bus.default_label(),
            "sync session started"
        );
        Ok(())
    }

    /// Stop the session and join the consumer. Safe to call twice, and safe
    /// when the session never started; sink registrations are cleared.
    pub fn stop_session(&self) {
        if self
            .started
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        self.stop.store(true, Ordering::Release);
        self.queue.wake(Ingress::Shutdown);

        if let Some(handle) = self.consumer.lock().take() {
            if handle.join().is_err() {
                error!("sync consumer panicked");
            }
        }

        *self.timing.write() = None;
        self.sinks.lock().clear();
        self.plot_sinks.lock().clear();
        info!("sync session stopped");
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Host-relative session time, if a session is running.
    pub fn session_elapsed(&self) -> Option<f64> {
        self.timing
            .read()
            .as_ref()
            .map(|t| t.epoch.elapsed().as_secs_f64())
    }

    // ---- producer-facing API ----------------------------------------------

    /// Enqueue one device packet; never blocks the producer thread. With a
    /// bounded queue the oldest packet is evicted on overflow.
    pub fn enqueue_packet(
        &self,
        device_ts: f64,
        device: &str,
        channels: Vec<(String, Option<f64>)>,
    ) {
        self.queue
            .push(Ingress::Packet(SamplePacket::new(device_ts, device, channels)));
    }

    // ---- trigger API ------------------------------------------------------

    /// Sticky event trigger: quantize "now" against the session epoch,
    /// resolve the toggle through the event bus, and route the transition
    /// in-band. Returns the resolved (new, previous) pair, or `None` when
    /// triggers are disabled.
    pub fn set_event(&self, label: &str, source: &str) -> Result<Option<(String, String)>, SyncError> {
        let (k, t_q) = self.quantized_now()?;
        let Some((new, prev)) = self.event_bus.set_event(label, source) else {
            return Ok(None);
        };
        self.queue.push(Ingress::Event {
            k,
            t_q,
            label: new.clone(),
            prev: prev.clone(),
            source: source.to_string(),
        });
        Ok(Some((new, prev)))
    }

    /// One-shot spike trigger, same in-band routing as events.
    pub fn trigger_spike(&self, label: &str, source: &str) -> Result<Option<String>, SyncError> {
        let (k, t_q) = self.quantized_now()?;
        let Some(label) = self.spike_bus.set_spike(label, source) else {
            return Ok(None);
        };
        self.queue.push(Ingress::Spike {
            k,
            t_q,
            label: label.clone(),
            source: source.to_string(),
        });
        Ok(Some(label))
    }

    /// Current sticky event label and its last change time.
    pub fn current_event(&self) -> (String, f64) {
        self.event_bus.current()
    }

    fn quantized_now(&self) -> Result<(i64, f64), SyncError> {
        let timing = self
            .timing
            .read()
            .as_ref()
            .cloned()
            .ok_or(SyncError::NotStarted)?;
        let t = timing.epoch.elapsed().as_secs_f64();
        Ok(timebase::quantize(t, timing.delta, timing.decimals))
    }

    pub fn stats(&self) -> SyncStats {
        let sink_dropped = self.sinks.lock().iter().map(|s| s.dropped()).sum();
        let plot_sink_dropped = self.plot_sinks.lock().iter().map(|s| s.dropped()).sum();
        SyncStats {
            packets_consumed: self.packets_consumed.load(Ordering::Relaxed),
            ingress_dropped: self.queue.dropped(),
            sink_dropped,
            plot_sink_dropped,
            anchor_resets: self.anchor_resets.load(Ordering::Relaxed),
        }
    }
}

impl Drop for SyncController {
    fn drop(&mut self) {
        self.stop_session();
    }
}

// ---------------------------------------------------------------------------
// Consumer thread
// ---------------------------------------------------------------------------

struct Consumer {
    queue: Arc<IngressQueue<Ingress>>,
    timing: Arc<SessionTiming>,
    stop: Arc<AtomicBool>,
    event_bus: Arc<EventBus>,
    spike_bus: Arc<SpikeBus>,
    sinks: Vec<SinkSender<SyncPayload>>,
    plot_sinks: Vec<SinkSender<SyncPayload>>,
    /// Minimum grid distance between plot emissions per series; 0 disables
    /// decimation.
    bin_width: i64,
    packets_consumed: Arc<AtomicU64>,
    anchor_resets: Arc<AtomicU64>,
}

impl Consumer {
    fn run(self) {
        let mut timebase = Timebase::new(self.timing.delta);
        let mut plot_last_k: HashMap<String, i64> = HashMap::new();
        info!("sync consumer running");

        loop {
            if self.stop.load(Ordering::Acquire) {
                break;
            }
            let item = match self.queue.recv_timeout(CONSUMER_POLL) {
                Ok(item) => item,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };
            match item {
                Ingress::Shutdown => break,
                Ingress::Packet(pkt) => {
                    self.handle_sample(&mut timebase, &mut plot_last_k, pkt);
                }
                Ingress::Event {
                    k,
                    t_q,
                    label,
                    prev,
                    source,
                } => {
                    self.event_bus.announce_change_at(t_q, k, &label, &prev, &source);
                    self.emit_marker(SyncPayload::Event {
                        k,
                        t_q,
                        label,
                        prev,
                        source,
                    });
                }
                Ingress::Spike { k, t_q, label, source } => {
                    self.spike_bus.announce_at(t_q, k, &label, &source);
                    self.emit_marker(SyncPayload::Spike { k, t_q, label, source });
                }
            }
        }

        info!(
            consumed = self.packets_consumed.load(Ordering::Relaxed),
            dropped = self.queue.dropped(),
            "sync consumer stopped"
        );
    }

    /// Anchor, quantize, fan out. Malformed packets are logged and skipped;
    /// the consumer must never die mid-session.
    fn handle_sample(
        &self,
        timebase: &mut Timebase,
        plot_last_k: &mut HashMap<String, i64>,
        pkt: SamplePacket,
    ) {
        if pkt.device.is_empty() {
            warn!("sample packet with empty device name dropped");
            return;
        }
        if !pkt.device_ts.is_finite() {
            error!(device = %pkt.device, ts = pkt.device_ts, "non-finite device timestamp dropped");
            return;
        }

        let host_now = self.timing.epoch.elapsed().as_secs_f64();
        let resets_before = timebase.anchor_resets();
        let t_host = timebase.map_to_host(&pkt.device, pkt.device_ts, host_now);
        let resets = timebase.anchor_resets() - resets_before;
        if resets > 0 {
            self.anchor_resets.fetch_add(resets, Ordering::Relaxed);
        }

        let (k, t_q) = timebase.quantize(t_host);
        self.packets_consumed.fetch_add(1, Ordering::Relaxed);

        let payload = SyncPayload::Sample {
            k,
            t_q,
            device: pkt.device,
            channels: pkt.channels,
        };
        for sink in &self.sinks {
            sink.send(payload.clone());
        }
        self.emit_plot_sample(plot_last_k, &payload);
    }

    /// Markers reach every sink, full-rate and plot alike, undecimated.
    fn emit_marker(&self, payload: SyncPayload) {
        for sink in &self.sinks {
            sink.send(payload.clone());
        }
        for sink in &self.plot_sinks {
            sink.send(payload.clone());
        }
    }

    /// Keep-one-per-bin decimation, tracked per `device:channel` series.
    fn emit_plot_sample(&self, plot_last_k: &mut HashMap<String, i64>, payload: &SyncPayload) {
        if self.plot_sinks.is_empty() {
            return;
        }
        if self.bin_width <= 0 {
            for sink in &self.plot_sinks {
                sink.send(payload.clone());
            }
            return;
        }

        let SyncPayload::Sample {
            k,
            t_q,
            device,
            channels,
        } = payload
        else {
            return;
        };

        let mut kept = Vec::new();
        for (ch, value) in channels {
            let series = format!("{device}:{ch}");
            let due = match plot_last_k.get(&series) {
                Some(&last) => *k - last >= self.bin_width,
                None => true,
            };
            if due {
                kept.push((ch.clone(), *value));
                plot_last_k.insert(series, *k);
            }
        }
        if kept.is_empty() {
            return;
        }

        let decimated = SyncPayload::Sample {
            k: *k,
            t_q: *t_q,
            device: device.clone(),
            channels: kept,
        };
        for sink in &self.plot_sinks {
            sink.send(decimated.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::sink_channel;
    use std::time::Duration;

    fn test_config(max_queue: i64, plot_decimate_hz: f64) -> Config {
        let mut config = Config::default();
        config.sync.max_queue = max_queue;
        config.ui.plot_decimate_hz = plot_decimate_hz;
        config.events.event_keymap =
            crate::config::KeyMap(vec![("0".into(), "REST".into()), ("1".into(), "TASK".into())]);
        config
    }

    fn collect(rx: &crossbeam_channel::Receiver<SyncPayload>, n: usize) -> Vec<SyncPayload> {
        let mut out = Vec::new();
        while out.len() < n {
            match rx.recv_timeout(Duration::from_secs(2)) {
                Ok(p) => out.push(p),
                Err(_) => break,
            }
        }
        out
    }

    #[test]
    fn double_start_and_double_stop() {
        let ctrl = SyncController::new(&test_config(0, 0.0));
        ctrl.start_session(0.1).unwrap();
        assert!(matches!(ctrl.start_session(0.1), Err(SyncError::AlreadyStarted)));
        ctrl.stop_session();
        ctrl.stop_session(); // no-op
        assert!(!ctrl.is_running());

        // A fresh session starts cleanly after stop.
        ctrl.start_session(0.1).unwrap();
        ctrl.stop_session();
    }

    #[test]
    fn stop_without_start_is_safe() {
        let ctrl = SyncController::new(&test_config(0, 0.0));
        ctrl.stop_session();
        assert!(matches!(ctrl.start_session(0.0), Err(SyncError::InvalidDelta(_))));
        ctrl.stop_session();
    }

    #[test]
    fn registration_rules() {
        let ctrl = SyncController::new(&test_config(0, 0.0));
        let (tx, _rx) = sink_channel(16, "t");
        ctrl.add_sink_queue(tx.clone()).unwrap();
        // Same queue twice has the effect of once.
        ctrl.add_sink_queue(tx.clone()).unwrap();
        assert_eq!(ctrl.sinks.lock().len(), 1);

        ctrl.start_session(0.1).unwrap();
        let (tx2, _rx2) = sink_channel(16, "t2");
        assert!(matches!(ctrl.add_sink_queue(tx2), Err(SyncError::SessionActive)));
        ctrl.stop_session();
    }

    #[test]
    fn triggers_require_session() {
        let ctrl = SyncController::new(&test_config(0, 0.0));
        assert!(matches!(ctrl.set_event("TASK", "test"), Err(SyncError::NotStarted)));
        assert!(matches!(ctrl.trigger_spike("S", "test"), Err(SyncError::NotStarted)));
    }

    #[test]
    fn samples_and_markers_interleave_in_arrival_order() {
        let ctrl = SyncController::new(&test_config(0, 0.0));
        let (tx, rx) = sink_channel(0, "export");
        ctrl.add_sink_queue(tx).unwrap();
        // delta = 0.1 s keeps millisecond-scale test jitter well inside half
        // a grid step.
        ctrl.start_session(0.1).unwrap();

        ctrl.enqueue_packet(5.0, "dev_a", vec![("ch".into(), Some(1.0))]);
        ctrl.set_event("TASK", "test").unwrap();
        ctrl.enqueue_packet(5.1, "dev_a", vec![("ch".into(), Some(2.0))]);

        let got = collect(&rx, 3);
        ctrl.stop_session();

        assert_eq!(got.len(), 3);
        let SyncPayload::Sample { k: k1, .. } = &got[0] else {
            panic!("expected sample first, got {:?}", got[0]);
        };
        let SyncPayload::Event { label, prev, .. } = &got[1] else {
            panic!("expected event second, got {:?}", got[1]);
        };
        assert_eq!((label.as_str(), prev.as_str()), ("TASK", "REST"));
        let SyncPayload::Sample { k: k2, .. } = &got[2] else {
            panic!("expected sample third, got {:?}", got[2]);
        };
        assert_eq!(*k1, 0);
        assert_eq!(*k2, k1 + 1);
    }

    #[test]
    fn per_device_k_is_monotone_without_resets() {
        let ctrl = SyncController::new(&test_config(0, 0.0));
        let (tx, rx) = sink_channel(0, "export");
        ctrl.add_sink_queue(tx).unwrap();
        ctrl.start_session(0.05).unwrap();

        for i in 0..20 {
            ctrl.enqueue_packet(i as f64 * 0.05, "dev_a", vec![("ch".into(), Some(i as f64))]);
        }
        let got = collect(&rx, 20);
        ctrl.stop_session();

        assert_eq!(got.len(), 20);
        let ks: Vec<i64> = got.iter().map(|p| p.k()).collect();
        assert!(ks.windows(2).all(|w| w[0] <= w[1]), "ks not monotone: {ks:?}");
        assert_eq!(ctrl.stats().anchor_resets, 0);
    }

    #[test]
    fn plot_sink_decimates_samples_but_not_markers() {
        // delta = 0.1, decimate 5 Hz → bin width 2 grid steps.
        let ctrl = SyncController::new(&test_config(0, 5.0));
        let (plot_tx, plot_rx) = sink_channel(0, "plot");
        let (full_tx, full_rx) = sink_channel(0, "full");
        ctrl.add_plot_sink_queue(plot_tx).unwrap();
        ctrl.add_sink_queue(full_tx).unwrap();
        ctrl.start_session(0.1).unwrap();

        for i in 0..4 {
            ctrl.enqueue_packet(9.0 + i as f64 * 0.1, "dev_a", vec![("ch".into(), Some(i as f64))]);
        }
        ctrl.trigger_spike("SPIKE_Q", "test").unwrap();

        let full = collect(&full_rx, 5);
        assert_eq!(full.len(), 5);
        ctrl.stop_session();

        let mut plot_samples = Vec::new();
        let mut plot_markers = 0usize;
        while let Ok(p) = plot_rx.try_recv() {
            match p {
                SyncPayload::Sample { k, .. } => plot_samples.push(k),
                _ => plot_markers += 1,
            }
        }
        assert_eq!(plot_samples, vec![0, 2]);
        assert_eq!(plot_markers, 1);
    }

    #[test]
    fn bounded_ingestion_counts_drops() {
        let ctrl = SyncController::new(&test_config(2, 0.0));
        // No consumer yet: everything stays queued.
        ctrl.enqueue_packet(0.0, "dev_a", vec![]);
        ctrl.enqueue_packet(0.1, "dev_a", vec![]);
        ctrl.enqueue_packet(0.2, "dev_a", vec![]);
        assert_eq!(ctrl.stats().ingress_dropped, 1);
    }
}
