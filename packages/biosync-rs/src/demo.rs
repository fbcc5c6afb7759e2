//! Synthetic producers: a modulated sine generator standing in for a real
//! biosensor, and interval-driven marker generators. They exercise the full
//! producer contract (paced emission, device-local timestamps, optional
//! per-channel filtering) without hardware attached.

use crate::config::{DeviceInstance, DeviceKind};
use crate::filters::{design_sos, StreamingSos};
use crate::runtime::{Producer, ShutdownFlag};
use crate::sync::SyncController;
use std::f64::consts::TAU;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Longest single sleep while pacing; keeps shutdown responsive.
const PACE_SLICE: Duration = Duration::from_millis(50);

struct SweepRange {
    min: f64,
    max: f64,
    step: f64,
    direction: f64,
}

impl SweepRange {
    fn new(min: f64, max: f64, step: f64) -> Self {
        let (min, max) = if min <= max { (min, max) } else { (max, min) };
        let step = step.clamp(0.0, (max - min).max(0.0));
        Self {
            min,
            max,
            step,
            direction: if step > 0.0 { 1.0 } else { 0.0 },
        }
    }

    fn advance(&mut self, value: &mut f64) {
        if self.direction == 0.0 {
            return;
        }
        *value += self.direction * self.step;
        if *value >= self.max {
            *value = self.max;
            self.direction = -1.0;
        } else if *value <= self.min {
            *value = self.min;
            self.direction = 1.0;
        }
    }
}

/// Start a sine producer for one configured demo instance. Channel `ch_1`
/// carries an amplitude-modulated tone, `ch_2` a frequency-swept tone.
/// Returns `None` when the instance has nothing to emit.
pub fn spawn_sine_producer(
    controller: Arc<SyncController>,
    kind: &DeviceKind,
    instance: &DeviceInstance,
    shutdown: ShutdownFlag,
) -> std::io::Result<Option<Producer>> {
    let device = instance.device_name.trim().to_string();
    let fs = instance.fs;
    if fs <= 0.0 {
        warn!(device = %device, fs, "non-positive FS, producer not started");
        return Ok(None);
    }

    let enable_ch1 = instance.channels.iter().any(|(c, on)| c == "ch_1" && *on);
    let enable_ch2 = instance.channels.iter().any(|(c, on)| c == "ch_2" && *on);
    if !(enable_ch1 || enable_ch2) {
        info!(device = %device, "no channels enabled, producer not started");
        return Ok(None);
    }

    let signal_freq = instance.param_f64("SIGNAL_FREQ_HZ", 2.0);
    let amp_base = instance.param_f64("AMP_BASE", 1.0).abs();
    let amp_rate_scale = instance.param_f64("AMP_RATE_SCALE", 1.0).max(0.0);
    let freq_rate_scale = instance.param_f64("FREQ_RATE_SCALE", 0.25).max(0.0);
    let amp_min = amp_base * instance.param_f64("AMP_MIN_MULT", 0.5).max(0.0);
    let amp_max = amp_base * instance.param_f64("AMP_MAX_MULT", 3.0).max(0.0);
    let base_freq = signal_freq.max(0.1);
    let freq_min = (instance.param_f64("FREQ_MIN_MULT", 0.5) * base_freq).max(0.0);
    let freq_max = (instance.param_f64("FREQ_MAX_MULT", 2.0) * base_freq).max(freq_min + 0.1);

    // One streaming filter per channel; the cascade comes from the shared
    // design cache, the state is private to this producer thread.
    let mut filter_ch1 = enable_ch1
        .then(|| kind.filter_spec_for("ch_1"))
        .flatten()
        .map(|spec| {
            let ctx = format!("{device}:ch_1");
            StreamingSos::new(design_sos(&ctx, fs, &spec), ctx)
        });
    let mut filter_ch2 = enable_ch2
        .then(|| kind.filter_spec_for("ch_2"))
        .flatten()
        .map(|spec| {
            let ctx = format!("{device}:ch_2");
            StreamingSos::new(design_sos(&ctx, fs, &spec), ctx)
        });

    let period = 1.0 / fs;
    let rate_ratio = signal_freq / fs.max(1.0);
    let amp_range = (amp_max - amp_min).max(0.0);
    let mut amp_sweep = SweepRange::new(amp_min, amp_max, 0.1 * rate_ratio * amp_rate_scale * amp_range.max(1e-6));
    let mut freq_sweep = SweepRange::new(freq_min, freq_max, 0.05 * base_freq * freq_rate_scale);

    let thread_name = format!("sine[{device}]");
    info!(
        device = %device,
        fs, signal_freq, amp_base, enable_ch1, enable_ch2, "sine producer starting"
    );

    let handle = std::thread::Builder::new().name(thread_name.clone()).spawn(move || {
        let start = Instant::now();
        let mut next_emit = 0.0f64;
        let mut sample_idx = 0u64;
        let mut amp = amp_base.clamp(amp_sweep.min, amp_sweep.max);
        let mut freq = base_freq.clamp(freq_sweep.min, freq_sweep.max);
        let mut phase_ch2 = 0.0f64;

        while !shutdown.is_set() {
            let now = start.elapsed().as_secs_f64();
            if now < next_emit {
                std::thread::sleep(Duration::from_secs_f64((next_emit - now).min(PACE_SLICE.as_secs_f64())));
                continue;
            }

            // Device-local clock derived from the sample index keeps the
            // emitted timestamps exactly periodic.
            let elapsed = sample_idx as f64 * period;
            let mut pairs = Vec::with_capacity(2);

            if enable_ch1 {
                let raw = amp * (TAU * signal_freq * elapsed).sin();
                let value = match filter_ch1.as_mut() {
                    Some(f) => f.apply(Some(raw)),
                    None => Some(raw),
                };
                pairs.push(("ch_1".to_string(), value));
            }
            if enable_ch2 {
                phase_ch2 = (phase_ch2 + TAU * freq * period) % TAU;
                let raw = phase_ch2.sin();
                let value = match filter_ch2.as_mut() {
                    Some(f) => f.apply(Some(raw)),
                    None => Some(raw),
                };
                pairs.push(("ch_2".to_string(), value));
            }

            controller.enqueue_packet(elapsed, &device, pairs);

            sample_idx += 1;
            next_emit += period;
            amp_sweep.advance(&mut amp);
            if enable_ch2 {
                freq_sweep.advance(&mut freq);
            }
        }
        info!(device = %device, emitted = sample_idx, "sine producer stopped");
    })?;

    Ok(Some(Producer::new(thread_name, handle)))
}

/// Cycle through event labels at a fixed interval. Exits when the session
/// is gone or shutdown is requested.
pub fn spawn_event_demo(
    controller: Arc<SyncController>,
    name: String,
    interval_s: f64,
    labels: Vec<String>,
    shutdown: ShutdownFlag,
) -> std::io::Result<Producer> {
    spawn_marker_loop(name, interval_s, shutdown, move |i| {
        if labels.is_empty() {
            return true;
        }
        let label = &labels[i % labels.len()];
        controller.set_event(label, "event_demo").is_ok()
    })
}

/// Fire spike labels round-robin at a fixed interval.
pub fn spawn_spike_demo(
    controller: Arc<SyncController>,
    name: String,
    interval_s: f64,
    labels: Vec<String>,
    shutdown: ShutdownFlag,
) -> std::io::Result<Producer> {
    spawn_marker_loop(name, interval_s, shutdown, move |i| {
        if labels.is_empty() {
            return true;
        }
        let label = &labels[i % labels.len()];
        controller.trigger_spike(label, "spike_demo").is_ok()
    })
}

fn spawn_marker_loop<F>(
    name: String,
    interval_s: f64,
    shutdown: ShutdownFlag,
    fire: F,
) -> std::io::Result<Producer>
where
    F: Fn(usize) -> bool + Send + 'static,
{
    let interval = Duration::from_secs_f64(interval_s.max(0.1));
    let thread_name = name.clone();
    let handle = std::thread::Builder::new().name(name.clone()).spawn(move || {
        let mut i = 0usize;
        let mut last_fire = Instant::now();
        while !shutdown.is_set() {
            if last_fire.elapsed() >= interval {
                if !fire(i) {
                    warn!(generator = %thread_name, "session unavailable, generator exiting");
                    break;
                }
                i += 1;
                last_fire = Instant::now();
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        info!(generator = %thread_name, fired = i, "marker generator stopped");
    })?;
    Ok(Producer::new(name, handle))
}
