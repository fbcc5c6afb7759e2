// Headless plot-queue consumer: drains a decimated payload stream and keeps
// smoothed throughput statistics. Stands in for a GUI surface while holding
// up the plot-sink side of the queue contract.

use crate::queue::{sink_channel, SinkSender};
use crate::types::SyncPayload;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{error, info};

/// Exponential smoothing factor for the payload rate.
const RATE_EMA_ALPHA: f64 = 0.3;

const SUMMARY_PERIOD: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Default)]
pub struct PlotStats {
    pub samples: u64,
    pub events: u64,
    pub spikes: u64,
    /// Smoothed payloads/second over the summary window.
    pub rate_ema: f64,
}

pub struct PlotStatsSink {
    sender: SinkSender<SyncPayload>,
    receiver: Mutex<Option<Receiver<SyncPayload>>>,
    stop: Arc<AtomicBool>,
    running: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
    samples: Arc<AtomicU64>,
    events: Arc<AtomicU64>,
    spikes: Arc<AtomicU64>,
    rate_ema_millis: Arc<AtomicU64>,
}

impl PlotStatsSink {
    /// Bounded like a real plot queue; overflow drops the sample for this
    /// sink only.
    pub fn new(capacity: i64) -> Self {
        let (sender, receiver) = sink_channel(capacity, "plot");
        Self {
            sender,
            receiver: Mutex::new(Some(receiver)),
            stop: Arc::new(AtomicBool::new(false)),
            running: AtomicBool::new(false),
            worker: Mutex::new(None),
            samples: Arc::new(AtomicU64::new(0)),
            events: Arc::new(AtomicU64::new(0)),
            spikes: Arc::new(AtomicU64::new(0)),
            rate_ema_millis: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn sender(&self) -> SinkSender<SyncPayload> {
        self.sender.clone()
    }

    pub fn stats(&self) -> PlotStats {
        PlotStats {
            samples: self.samples.load(Ordering::Relaxed),
            events: self.events.load(Ordering::Relaxed),
            spikes: self.spikes.load(Ordering::Relaxed),
            rate_ema: self.rate_ema_millis.load(Ordering::Relaxed) as f64 / 1000.0,
        }
    }

    pub fn start(&self) -> std::io::Result<()> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }
        let Some(rx) = self.receiver.lock().take() else {
            self.running.store(false, Ordering::Release);
            return Ok(());
        };
        let stop = Arc::clone(&self.stop);
        let samples = Arc::clone(&self.samples);
        let events = Arc::clone(&self.events);
        let spikes = Arc::clone(&self.spikes);
        let rate_ema_millis = Arc::clone(&self.rate_ema_millis);

        let handle = std::thread::Builder::new().name("plot-stats".into()).spawn(move || {
            let mut window_count = 0u64;
            let mut window_start = Instant::now();
            let mut ema: Option<f64> = None;

            loop {
                if stop.load(Ordering::Acquire) {
                    break;
                }
                match rx.recv_timeout(Duration::from_millis(200)) {
                    Ok(SyncPayload::Sample { .. }) => {
                        samples.fetch_add(1, Ordering::Relaxed);
                        window_count += 1;
                    }
                    Ok(SyncPayload::Event { label, prev, .. }) => {
                        events.fetch_add(1, Ordering::Relaxed);
                        info!(%label, %prev, "plot: event marker");
                    }
                    Ok(SyncPayload::Spike { label, .. }) => {
                        spikes.fetch_add(1, Ordering::Relaxed);
                        info!(%label, "plot: spike marker");
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }

                let elapsed = window_start.elapsed();
                if elapsed >= SUMMARY_PERIOD {
                    let instantaneous = window_count as f64 / elapsed.as_secs_f64();
                    let smoothed = match ema {
                        Some(prev) => RATE_EMA_ALPHA * instantaneous + (1.0 - RATE_EMA_ALPHA) * prev,
                        None => instantaneous,
                    };
                    ema = Some(smoothed);
                    rate_ema_millis.store((smoothed * 1000.0) as u64, Ordering::Relaxed);
                    info!(
                        rate_hz = smoothed,
                        samples = samples.load(Ordering::Relaxed),
                        "plot sink throughput"
                    );
                    window_count = 0;
                    window_start = Instant::now();
                }
            }
        })?;
        *self.worker.lock() = Some(handle);
        Ok(())
    }

    pub fn stop(&self) {
        if self
            .running
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                error!("plot stats worker panicked");
            }
        }
    }
}

impl Drop for PlotStatsSink {
    fn drop(&mut self) {
        self.stop();
    }
}
