//! CSV export sink: wide synced signal file plus a markers sidecar.
//!
//! A single worker thread assembles one row per observed grid index from
//! the synchronizer's payload stream. Rows stay open for a fixed lookahead
//! window so late packets from slower devices can still land in their bin;
//! an idle watermark finalizes everything when the stream goes quiet.
//! Marker rows are low-volume and written immediately.

use crate::error::ExportError;
use crate::queue::{sink_channel, SinkSender};
use crate::timebase;
use crate::types::SyncPayload;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Exporter tuning; see the `export` config section for the on-disk keys.
#[derive(Debug, Clone)]
pub struct ExportConfig {
    pub lookahead_sec: f64,
    pub flush_period_sec: f64,
    /// ≤ 0 derives a threshold from fs_max and the flush period.
    pub flush_rows: i64,
    /// ≤ 0 disables the idle watermark.
    pub idle_watermark_sec: f64,
    pub signal_csv: bool,
    pub marker_csv: bool,
    pub include_k: bool,
    pub synced_dir: PathBuf,
    pub markers_dir: PathBuf,
    /// Sticky label in effect before the first event, from the keymap.
    pub initial_event: String,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            lookahead_sec: 0.05,
            flush_period_sec: 0.25,
            flush_rows: 0,
            idle_watermark_sec: 0.0,
            signal_csv: true,
            marker_csv: true,
            include_k: true,
            synced_dir: PathBuf::from("data/synced"),
            markers_dir: PathBuf::from("data/markers"),
            initial_event: "REST".into(),
        }
    }
}

impl ExportConfig {
    pub fn from_config(config: &crate::config::Config) -> Self {
        let exp = &config.export;
        Self {
            lookahead_sec: exp.lookahead_sec,
            flush_period_sec: exp.flush_period_sec,
            flush_rows: exp.flush_rows,
            idle_watermark_sec: exp.idle_watermark_sec,
            signal_csv: exp.csv_signal_enable,
            marker_csv: exp.csv_marker_enable,
            include_k: exp.print_k,
            synced_dir: PathBuf::from(&exp.out.synced_dir),
            markers_dir: PathBuf::from(&exp.out.markers_dir),
            initial_event: config
                .events
                .event_keymap
                .default_label()
                .unwrap_or("REST")
                .to_string(),
        }
    }
}

/// Row under assembly for one grid index.
struct OpenRow {
    t_q: f64,
    values: Vec<Option<f64>>,
    spike: Option<String>,
}

impl OpenRow {
    fn new(t_q: f64, width: usize) -> Self {
        Self {
            t_q,
            values: vec![None; width],
            spike: None,
        }
    }
}

/// Consume synchronizer payloads and write the two CSVs for one session.
pub struct CsvExportSink {
    sender: SinkSender<SyncPayload>,
    receiver: Mutex<Option<Receiver<SyncPayload>>>,
    stop: Arc<AtomicBool>,
    running: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
    delta: f64,
    schema: Vec<String>,
    config: ExportConfig,
    signal_path: PathBuf,
    markers_path: PathBuf,
}

impl CsvExportSink {
    /// Build the sink with a session timestamp in the output filenames.
    pub fn new(delta: f64, schema: Vec<String>, config: ExportConfig) -> Result<Self, ExportError> {
        let stamp = chrono::Local::now().format("%Y-%m-%d_%H-%M-%S").to_string();
        Self::with_session_id(delta, schema, config, &stamp)
    }

    pub fn with_session_id(
        delta: f64,
        schema: Vec<String>,
        config: ExportConfig,
        session_id: &str,
    ) -> Result<Self, ExportError> {
        if config.signal_csv && schema.is_empty() {
            return Err(ExportError::EmptySchema);
        }
        let signal_path = config.synced_dir.join(format!("synced_{session_id}.csv"));
        let markers_path = config.markers_dir.join(format!("markers_{session_id}.csv"));
        let (sender, receiver) = sink_channel(0, "export");
        Ok(Self {
            sender,
            receiver: Mutex::new(Some(receiver)),
            stop: Arc::new(AtomicBool::new(false)),
            running: AtomicBool::new(false),
            worker: Mutex::new(None),
            delta,
            schema,
            config,
            signal_path,
            markers_path,
        })
    }

    /// Writer half to register with the synchronizer.
    pub fn sender(&self) -> SinkSender<SyncPayload> {
        self.sender.clone()
    }

    pub fn signal_path(&self) -> &Path {
        &self.signal_path
    }

    pub fn markers_path(&self) -> &Path {
        &self.markers_path
    }

    /// Open the output files, write headers, and start the worker thread.
    pub fn start(&self) -> Result<(), ExportError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ExportError::AlreadyRunning);
        }

        let open = |dir: &Path, path: &Path| -> Result<BufWriter<File>, ExportError> {
            std::fs::create_dir_all(dir)?;
            Ok(BufWriter::new(File::create(path)?))
        };

        let mut signal = if self.config.signal_csv {
            let w = open(&self.config.synced_dir, &self.signal_path)?;
            info!(path = %self.signal_path.display(), "signal CSV enabled");
            Some(w)
        } else {
            info!("signal CSV disabled");
            None
        };
        let mut markers = if self.config.marker_csv {
            let w = open(&self.config.markers_dir, &self.markers_path)?;
            info!(path = %self.markers_path.display(), "marker CSV enabled");
            Some(w)
        } else {
            info!("marker CSV disabled");
            None
        };

        if let Some(w) = signal.as_mut() {
            let mut header = String::new();
            if self.config.include_k {
                header.push_str("k,");
            }
            header.push_str("t_q");
            for col in &self.schema {
                header.push(',');
                header.push_str(&csv_field(col));
            }
            header.push_str(",spike,event");
            writeln!(w, "{header}")?;
        }
        if let Some(w) = markers.as_mut() {
            writeln!(w, "t_q,event,spike,source")?;
        }

        let fs_max = 1.0 / self.delta;
        let flush_rows = if self.config.flush_rows > 0 {
            self.config.flush_rows as usize
        } else {
            ((fs_max * self.config.flush_period_sec).round() as i64).clamp(64, 2048) as usize
        };

        let Some(receiver) = self.receiver.lock().take() else {
            // A sink is single-session; a second start has nothing to read.
            self.running.store(false, Ordering::Release);
            return Err(ExportError::AlreadyRunning);
        };

        let worker = Worker {
            rx: receiver,
            stop: Arc::clone(&self.stop),
            decimals: timebase::decimals_for(self.delta),
            index: self
                .schema
                .iter()
                .enumerate()
                .map(|(i, c)| (c.clone(), i))
                .collect(),
            width: self.schema.len(),
            lookahead_rows: ((self.config.lookahead_sec * fs_max).round() as i64).max(0),
            flush_period: Duration::from_secs_f64(self.config.flush_period_sec.max(0.01)),
            flush_rows,
            idle_watermark: (self.config.idle_watermark_sec > 0.0)
                .then(|| Duration::from_secs_f64(self.config.idle_watermark_sec)),
            include_k: self.config.include_k,
            signal,
            markers,
            open_rows: BTreeMap::new(),
            event_changes: BTreeMap::new(),
            k_seen_max: -1,
            k_committed: -1,
            sticky: self.config.initial_event.clone(),
            initial_marker_emitted: false,
            rows_since_flush: 0,
            last_flush: Instant::now(),
            last_activity: Instant::now(),
        };

        info!(
            lookahead_rows = worker.lookahead_rows,
            flush_rows,
            columns = self.schema.len(),
            "export sink started"
        );

        let handle = std::thread::Builder::new()
            .name("export-sink".into())
            .spawn(move || worker.run())
            .map_err(ExportError::Io)?;
        *self.worker.lock() = Some(handle);
        Ok(())
    }

    /// Stop the worker: drain the queue, commit every open row, flush, and
    /// close the files. Safe to call twice.
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
                error!("export worker panicked");
            }
        }
        info!(
            signal = %self.signal_path.display(),
            markers = %self.markers_path.display(),
            "export sink stopped"
        );
    }
}

impl Drop for CsvExportSink {
    fn drop(&mut self) {
        self.stop();
    }
}

// ---------------------------------------------------------------------------
// Worker thread
// ---------------------------------------------------------------------------

struct Worker {
    rx: Receiver<SyncPayload>,
    stop: Arc<AtomicBool>,
    decimals: u32,
    index: HashMap<String, usize>,
    width: usize,
    lookahead_rows: i64,
    flush_period: Duration,
    flush_rows: usize,
    idle_watermark: Option<Duration>,
    include_k: bool,
    signal: Option<BufWriter<File>>,
    markers: Option<BufWriter<File>>,
    open_rows: BTreeMap<i64, OpenRow>,
    event_changes: BTreeMap<i64, String>,
    k_seen_max: i64,
    /// Highest grid index already written out; rows never reopen below it.
    k_committed: i64,
    sticky: String,
    initial_marker_emitted: bool,
    rows_since_flush: usize,
    last_flush: Instant,
    last_activity: Instant,
}

impl Worker {
    fn run(mut self) {
        // Half the flush period keeps the checkpoint responsive without
        // busy-waiting; floor avoids a zero timeout.
        let poll = (self.flush_period / 2).max(Duration::from_millis(20));

        loop {
            if self.stop.load(Ordering::Acquire) {
                break;
            }
            let received = match self.rx.recv_timeout(poll) {
                Ok(payload) => Some(payload),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => break,
            };
            let now = Instant::now();

            if let Some(payload) = received {
                self.last_activity = now;
                self.handle(payload);
            }

            self.commit_until(self.k_seen_max - self.lookahead_rows);

            if let Some(idle) = self.idle_watermark {
                if now.duration_since(self.last_activity) >= idle {
                    self.commit_until(self.k_seen_max);
                    self.flush();
                    warn!(
                        idle_sec = idle.as_secs_f64(),
                        "idle watermark fired, open rows finalized"
                    );
                    self.last_activity = now;
                }
            }

            if self.rows_since_flush >= self.flush_rows
                || now.duration_since(self.last_flush) >= self.flush_period
            {
                self.flush();
                self.last_flush = now;
                self.rows_since_flush = 0;
            }
        }

        // Late payloads still queued at stop belong to this session.
        while let Ok(payload) = self.rx.try_recv() {
            self.handle(payload);
        }
        self.commit_until(i64::MAX);
        self.flush();
    }

    fn handle(&mut self, payload: SyncPayload) {
        match payload {
            SyncPayload::Sample {
                k,
                t_q,
                device,
                channels,
            } => self.on_sample(k, t_q, &device, channels),
            SyncPayload::Event {
                k,
                t_q,
                label,
                source,
                ..
            } => self.on_event(k, t_q, label, &source),
            SyncPayload::Spike { k, t_q, label, source } => self.on_spike(k, t_q, label, &source),
        }
    }

    /// Store channel values into the open row for k; last write wins per
    /// (k, column). Samples older than the committed watermark are dropped.
    fn on_sample(&mut self, k: i64, t_q: f64, device: &str, channels: Vec<(String, Option<f64>)>) {
        if k <= self.k_committed {
            warn!(k, committed = self.k_committed, "late sample past commit point dropped");
            return;
        }
        self.k_seen_max = self.k_seen_max.max(k);
        let width = self.width;
        let row = self
            .open_rows
            .entry(k)
            .or_insert_with(|| OpenRow::new(t_q, width));
        for (ch, value) in channels {
            let column = format!("{device}:{ch}");
            // Columns outside the fixed header are ignored.
            if let Some(&i) = self.index.get(&column) {
                row.values[i] = value;
            }
        }
    }

    /// Record the sticky transition at k and write the marker row now.
    /// The signal row for k (existing or future) picks the change up at
    /// commit time.
    fn on_event(&mut self, k: i64, t_q: f64, label: String, source: &str) {
        if k <= self.k_committed {
            // The row is gone; the sticky state still advances.
            self.sticky = label.clone();
        } else {
            self.event_changes.insert(k, label.clone());
        }
        self.write_marker(t_q, &label, "", source);
    }

    /// Mark the spike on the open row and write the marker row now. A spike
    /// whose k is already committed stays marker-only; committed rows are
    /// never rewritten.
    fn on_spike(&mut self, k: i64, t_q: f64, label: String, source: &str) {
        if k > self.k_committed {
            self.k_seen_max = self.k_seen_max.max(k);
            let width = self.width;
            let row = self
                .open_rows
                .entry(k)
                .or_insert_with(|| OpenRow::new(t_q, width));
            row.spike = Some(label.clone());
        }
        self.write_marker(t_q, "", &label, source);
    }

    /// Write out every open row with k ≤ k_cap, in ascending k, advancing
    /// the sticky event through recorded change points.
    fn commit_until(&mut self, k_cap: i64) {
        if k_cap < 0 || (self.open_rows.is_empty() && self.event_changes.is_empty()) {
            return;
        }

        let bound = k_cap.saturating_add(1);
        let keep = self.open_rows.split_off(&bound);
        let due = std::mem::replace(&mut self.open_rows, keep);

        for (k, row) in due {
            // Sticky changes at or before this row take effect here.
            let later = self.event_changes.split_off(&(k + 1));
            for (_, label) in std::mem::replace(&mut self.event_changes, later) {
                self.sticky = label;
            }

            if !self.initial_marker_emitted {
                let sticky = self.sticky.clone();
                self.write_marker(row.t_q, &sticky, "", "sync");
                self.initial_marker_emitted = true;
            }

            self.write_signal_row(k, &row);
            self.k_committed = k;
            self.rows_since_flush += 1;
        }

        // Change points below the cap with no row of their own still move
        // the sticky label forward.
        let later = self.event_changes.split_off(&bound);
        for (_, label) in std::mem::replace(&mut self.event_changes, later) {
            self.sticky = label;
        }
    }

    fn write_signal_row(&mut self, k: i64, row: &OpenRow) {
        let Some(w) = self.signal.as_mut() else {
            return;
        };

        let mut line = String::new();
        if self.include_k {
            let _ = write!(line, "{k},");
        }
        // Every numeric cell uses the delta-derived decimal count, values
        // included, so row width tracks the grid resolution.
        let _ = write!(line, "{:.*}", self.decimals as usize, row.t_q);
        for value in &row.values {
            line.push(',');
            if let Some(v) = value {
                let _ = write!(line, "{:.*}", self.decimals as usize, v);
            }
        }
        line.push(',');
        if let Some(spike) = &row.spike {
            line.push_str(&csv_field(spike));
        }
        line.push(',');
        line.push_str(&csv_field(&self.sticky));

        if let Err(e) = writeln!(w, "{line}") {
            error!(k, error = %e, "failed to write signal row");
        }
    }

    fn write_marker(&mut self, t_q: f64, event: &str, spike: &str, source: &str) {
        let Some(w) = self.markers.as_mut() else {
            return;
        };
        let line = format!(
            "{:.*},{},{},{}",
            self.decimals as usize,
            t_q,
            csv_field(event),
            csv_field(spike),
            csv_field(source)
        );
        if let Err(e) = writeln!(w, "{line}") {
            error!(error = %e, "failed to write marker row");
        }
    }

    fn flush(&mut self) {
        if let Some(w) = self.signal.as_mut() {
            if let Err(e) = w.flush() {
                error!(error = %e, "signal CSV flush failed");
            }
        }
        if let Some(w) = self.markers.as_mut() {
            if let Err(e) = w.flush() {
                error!(error = %e, "marker CSV flush failed");
            }
        }
    }
}

/// Quote a field only when it would break the row.
fn csv_field(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}
