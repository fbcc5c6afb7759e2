//! Configuration tree and config-driven inventory helpers.
//!
//! The on-disk format is TOML. Every field has a default, so a partial user
//! file overlays the built-in configuration. Ordered collections (keymaps,
//! device list, channel list) are TOML arrays, which keeps their declaration
//! order through deserialization: the first keymap entry is the default
//! sticky label, and channel order defines the export column order.

use crate::error::ConfigError;
use crate::filters::{BandPassSpec, FilterSpec, NotchSpec};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};

/// Ordered key → label mapping for trigger buses.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyMap(pub Vec<(String, String)>);

impl KeyMap {
    /// First mapped label; the buses treat it as the default sticky state.
    pub fn default_label(&self) -> Option<&str> {
        self.0.first().map(|(_, label)| label.as_str())
    }

    pub fn lookup(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, label)| label.as_str())
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(_, label)| label.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "SCREAMING_SNAKE_CASE")]
pub struct SystemConfig {
    pub check_dependencies: bool,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            check_dependencies: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "SCREAMING_SNAKE_CASE")]
pub struct TelemetryConfig {
    /// Rolling window for producer-side telemetry counters, seconds.
    pub window_s: f64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self { window_s: 10.0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "SCREAMING_SNAKE_CASE")]
pub struct EventsConfig {
    pub enable_triggers: bool,
    pub event_keymap: KeyMap,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            enable_triggers: true,
            event_keymap: KeyMap(vec![
                ("0".into(), "REST".into()),
                ("7".into(), "TASK_7".into()),
                ("8".into(), "TASK_8".into()),
                ("9".into(), "TASK_9".into()),
            ]),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "SCREAMING_SNAKE_CASE")]
pub struct SpikesConfig {
    pub enable_triggers: bool,
    pub spike_keymap: KeyMap,
}

impl Default for SpikesConfig {
    fn default() -> Self {
        Self {
            enable_triggers: true,
            spike_keymap: KeyMap(vec![
                ("q".into(), "SPIKE_Q".into()),
                ("w".into(), "SPIKE_W".into()),
                ("e".into(), "SPIKE_E".into()),
            ]),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "SCREAMING_SNAKE_CASE")]
pub struct ExportDirs {
    pub synced_dir: String,
    pub markers_dir: String,
}

impl Default for ExportDirs {
    fn default() -> Self {
        Self {
            synced_dir: "data/synced".into(),
            markers_dir: "data/markers".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "SCREAMING_SNAKE_CASE")]
pub struct ExportSection {
    pub export_enable: bool,
    pub csv_signal_enable: bool,
    pub csv_marker_enable: bool,
    /// Row-assembly window for late packets, seconds.
    pub lookahead_sec: f64,
    pub flush_period_sec: f64,
    /// ≤ 0 derives the threshold from fs_max and the flush period.
    pub flush_rows: i64,
    /// ≤ 0 disables the idle watermark.
    pub idle_watermark_sec: f64,
    /// Include the grid index as the first CSV column.
    pub print_k: bool,
    pub out: ExportDirs,
}

impl Default for ExportSection {
    fn default() -> Self {
        Self {
            export_enable: true,
            csv_signal_enable: true,
            csv_marker_enable: true,
            lookahead_sec: 0.05,
            flush_period_sec: 0.25,
            flush_rows: 0,
            idle_watermark_sec: 0.0,
            print_k: true,
            out: ExportDirs::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "SCREAMING_SNAKE_CASE")]
pub struct UiConfig {
    pub plot_enable: bool,
    /// Target per-channel plotting rate; ≤ 0 disables decimation.
    pub plot_decimate_hz: f64,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            plot_enable: true,
            plot_decimate_hz: 50.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "SCREAMING_SNAKE_CASE")]
pub struct SyncSection {
    /// Ingestion queue capacity; ≤ 0 means unbounded.
    pub max_queue: i64,
}

impl Default for SyncSection {
    fn default() -> Self {
        Self { max_queue: 0 }
    }
}

/// Per-channel filter block, mirroring the on-disk spelling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "SCREAMING_SNAKE_CASE")]
pub struct FilterBlock {
    pub bandpass_enable: bool,
    pub bandpass_order: u32,
    pub low_hz: f64,
    pub high_hz: f64,
    /// 0 disables; 50 or 60 selects the power-line notch.
    pub notch: f64,
    pub notch_q: f64,
}

impl Default for FilterBlock {
    fn default() -> Self {
        Self {
            bandpass_enable: false,
            bandpass_order: 4,
            low_hz: 0.1,
            high_hz: 10.0,
            notch: 0.0,
            notch_q: 30.0,
        }
    }
}

impl FilterBlock {
    pub fn to_spec(&self) -> FilterSpec {
        FilterSpec {
            band_pass: self.bandpass_enable.then(|| BandPassSpec {
                order: self.bandpass_order,
                low_hz: self.low_hz,
                high_hz: self.high_hz,
            }),
            notch: (self.notch != 0.0).then(|| NotchSpec {
                freq_hz: self.notch,
                q: self.notch_q,
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "SCREAMING_SNAKE_CASE")]
pub struct DeviceInstance {
    pub enabled: bool,
    pub device_name: String,
    pub fs: f64,
    pub plot_enable: bool,
    pub export_enable: bool,
    /// Device-specific knobs, opaque to the core.
    pub params: toml::value::Table,
    /// (channel name, enabled) in declaration order.
    pub channels: Vec<(String, bool)>,
}

impl Default for DeviceInstance {
    fn default() -> Self {
        Self {
            enabled: false,
            device_name: String::new(),
            fs: 0.0,
            plot_enable: true,
            export_enable: true,
            params: toml::value::Table::new(),
            channels: Vec::new(),
        }
    }
}

impl DeviceInstance {
    pub fn enabled_channels(&self) -> impl Iterator<Item = &str> {
        self.channels
            .iter()
            .filter(|(_, on)| *on)
            .map(|(name, _)| name.as_str())
    }

    pub fn param_f64(&self, key: &str, default: f64) -> f64 {
        match self.params.get(key) {
            Some(toml::Value::Float(v)) => *v,
            Some(toml::Value::Integer(v)) => *v as f64,
            _ => default,
        }
    }
}

/// One device type (e.g. `demo_rand`) with its instances and the filter
/// blocks shared by those instances, keyed by channel name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "SCREAMING_SNAKE_CASE")]
pub struct DeviceKind {
    pub kind: String,
    pub instances: Vec<DeviceInstance>,
    pub filters: HashMap<String, FilterBlock>,
}

impl DeviceKind {
    /// Filter spec for a channel of this device type, if one is configured.
    pub fn filter_spec_for(&self, channel: &str) -> Option<FilterSpec> {
        self.filters.get(channel).map(FilterBlock::to_spec)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "SCREAMING_SNAKE_CASE")]
pub struct MarkerGenerator {
    /// `event_demo` or `spike_demo`.
    pub kind: String,
    pub generator_name: String,
    pub enabled: bool,
    pub interval_s: f64,
}

impl Default for MarkerGenerator {
    fn default() -> Self {
        Self {
            kind: String::new(),
            generator_name: String::new(),
            enabled: false,
            interval_s: 3.0,
        }
    }
}

/// Whole configuration surface.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub system: SystemConfig,
    pub telemetry: TelemetryConfig,
    pub events: EventsConfig,
    pub spikes: SpikesConfig,
    pub export: ExportSection,
    pub ui: UiConfig,
    pub sync: SyncSection,
    pub devices: Vec<DeviceKind>,
    pub marker_generators: Vec<MarkerGenerator>,
}

impl Config {
    pub fn from_toml_str(text: &str, origin: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: origin.to_string(),
            source,
        })
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text, &path.display().to_string())
    }
}

/// Iterate enabled device instances with their kind.
pub fn enabled_instances(config: &Config) -> impl Iterator<Item = (&DeviceKind, &DeviceInstance)> {
    config.devices.iter().flat_map(|kind| {
        kind.instances
            .iter()
            .filter(|inst| inst.enabled)
            .map(move |inst| (kind, inst))
    })
}

/// Maximum sampling rate across enabled, exportable instances. Falls back to
/// 250 Hz when nothing usable is configured.
pub fn compute_fs_max(config: &Config) -> f64 {
    let mut fs_values = Vec::new();
    let mut enabled_seen = 0usize;
    let mut discarded = 0usize;

    for (_, inst) in enabled_instances(config) {
        if !inst.export_enable {
            continue;
        }
        enabled_seen += 1;
        if inst.fs > 0.0 && inst.fs.is_finite() {
            fs_values.push(inst.fs);
        } else {
            discarded += 1;
        }
    }

    if let Some(fs_max) = fs_values.into_iter().reduce(f64::max) {
        info!(fs_max, enabled = enabled_seen, discarded, "fs_max derived from config");
        return fs_max;
    }

    let default_fs = 250.0;
    warn!(
        enabled = enabled_seen,
        default_fs, "no valid FS across enabled instances, using default"
    );
    default_fs
}

/// Export column inventory: `device:channel` for every enabled channel of
/// every enabled, exportable instance, insertion-ordered and deduplicated.
pub fn collect_known_channels(config: &Config) -> Vec<String> {
    let mut cols = Vec::new();
    let mut seen = std::collections::HashSet::new();

    let mut exportable = 0usize;
    let mut without_channels = 0usize;
    let mut duplicates = 0usize;

    for (_, inst) in enabled_instances(config) {
        if !inst.export_enable {
            continue;
        }
        exportable += 1;

        let dev = inst.device_name.trim();
        if dev.is_empty() {
            continue;
        }

        let mut any = false;
        for ch in inst.enabled_channels() {
            any = true;
            let key = format!("{dev}:{ch}");
            if seen.insert(key.clone()) {
                cols.push(key);
            } else {
                duplicates += 1;
            }
        }
        if !any {
            without_channels += 1;
        }
    }

    info!(columns = cols.len(), exportable, "exportable columns collected");
    if without_channels > 0 {
        warn!(count = without_channels, "export-enabled instances with no channels enabled");
    }
    if duplicates > 0 {
        warn!(count = duplicates, "duplicate channel entries deduplicated");
    }

    cols
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[events]
ENABLE_TRIGGERS = true
EVENT_KEYMAP = [["0", "REST"], ["1", "TASK"]]

[export]
LOOKAHEAD_SEC = 0.1
[export.OUT]
SYNCED_DIR = "/tmp/synced"

[ui]
PLOT_DECIMATE_HZ = 25.0

[[devices]]
KIND = "demo_rand"

[[devices.INSTANCES]]
ENABLED = true
DEVICE_NAME = "demo_1"
FS = 128.0
CHANNELS = [["ch_1", true], ["ch_2", false]]

[[devices.INSTANCES]]
ENABLED = true
DEVICE_NAME = "demo_2"
FS = 250.0
CHANNELS = [["ch_1", true], ["ch_1", true]]

[devices.FILTERS.ch_1]
BANDPASS_ENABLE = true
LOW_HZ = 0.5
HIGH_HZ = 20.0
NOTCH = 50.0
"#;

    #[test]
    fn partial_file_overlays_defaults() {
        let cfg = Config::from_toml_str(SAMPLE, "test").unwrap();
        assert_eq!(cfg.events.event_keymap.default_label(), Some("REST"));
        assert_eq!(cfg.export.lookahead_sec, 0.1);
        assert_eq!(cfg.export.out.synced_dir, "/tmp/synced");
        // Untouched fields keep their defaults.
        assert_eq!(cfg.export.out.markers_dir, "data/markers");
        assert_eq!(cfg.export.flush_period_sec, 0.25);
        assert!(cfg.export.print_k);
        assert_eq!(cfg.ui.plot_decimate_hz, 25.0);
        assert_eq!(cfg.sync.max_queue, 0);
    }

    #[test]
    fn fs_max_over_enabled_instances() {
        let cfg = Config::from_toml_str(SAMPLE, "test").unwrap();
        assert_eq!(compute_fs_max(&cfg), 250.0);
    }

    #[test]
    fn fs_max_falls_back_when_unconfigured() {
        let cfg = Config::default();
        assert_eq!(compute_fs_max(&cfg), 250.0);
    }

    #[test]
    fn channel_inventory_ordered_and_deduplicated() {
        let cfg = Config::from_toml_str(SAMPLE, "test").unwrap();
        let cols = collect_known_channels(&cfg);
        // ch_2 disabled, demo_2's duplicate ch_1 dropped.
        assert_eq!(cols, vec!["demo_1:ch_1", "demo_2:ch_1"]);
    }

    #[test]
    fn filter_block_converts_to_spec() {
        let cfg = Config::from_toml_str(SAMPLE, "test").unwrap();
        let spec = cfg.devices[0].filter_spec_for("ch_1").unwrap();
        let bp = spec.band_pass.unwrap();
        assert_eq!(bp.low_hz, 0.5);
        assert_eq!(bp.order, 4);
        assert_eq!(spec.notch.unwrap().freq_hz, 50.0);
        assert!(cfg.devices[0].filter_spec_for("nope").is_none());
    }

    #[test]
    fn keymap_lookup() {
        let km = KeyMap(vec![("0".into(), "REST".into()), ("1".into(), "TASK".into())]);
        assert_eq!(km.lookup("1"), Some("TASK"));
        assert_eq!(km.lookup("x"), None);
        assert_eq!(km.default_label(), Some("REST"));
    }
}
