//! Real-time multi-device physiological signal acquisition core.
//!
//! Heterogeneous producers push timestamped packets into a central
//! synchronizer that projects every device clock onto one quantized grid
//! and fans tagged payloads out to non-blocking sinks: a CSV exporter that
//! assembles wide rows with late-packet tolerance, and a decimated plot
//! queue. Sticky events and one-shot spikes travel in-band with the sample
//! stream.
//!
//! Architecture:
//! - `queue`: drop-oldest bounded ingestion and per-sink payload channels
//! - `timebase`: per-device anchors and grid quantization
//! - `sync`: session lifecycle, consumer thread, fan-out, plot decimation
//! - `filters`: cached SOS design and per-channel streaming state
//! - `events` / `spikes`: marker buses with subscriber fan-out
//! - `export`: row-assembling CSV sink with markers sidecar
//! - `config` / `runtime` / `demo`: configuration surface, producer
//!   supervision, and synthetic producers

pub mod config;
pub mod demo;
pub mod error;
pub mod events;
pub mod export;
pub mod filters;
pub mod plot;
pub mod queue;
pub mod runtime;
pub mod spikes;
pub mod sync;
pub mod timebase;
pub mod types;

pub use config::{collect_known_channels, compute_fs_max, enabled_instances, Config, KeyMap};
pub use error::{ConfigError, ExportError, SyncError};
pub use events::{EventBus, EventNotice};
pub use export::{CsvExportSink, ExportConfig};
pub use filters::{design_sos, FilterSpec, SosCascade, StreamingSos};
pub use plot::PlotStatsSink;
pub use queue::{sink_channel, IngressQueue, SinkSender};
pub use runtime::{wait_for_producers, Producer, ShutdownFlag};
pub use spikes::{SpikeBus, SpikeNotice};
pub use sync::SyncController;
pub use timebase::{DeviceAnchor, Timebase};
pub use types::{ChannelValue, SamplePacket, SyncPayload, SyncStats};
