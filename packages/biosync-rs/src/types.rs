// Common types shared across the synchronization pipeline.

use serde::{Deserialize, Serialize};

/// A single channel reading. `None` is the missing-sample sentinel: it must
/// survive filtering and quantization and is rendered as an empty CSV cell.
pub type ChannelValue = Option<f64>;

/// Raw packet pushed by a producer into the synchronizer.
///
/// `device_ts` is in the device's own clock (seconds); the synchronizer maps
/// it onto the session grid through the per-device anchor. Channel names are
/// the bare channel identifiers (e.g. `gsr_uS`); sinks see them joined with
/// the device name as `device:channel`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplePacket {
    pub device_ts: f64,
    pub device: String,
    pub channels: Vec<(String, ChannelValue)>,
}

impl SamplePacket {
    pub fn new(device_ts: f64, device: impl Into<String>, channels: Vec<(String, ChannelValue)>) -> Self {
        Self {
            device_ts,
            device: device.into(),
            channels,
        }
    }
}

/// Quantized payload fanned out from the synchronizer consumer to sinks.
///
/// `k` is the integer grid index, `t_q = k * delta` floored to the session's
/// decimal count. Events carry the resolved sticky transition; spikes are
/// one-shot labels attached to a single grid instant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncPayload {
    Sample {
        k: i64,
        t_q: f64,
        device: String,
        channels: Vec<(String, ChannelValue)>,
    },
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
}

impl SyncPayload {
    /// Grid index of this payload, whatever its kind.
    pub fn k(&self) -> i64 {
        match self {
            SyncPayload::Sample { k, .. }
            | SyncPayload::Event { k, .. }
            | SyncPayload::Spike { k, .. } => *k,
        }
    }

    pub fn is_sample(&self) -> bool {
        matches!(self, SyncPayload::Sample { .. })
    }
}

/// Counters exposed by the synchronizer for logging and diagnostics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncStats {
    pub packets_consumed: u64,
    pub ingress_dropped: u64,
    pub sink_dropped: u64,
    pub plot_sink_dropped: u64,
    pub anchor_resets: u64,
}
