// Host timebase: per-device anchors and delta-grid quantization.
//
// Each device keeps its own clock; the first packet from a device anchors
// that clock to host-relative session time with an offset-only mapping.
// A backward jump in the device clock re-anchors at the current host time
// and bumps the anchor epoch.

use std::collections::HashMap;
use tracing::{info, warn};

/// Tolerance for backward-jump detection, absorbs float noise in device
/// timestamps without masking real clock resets.
const BACKWARD_EPS: f64 = 1e-12;

/// Per-device anchor mapping the device clock origin onto session time.
#[derive(Debug, Clone)]
pub struct DeviceAnchor {
    /// First device timestamp seen (or the timestamp at the last re-anchor).
    pub first_device_ts: f64,
    /// Host-relative time captured when the anchor was (re)created.
    pub host_at_first: f64,
    /// Last accepted device timestamp; backward motion relative to this
    /// triggers a re-anchor.
    pub last_device_ts: f64,
    /// Count of re-anchors caused by backward clock motion.
    pub epoch: u32,
}

/// Session grid: delta spacing, derived formatting decimals, and the anchor
/// table. Owned by the synchronizer consumer thread; no locking needed.
pub struct Timebase {
    delta: f64,
    decimals: u32,
    anchors: HashMap<String, DeviceAnchor>,
    resets: u64,
}

impl Timebase {
    pub fn new(delta: f64) -> Self {
        Self {
            delta,
            decimals: decimals_for(delta),
            anchors: HashMap::new(),
            resets: 0,
        }
    }

    pub fn delta(&self) -> f64 {
        self.delta
    }

    pub fn decimals(&self) -> u32 {
        self.decimals
    }

    /// Map a device timestamp to host-relative time using the offset-only
    /// anchor, creating or resetting the anchor as needed. `host_now` is the
    /// caller's current host-relative time.
    pub fn map_to_host(&mut self, device: &str, device_ts: f64, host_now: f64) -> f64 {
        let anchor = match self.anchors.get_mut(device) {
            None => {
                self.anchors.insert(
                    device.to_string(),
                    DeviceAnchor {
                        first_device_ts: device_ts,
                        host_at_first: host_now.max(0.0),
                        last_device_ts: device_ts,
                        epoch: 0,
                    },
                );
                info!(device, "anchor created");
                return host_now.max(0.0);
            }
            Some(anchor) => anchor,
        };

        if device_ts + BACKWARD_EPS < anchor.last_device_ts {
            anchor.first_device_ts = device_ts;
            anchor.host_at_first = host_now.max(0.0);
            anchor.epoch += 1;
            self.resets += 1;
            warn!(device, epoch = anchor.epoch, "device clock moved backward, anchor reset");
        }
        anchor.last_device_ts = device_ts;

        let estimate = anchor.host_at_first + (device_ts - anchor.first_device_ts);
        estimate.max(0.0)
    }

    /// Quantize a host-relative time onto the grid.
    pub fn quantize(&self, t_host: f64) -> (i64, f64) {
        quantize(t_host, self.delta, self.decimals)
    }

    pub fn anchor(&self, device: &str) -> Option<&DeviceAnchor> {
        self.anchors.get(device)
    }

    pub fn anchor_resets(&self) -> u64 {
        self.resets
    }
}

/// Decimal count for t_q formatting: `max(0, ceil(-log10(delta)) + 1)`.
/// One digit beyond the grid resolution keeps adjacent grid times distinct
/// after the floor.
pub fn decimals_for(delta: f64) -> u32 {
    if !(delta > 0.0) {
        return 6;
    }
    let d = -delta.log10();
    (((d - 1e-9).ceil() as i64) + 1).max(0) as u32
}

/// Round-half-up grid quantization followed by a fixed-decimal floor.
/// Deterministic in (t_host, delta) only.
pub fn quantize(t_host: f64, delta: f64, decimals: u32) -> (i64, f64) {
    let k = (t_host / delta + 0.5).floor() as i64;
    let t_q = floor_to_decimals(k as f64 * delta, decimals);
    (k, t_q)
}

/// Floor a non-negative value to a fixed number of decimals. Flooring (not
/// rounding) keeps t_q from drifting past the true grid instant.
pub fn floor_to_decimals(x: f64, decimals: u32) -> f64 {
    if decimals == 0 {
        return x.floor();
    }
    let p = 10f64.powi(decimals as i32);
    (x * p).floor() / p
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anchor_created_on_first_packet() {
        let mut tb = Timebase::new(0.01);
        let host = tb.map_to_host("dev_a", 100.0, 0.25);
        assert_eq!(host, 0.25);
        let anchor = tb.anchor("dev_a").unwrap();
        assert_eq!(anchor.first_device_ts, 100.0);
        assert_eq!(anchor.epoch, 0);
    }

    #[test]
    fn offset_mapping_follows_device_clock() {
        let mut tb = Timebase::new(0.01);
        tb.map_to_host("dev_a", 100.0, 0.0);
        let host = tb.map_to_host("dev_a", 100.5, 9.9);
        assert!((host - 0.5).abs() < 1e-9);
    }

    #[test]
    fn backward_clock_resets_anchor() {
        // device_ts = 10.0, 10.05, then 2.0: the jump backward re-anchors at
        // the current session time, not at anything derived from 2.0.
        let mut tb = Timebase::new(0.01);
        tb.map_to_host("dev_a", 10.0, 0.0);
        let h2 = tb.map_to_host("dev_a", 10.05, 0.05);
        assert!((h2 - 0.05).abs() < 1e-9);

        let h3 = tb.map_to_host("dev_a", 2.0, 0.12);
        assert!((h3 - 0.12).abs() < 1e-9);
        let anchor = tb.anchor("dev_a").unwrap();
        assert_eq!(anchor.epoch, 1);
        assert_eq!(tb.anchor_resets(), 1);

        // Anchor continues from the reset point.
        let h4 = tb.map_to_host("dev_a", 2.5, 99.0);
        assert!((h4 - 0.62).abs() < 1e-9);
    }

    #[test]
    fn host_estimate_clamped_to_zero() {
        let mut tb = Timebase::new(0.01);
        tb.map_to_host("dev_a", 100.0, 0.0);
        // A regression within epsilon is not a reset; the estimate lands
        // just below zero and is clamped.
        let h = tb.map_to_host("dev_a", 100.0 - 1e-13, 1.0);
        assert_eq!(h, 0.0);
        assert_eq!(tb.anchor("dev_a").unwrap().epoch, 0);
    }

    #[test]
    fn quantize_rounds_half_up() {
        let (k, t_q) = quantize(0.005, 0.01, 3);
        assert_eq!(k, 1);
        assert!((t_q - 0.01).abs() < 1e-12);
        let (k, _) = quantize(0.00499, 0.01, 3);
        assert_eq!(k, 0);
    }

    #[test]
    fn quantize_is_idempotent() {
        for delta in [0.01, 0.004, 1.0 / 128.0] {
            let decimals = decimals_for(delta);
            for i in 0..500 {
                let t = i as f64 * 0.0173;
                let (k, t_q) = quantize(t, delta, decimals);
                let (k2, t_q2) = quantize(t_q, delta, decimals);
                assert_eq!(k, k2, "delta={delta} t={t}");
                assert_eq!(t_q.to_bits(), t_q2.to_bits());
            }
        }
    }

    #[test]
    fn decimals_from_delta() {
        assert_eq!(decimals_for(1.0), 1); // fs_max = 1 Hz
        assert_eq!(decimals_for(0.01), 3); // fs_max = 100 Hz
        assert_eq!(decimals_for(0.004), 4); // fs_max = 250 Hz
        assert_eq!(decimals_for(100.0), 0);
    }

    #[test]
    fn floor_keeps_decimals() {
        assert_eq!(floor_to_decimals(0.0399999, 3), 0.039);
        assert_eq!(floor_to_decimals(1.2345, 0), 1.0);
    }
}
