//! Streaming IIR filters as cascaded second-order sections (biquads).
//!
//! Filter design is stateless and memoized process-wide; per-channel
//! streaming state lives in `StreamingSos`, one instance per
//! (device instance, channel). The cascade itself is immutable and shared.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::f64::consts::PI;
use std::sync::{Arc, OnceLock};
use tracing::{error, info, warn};

/// Band-pass design request: Butterworth of the given order between the
/// two edges.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BandPassSpec {
    pub order: u32,
    pub low_hz: f64,
    pub high_hz: f64,
}

/// Power-line notch design request. Only 50 and 60 Hz are meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NotchSpec {
    pub freq_hz: f64,
    pub q: f64,
}

/// Immutable filter design input. Both sections disabled means identity.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FilterSpec {
    pub band_pass: Option<BandPassSpec>,
    pub notch: Option<NotchSpec>,
}

impl FilterSpec {
    pub fn is_identity(&self) -> bool {
        self.band_pass.is_none() && self.notch.is_none()
    }
}

/// Single biquad, transfer function
/// H(z) = (b0 + b1 z^-1 + b2 z^-2) / (1 + a1 z^-1 + a2 z^-2).
#[derive(Debug, Clone, Copy)]
pub struct BiquadCoeffs {
    pub b0: f64,
    pub b1: f64,
    pub b2: f64,
    pub a1: f64,
    pub a2: f64,
}

/// Immutable cascade of second-order sections. Shared across streaming
/// instances via `Arc`; never mutated after design.
#[derive(Debug)]
pub struct SosCascade {
    sections: Vec<BiquadCoeffs>,
    gain: f64,
}

impl SosCascade {
    fn identity() -> Self {
        Self {
            sections: Vec::new(),
            gain: 1.0,
        }
    }

    pub fn is_identity(&self) -> bool {
        self.sections.is_empty()
    }

    pub fn num_sections(&self) -> usize {
        self.sections.len()
    }
}

// ---------------------------------------------------------------------------
// Design
// ---------------------------------------------------------------------------

/// Frequency prewarp for the bilinear transform.
fn prewarp(freq: f64, fs: f64) -> f64 {
    (PI * freq / fs).tan()
}

/// Butterworth lowpass sections via bilinear transform. Odd orders get a
/// trailing first-order section.
fn butter_lowpass(wn: f64, order: u32) -> Vec<BiquadCoeffs> {
    let num_sections = ((order + 1) / 2) as usize;
    let mut sections = Vec::with_capacity(num_sections);

    for k in 0..num_sections {
        if order % 2 == 1 && k == num_sections - 1 {
            let c = wn / (1.0 + wn);
            sections.push(BiquadCoeffs {
                b0: c,
                b1: c,
                b2: 0.0,
                a1: (wn - 1.0) / (wn + 1.0),
                a2: 0.0,
            });
        } else {
            let theta = PI * (2.0 * k as f64 + 1.0) / (2.0 * order as f64);
            let alpha = -2.0 * theta.cos();
            let wn2 = wn * wn;
            let denom = 1.0 + alpha * wn + wn2;
            sections.push(BiquadCoeffs {
                b0: wn2 / denom,
                b1: 2.0 * wn2 / denom,
                b2: wn2 / denom,
                a1: 2.0 * (wn2 - 1.0) / denom,
                a2: (1.0 - alpha * wn + wn2) / denom,
            });
        }
    }
    sections
}

/// Butterworth highpass sections, same pole layout as the lowpass.
fn butter_highpass(wn: f64, order: u32) -> Vec<BiquadCoeffs> {
    let num_sections = ((order + 1) / 2) as usize;
    let mut sections = Vec::with_capacity(num_sections);

    for k in 0..num_sections {
        if order % 2 == 1 && k == num_sections - 1 {
            let c = 1.0 / (1.0 + wn);
            sections.push(BiquadCoeffs {
                b0: c,
                b1: -c,
                b2: 0.0,
                a1: (wn - 1.0) / (wn + 1.0),
                a2: 0.0,
            });
        } else {
            let theta = PI * (2.0 * k as f64 + 1.0) / (2.0 * order as f64);
            let alpha = -2.0 * theta.cos();
            let wn2 = wn * wn;
            let denom = 1.0 + alpha * wn + wn2;
            sections.push(BiquadCoeffs {
                b0: 1.0 / denom,
                b1: -2.0 / denom,
                b2: 1.0 / denom,
                a1: 2.0 * (wn2 - 1.0) / denom,
                a2: (1.0 - alpha * wn + wn2) / denom,
            });
        }
    }
    sections
}

/// Band-pass as a highpass/lowpass cascade.
fn butter_bandpass(low: f64, high: f64, fs: f64, order: u32) -> Vec<BiquadCoeffs> {
    let mut sections = butter_highpass(prewarp(low, fs), order);
    sections.extend(butter_lowpass(prewarp(high, fs), order));
    sections
}

/// RBJ notch at `freq` with quality factor `q`.
fn notch_section(freq: f64, fs: f64, q: f64) -> BiquadCoeffs {
    let w0 = 2.0 * PI * freq / fs;
    let bandwidth = w0 / q;
    let cos_w0 = w0.cos();
    let alpha = w0.sin() * (bandwidth / 2.0).sinh();

    let a0 = 1.0 + alpha;
    BiquadCoeffs {
        b0: 1.0 / a0,
        b1: -2.0 * cos_w0 / a0,
        b2: 1.0 / a0,
        a1: -2.0 * cos_w0 / a0,
        a2: (1.0 - alpha) / a0,
    }
}

/// Sanitized primitives a spec reduces to, also the cache key fields.
/// Floats are fixed to micro-hertz so semantically identical specs hash
/// identically.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DesignKey {
    sensor: String,
    fs_uhz: i64,
    band_pass: Option<(u32, i64, i64)>,
    notch: Option<(i64, i64)>,
}

fn canon(hz: f64) -> i64 {
    (hz * 1e6).round() as i64
}

/// Validate and normalize a spec against the sampling rate. Invalid
/// sections are dropped with a warning; an out-of-set notch frequency is
/// coerced to 50 Hz. Never fails: the worst outcome is an identity design.
fn sanitize(sensor: &str, fs: f64, spec: &FilterSpec) -> (Option<BandPassSpec>, Option<NotchSpec>) {
    let nyquist = fs / 2.0;

    let band_pass = spec.band_pass.filter(|bp| {
        let valid = bp.order >= 1 && 0.0 < bp.low_hz && bp.low_hz < bp.high_hz && bp.high_hz < nyquist;
        if !valid {
            warn!(
                sensor,
                low = bp.low_hz,
                high = bp.high_hz,
                order = bp.order,
                nyquist,
                "invalid band-pass spec, section disabled"
            );
        }
        valid
    });

    let notch = spec.notch.and_then(|mut n| {
        if n.freq_hz != 50.0 && n.freq_hz != 60.0 {
            warn!(sensor, freq = n.freq_hz, "unsupported notch frequency, coercing to 50 Hz");
            n.freq_hz = 50.0;
        }
        if !(n.q > 0.0) {
            warn!(sensor, q = n.q, "non-positive notch Q, section disabled");
            return None;
        }
        if n.freq_hz >= nyquist {
            warn!(sensor, freq = n.freq_hz, nyquist, "notch above Nyquist, section disabled");
            return None;
        }
        Some(n)
    });

    (band_pass, notch)
}

const DESIGN_CACHE_CAP: usize = 128;

/// Bounded LRU over designed cascades. Reads after publication are cheap
/// Arc clones; the map is only locked around lookup/insert.
struct DesignCache {
    map: HashMap<DesignKey, Arc<SosCascade>>,
    order: VecDeque<DesignKey>,
}

impl DesignCache {
    fn get(&mut self, key: &DesignKey) -> Option<Arc<SosCascade>> {
        let cascade = self.map.get(key)?.clone();
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            if let Some(k) = self.order.remove(pos) {
                self.order.push_back(k);
            }
        }
        Some(cascade)
    }

    fn insert(&mut self, key: DesignKey, cascade: Arc<SosCascade>) {
        while self.order.len() >= DESIGN_CACHE_CAP {
            if let Some(evicted) = self.order.pop_front() {
                self.map.remove(&evicted);
            }
        }
        self.order.push_back(key.clone());
        self.map.insert(key, cascade);
    }
}

fn design_cache() -> &'static Mutex<DesignCache> {
    static CACHE: OnceLock<Mutex<DesignCache>> = OnceLock::new();
    CACHE.get_or_init(|| {
        Mutex::new(DesignCache {
            map: HashMap::new(),
            order: VecDeque::new(),
        })
    })
}

/// Design (or fetch from cache) the SOS cascade for a sensor. Build order is
/// notch first, then band-pass. Design problems degrade to fewer sections or
/// the identity cascade; acquisition threads are never killed by a bad spec.
pub fn design_sos(sensor_key: &str, fs: f64, spec: &FilterSpec) -> Arc<SosCascade> {
    if !(fs > 0.0) {
        warn!(sensor = sensor_key, fs, "non-positive sampling rate, identity filter");
        return Arc::new(SosCascade::identity());
    }

    let (band_pass, notch) = sanitize(sensor_key, fs, spec);

    let key = DesignKey {
        sensor: sensor_key.to_string(),
        fs_uhz: canon(fs),
        band_pass: band_pass.map(|bp| (bp.order, canon(bp.low_hz), canon(bp.high_hz))),
        notch: notch.map(|n| (canon(n.freq_hz), canon(n.q))),
    };

    let mut cache = design_cache().lock();
    if let Some(hit) = cache.get(&key) {
        return hit;
    }

    let mut sections = Vec::new();
    if let Some(n) = notch {
        sections.push(notch_section(n.freq_hz, fs, n.q));
    }
    if let Some(bp) = band_pass {
        sections.extend(butter_bandpass(bp.low_hz, bp.high_hz, fs, bp.order));
    }

    let summary = match (&notch, &band_pass) {
        (None, None) => "identity".to_string(),
        _ => {
            let mut parts = Vec::new();
            if let Some(n) = notch {
                parts.push(format!("notch={}Hz(Q={:.1})", n.freq_hz, n.q));
            }
            if let Some(bp) = band_pass {
                parts.push(format!("bp=[{:.2}-{:.2} Hz, ord={}]", bp.low_hz, bp.high_hz, bp.order));
            }
            parts.join(", ")
        }
    };
    info!(sensor = sensor_key, fs, %summary, "filter designed");

    let cascade = Arc::new(SosCascade { sections, gain: 1.0 });
    cache.insert(key, cascade.clone());
    cascade
}

// ---------------------------------------------------------------------------
// Streaming
// ---------------------------------------------------------------------------

/// Stateful single-sample filter over a shared cascade.
///
/// The cascade may be shared between instances; the `zi` delay state must
/// not be. One instance per (device instance, channel). A missing sample
/// passes through without advancing the state. If the math goes non-finite
/// the instance logs once and becomes a pass-through for the rest of the
/// session.
pub struct StreamingSos {
    cascade: Arc<SosCascade>,
    zi: Vec<[f64; 2]>,
    ctx: String,
    poisoned: bool,
}

impl StreamingSos {
    pub fn new(cascade: Arc<SosCascade>, context: impl Into<String>) -> Self {
        let zi = vec![[0.0; 2]; cascade.num_sections()];
        let ctx = context.into();
        info!(stages = cascade.num_sections(), ctx = %ctx, "streaming filter ready");
        Self {
            cascade,
            zi,
            ctx,
            poisoned: false,
        }
    }

    /// Filter one sample. Direct Form II Transposed per section.
    pub fn apply(&mut self, x: Option<f64>) -> Option<f64> {
        let x = x?;
        if self.poisoned || self.cascade.is_identity() {
            return Some(x);
        }

        let mut y = x * self.cascade.gain;
        for (coeffs, zi) in self.cascade.sections.iter().zip(self.zi.iter_mut()) {
            let out = coeffs.b0 * y + zi[0];
            zi[0] = coeffs.b1 * y - coeffs.a1 * out + zi[1];
            zi[1] = coeffs.b2 * y - coeffs.a2 * out;
            y = out;
        }

        if !y.is_finite() {
            error!(ctx = %self.ctx, "filter output non-finite, degrading to pass-through");
            self.poisoned = true;
            return Some(x);
        }
        Some(y)
    }

    /// Rezero the delay state without touching the topology.
    pub fn reset(&mut self) {
        for zi in &mut self.zi {
            *zi = [0.0; 2];
        }
        self.poisoned = false;
    }

    pub fn context(&self) -> &str {
        &self.ctx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bandpass_spec(low: f64, high: f64) -> FilterSpec {
        FilterSpec {
            band_pass: Some(BandPassSpec {
                order: 4,
                low_hz: low,
                high_hz: high,
            }),
            notch: None,
        }
    }

    #[test]
    fn identity_spec_designs_empty_cascade() {
        let cascade = design_sos("test:id", 100.0, &FilterSpec::default());
        assert!(cascade.is_identity());
    }

    #[test]
    fn design_is_cached_by_canonical_spec() {
        let a = design_sos("cache:ch", 250.0, &bandpass_spec(1.0, 40.0));
        let b = design_sos("cache:ch", 250.0, &bandpass_spec(1.0, 40.0));
        assert!(Arc::ptr_eq(&a, &b));

        let c = design_sos("cache:ch", 250.0, &bandpass_spec(1.0, 41.0));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn invalid_bandpass_degrades_to_identity() {
        let spec = bandpass_spec(40.0, 1.0);
        let cascade = design_sos("bad:bp", 100.0, &spec);
        assert!(cascade.is_identity());
    }

    #[test]
    fn notch_55_is_coerced_and_still_filters() {
        let spec = FilterSpec {
            band_pass: None,
            notch: Some(NotchSpec { freq_hz: 55.0, q: 30.0 }),
        };
        let cascade = design_sos("coerce:notch", 1000.0, &spec);
        assert_eq!(cascade.num_sections(), 1);

        // Coerced to 50 Hz, so a 50 Hz tone must be attenuated.
        let mut filt = StreamingSos::new(cascade, "coerce:notch");
        let fs = 1000.0;
        let signal: Vec<f64> = (0..2000)
            .map(|i| (2.0 * PI * 50.0 * i as f64 / fs).sin())
            .collect();
        let out: Vec<f64> = signal.iter().map(|&s| filt.apply(Some(s)).unwrap()).collect();

        let rms = |v: &[f64]| (v.iter().map(|x| x * x).sum::<f64>() / v.len() as f64).sqrt();
        assert!(rms(&out[1000..]) < rms(&signal[1000..]) * 0.1);
    }

    #[test]
    fn notch_passes_dc() {
        let spec = FilterSpec {
            band_pass: None,
            notch: Some(NotchSpec { freq_hz: 50.0, q: 30.0 }),
        };
        let mut filt = StreamingSos::new(design_sos("dc:notch", 500.0, &spec), "dc:notch");
        let mut last = 0.0;
        for _ in 0..2000 {
            last = filt.apply(Some(1.0)).unwrap();
        }
        assert!((last - 1.0).abs() < 0.01);
    }

    #[test]
    fn missing_sample_passes_through_without_advancing_state() {
        let cascade = design_sos("gap:ch", 100.0, &bandpass_spec(1.0, 20.0));
        let mut with_gap = StreamingSos::new(cascade.clone(), "gap:a");
        let mut control = StreamingSos::new(cascade, "gap:b");

        let a1 = with_gap.apply(Some(1.0));
        let gap = with_gap.apply(None);
        let a2 = with_gap.apply(Some(1.0));

        let b1 = control.apply(Some(1.0));
        let b2 = control.apply(Some(1.0));

        assert_eq!(gap, None);
        assert_eq!(a1, b1);
        assert_eq!(a2, b2);
    }

    #[test]
    fn reset_rezeros_state() {
        let cascade = design_sos("reset:ch", 100.0, &bandpass_spec(1.0, 20.0));
        let mut filt = StreamingSos::new(cascade.clone(), "reset:a");
        let mut fresh = StreamingSos::new(cascade, "reset:b");

        let first = filt.apply(Some(1.0));
        filt.apply(Some(-0.5));
        filt.reset();
        assert_eq!(filt.apply(Some(1.0)), first);
        assert_eq!(first, fresh.apply(Some(1.0)));
    }

    #[test]
    fn shared_cascade_independent_state() {
        let cascade = design_sos("share:ch", 100.0, &bandpass_spec(1.0, 20.0));
        let mut a = StreamingSos::new(cascade.clone(), "share:a");
        let mut b = StreamingSos::new(cascade, "share:b");

        a.apply(Some(5.0));
        a.apply(Some(-3.0));
        // b's state is untouched by a's history.
        let mut fresh = StreamingSos::new(design_sos("share:ch", 100.0, &bandpass_spec(1.0, 20.0)), "share:c");
        assert_eq!(b.apply(Some(1.0)), fresh.apply(Some(1.0)));
    }

    #[test]
    fn bandpass_attenuates_out_of_band() {
        let mut filt = StreamingSos::new(design_sos("band:ch", 250.0, &bandpass_spec(5.0, 20.0)), "band");
        // 60 Hz is well above the 20 Hz edge.
        let fs = 250.0;
        let out: Vec<f64> = (0..2500)
            .map(|i| (2.0 * PI * 60.0 * i as f64 / fs).sin())
            .map(|s| filt.apply(Some(s)).unwrap())
            .collect();
        let rms = (out[1250..].iter().map(|x| x * x).sum::<f64>() / 1250.0).sqrt();
        assert!(rms < 0.1);
    }
}
