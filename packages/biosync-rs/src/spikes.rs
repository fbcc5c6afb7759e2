// One-shot spike bus: instantaneous labels, no sticky state.

use crate::config::KeyMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{error, info, warn};

/// Broadcast payload. `k` is present only for replays at a quantized time.
#[derive(Debug, Clone)]
pub struct SpikeNotice {
    pub ts: f64,
    pub k: Option<i64>,
    pub label: String,
    pub source: String,
}

type Subscriber = Box<dyn Fn(&SpikeNotice) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriberId(u64);

pub struct SpikeBus {
    enabled: bool,
    keymap: KeyMap,
    subscribers: Mutex<Vec<(u64, Subscriber)>>,
    next_id: AtomicU64,
    warned_keys: Mutex<HashSet<String>>,
    epoch: Instant,
}

impl SpikeBus {
    pub fn new(keymap: KeyMap, enabled: bool) -> Self {
        let labels: Vec<&str> = keymap.labels().collect();
        info!(enabled, triggers = ?labels, "spike bus ready");
        Self {
            enabled,
            keymap,
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            warned_keys: Mutex::new(HashSet::new()),
            epoch: Instant::now(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn subscribe<F>(&self, f: F) -> SubscriberId
    where
        F: Fn(&SpikeNotice) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut subs = self.subscribers.lock();
        subs.push((id, Box::new(f)));
        info!(n = subs.len(), "spike subscriber added");
        SubscriberId(id)
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut subs = self.subscribers.lock();
        let before = subs.len();
        subs.retain(|(sid, _)| *sid != id.0);
        subs.len() != before
    }

    /// Fire the spike mapped to `key`. No toggle rule; spikes are one-shot.
    pub fn set_by_key(&self, key: &str, source: &str) -> Option<String> {
        if !self.enabled {
            warn!(key, "spike trigger ignored (triggers disabled)");
            return None;
        }
        match self.keymap.lookup(key) {
            Some(label) => self.set_spike(label, source),
            None => {
                if self.warned_keys.lock().insert(key.to_string()) {
                    warn!(key, "unmapped spike key");
                }
                None
            }
        }
    }

    /// Broadcast a spike "now". Returns the label, or `None` when disabled.
    pub fn set_spike(&self, label: &str, source: &str) -> Option<String> {
        if !self.enabled {
            warn!(label, "spike ignored (triggers disabled)");
            return None;
        }
        self.broadcast(&SpikeNotice {
            ts: self.epoch.elapsed().as_secs_f64(),
            k: None,
            label: label.to_string(),
            source: source.to_string(),
        });
        Some(label.to_string())
    }

    /// Broadcast a spike at an externally quantized time.
    pub fn announce_at(&self, t_q: f64, k: i64, label: &str, source: &str) {
        self.broadcast(&SpikeNotice {
            ts: t_q,
            k: Some(k),
            label: label.to_string(),
            source: source.to_string(),
        });
    }

    fn broadcast(&self, notice: &SpikeNotice) {
        let subs = self.subscribers.lock();
        for (id, f) in subs.iter() {
            if let Err(e) = f(notice) {
                error!(subscriber = id, error = %e, "spike subscriber failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn keymap() -> KeyMap {
        KeyMap(vec![("q".into(), "SPIKE_Q".into()), ("w".into(), "SPIKE_W".into())])
    }

    #[test]
    fn spike_broadcasts_label() {
        let bus = SpikeBus::new(keymap(), true);
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = Arc::clone(&seen);
        bus.subscribe(move |n| {
            assert_eq!(n.label, "SPIKE_Q");
            seen_clone.fetch_add(1, Ordering::Relaxed);
            Ok(())
        });

        assert_eq!(bus.set_by_key("q", "keyboard").as_deref(), Some("SPIKE_Q"));
        assert_eq!(seen.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn repeated_spike_is_not_a_toggle() {
        let bus = SpikeBus::new(keymap(), true);
        assert_eq!(bus.set_spike("SPIKE_Q", "api").as_deref(), Some("SPIKE_Q"));
        assert_eq!(bus.set_spike("SPIKE_Q", "api").as_deref(), Some("SPIKE_Q"));
    }

    #[test]
    fn disabled_and_unmapped() {
        let bus = SpikeBus::new(keymap(), false);
        assert!(bus.set_spike("SPIKE_Q", "api").is_none());

        let bus = SpikeBus::new(keymap(), true);
        assert!(bus.set_by_key("z", "keyboard").is_none());
    }

    #[test]
    fn announce_carries_quantized_instant() {
        let bus = SpikeBus::new(keymap(), true);
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = Arc::clone(&seen);
        bus.subscribe(move |n| {
            assert_eq!(n.k, Some(7));
            assert!((n.ts - 0.07).abs() < 1e-12);
            seen_clone.fetch_add(1, Ordering::Relaxed);
            Ok(())
        });
        bus.announce_at(0.07, 7, "SPIKE_W", "sync");
        assert_eq!(seen.load(Ordering::Relaxed), 1);
    }
}
