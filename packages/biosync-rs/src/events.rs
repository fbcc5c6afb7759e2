// Sticky event bus: toggleable labeled state with subscriber fan-out.
//
// Keeps one current label. Setting the label that is already current
// toggles back to the default (the first keymap entry). Subscribers are
// notified on every set; the synchronizer additionally replays resolved
// transitions at their quantized time via `announce_change_at`.

use crate::config::KeyMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{error, info, warn};

/// Broadcast payload. `k` is present only for replays at a quantized time.
#[derive(Debug, Clone)]
pub struct EventNotice {
    pub ts: f64,
    pub k: Option<i64>,
    pub label: String,
    pub prev: String,
    pub source: String,
}

type Subscriber = Box<dyn Fn(&EventNotice) -> anyhow::Result<()> + Send + Sync>;

/// Opaque handle returned from `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriberId(u64);

struct StickyState {
    current: String,
    changed_at: f64,
}

pub struct EventBus {
    enabled: bool,
    keymap: KeyMap,
    default_label: String,
    state: Mutex<StickyState>,
    subscribers: Mutex<Vec<(u64, Subscriber)>>,
    next_id: AtomicU64,
    warned_keys: Mutex<HashSet<String>>,
    epoch: Instant,
}

impl EventBus {
    /// Build the bus from a keymap; the first mapped label is the default
    /// (and the initial sticky state). `REST` stands in for an empty keymap.
    pub fn new(keymap: KeyMap, enabled: bool) -> Self {
        let default_label = keymap.default_label().unwrap_or("REST").to_string();
        let labels: Vec<&str> = keymap.labels().collect();
        info!(default = %default_label, enabled, triggers = ?labels, "event bus ready");
        Self {
            enabled,
            keymap,
            default_label: default_label.clone(),
            state: Mutex::new(StickyState {
                current: default_label,
                changed_at: 0.0,
            }),
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            warned_keys: Mutex::new(HashSet::new()),
            epoch: Instant::now(),
        }
    }

    fn now(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    /// Current sticky label and the monotonic time of its last change.
    pub fn current(&self) -> (String, f64) {
        let state = self.state.lock();
        (state.current.clone(), state.changed_at)
    }

    pub fn default_label(&self) -> &str {
        &self.default_label
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Re-arm the sticky state at session start.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.current = self.default_label.clone();
        state.changed_at = self.now();
    }

    pub fn subscribe<F>(&self, f: F) -> SubscriberId
    where
        F: Fn(&EventNotice) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut subs = self.subscribers.lock();
        subs.push((id, Box::new(f)));
        info!(n = subs.len(), "event subscriber added");
        SubscriberId(id)
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut subs = self.subscribers.lock();
        let before = subs.len();
        subs.retain(|(sid, _)| *sid != id.0);
        subs.len() != before
    }

    /// Resolve a keymap key and apply the toggle rule. Unmapped keys are
    /// warned about once and ignored.
    pub fn set_by_key(&self, key: &str, source: &str) -> Option<(String, String)> {
        if !self.enabled {
            warn!(key, "event trigger ignored (triggers disabled)");
            return None;
        }
        match self.keymap.lookup(key) {
            Some(label) => self.set_event(label, source),
            None => {
                if self.warned_keys.lock().insert(key.to_string()) {
                    warn!(key, "unmapped event key");
                }
                None
            }
        }
    }

    /// Apply the toggle rule and broadcast. Returns the resolved
    /// (new, previous) pair, or `None` when triggers are disabled.
    ///
    /// Toggle rule: pressing the current label returns to the default;
    /// anything else becomes the new sticky label.
    pub fn set_event(&self, label: &str, source: &str) -> Option<(String, String)> {
        if !self.enabled {
            warn!(label, "event ignored (triggers disabled)");
            return None;
        }

        let now = self.now();
        let (new, prev) = {
            let mut state = self.state.lock();
            let prev = state.current.clone();
            let new = if label == prev {
                self.default_label.clone()
            } else {
                label.to_string()
            };
            state.current = new.clone();
            state.changed_at = now;
            (new, prev)
        };

        self.broadcast(&EventNotice {
            ts: now,
            k: None,
            label: new.clone(),
            prev: prev.clone(),
            source: source.to_string(),
        });
        Some((new, prev))
    }

    /// Broadcast an already-resolved transition at an externally quantized
    /// time. Does not touch sticky state.
    pub fn announce_change_at(&self, t_q: f64, k: i64, label: &str, prev: &str, source: &str) {
        self.broadcast(&EventNotice {
            ts: t_q,
            k: Some(k),
            label: label.to_string(),
            prev: prev.to_string(),
            source: source.to_string(),
        });
    }

    /// Notify outside the sticky-state lock; a failing subscriber is logged
    /// and never propagates.
    fn broadcast(&self, notice: &EventNotice) {
        let subs = self.subscribers.lock();
        for (id, f) in subs.iter() {
            if let Err(e) = f(notice) {
                error!(subscriber = id, error = %e, "event subscriber failed");
            }
        }
    }
}
