//! Named alert conditions with episode accounting.
//!
//! Every failure condition in the system is identified by a stable string
//! key. Raising an inactive key opens a new episode; raising it again while
//! active only bumps the counter. Resolving closes the episode and, for
//! WARN and above, archives it in a bounded history. A bounded ring of raw
//! raise/resolve events backs the "recent activity" views.

pub mod sink;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use strum_macros::Display;

use crate::util::now_ms;
use sink::AlertSink;

pub const EVENT_RING_CAPACITY: usize = 50;
pub const EPISODE_HISTORY_CAPACITY: usize = 100;
pub const DECK_MAX: usize = 50;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Display,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Warn,
    Error,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum EventKind {
    Raise,
    Resolve,
}

/// Current state of one alert key.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub key: String,
    pub severity: Severity,
    pub message: String,
    pub active: bool,
    /// Start of the current (or last) episode.
    pub first_seen_ms: i64,
    pub last_seen_ms: i64,
    /// Raises within the current episode.
    pub count: u64,
}

/// One raw raise/resolve transition.
#[derive(Debug, Clone, Serialize)]
pub struct AlertEvent {
    pub key: String,
    pub severity: Severity,
    pub message: String,
    pub kind: EventKind,
    pub ts_ms: i64,
}

/// A closed episode archived in history.
#[derive(Debug, Clone, Serialize)]
pub struct Episode {
    pub key: String,
    pub severity: Severity,
    pub message: String,
    pub started_at_ms: i64,
    pub ended_at_ms: i64,
    pub count: u64,
}

/// Entry of the operator-facing deck: active episodes first, then recently
/// resolved ones.
#[derive(Debug, Clone, Serialize)]
pub struct DeckEntry {
    pub key: String,
    pub severity: Severity,
    pub message: String,
    pub started_at_ms: i64,
    pub ended_at_ms: Option<i64>,
    pub count: u64,
    pub active: bool,
}

/// Point-in-time view of the whole table.
#[derive(Debug, Clone, Serialize)]
pub struct AlertsView {
    /// Active alerts, most recently touched first.
    pub active: Vec<Alert>,
    /// Recent events, newest first.
    pub recent: Vec<AlertEvent>,
}

/// Consecutive identical events folded into one item.
#[derive(Debug, Clone, Serialize)]
pub struct CollapsedEvent {
    pub key: String,
    pub severity: Severity,
    pub message: String,
    pub kind: EventKind,
    pub count: usize,
    pub first_ts_ms: i64,
    pub last_ts_ms: i64,
}

#[derive(Default)]
struct EngineInner {
    alerts: HashMap<String, Alert>,
    recent: VecDeque<AlertEvent>,
    episodes: VecDeque<Episode>,
}

pub struct AlertEngine {
    inner: Mutex<EngineInner>,
    sinks: RwLock<Vec<Arc<dyn AlertSink>>>,
    stopping: AtomicBool,
}

impl AlertEngine {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(EngineInner::default()),
            sinks: RwLock::new(Vec::new()),
            stopping: AtomicBool::new(false),
        }
    }

    pub fn add_sink(&self, sink: Arc<dyn AlertSink>) {
        self.sinks.write().push(sink);
    }

    /// Suppress further raises; used once shutdown has begun so half-torn
    /// components do not page anyone.
    pub fn set_stopping(&self) {
        self.stopping.store(true, Ordering::SeqCst);
    }

    pub fn raise(&self, key: &str, severity: Severity, message: impl Into<String>) {
        if self.stopping.load(Ordering::SeqCst) {
            return;
        }
        let message = message.into();
        let now = now_ms();

        let raised = {
            let mut inner = self.inner.lock();
            let alert = inner
                .alerts
                .entry(key.to_string())
                .or_insert_with(|| Alert {
                    key: key.to_string(),
                    severity,
                    message: message.clone(),
                    active: false,
                    first_seen_ms: now,
                    last_seen_ms: now,
                    count: 0,
                });
            if !alert.active {
                // New episode.
                alert.first_seen_ms = now;
                alert.count = 0;
            }
            alert.active = true;
            alert.severity = severity;
            alert.message = message.clone();
            alert.count += 1;
            alert.last_seen_ms = now;
            let alert = alert.clone();

            Self::push_event(
                &mut inner,
                AlertEvent {
                    key: key.to_string(),
                    severity,
                    message,
                    kind: EventKind::Raise,
                    ts_ms: now,
                },
            );
            alert
        };

        for sink in self.sinks.read().iter() {
            sink.on_raise(&raised);
        }
    }

    pub fn resolve(&self, key: &str) {
        let now = now_ms();

        let resolved = {
            let mut inner = self.inner.lock();
            let Some(alert) = inner.alerts.get_mut(key) else {
                return;
            };
            if !alert.active {
                return;
            }
            alert.active = false;
            alert.last_seen_ms = now;
            let alert = alert.clone();

            Self::push_event(
                &mut inner,
                AlertEvent {
                    key: alert.key.clone(),
                    severity: alert.severity,
                    message: alert.message.clone(),
                    kind: EventKind::Resolve,
                    ts_ms: now,
                },
            );

            if alert.severity >= Severity::Warn {
                if inner.episodes.len() >= EPISODE_HISTORY_CAPACITY {
                    inner.episodes.pop_front();
                }
                inner.episodes.push_back(Episode {
                    key: alert.key.clone(),
                    severity: alert.severity,
                    message: alert.message.clone(),
                    started_at_ms: alert.first_seen_ms,
                    ended_at_ms: now,
                    count: alert.count,
                });
            }
            alert
        };

        for sink in self.sinks.read().iter() {
            sink.on_resolve(&resolved);
        }
    }

    fn push_event(inner: &mut EngineInner, event: AlertEvent) {
        if inner.recent.len() >= EVENT_RING_CAPACITY {
            inner.recent.pop_front();
        }
        inner.recent.push_back(event);
    }

    pub fn is_active(&self, key: &str) -> bool {
        self.inner
            .lock()
            .alerts
            .get(key)
            .map(|a| a.active)
            .unwrap_or(false)
    }

    pub fn snapshot(&self) -> AlertsView {
        let inner = self.inner.lock();
        let mut active: Vec<Alert> = inner
            .alerts
            .values()
            .filter(|a| a.active)
            .cloned()
            .collect();
        active.sort_by_key(|a| std::cmp::Reverse(a.last_seen_ms));
        let recent: Vec<AlertEvent> = inner.recent.iter().rev().cloned().collect();
        AlertsView { active, recent }
    }

    /// Active WARN+ episodes first (most recently touched first), then
    /// resolved history newest-first, deduplicated by (key, episode start).
    pub fn deck(&self, limit: usize) -> Vec<DeckEntry> {
        let cap = limit.max(1).min(DECK_MAX);
        let inner = self.inner.lock();

        let mut entries: Vec<DeckEntry> = Vec::new();
        let mut seen: HashSet<(String, i64)> = HashSet::new();

        let mut active: Vec<&Alert> = inner
            .alerts
            .values()
            .filter(|a| a.active && a.severity >= Severity::Warn)
            .collect();
        active.sort_by_key(|a| std::cmp::Reverse(a.last_seen_ms));
        for alert in active {
            if entries.len() >= cap {
                break;
            }
            seen.insert((alert.key.clone(), alert.first_seen_ms));
            entries.push(DeckEntry {
                key: alert.key.clone(),
                severity: alert.severity,
                message: alert.message.clone(),
                started_at_ms: alert.first_seen_ms,
                ended_at_ms: None,
                count: alert.count,
                active: true,
            });
        }

        for episode in inner.episodes.iter().rev() {
            if entries.len() >= cap {
                break;
            }
            if !seen.insert((episode.key.clone(), episode.started_at_ms)) {
                continue;
            }
            entries.push(DeckEntry {
                key: episode.key.clone(),
                severity: episode.severity,
                message: episode.message.clone(),
                started_at_ms: episode.started_at_ms,
                ended_at_ms: Some(episode.ended_at_ms),
                count: episode.count,
                active: false,
            });
        }

        entries
    }

    /// Fold the newest run of identical events (same key, message, severity
    /// and kind, consecutive timestamps no further apart than `gap_ms`) into
    /// a single item.
    pub fn latest_collapsed(&self, gap_ms: i64) -> Option<CollapsedEvent> {
        let inner = self.inner.lock();
        let mut iter = inner.recent.iter().rev();
        let newest = iter.next()?;

        let mut count = 1usize;
        let mut first_ts = newest.ts_ms;
        let mut prev_ts = newest.ts_ms;
        for event in iter {
            let same = event.key == newest.key
                && event.message == newest.message
                && event.severity == newest.severity
                && event.kind == newest.kind;
            if !same || prev_ts - event.ts_ms > gap_ms {
                break;
            }
            count += 1;
            first_ts = event.ts_ms;
            prev_ts = event.ts_ms;
        }

        Some(CollapsedEvent {
            key: newest.key.clone(),
            severity: newest.severity,
            message: newest.message.clone(),
            kind: newest.kind,
            count,
            first_ts_ms: first_ts,
            last_ts_ms: newest.ts_ms,
        })
    }
}

impl Default for AlertEngine {
    fn default() -> Self {
        Self::new()
    }
}
