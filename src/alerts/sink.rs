//! Alert delivery capabilities.
//!
//! A sink is the two-method surface downstream transports implement. The
//! engine calls sinks after the per-key state transition has been committed,
//! outside its own lock, so a slow transport cannot stall alert accounting.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

use super::{Alert, Severity};
use crate::util::now_ms;

pub trait AlertSink: Send + Sync {
    fn on_raise(&self, alert: &Alert);
    fn on_resolve(&self, alert: &Alert);
}

/// Writes alert transitions to the log at a level matching their severity.
pub struct LogSink;

impl AlertSink for LogSink {
    fn on_raise(&self, alert: &Alert) {
        match alert.severity {
            Severity::Info => {
                info!(key = %alert.key, message = %alert.message, "alert raised")
            }
            Severity::Warn => {
                warn!(key = %alert.key, message = %alert.message, "alert raised")
            }
            Severity::Error | Severity::Critical => {
                error!(key = %alert.key, severity = %alert.severity, message = %alert.message, "alert raised")
            }
        }
    }

    fn on_resolve(&self, alert: &Alert) {
        info!(key = %alert.key, "alert resolved");
    }
}

/// Per-key cooldown in front of another sink.
///
/// Repeated raises of the same key are forwarded at most once per cooldown
/// window; resolves always pass so the downstream transport can close the
/// loop it opened.
pub struct CooldownSink {
    inner: Arc<dyn AlertSink>,
    cooldown_ms: i64,
    last_sent_ms: Mutex<HashMap<String, i64>>,
}

impl CooldownSink {
    pub fn new(inner: Arc<dyn AlertSink>, cooldown_ms: i64) -> Self {
        Self {
            inner,
            cooldown_ms,
            last_sent_ms: Mutex::new(HashMap::new()),
        }
    }
}

impl AlertSink for CooldownSink {
    fn on_raise(&self, alert: &Alert) {
        let now = now_ms();
        {
            let mut last = self.last_sent_ms.lock();
            match last.get(&alert.key) {
                Some(sent) if now - sent < self.cooldown_ms => return,
                _ => {
                    last.insert(alert.key.clone(), now);
                }
            }
        }
        self.inner.on_raise(alert);
    }

    fn on_resolve(&self, alert: &Alert) {
        self.inner.on_resolve(alert);
    }
}
