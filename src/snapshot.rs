use parking_lot::RwLock;
use std::sync::Arc;

use crate::registers::IMAGE_LEN;

/// Immutable meter image plus its acquisition time.
///
/// Produced only by the meter reader; everything downstream holds a shared
/// reference and never mutates it. `acquired_at_ms == 0` means the meter has
/// never been read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeterSnapshot {
    pub image: Vec<u16>,
    pub acquired_at_ms: i64,
}

impl MeterSnapshot {
    pub fn new(image: Vec<u16>, acquired_at_ms: i64) -> Self {
        Self {
            image,
            acquired_at_ms,
        }
    }

    pub fn empty() -> Self {
        Self {
            image: vec![0; IMAGE_LEN],
            acquired_at_ms: 0,
        }
    }

    pub fn is_acquired(&self) -> bool {
        self.acquired_at_ms > 0
    }

    /// Age in milliseconds, or -1 when never acquired.
    pub fn age_ms(&self, now_ms: i64) -> i64 {
        if self.is_acquired() {
            (now_ms - self.acquired_at_ms).max(0)
        } else {
            -1
        }
    }
}

/// Single-writer, multi-reader handle to the latest snapshot.
///
/// The writer replaces the whole `Arc` under a short write lock; readers
/// clone the `Arc` and work on a consistent image without blocking the
/// writer afterwards.
#[derive(Clone)]
pub struct SharedSnapshot {
    inner: Arc<RwLock<Arc<MeterSnapshot>>>,
}

impl SharedSnapshot {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(MeterSnapshot::empty()))),
        }
    }

    pub fn publish(&self, snapshot: MeterSnapshot) {
        *self.inner.write() = Arc::new(snapshot);
    }

    pub fn latest(&self) -> Arc<MeterSnapshot> {
        self.inner.read().clone()
    }
}

impl Default for SharedSnapshot {
    fn default() -> Self {
        Self::new()
    }
}
