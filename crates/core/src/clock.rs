use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::CoreError;

/// Milliseconds since Unix epoch.
pub type Millis = u64;

/// Returns the current wall-clock time as milliseconds since Unix epoch.
pub fn physical_now() -> Result<Millis, CoreError> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .map_err(|_| CoreError::Clock("system clock before epoch".into()))
}

/// Source of wall-clock time for detection windows, TTLs and resolution timing.
pub trait Clock: Send + Sync {
    fn now(&self) -> Result<Millis, CoreError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Result<Millis, CoreError> {
        physical_now()
    }
}

/// A clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start: Millis) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start)),
        }
    }

    pub fn set(&self, at: Millis) {
        self.now.store(at, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Millis) -> Millis {
        self.now.fetch_add(by, Ordering::SeqCst) + by
    }

    pub fn get(&self) -> Millis {
        self.now.load(Ordering::SeqCst)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Result<Millis, CoreError> {
        Ok(self.get())
    }
}
