//! Wall-clock source for `now_ticks`.
//!
//! Time is read once, by the endpoint, when a command is built. The value
//! travels inside the command so every node applies it identically.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::state::TICKS_PER_SECOND;

pub trait TickSource: Send + Sync {
    /// Current time in 100 ns ticks since the Unix epoch.
    fn now_ticks(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTicks;

impl TickSource for SystemTicks {
    fn now_ticks(&self) -> i64 {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(elapsed) => {
                elapsed.as_secs() as i64 * TICKS_PER_SECOND + i64::from(elapsed.subsec_nanos() / 100)
            }
            Err(_) => 0,
        }
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default, Clone)]
pub struct ManualTicks(Arc<AtomicI64>);

impl ManualTicks {
    pub fn new(start: i64) -> Self {
        Self(Arc::new(AtomicI64::new(start)))
    }

    pub fn advance_seconds(&self, seconds: i64) {
        self.0.fetch_add(seconds * TICKS_PER_SECOND, Ordering::SeqCst);
    }
}

impl TickSource for ManualTicks {
    fn now_ticks(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}
