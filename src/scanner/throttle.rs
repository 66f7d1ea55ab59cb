use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::config::ConfigProvider;

const SLICE: Duration = Duration::from_millis(50);

/// Cooperative CPU yield while the UI is in the background.
#[derive(Debug, Clone, Copy)]
pub struct Throttle {
    factor: u32,
    max: Duration,
}

impl Throttle {
    pub fn new(factor: u32, max_ms: u64) -> Self {
        Self {
            factor,
            max: Duration::from_millis(max_ms),
        }
    }

    /// Sleep owed after spending `elapsed` on one unit of work.
    pub fn delay_for(&self, elapsed: Duration) -> Duration {
        elapsed.saturating_mul(self.factor).min(self.max)
    }

    /// Sleep if throttling is enabled and the UI is not in the foreground.
    /// Returns early when `cancel` is raised.
    pub fn pause(&self, elapsed: Duration, config: &dyn ConfigProvider, cancel: &AtomicBool) {
        if !config.dynamic_throttle_enabled() || config.is_foreground() {
            return;
        }

        let mut remaining = self.delay_for(elapsed);
        while !remaining.is_zero() && !cancel.load(Ordering::SeqCst) {
            let step = remaining.min(SLICE);
            std::thread::sleep(step);
            remaining -= step;
        }
    }
}
