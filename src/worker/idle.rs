use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Rate limits this node's `idle` announcements.
///
/// All worker tasks share one advertiser, so the tracker hears at most one
/// `INFORM idle` per interval however many workers are waiting.
#[derive(Debug)]
pub struct IdleAdvertiser {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl IdleAdvertiser {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(None),
        }
    }

    /// Whether an announcement is due now. A `true` answer reserves the
    /// current interval for the caller.
    pub fn due(&self) -> bool {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        match *last {
            Some(at) if now.duration_since(at) < self.interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }

    /// Forget the last announcement, so the next idle worker announces at once.
    pub fn reset(&self) {
        *self.last.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}
