use std::sync::Mutex;
use std::thread::sleep;
use std::time::{Duration, Instant};

/// Minimum spacing between upstream calls, shared by every fetch worker.
///
/// The lock is held across read, sleep and write so two workers never claim
/// the same slot.
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    last_request_at: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_request_at: Mutex::new(None),
        }
    }

    pub fn from_millis(millis: u64) -> Self {
        Self::new(Duration::from_millis(millis))
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Block until the next request may go out, then claim the slot.
    pub fn acquire(&self) {
        let mut last = match self.last_request_at.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.min_interval {
                sleep(self.min_interval - elapsed);
            }
        }
        *last = Some(Instant::now());
    }
}
