use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Spaces dispatch starts evenly so a job never exceeds its packets-per-second budget.
///
/// Shared by all workers of one job. Each `acquire` reserves the next free slot and sleeps
/// until it arrives; the lock is only held while reserving.
#[derive(Debug)]
pub struct RateLimiter {
    interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn per_second(rate: u32) -> Self {
        let rate = rate.max(1);
        Self {
            interval: Duration::from_nanos(1_000_000_000 / u64::from(rate)),
            next_slot: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub async fn acquire(&self) {
        let slot = {
            let mut next = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = match *next {
                Some(reserved) if reserved > now => reserved,
                _ => now,
            };
            *next = Some(slot + self.interval);
            slot
        };
        tokio::time::sleep_until(slot).await;
    }
}
