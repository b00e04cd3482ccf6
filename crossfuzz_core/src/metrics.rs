//! Folding dispatch outcomes into a job's running metrics.

use crate::driver::{Outcome, OutcomeStatus};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Per-status outcome counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub ok: u64,
    pub timeout: u64,
    pub connection_error: u64,
    pub crash_signature: u64,
    pub malformed_response: u64,
}

impl StatusCounts {
    fn bump(&mut self, status: OutcomeStatus) {
        let slot = match status {
            OutcomeStatus::Ok => &mut self.ok,
            OutcomeStatus::Timeout => &mut self.timeout,
            OutcomeStatus::ConnectionError => &mut self.connection_error,
            OutcomeStatus::CrashSignature => &mut self.crash_signature,
            OutcomeStatus::MalformedResponse => &mut self.malformed_response,
        };
        *slot += 1;
    }
}

/// Aggregate snapshot of a job's progress.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobMetrics {
    pub packets_sent: u64,
    /// Completed dispatches per second over the rolling window.
    pub packets_per_sec: f64,
    /// Exponential moving average of dispatch latency.
    pub avg_rtt_ms: f64,
    pub max_rtt_ms: f64,
    /// Outcomes with any status other than `Ok`.
    pub error_count: u64,
    pub crash_count: u64,
    pub finding_count: u64,
    /// Percentage in `[0, 100]`, non-decreasing while the job runs.
    pub progress: f64,
    pub in_flight: u64,
    pub status_counts: StatusCounts,
}

impl JobMetrics {
    pub fn error_rate(&self) -> f64 {
        if self.packets_sent == 0 {
            0.0
        } else {
            self.error_count as f64 / self.packets_sent as f64 * 100.0
        }
    }
}

/// Running fold over the outcome stream of one job.
///
/// Owned by the job's runner; observers only ever see cloned [`JobMetrics`] snapshots.
#[derive(Debug)]
pub struct MetricsAccumulator {
    metrics: JobMetrics,
    total: Option<u64>,
    window: VecDeque<Instant>,
    rate_window: Duration,
    alpha: f64,
    consecutive_connection_errors: u32,
}

impl MetricsAccumulator {
    pub fn new(total: Option<u64>, rate_window: Duration, alpha: f64) -> Self {
        Self {
            metrics: JobMetrics::default(),
            total,
            window: VecDeque::new(),
            rate_window,
            alpha,
            consecutive_connection_errors: 0,
        }
    }

    /// Dispatches currently awaiting the driver, as counted by the worker pool.
    pub fn set_in_flight(&mut self, in_flight: u64) {
        self.metrics.in_flight = in_flight;
    }

    /// Folds one completed dispatch into the metrics.
    pub fn record(&mut self, outcome: &Outcome, now: Instant) {
        let m = &mut self.metrics;
        m.packets_sent += 1;
        m.status_counts.bump(outcome.status);

        m.avg_rtt_ms = if m.packets_sent == 1 {
            outcome.latency_ms
        } else {
            self.alpha * outcome.latency_ms + (1.0 - self.alpha) * m.avg_rtt_ms
        };
        m.max_rtt_ms = m.max_rtt_ms.max(outcome.latency_ms);

        if outcome.status.is_error() {
            m.error_count += 1;
        }
        if outcome.status == OutcomeStatus::CrashSignature {
            m.crash_count += 1;
        }
        if outcome.status.is_finding() {
            m.finding_count += 1;
        }
        if outcome.status == OutcomeStatus::ConnectionError {
            self.consecutive_connection_errors += 1;
        } else {
            self.consecutive_connection_errors = 0;
        }

        if let Some(total) = self.total.filter(|t| *t > 0) {
            let ratio = (m.packets_sent as f64 / total as f64 * 100.0).min(100.0);
            m.progress = m.progress.max(ratio);
        }

        self.window.push_back(now);
        self.prune(now);
    }

    /// Time-based progress estimate for runs with no payload count.
    pub fn observe_elapsed(&mut self, elapsed: Duration, limit: Duration) {
        if self.total.is_some() || limit.is_zero() {
            return;
        }
        let ratio = (elapsed.as_secs_f64() / limit.as_secs_f64() * 100.0).min(100.0);
        self.metrics.progress = self.metrics.progress.max(ratio);
    }

    /// Marks the sequence as fully processed.
    pub fn complete(&mut self) {
        self.metrics.progress = 100.0;
    }

    pub fn consecutive_connection_errors(&self) -> u32 {
        self.consecutive_connection_errors
    }

    pub fn reset_connection_error_streak(&mut self) {
        self.consecutive_connection_errors = 0;
    }

    pub fn snapshot(&mut self, now: Instant) -> JobMetrics {
        self.prune(now);
        let secs = self.rate_window.as_secs_f64();
        self.metrics.packets_per_sec = if secs > 0.0 {
            self.window.len() as f64 / secs
        } else {
            0.0
        };
        self.metrics.clone()
    }

    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.window.front() {
            if now.saturating_duration_since(*front) > self.rate_window {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(index: u64, latency_ms: u64, status: OutcomeStatus) -> Outcome {
        Outcome::new(index, Duration::from_millis(latency_ms), status, "")
    }

    #[test]
    fn counts_errors_crashes_and_findings() {
        let mut acc = MetricsAccumulator::new(Some(4), Duration::from_secs(1), 0.5);
        let now = Instant::now();
        acc.record(&outcome(0, 10, OutcomeStatus::Ok), now);
        acc.record(&outcome(1, 10, OutcomeStatus::Timeout), now);
        acc.record(&outcome(2, 10, OutcomeStatus::CrashSignature), now);
        acc.record(&outcome(3, 10, OutcomeStatus::MalformedResponse), now);
        let m = acc.snapshot(now);
        assert_eq!(m.packets_sent, 4);
        assert_eq!(m.error_count, 3);
        assert_eq!(m.crash_count, 1);
        assert_eq!(m.finding_count, 2);
        assert_eq!(m.status_counts.timeout, 1);
        assert_eq!(m.progress, 100.0);
        assert_eq!(m.error_rate(), 75.0);
    }

    #[test]
    fn rtt_is_an_exponential_moving_average() {
        let mut acc = MetricsAccumulator::new(None, Duration::from_secs(1), 0.5);
        let now = Instant::now();
        acc.record(&outcome(0, 10, OutcomeStatus::Ok), now);
        acc.record(&outcome(1, 30, OutcomeStatus::Ok), now);
        let m = acc.snapshot(now);
        assert!((m.avg_rtt_ms - 20.0).abs() < 1e-6);
        assert!((m.max_rtt_ms - 30.0).abs() < 1e-6);
    }

    #[test]
    fn rate_window_forgets_old_completions() {
        let mut acc = MetricsAccumulator::new(None, Duration::from_millis(100), 0.2);
        let start = Instant::now();
        for i in 0..5 {
            acc.record(&outcome(i, 1, OutcomeStatus::Ok), start);
        }
        assert_eq!(acc.snapshot(start).packets_per_sec, 50.0);
        let later = start + Duration::from_millis(500);
        assert_eq!(acc.snapshot(later).packets_per_sec, 0.0);
        assert_eq!(acc.snapshot(later).packets_sent, 5);
    }

    #[test]
    fn progress_never_decreases() {
        let mut acc = MetricsAccumulator::new(Some(10), Duration::from_secs(1), 0.2);
        let now = Instant::now();
        let mut last = 0.0;
        for i in 0..10 {
            acc.record(&outcome(i, 1, OutcomeStatus::Ok), now);
            let progress = acc.snapshot(now).progress;
            assert!(progress >= last);
            last = progress;
        }
        assert_eq!(last, 100.0);
    }

    #[test]
    fn unbounded_runs_use_elapsed_time() {
        let mut acc = MetricsAccumulator::new(None, Duration::from_secs(1), 0.2);
        acc.observe_elapsed(Duration::from_secs(5), Duration::from_secs(10));
        assert_eq!(acc.snapshot(Instant::now()).progress, 50.0);
        acc.observe_elapsed(Duration::from_secs(2), Duration::from_secs(10));
        assert_eq!(acc.snapshot(Instant::now()).progress, 50.0);
    }

    #[test]
    fn connection_error_streak_resets_on_other_outcomes() {
        let mut acc = MetricsAccumulator::new(None, Duration::from_secs(1), 0.2);
        let now = Instant::now();
        acc.record(&outcome(0, 1, OutcomeStatus::ConnectionError), now);
        acc.record(&outcome(1, 1, OutcomeStatus::ConnectionError), now);
        assert_eq!(acc.consecutive_connection_errors(), 2);
        acc.record(&outcome(2, 1, OutcomeStatus::Ok), now);
        assert_eq!(acc.consecutive_connection_errors(), 0);
    }

    #[test]
    fn in_flight_comes_from_the_pool() {
        let mut acc = MetricsAccumulator::new(None, Duration::from_secs(1), 0.2);
        acc.set_in_flight(3);
        acc.record(&outcome(0, 1, OutcomeStatus::Ok), Instant::now());
        assert_eq!(acc.snapshot(Instant::now()).in_flight, 3);
    }
}
