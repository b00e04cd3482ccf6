//! Execution of a single fuzzing job.
//!
//! A [`JobRunner`] owns one job from `start()` until its summary is persisted:
//! - a fixed pool of `concurrency` workers claims sequence positions, generates the payload
//!   and dispatches it through the protocol driver
//! - a single aggregation loop folds completed outcomes into metrics, derives findings and
//!   publishes events, so a job's events come out in dispatch completion order
//! - control calls move the lifecycle state; workers observe it at every claim
//!
//! Claims and state changes share one lock, so once `pause()` or `stop()` returns no worker
//! starts another dispatch.

use crate::config::{EngineConfig, JobConfig};
use crate::driver::{Outcome, OutcomeStatus, ProtocolDriver};
use crate::error::{DriverError, EngineError};
use crate::event::{Event, EventBus, LogLevel, Subscription};
use crate::job::{JobAction, JobId, JobState};
use crate::limiter::RateLimiter;
use crate::metrics::MetricsAccumulator;
use crate::oracle::{Finding, Oracle, OutcomeOracle, Severity};
use crate::payload::{Payload, PayloadGenerator};
use crate::protocol::Protocol;
use crate::store::{JobStore, JobSummary};
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Engine-wide collaborators every runner reports to.
#[derive(Clone)]
pub struct RunnerServices {
    pub bus: Arc<EventBus>,
    pub store: Arc<dyn JobStore>,
    pub oracle: Arc<dyn Oracle>,
    pub engine: Arc<EngineConfig>,
}

impl fmt::Debug for RunnerServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunnerServices")
            .field("bus", &self.bus)
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}

struct Lifecycle {
    state: JobState,
    next_position: u64,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
}

enum Claim {
    Position(u64),
    Wait,
    Done,
}

/// State shared between the control API, the workers and the aggregation loop.
struct Shared {
    job_id: JobId,
    lifecycle: Mutex<Lifecycle>,
    state_tx: watch::Sender<JobState>,
    summary_tx: watch::Sender<Option<Arc<JobSummary>>>,
    /// No further claims; set by `stop()` or a fatal driver error.
    stop: CancellationToken,
    /// In-flight dispatches are abandoned.
    abandon: CancellationToken,
    in_flight: AtomicU64,
    bus: Arc<EventBus>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> JobState {
        self.lock().state
    }

    fn apply(&self, action: JobAction) -> Result<JobState, EngineError> {
        let mut lifecycle = self.lock();
        let old = lifecycle.state;
        let new = action
            .next_state(old)
            .ok_or_else(|| EngineError::invalid_state(&self.job_id, old, action.as_str()))?;
        lifecycle.state = new;
        if action == JobAction::Start {
            lifecycle.started_at = Some(Utc::now());
        }
        if new == JobState::Stopping {
            self.stop.cancel();
        }
        self.state_tx.send_replace(new);
        self.bus
            .publish(&self.job_id, Event::JobStateChanged { old, new });
        drop(lifecycle);
        info!(job_id = %self.job_id, from = %old, to = %new, "Job state changed");
        Ok(new)
    }

    fn claim(&self, total: Option<u64>, expired: bool) -> Claim {
        let mut lifecycle = self.lock();
        if expired || total.is_some_and(|total| lifecycle.next_position >= total) {
            return Claim::Done;
        }
        match lifecycle.state {
            JobState::Running => {
                let position = lifecycle.next_position;
                lifecycle.next_position += 1;
                self.in_flight.fetch_add(1, Ordering::SeqCst);
                Claim::Position(position)
            }
            JobState::Paused => Claim::Wait,
            _ => Claim::Done,
        }
    }

    fn subscribe(&self) -> Result<Subscription, EngineError> {
        let lifecycle = self.lock();
        if lifecycle.state.is_terminal() {
            return Err(EngineError::invalid_state(&self.job_id, lifecycle.state, "subscribe to"));
        }
        Ok(self.bus.subscribe(&self.job_id))
    }

    fn release(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    /// Moves to the terminal state implied by the current one.
    fn terminate(&self, failed: bool) -> (JobState, JobState, Option<DateTime<Utc>>, DateTime<Utc>) {
        let mut lifecycle = self.lock();
        let old = lifecycle.state;
        let new = if failed {
            JobState::Failed
        } else if old == JobState::Stopping {
            JobState::Cancelled
        } else {
            JobState::Completed
        };
        lifecycle.state = new;
        let ended_at = *lifecycle.ended_at.get_or_insert_with(Utc::now);
        self.state_tx.send_replace(new);
        (old, new, lifecycle.started_at, ended_at)
    }

    fn halt(&self) {
        self.stop.cancel();
        self.abandon.cancel();
    }
}

/// Immutable description of what a job does.
struct JobPlan {
    job_id: JobId,
    protocol: Protocol,
    config: JobConfig,
    created_at: DateTime<Utc>,
    generator: PayloadGenerator,
    driver: Arc<dyn ProtocolDriver>,
    limiter: Option<RateLimiter>,
    services: RunnerServices,
}

impl JobPlan {
    fn grace(&self) -> Duration {
        self.config
            .stop_grace_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.services.engine.stop_grace())
    }
}

struct Completion {
    payload: Payload,
    outcome: Outcome,
}

/// Drives one fuzzing job through its lifecycle.
///
/// All methods are cheap and non-blocking; `start()` spawns the job onto the current Tokio
/// runtime and must be called from within one.
pub struct JobRunner {
    shared: Arc<Shared>,
    plan: Arc<JobPlan>,
    summary_rx: watch::Receiver<Option<Arc<JobSummary>>>,
}

impl JobRunner {
    /// Creates a runner in the `Pending` state. The configuration is assumed valid.
    pub fn new(
        job_id: JobId,
        protocol: Protocol,
        config: JobConfig,
        driver: Arc<dyn ProtocolDriver>,
        services: RunnerServices,
    ) -> Self {
        let (state_tx, _) = watch::channel(JobState::Pending);
        let (summary_tx, summary_rx) = watch::channel(None);
        let shared = Arc::new(Shared {
            job_id,
            lifecycle: Mutex::new(Lifecycle {
                state: JobState::Pending,
                next_position: 0,
                started_at: None,
                ended_at: None,
            }),
            state_tx,
            summary_tx,
            stop: CancellationToken::new(),
            abandon: CancellationToken::new(),
            in_flight: AtomicU64::new(0),
            bus: Arc::clone(&services.bus),
        });
        let plan = Arc::new(JobPlan {
            job_id,
            protocol,
            generator: PayloadGenerator::new(config.payload.clone()),
            limiter: config.rate_limit_per_sec.map(RateLimiter::per_second),
            config,
            created_at: Utc::now(),
            driver,
            services,
        });
        Self {
            shared,
            plan,
            summary_rx,
        }
    }

    pub fn id(&self) -> &JobId {
        &self.plan.job_id
    }

    pub fn protocol(&self) -> &Protocol {
        &self.plan.protocol
    }

    pub fn config(&self) -> &JobConfig {
        &self.plan.config
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.plan.created_at
    }

    pub fn state(&self) -> JobState {
        self.shared.state()
    }

    pub fn start(&self) -> Result<(), EngineError> {
        self.shared.apply(JobAction::Start)?;
        tokio::spawn(drive(Arc::clone(&self.shared), Arc::clone(&self.plan)));
        Ok(())
    }

    pub fn pause(&self) -> Result<(), EngineError> {
        self.shared.apply(JobAction::Pause).map(|_| ())
    }

    pub fn resume(&self) -> Result<(), EngineError> {
        self.shared.apply(JobAction::Resume).map(|_| ())
    }

    /// Requests cancellation. In-flight dispatches get the grace period to finish.
    pub fn stop(&self) -> Result<(), EngineError> {
        self.shared.apply(JobAction::Stop).map(|_| ())
    }

    /// Subscribes to this job's events. Fails once the job has terminated, since its topic
    /// is closed and nothing more will be published.
    pub fn subscribe(&self) -> Result<Subscription, EngineError> {
        self.shared.subscribe()
    }

    /// The persisted summary, once the job has terminated.
    pub fn summary(&self) -> Option<JobSummary> {
        self.summary_rx.borrow().as_deref().cloned()
    }

    /// Waits until the job has terminated and its summary is persisted.
    pub async fn wait(&self) -> Option<JobSummary> {
        let mut rx = self.summary_rx.clone();
        let summary = rx.wait_for(Option::is_some).await.ok()?;
        summary.as_deref().cloned()
    }
}

impl fmt::Debug for JobRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRunner")
            .field("job_id", &self.plan.job_id)
            .field("protocol", &self.plan.protocol)
            .field("state", &self.state())
            .finish()
    }
}

/// Folds completions into metrics and findings and publishes the resulting events.
struct Aggregator {
    shared: Arc<Shared>,
    plan: Arc<JobPlan>,
    acc: MetricsAccumulator,
    findings: Vec<Finding>,
    peak_severity: Option<Severity>,
    failure: Option<String>,
    last_snapshot: std::time::Instant,
}

impl Aggregator {
    fn new(shared: Arc<Shared>, plan: Arc<JobPlan>) -> Self {
        let engine = &plan.services.engine;
        let acc = MetricsAccumulator::new(plan.generator.total(), engine.rate_window(), engine.rtt_ema_alpha);
        Self {
            shared,
            plan,
            acc,
            findings: Vec::new(),
            peak_severity: None,
            failure: None,
            last_snapshot: std::time::Instant::now(),
        }
    }

    fn publish(&self, event: Event) {
        self.plan.services.bus.publish(&self.plan.job_id, event);
    }

    fn record(&mut self, completion: Completion) {
        let Completion { payload, outcome } = completion;
        self.acc.record(&outcome, std::time::Instant::now());

        let (level, message) = describe(&outcome);
        self.publish(Event::log(level, message));

        if outcome.status.is_finding() {
            let job_id = self.plan.job_id;
            let finding = self
                .plan
                .services
                .oracle
                .examine(&job_id, &payload, &outcome)
                .or_else(|| OutcomeOracle.examine(&job_id, &payload, &outcome));
            if let Some(finding) = finding {
                debug!(
                    job_id = %job_id,
                    payload_index = finding.payload_index,
                    severity = %finding.severity,
                    signature = %finding.signature,
                    "Recorded finding"
                );
                self.peak_severity = self.peak_severity.max(Some(finding.severity));
                self.publish(Event::log(
                    LogLevel::Error,
                    format!("Finding [{}]: {}", finding.severity, finding.description),
                ));
                self.findings.push(finding);
            }
        }

        if self.last_snapshot.elapsed() >= self.plan.services.engine.snapshot_interval() {
            self.publish_snapshot();
        }
    }

    fn publish_snapshot(&mut self) {
        self.acc
            .set_in_flight(self.shared.in_flight.load(Ordering::SeqCst));
        let metrics = self.acc.snapshot(std::time::Instant::now());
        self.last_snapshot = std::time::Instant::now();
        self.publish(Event::MetricsSnapshot(metrics));
    }

    /// Whether the connection-error streak warrants probing the driver again.
    fn streak_exceeded(&self) -> bool {
        let limit = self.plan.services.engine.max_consecutive_connection_errors;
        limit > 0 && self.acc.consecutive_connection_errors() >= limit
    }

    fn finalize(mut self) {
        let failure = self.failure.take();
        let (old, new, started_at, ended_at) = self.shared.terminate(failure.is_some());
        if new == JobState::Completed {
            self.acc.complete();
        }
        self.acc.set_in_flight(0);
        let metrics = self.acc.snapshot(std::time::Instant::now());
        self.publish(Event::MetricsSnapshot(metrics.clone()));
        if let Some(reason) = &failure {
            self.publish(Event::log(LogLevel::Error, format!("Job failed: {reason}")));
        }

        let plan = Arc::clone(&self.plan);
        let summary = JobSummary {
            job_id: plan.job_id,
            protocol: plan.protocol.clone(),
            config: plan.config.clone(),
            state: new,
            created_at: plan.created_at,
            started_at,
            ended_at: Some(ended_at),
            metrics,
            findings: std::mem::take(&mut self.findings),
            peak_severity: self.peak_severity,
            failure_reason: failure,
        };
        if let Err(e) = plan.services.store.save(summary.clone()) {
            error!(job_id = %plan.job_id, error = %e, "Failed to persist job summary");
            self.publish(Event::log(
                LogLevel::Error,
                format!("Failed to persist job summary: {e}"),
            ));
        }

        self.publish(Event::JobStateChanged { old, new });
        info!(
            job_id = %plan.job_id,
            protocol = %plan.protocol,
            state = %new,
            packets_sent = summary.metrics.packets_sent,
            findings = summary.findings.len(),
            "Job finished"
        );
        plan.services.bus.close(&plan.job_id);
        self.shared.summary_tx.send_replace(Some(Arc::new(summary)));
    }
}

fn describe(outcome: &Outcome) -> (LogLevel, String) {
    match outcome.status {
        OutcomeStatus::Ok => (
            LogLevel::Info,
            format!("payload {} ok in {:.1} ms", outcome.payload_index, outcome.latency_ms),
        ),
        OutcomeStatus::Timeout | OutcomeStatus::ConnectionError => (
            LogLevel::Warning,
            format!("payload {} {}: {}", outcome.payload_index, outcome.status, outcome.detail),
        ),
        OutcomeStatus::CrashSignature | OutcomeStatus::MalformedResponse => (
            LogLevel::Error,
            format!("payload {} {}: {}", outcome.payload_index, outcome.status, outcome.detail),
        ),
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

const DRIVER_PANICKED: &str = "protocol driver panicked during dispatch";

enum Readiness {
    Ready,
    Unavailable(DriverError),
    /// `stop()` arrived, or the grace period ran out, before the driver answered.
    Interrupted,
}

/// Probes the driver, bounded by the job timeout.
///
/// Without a grace deadline the probe is raced against `stop()`; once stopping it is raced
/// against the end of the grace period instead.
async fn check_driver(shared: &Shared, plan: &JobPlan, grace_deadline: Option<Instant>) -> Readiness {
    let target = plan.config.target.as_str();
    let timeout = plan.config.timeout();
    let interrupted = async {
        match grace_deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => shared.stop.cancelled().await,
        }
    };
    tokio::select! {
        result = tokio::time::timeout(timeout, plan.driver.probe(target)) => match result {
            Ok(Ok(())) => Readiness::Ready,
            Ok(Err(e)) => Readiness::Unavailable(e),
            Err(_) => Readiness::Unavailable(DriverError::Unreachable {
                target: target.to_string(),
                reason: format!("probe timed out after {} ms", timeout.as_millis()),
            }),
        },
        _ = interrupted => Readiness::Interrupted,
    }
}

async fn drive(shared: Arc<Shared>, plan: Arc<JobPlan>) {
    let job_id = plan.job_id;
    let target = plan.config.target.as_str();
    let mut agg = Aggregator::new(Arc::clone(&shared), Arc::clone(&plan));

    match check_driver(&shared, &plan, None).await {
        Readiness::Ready => {}
        Readiness::Unavailable(e) => {
            warn!(job_id = %job_id, driver = plan.driver.name(), error = %e, "Driver probe failed");
            agg.failure = Some(EngineError::from(e).to_string());
            agg.finalize();
            return;
        }
        Readiness::Interrupted => {
            debug!(job_id = %job_id, "Stopped before the driver answered its probe");
            agg.finalize();
            return;
        }
    }

    let concurrency = plan.config.concurrency.max(1);
    agg.publish(Event::log(
        LogLevel::Info,
        format!(
            "{} job started against {} with {} workers",
            plan.protocol, target, concurrency
        ),
    ));

    let started = Instant::now();
    let deadline = plan.config.max_duration().map(|limit| started + limit);
    let (tx, mut rx) = mpsc::channel(concurrency.saturating_mul(2));
    let mut workers = JoinSet::new();
    for _ in 0..concurrency {
        workers.spawn(work(Arc::clone(&shared), Arc::clone(&plan), deadline, tx.clone()));
    }
    drop(tx);

    let grace = plan.grace();
    let mut grace_deadline: Option<Instant> = None;
    let mut ticker = tokio::time::interval(
        plan.services
            .engine
            .snapshot_interval()
            .max(Duration::from_millis(1)),
    );
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            received = rx.recv() => {
                let Some(completion) = received else {
                    break;
                };
                agg.record(completion);
                if agg.streak_exceeded() {
                    agg.acc.reset_connection_error_streak();
                    // An interrupted re-probe leaves the stop and grace arms to end the loop.
                    if let Readiness::Unavailable(e) = check_driver(&shared, &plan, grace_deadline).await {
                        warn!(job_id = %job_id, error = %e, "Driver became unavailable mid-run");
                        agg.failure = Some(EngineError::from(e).to_string());
                        shared.halt();
                        break;
                    }
                }
            }
            _ = shared.stop.cancelled(), if grace_deadline.is_none() => {
                debug!(job_id = %job_id, grace_ms = grace.as_millis() as u64, "Stop requested");
                grace_deadline = Some(Instant::now() + grace);
            }
            _ = sleep_until_opt(grace_deadline) => {
                warn!(
                    job_id = %job_id,
                    in_flight = shared.in_flight.load(Ordering::SeqCst),
                    "Grace period expired, abandoning in-flight dispatches"
                );
                shared.abandon.cancel();
                break;
            }
            Some(Err(e)) = workers.join_next(), if !workers.is_empty() => {
                if e.is_panic() {
                    error!(job_id = %job_id, "Worker panicked inside the protocol driver");
                    agg.failure = Some(DRIVER_PANICKED.to_string());
                    shared.halt();
                    break;
                }
            }
            _ = ticker.tick() => {
                if let Some(limit) = plan.config.max_duration() {
                    agg.acc.observe_elapsed(started.elapsed(), limit);
                }
                agg.publish_snapshot();
            }
        }
    }

    workers.abort_all();
    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            if e.is_panic() {
                error!(job_id = %job_id, "Worker panicked inside the protocol driver");
                agg.failure.get_or_insert_with(|| DRIVER_PANICKED.to_string());
            }
        }
    }
    while let Ok(completion) = rx.try_recv() {
        agg.record(completion);
    }
    shared.in_flight.store(0, Ordering::SeqCst);
    agg.finalize();
}

async fn work(
    shared: Arc<Shared>,
    plan: Arc<JobPlan>,
    deadline: Option<Instant>,
    tx: mpsc::Sender<Completion>,
) {
    let mut state_rx = shared.state_tx.subscribe();
    let timeout = plan.config.timeout();
    let total = plan.generator.total();

    loop {
        if shared.stop.is_cancelled() {
            break;
        }
        if let Some(limiter) = &plan.limiter {
            tokio::select! {
                _ = limiter.acquire() => {}
                _ = shared.stop.cancelled() => break,
            }
        }

        state_rx.borrow_and_update();
        let expired = deadline.is_some_and(|deadline| Instant::now() >= deadline);
        let position = match shared.claim(total, expired) {
            Claim::Position(position) => position,
            Claim::Done => break,
            Claim::Wait => {
                tokio::select! {
                    changed = state_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = shared.stop.cancelled() => break,
                }
                continue;
            }
        };

        let Some(payload) = plan.generator.payload_at_position(position) else {
            shared.release();
            break;
        };
        let dispatch = plan.driver.dispatch(&plan.config.target, &payload, timeout);
        let outcome = tokio::select! {
            result = tokio::time::timeout(timeout, dispatch) => {
                result.unwrap_or_else(|_| Outcome::timeout(payload.index, timeout))
            }
            _ = shared.abandon.cancelled() => {
                shared.release();
                break;
            }
        };
        shared.release();

        if tx.send(Completion { payload, outcome }).await.is_err() {
            break;
        }
    }
}
