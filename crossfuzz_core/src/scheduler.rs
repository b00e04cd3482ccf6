//! The control surface of the engine.
//!
//! `JobScheduler` owns every live [`JobRunner`] keyed by job id. Front ends create and steer
//! jobs only through it, subscribe to their telemetry and query finished runs from the store.

use crate::config::{EngineConfig, JobConfig};
use crate::driver::DriverRegistry;
use crate::error::EngineError;
use crate::event::{EventBus, Subscription};
use crate::job::{JobAction, JobId, JobState};
use crate::oracle::{Oracle, OutcomeOracle};
use crate::protocol::Protocol;
use crate::runner::{JobRunner, RunnerServices};
use crate::store::{JobFilter, JobStore, JobSummary, open_store};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct JobScheduler {
    services: RunnerServices,
    drivers: DriverRegistry,
    jobs: Arc<DashMap<JobId, Arc<JobRunner>>>,
}

impl JobScheduler {
    /// Builds a scheduler with the store described by `config.store`.
    pub fn new(config: EngineConfig, drivers: DriverRegistry) -> Result<Self, EngineError> {
        let store = open_store(&config.store)?;
        Self::with_store(config, drivers, store)
    }

    pub fn with_store(
        config: EngineConfig,
        drivers: DriverRegistry,
        store: Arc<dyn JobStore>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        info!(
            protocols = ?drivers.protocols(),
            stored_jobs = store.len(),
            "Job scheduler ready"
        );
        Ok(Self {
            services: RunnerServices {
                bus: Arc::new(EventBus::new(config.event_queue_capacity)),
                store,
                oracle: Arc::new(OutcomeOracle::new()),
                engine: Arc::new(config),
            },
            drivers,
            jobs: Arc::new(DashMap::new()),
        })
    }

    /// Replaces the oracle used for jobs created from now on.
    pub fn with_oracle(mut self, oracle: Arc<dyn Oracle>) -> Self {
        self.services.oracle = oracle;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.services.engine
    }

    pub fn drivers(&self) -> &DriverRegistry {
        &self.drivers
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.services.bus
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.services.store
    }

    /// Registers a new `Pending` job. Nothing is dispatched until `start_job`.
    ///
    /// # Arguments
    /// * `protocol`: Selects the registered driver that will send the payloads.
    /// * `config`: Target, timeouts, concurrency and payload parameters of the job.
    ///
    /// # Returns
    /// The new job's id, or [`EngineError::Validation`] if the configuration is invalid or no
    /// driver is registered for `protocol`.
    pub fn create_job(&self, protocol: Protocol, config: JobConfig) -> Result<JobId, EngineError> {
        config.validate()?;
        let driver = self.drivers.get(&protocol).ok_or_else(|| {
            EngineError::Validation(format!("no driver registered for protocol {protocol}"))
        })?;
        let job_id = JobId::new();
        info!(
            job_id = %job_id,
            protocol = %protocol,
            target = %config.target,
            concurrency = config.concurrency,
            count = ?config.payload.count,
            "Created job"
        );
        let runner = JobRunner::new(job_id, protocol, config, driver, self.services.clone());
        self.jobs.insert(job_id, Arc::new(runner));
        Ok(job_id)
    }

    /// Starts a `Pending` job on the current Tokio runtime.
    ///
    /// The job is released from the scheduler once its summary is persisted; later calls are
    /// answered from the store.
    ///
    /// # Arguments
    /// * `job_id`: The job to start.
    ///
    /// # Returns
    /// `Ok(())` once the job is `Running`, [`EngineError::InvalidState`] if it was already
    /// started, or [`EngineError::NotFound`] for an unknown id.
    pub fn start_job(&self, job_id: &JobId) -> Result<(), EngineError> {
        let runner = self.runner(job_id, JobAction::Start)?;
        runner.start()?;

        let jobs = Arc::clone(&self.jobs);
        tokio::spawn(async move {
            let summary = runner.wait().await;
            jobs.remove(runner.id());
            debug!(
                job_id = %runner.id(),
                state = ?summary.map(|s| s.state),
                "Released finished job"
            );
        });
        Ok(())
    }

    pub fn pause_job(&self, job_id: &JobId) -> Result<(), EngineError> {
        self.runner(job_id, JobAction::Pause)?.pause()
    }

    pub fn resume_job(&self, job_id: &JobId) -> Result<(), EngineError> {
        self.runner(job_id, JobAction::Resume)?.resume()
    }

    pub fn stop_job(&self, job_id: &JobId) -> Result<(), EngineError> {
        self.runner(job_id, JobAction::Stop)?.stop()
    }

    /// Jobs that are `Running`, `Paused` or `Stopping`.
    pub fn list_active(&self) -> Vec<JobId> {
        let mut active: Vec<(chrono::DateTime<chrono::Utc>, JobId)> = self
            .jobs
            .iter()
            .filter(|entry| entry.value().state().is_active())
            .map(|entry| (entry.value().created_at(), *entry.key()))
            .collect();
        active.sort_by_key(|(created_at, _)| *created_at);
        active.into_iter().map(|(_, id)| id).collect()
    }

    /// Jobs created but not yet started.
    pub fn list_pending(&self) -> Vec<JobId> {
        self.jobs
            .iter()
            .filter(|entry| entry.value().state() == JobState::Pending)
            .map(|entry| *entry.key())
            .collect()
    }

    /// Current state of a live job, or the final state of a stored one.
    pub fn job_state(&self, job_id: &JobId) -> Result<JobState, EngineError> {
        if let Some(runner) = self.jobs.get(job_id) {
            return Ok(runner.state());
        }
        match self.services.store.get(job_id)? {
            Some(summary) => Ok(summary.state),
            None => Err(EngineError::NotFound(*job_id)),
        }
    }

    pub fn subscribe(&self, job_id: &JobId) -> Result<Subscription, EngineError> {
        match self.jobs.get(job_id) {
            Some(runner) => runner.subscribe(),
            None => match self.services.store.get(job_id)? {
                Some(summary) => Err(EngineError::invalid_state(job_id, summary.state, "subscribe to")),
                None => Err(EngineError::NotFound(*job_id)),
            },
        }
    }

    pub fn unsubscribe(&self, subscription: Subscription) {
        self.services.bus.unsubscribe(subscription);
    }

    /// Resolves with the persisted summary once the job is terminal.
    ///
    /// A `Pending` job is waited on until someone starts and finishes it.
    pub async fn wait(&self, job_id: &JobId) -> Result<JobSummary, EngineError> {
        let runner = self.jobs.get(job_id).map(|entry| Arc::clone(entry.value()));
        if let Some(runner) = runner {
            if let Some(summary) = runner.wait().await {
                return Ok(summary);
            }
        }
        self.services
            .store
            .get(job_id)?
            .ok_or(EngineError::NotFound(*job_id))
    }

    pub fn query(&self, filter: &JobFilter) -> Result<Vec<JobSummary>, EngineError> {
        Ok(self.services.store.query(filter)?)
    }

    /// Stops every running or paused job, discards pending ones and waits for all of them.
    pub async fn shutdown(&self) -> Vec<JobSummary> {
        let runners: Vec<Arc<JobRunner>> = self
            .jobs
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        info!(jobs = runners.len(), "Shutting down job scheduler");

        let mut stopping = Vec::new();
        for runner in runners {
            match runner.state() {
                JobState::Pending => {
                    self.jobs.remove(runner.id());
                    debug!(job_id = %runner.id(), "Discarded pending job");
                }
                JobState::Running | JobState::Paused => {
                    if let Err(e) = runner.stop() {
                        debug!(job_id = %runner.id(), error = %e, "Job finished before stop");
                    }
                    stopping.push(runner);
                }
                _ => stopping.push(runner),
            }
        }

        let mut summaries = Vec::with_capacity(stopping.len());
        for runner in stopping {
            match runner.wait().await {
                Some(summary) => summaries.push(summary),
                None => warn!(job_id = %runner.id(), "Job ended without a summary"),
            }
            self.jobs.remove(runner.id());
        }
        summaries
    }

    /// Live runner for `job_id`. A job that already finished is reported in its final state.
    fn runner(&self, job_id: &JobId, action: JobAction) -> Result<Arc<JobRunner>, EngineError> {
        if let Some(entry) = self.jobs.get(job_id) {
            return Ok(Arc::clone(entry.value()));
        }
        match self.services.store.get(job_id)? {
            Some(summary) => Err(EngineError::invalid_state(job_id, summary.state, action.as_str())),
            None => Err(EngineError::NotFound(*job_id)),
        }
    }
}

impl std::fmt::Debug for JobScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobScheduler")
            .field("drivers", &self.drivers)
            .field("live_jobs", &self.jobs.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::SimulatedDriver;
    use crate::store::InMemoryJobStore;
    use std::time::Duration;

    fn scheduler(latency: Duration) -> (JobScheduler, Arc<SimulatedDriver>) {
        let driver = Arc::new(SimulatedDriver::new("ICMP", latency));
        let mut drivers = DriverRegistry::new();
        drivers.register(Protocol::Icmp, driver.clone());
        let scheduler = JobScheduler::with_store(
            EngineConfig::default(),
            drivers,
            Arc::new(InMemoryJobStore::new()),
        )
        .unwrap();
        (scheduler, driver)
    }

    fn config(count: Option<u64>) -> JobConfig {
        let mut config = JobConfig::new("127.0.0.1");
        config.concurrency = 2;
        config.rate_limit_per_sec = None;
        config.payload.count = count;
        config
    }

    #[tokio::test]
    async fn create_job_rejects_invalid_configs() {
        let (scheduler, _) = scheduler(Duration::ZERO);
        let mut bad = config(Some(1));
        bad.timeout_ms = 0;
        assert!(matches!(
            scheduler.create_job(Protocol::Icmp, bad),
            Err(EngineError::Validation(_))
        ));
        let mut bad = config(Some(1));
        bad.concurrency = 0;
        assert!(matches!(
            scheduler.create_job(Protocol::Icmp, bad),
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            scheduler.create_job(Protocol::Ssh, config(Some(1))),
            Err(EngineError::Validation(_))
        ));
        assert!(scheduler.list_pending().is_empty());
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found() {
        let (scheduler, _) = scheduler(Duration::ZERO);
        let ghost = JobId::new();
        for result in [
            scheduler.start_job(&ghost),
            scheduler.pause_job(&ghost),
            scheduler.resume_job(&ghost),
            scheduler.stop_job(&ghost),
        ] {
            assert!(matches!(result, Err(EngineError::NotFound(id)) if id == ghost));
        }
        assert!(matches!(scheduler.job_state(&ghost), Err(EngineError::NotFound(_))));
        assert!(matches!(scheduler.subscribe(&ghost), Err(EngineError::NotFound(_))));
        assert!(matches!(scheduler.wait(&ghost).await, Err(EngineError::NotFound(_))));
    }

    #[tokio::test]
    async fn pending_jobs_are_not_active() {
        let (scheduler, driver) = scheduler(Duration::ZERO);
        let job = scheduler.create_job(Protocol::Icmp, config(Some(5))).unwrap();
        assert_eq!(scheduler.job_state(&job).unwrap(), JobState::Pending);
        assert!(scheduler.list_active().is_empty());
        assert_eq!(scheduler.list_pending(), vec![job]);
        assert_eq!(driver.dispatched(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn finished_jobs_leave_the_registry_but_stay_queryable() {
        let (scheduler, _) = scheduler(Duration::from_millis(1));
        let job = scheduler.create_job(Protocol::Icmp, config(Some(10))).unwrap();
        scheduler.start_job(&job).unwrap();
        let summary = scheduler.wait(&job).await.unwrap();
        assert_eq!(summary.state, JobState::Completed);

        for _ in 0..100 {
            if scheduler.jobs.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(scheduler.jobs.is_empty());
        assert_eq!(scheduler.job_state(&job).unwrap(), JobState::Completed);
        assert_eq!(scheduler.wait(&job).await.unwrap(), summary);
        assert!(matches!(
            scheduler.subscribe(&job),
            Err(EngineError::InvalidState { state: JobState::Completed, .. })
        ));
        assert!(matches!(
            scheduler.start_job(&job),
            Err(EngineError::InvalidState { state: JobState::Completed, action: "start", .. })
        ));
        let rows = scheduler
            .query(&JobFilter::new().protocol(Protocol::Icmp))
            .unwrap();
        assert_eq!(rows, vec![summary]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_stops_active_and_discards_pending_jobs() {
        let (scheduler, _) = scheduler(Duration::from_millis(5));
        let running = scheduler.create_job(Protocol::Icmp, config(None)).unwrap();
        let pending = scheduler.create_job(Protocol::Icmp, config(Some(3))).unwrap();
        scheduler.start_job(&running).unwrap();
        assert_eq!(scheduler.list_active(), vec![running]);

        let summaries = scheduler.shutdown().await;
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].job_id, running);
        assert_eq!(summaries[0].state, JobState::Cancelled);
        assert!(scheduler.list_active().is_empty());
        assert!(matches!(
            scheduler.job_state(&pending),
            Err(EngineError::NotFound(_))
        ));
        assert_eq!(scheduler.store().len(), 1);
    }

    /// Grades every finding the default oracle would report as `Low`.
    struct LenientOracle;

    impl Oracle for LenientOracle {
        fn examine(
            &self,
            job_id: &JobId,
            payload: &crate::payload::Payload,
            outcome: &crate::driver::Outcome,
        ) -> Option<crate::oracle::Finding> {
            OutcomeOracle.examine(job_id, payload, outcome).map(|finding| crate::oracle::Finding {
                severity: crate::oracle::Severity::Low,
                ..finding
            })
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn jobs_use_the_configured_oracle() {
        let driver = Arc::new(SimulatedDriver::with_classifier("ICMP", Duration::ZERO, |payload| {
            if payload.index % 5 == 0 {
                crate::driver::OutcomeStatus::CrashSignature
            } else {
                crate::driver::OutcomeStatus::Ok
            }
        }));
        let mut drivers = DriverRegistry::new();
        drivers.register(Protocol::Icmp, driver);
        let scheduler = JobScheduler::with_store(
            EngineConfig::default(),
            drivers,
            Arc::new(InMemoryJobStore::new()),
        )
        .unwrap()
        .with_oracle(Arc::new(LenientOracle));

        let job = scheduler.create_job(Protocol::Icmp, config(Some(50))).unwrap();
        scheduler.start_job(&job).unwrap();
        let summary = scheduler.wait(&job).await.unwrap();

        assert_eq!(summary.metrics.status_counts.crash_signature, 10);
        assert_eq!(summary.findings.len(), 10);
        assert!(summary
            .findings
            .iter()
            .all(|f| f.severity == crate::oracle::Severity::Low));
        assert_eq!(summary.peak_severity, Some(crate::oracle::Severity::Low));
    }
}
