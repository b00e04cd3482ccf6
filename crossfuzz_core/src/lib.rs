pub mod config;
pub mod driver;
pub mod error;
pub mod event;
pub mod job;
pub mod limiter;
pub mod metrics;
pub mod oracle;
pub mod payload;
pub mod protocol;
pub mod runner;
pub mod scheduler;
pub mod store;

pub use config::{EngineConfig, JobConfig, JobDefaults, StoreConfig};
pub use driver::{DriverRegistry, Outcome, OutcomeStatus, ProtocolDriver, SimulatedDriver};
pub use error::{DriverError, EngineError, GeneratorError, StoreError};
pub use event::{Event, EventBus, LogLevel, Subscription};
pub use job::{JobAction, JobId, JobState};
pub use limiter::RateLimiter;
pub use metrics::{JobMetrics, MetricsAccumulator, StatusCounts};
pub use oracle::{Finding, FindingCategory, Oracle, OutcomeOracle, Severity};
pub use payload::{
    Payload, PayloadCorpus, PayloadGenerator, PayloadParams, PayloadPreview, Profile, Seed,
    generate, import_payloads,
};
pub use protocol::Protocol;
pub use runner::{JobRunner, RunnerServices};
pub use scheduler::JobScheduler;
pub use store::{
    FileJobStore, InMemoryJobStore, JobFilter, JobStore, JobSummary, SortOrder, open_store,
};
