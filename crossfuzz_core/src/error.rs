use crate::job::{JobId, JobState};
use thiserror::Error;

/// Errors returned synchronously by the scheduler, runners and stores.
///
/// Per-dispatch failures never show up here: they are recorded as
/// [`Outcome`](crate::driver::Outcome)s and surface through metrics and log events.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The job configuration violates a constraint; the job was never created.
    #[error("Invalid job configuration: {0}")]
    Validation(String),
    /// A control call was issued against a job whose state does not permit it.
    #[error("Cannot {action} job {job_id} while it is {state}")]
    InvalidState {
        job_id: JobId,
        state: JobState,
        action: &'static str,
    },
    #[error("Unknown job id: {0}")]
    NotFound(JobId),
    /// The protocol driver itself is unreachable or misconfigured.
    #[error("Protocol driver unavailable: {0}")]
    DriverUnavailable(#[from] DriverError),
    #[error("Job store operation failed: {0}")]
    Store(#[from] StoreError),
    #[error("Payload generation failed: {0}")]
    Generator(#[from] GeneratorError),
}

/// Raised by [`ProtocolDriver::probe`](crate::driver::ProtocolDriver::probe) when the
/// driver cannot serve the target at all.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("target '{target}' is unreachable: {reason}")]
    Unreachable { target: String, reason: String },
    #[error("driver is misconfigured: {0}")]
    Misconfigured(String),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error on job store: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to (de)serialize job summary: {0}")]
    Serde(#[from] serde_json::Error),
    /// A terminal summary already exists for this job and differs from the new one.
    #[error("Summary for job {0} is terminal and cannot be replaced")]
    Immutable(JobId),
}

#[derive(Error, Debug)]
pub enum GeneratorError {
    #[error("Seed text is empty")]
    EmptySeed,
    #[error("Cannot export an unbounded payload sequence")]
    UnboundedExport,
    #[error("Failed to encode payload corpus: {0}")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("Failed to decode payload corpus: {0}")]
    Decode(#[from] bincode::error::DecodeError),
}

impl EngineError {
    pub(crate) fn invalid_state(job_id: &JobId, state: JobState, action: &'static str) -> Self {
        EngineError::InvalidState {
            job_id: *job_id,
            state,
            action,
        }
    }
}
