//! Job identity and the lifecycle state machine shared by runners, events and the store.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique, immutable job identifier assigned at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Lifecycle state of a job.
///
/// ```text
/// Pending -> Running <-> Paused
/// Running | Paused -> Stopping -> Cancelled
/// Running -> Completed
/// Running | Paused | Stopping -> Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    Running,
    Paused,
    Stopping,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub const ALL: [JobState; 7] = [
        JobState::Pending,
        JobState::Running,
        JobState::Paused,
        JobState::Stopping,
        JobState::Completed,
        JobState::Failed,
        JobState::Cancelled,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }

    /// Whether workers may be dispatching payloads in this state.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            JobState::Running | JobState::Paused | JobState::Stopping
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "Pending",
            JobState::Running => "Running",
            JobState::Paused => "Paused",
            JobState::Stopping => "Stopping",
            JobState::Completed => "Completed",
            JobState::Failed => "Failed",
            JobState::Cancelled => "Cancelled",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown job state '{s}'"))
    }
}

/// Control actions a caller may issue through the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobAction {
    Start,
    Pause,
    Resume,
    Stop,
}

impl JobAction {
    pub const ALL: [JobAction; 4] = [
        JobAction::Start,
        JobAction::Pause,
        JobAction::Resume,
        JobAction::Stop,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobAction::Start => "start",
            JobAction::Pause => "pause",
            JobAction::Resume => "resume",
            JobAction::Stop => "stop",
        }
    }

    /// The state `from` moves to under this action, or `None` if the action is illegal there.
    pub fn next_state(&self, from: JobState) -> Option<JobState> {
        match (self, from) {
            (JobAction::Start, JobState::Pending) => Some(JobState::Running),
            (JobAction::Pause, JobState::Running) => Some(JobState::Paused),
            (JobAction::Resume, JobState::Paused) => Some(JobState::Running),
            (JobAction::Stop, JobState::Running | JobState::Paused) => Some(JobState::Stopping),
            _ => None,
        }
    }
}

impl fmt::Display for JobAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_edges_match_lifecycle() {
        let legal: Vec<(JobAction, JobState, JobState)> = JobAction::ALL
            .into_iter()
            .flat_map(|action| {
                JobState::ALL
                    .into_iter()
                    .filter_map(move |from| action.next_state(from).map(|to| (action, from, to)))
            })
            .collect();

        assert_eq!(
            legal,
            vec![
                (JobAction::Start, JobState::Pending, JobState::Running),
                (JobAction::Pause, JobState::Running, JobState::Paused),
                (JobAction::Resume, JobState::Paused, JobState::Running),
                (JobAction::Stop, JobState::Running, JobState::Stopping),
                (JobAction::Stop, JobState::Paused, JobState::Stopping),
            ]
        );
    }

    #[test]
    fn terminal_states_accept_no_action() {
        for state in JobState::ALL.into_iter().filter(JobState::is_terminal) {
            for action in JobAction::ALL {
                assert_eq!(action.next_state(state), None, "{action} from {state}");
            }
        }
    }

    #[test]
    fn job_state_parses_case_insensitively() {
        assert_eq!("cancelled".parse::<JobState>(), Ok(JobState::Cancelled));
        assert_eq!("RUNNING".parse::<JobState>(), Ok(JobState::Running));
        assert!("exploded".parse::<JobState>().is_err());
    }

    #[test]
    fn job_ids_are_unique_and_round_trip_through_text() {
        let a = JobId::new();
        let b = JobId::new();
        assert_ne!(a, b);
        assert_eq!(a.to_string().parse::<JobId>().unwrap(), a);
    }
}
