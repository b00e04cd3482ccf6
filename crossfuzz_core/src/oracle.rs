use crate::driver::{Outcome, OutcomeStatus};
use crate::job::JobId;
use crate::payload::Payload;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Severity attached to findings. Ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Severity::Low => "Low",
            Severity::Medium => "Medium",
            Severity::High => "High",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FindingCategory {
    Crash,
    MalformedResponse,
}

/// A suspected defect derived from one outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub job_id: JobId,
    pub payload_index: u64,
    pub category: FindingCategory,
    pub severity: Severity,
    pub description: String,
    /// MD5 hex digest of the payload bytes, for deduplication across runs.
    pub signature: String,
    pub timestamp: DateTime<Utc>,
}

/// An `Oracle` examines dispatch outcomes and decides whether they describe a defect.
pub trait Oracle: Send + Sync {
    fn examine(&self, job_id: &JobId, payload: &Payload, outcome: &Outcome) -> Option<Finding>;
}

/// Reports every crash signature and every malformed response, and nothing else.
#[derive(Debug, Default, Clone, Copy)]
pub struct OutcomeOracle;

impl OutcomeOracle {
    pub fn new() -> Self {
        OutcomeOracle
    }
}

impl Oracle for OutcomeOracle {
    fn examine(&self, job_id: &JobId, payload: &Payload, outcome: &Outcome) -> Option<Finding> {
        let (category, severity, summary) = match outcome.status {
            OutcomeStatus::CrashSignature => (FindingCategory::Crash, Severity::High, "Possible crash signature"),
            OutcomeStatus::MalformedResponse => (
                FindingCategory::MalformedResponse,
                Severity::Medium,
                "Malformed response",
            ),
            _ => return None,
        };
        let description = if outcome.detail.is_empty() {
            format!("{summary} at payload {}", outcome.payload_index)
        } else {
            format!("{summary} at payload {}: {}", outcome.payload_index, outcome.detail)
        };
        Some(Finding {
            job_id: *job_id,
            payload_index: outcome.payload_index,
            category,
            severity,
            description,
            signature: format!("{:x}", md5::compute(&payload.bytes)),
            timestamp: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn outcome(status: OutcomeStatus) -> Outcome {
        Outcome::new(42, Duration::from_millis(3), status, "target went quiet")
    }

    fn payload() -> Payload {
        Payload {
            index: 42,
            bytes: vec![0xFF, 0xFE, 0xFD],
        }
    }

    #[test]
    fn crash_outcome_yields_high_severity_finding() {
        let job_id = JobId::new();
        let finding = OutcomeOracle::new()
            .examine(&job_id, &payload(), &outcome(OutcomeStatus::CrashSignature))
            .expect("crash must produce a finding");
        assert_eq!(finding.job_id, job_id);
        assert_eq!(finding.payload_index, 42);
        assert_eq!(finding.category, FindingCategory::Crash);
        assert_eq!(finding.severity, Severity::High);
        assert!(finding.description.contains("target went quiet"));
        assert_eq!(finding.signature, format!("{:x}", md5::compute([0xFFu8, 0xFE, 0xFD])));
    }

    #[test]
    fn malformed_outcome_yields_medium_severity_finding() {
        let finding = OutcomeOracle::new()
            .examine(&JobId::new(), &payload(), &outcome(OutcomeStatus::MalformedResponse))
            .unwrap();
        assert_eq!(finding.category, FindingCategory::MalformedResponse);
        assert_eq!(finding.severity, Severity::Medium);
    }

    #[test]
    fn expected_failures_are_not_findings() {
        let oracle = OutcomeOracle::new();
        for status in [
            OutcomeStatus::Ok,
            OutcomeStatus::Timeout,
            OutcomeStatus::ConnectionError,
        ] {
            assert!(oracle.examine(&JobId::new(), &payload(), &outcome(status)).is_none());
        }
    }

    #[test]
    fn severity_orders_by_gravity() {
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
    }
}
