//! Protocol driver capability consumed by job runners.
//!
//! A driver knows how to put one payload on the wire for its protocol and how to judge the
//! target's reaction. The engine is polymorphic over [`ProtocolDriver`]; adding a protocol means
//! registering one more implementation in a [`DriverRegistry`].

use crate::error::DriverError;
use crate::payload::Payload;
use crate::protocol::Protocol;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Classification of one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutcomeStatus {
    Ok,
    Timeout,
    ConnectionError,
    CrashSignature,
    MalformedResponse,
}

impl OutcomeStatus {
    pub const ALL: [OutcomeStatus; 5] = [
        OutcomeStatus::Ok,
        OutcomeStatus::Timeout,
        OutcomeStatus::ConnectionError,
        OutcomeStatus::CrashSignature,
        OutcomeStatus::MalformedResponse,
    ];

    /// Whether this outcome is a suspected defect that must be recorded as a finding.
    pub fn is_finding(&self) -> bool {
        matches!(
            self,
            OutcomeStatus::CrashSignature | OutcomeStatus::MalformedResponse
        )
    }

    pub fn is_error(&self) -> bool {
        !matches!(self, OutcomeStatus::Ok)
    }
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OutcomeStatus::Ok => "Ok",
            OutcomeStatus::Timeout => "Timeout",
            OutcomeStatus::ConnectionError => "ConnectionError",
            OutcomeStatus::CrashSignature => "CrashSignature",
            OutcomeStatus::MalformedResponse => "MalformedResponse",
        };
        f.write_str(name)
    }
}

/// Result of dispatching one payload. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub payload_index: u64,
    pub latency_ms: f64,
    pub status: OutcomeStatus,
    pub detail: String,
}

impl Outcome {
    pub fn new(payload_index: u64, latency: Duration, status: OutcomeStatus, detail: impl Into<String>) -> Self {
        Self {
            payload_index,
            latency_ms: latency.as_secs_f64() * 1000.0,
            status,
            detail: detail.into(),
        }
    }

    pub fn timeout(payload_index: u64, timeout: Duration) -> Self {
        Self::new(
            payload_index,
            timeout,
            OutcomeStatus::Timeout,
            format!("no response within {} ms", timeout.as_millis()),
        )
    }
}

/// Capability to send payloads for one protocol.
///
/// `dispatch` must return within roughly `timeout` (reporting [`OutcomeStatus::Timeout`]
/// rather than blocking past it) and must express every per-payload failure as an
/// [`Outcome`]. Only `probe` may report that the driver itself is unusable.
#[async_trait]
pub trait ProtocolDriver: Send + Sync {
    fn name(&self) -> &str;

    /// Checks that the driver can serve `target` at all.
    ///
    /// Runners call this before the first dispatch and again after a run of connection
    /// errors. A probe that outlives the job timeout counts as unreachable.
    ///
    /// # Arguments
    /// * `target`: The job's target, as configured.
    ///
    /// # Returns
    /// `Ok(())` if dispatching can proceed, otherwise the [`DriverError`] that fails the job.
    async fn probe(&self, target: &str) -> Result<(), DriverError>;

    /// Sends one payload to `target` and classifies what came back.
    ///
    /// # Arguments
    /// * `target`: The job's target, as configured.
    /// * `payload`: The generated payload to send.
    /// * `timeout`: How long to wait for a response before reporting a timeout.
    ///
    /// # Returns
    /// The [`Outcome`] of this single dispatch. Failures of the target are outcomes, not errors.
    async fn dispatch(&self, target: &str, payload: &Payload, timeout: Duration) -> Outcome;
}

/// Maps protocols to the drivers that serve them.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    drivers: HashMap<Protocol, Arc<dyn ProtocolDriver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `driver` for `protocol`, returning the driver it replaced.
    pub fn register(
        &mut self,
        protocol: Protocol,
        driver: Arc<dyn ProtocolDriver>,
    ) -> Option<Arc<dyn ProtocolDriver>> {
        self.drivers.insert(protocol, driver)
    }

    pub fn get(&self, protocol: &Protocol) -> Option<Arc<dyn ProtocolDriver>> {
        self.drivers.get(protocol).cloned()
    }

    pub fn contains(&self, protocol: &Protocol) -> bool {
        self.drivers.contains_key(protocol)
    }

    pub fn protocols(&self) -> Vec<Protocol> {
        let mut protocols: Vec<Protocol> = self.drivers.keys().cloned().collect();
        protocols.sort();
        protocols
    }
}

impl fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("protocols", &self.protocols())
            .finish()
    }
}

type Classifier = dyn Fn(&Payload) -> OutcomeStatus + Send + Sync;

/// Looks for marker bytes: `CRASH` means the target died, `BAD` means it answered garbage.
pub fn marker_classifier(payload: &Payload) -> OutcomeStatus {
    let bytes = payload.bytes.as_slice();
    if bytes.windows(5).any(|w| w == b"CRASH") {
        OutcomeStatus::CrashSignature
    } else if bytes.windows(3).any(|w| w == b"BAD") {
        OutcomeStatus::MalformedResponse
    } else {
        OutcomeStatus::Ok
    }
}

/// In-process driver with a fixed per-dispatch latency.
///
/// The verdict for each payload comes from a classifier function, in the same spirit as an
/// in-process fuzz harness. The driver can be switched offline to make `probe` fail and every
/// dispatch report a connection error.
pub struct SimulatedDriver {
    name: String,
    latency: Duration,
    classifier: Box<Classifier>,
    online: AtomicBool,
    dispatched: AtomicU64,
}

impl SimulatedDriver {
    pub fn new(name: impl Into<String>, latency: Duration) -> Self {
        Self::with_classifier(name, latency, marker_classifier)
    }

    pub fn with_classifier<F>(name: impl Into<String>, latency: Duration, classifier: F) -> Self
    where
        F: Fn(&Payload) -> OutcomeStatus + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            latency,
            classifier: Box::new(classifier),
            online: AtomicBool::new(true),
            dispatched: AtomicU64::new(0),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Number of dispatches that have started.
    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProtocolDriver for SimulatedDriver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn probe(&self, target: &str) -> Result<(), DriverError> {
        if target.trim().is_empty() {
            return Err(DriverError::Misconfigured("empty target".to_string()));
        }
        if !self.online.load(Ordering::SeqCst) {
            return Err(DriverError::Unreachable {
                target: target.to_string(),
                reason: format!("{} driver is offline", self.name),
            });
        }
        Ok(())
    }

    async fn dispatch(&self, target: &str, payload: &Payload, timeout: Duration) -> Outcome {
        self.dispatched.fetch_add(1, Ordering::SeqCst);
        let started = Instant::now();
        if !self.online.load(Ordering::SeqCst) {
            return Outcome::new(
                payload.index,
                started.elapsed(),
                OutcomeStatus::ConnectionError,
                format!("{target} refused connection"),
            );
        }
        if self.latency > timeout {
            tokio::time::sleep(timeout).await;
            return Outcome::timeout(payload.index, timeout);
        }
        tokio::time::sleep(self.latency).await;

        let status = (self.classifier)(payload);
        let detail = match status {
            OutcomeStatus::Ok => String::new(),
            OutcomeStatus::CrashSignature => {
                format!("{target} stopped responding after payload {}", payload.index)
            }
            OutcomeStatus::MalformedResponse => {
                format!("{target} answered payload {} with an unparsable reply", payload.index)
            }
            other => format!("{target} reported {other}"),
        };
        Outcome::new(payload.index, started.elapsed(), status, detail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(bytes: &[u8]) -> Payload {
        Payload {
            index: 7,
            bytes: bytes.to_vec(),
        }
    }

    #[test]
    fn marker_classifier_detects_markers() {
        assert_eq!(marker_classifier(&payload(b"xxCRASHxx")), OutcomeStatus::CrashSignature);
        assert_eq!(marker_classifier(&payload(b"BADINPUT")), OutcomeStatus::MalformedResponse);
        assert_eq!(marker_classifier(&payload(b"GOOD")), OutcomeStatus::Ok);
        assert_eq!(marker_classifier(&payload(b"")), OutcomeStatus::Ok);
    }

    #[test]
    fn only_crash_and_malformed_are_findings() {
        let findings: Vec<OutcomeStatus> = OutcomeStatus::ALL
            .into_iter()
            .filter(OutcomeStatus::is_finding)
            .collect();
        assert_eq!(
            findings,
            vec![OutcomeStatus::CrashSignature, OutcomeStatus::MalformedResponse]
        );
    }

    #[tokio::test]
    async fn simulated_driver_reports_classified_outcome() {
        let driver = SimulatedDriver::new("TCP", Duration::from_millis(1));
        let outcome = driver
            .dispatch("127.0.0.1", &payload(b"CRASH"), Duration::from_secs(1))
            .await;
        assert_eq!(outcome.status, OutcomeStatus::CrashSignature);
        assert_eq!(outcome.payload_index, 7);
        assert!(outcome.detail.contains("127.0.0.1"));
        assert_eq!(driver.dispatched(), 1);
    }

    #[tokio::test]
    async fn simulated_driver_respects_timeout() {
        let driver = SimulatedDriver::new("SSH", Duration::from_secs(5));
        let started = Instant::now();
        let outcome = driver
            .dispatch("10.0.0.1", &payload(b"x"), Duration::from_millis(20))
            .await;
        assert_eq!(outcome.status, OutcomeStatus::Timeout);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn offline_driver_fails_probe_and_refuses_dispatch() {
        let driver = SimulatedDriver::new("SNMP", Duration::from_millis(1));
        assert!(driver.probe("10.0.0.2").await.is_ok());
        driver.set_online(false);
        assert!(matches!(
            driver.probe("10.0.0.2").await,
            Err(DriverError::Unreachable { .. })
        ));
        let outcome = driver
            .dispatch("10.0.0.2", &payload(b"x"), Duration::from_secs(1))
            .await;
        assert_eq!(outcome.status, OutcomeStatus::ConnectionError);
    }

    #[test]
    fn registry_lists_registered_protocols_sorted() {
        let mut registry = DriverRegistry::new();
        registry.register(Protocol::Tcp, Arc::new(SimulatedDriver::new("TCP", Duration::ZERO)));
        registry.register(Protocol::Icmp, Arc::new(SimulatedDriver::new("ICMP", Duration::ZERO)));
        assert_eq!(registry.protocols(), vec![Protocol::Icmp, Protocol::Tcp]);
        assert!(registry.contains(&Protocol::Tcp));
        assert!(registry.get(&Protocol::Snmp).is_none());
    }
}
