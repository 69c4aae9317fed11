use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ScanError;

/// Connect timeout applied when a request does not name one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(100);

/// One scan invocation: a target and an inclusive port range.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ScanRequest {
    pub address: String,
    pub start_port: u16,
    pub end_port: u16,
    #[serde(rename = "timeout_ms", with = "duration_ms", default = "default_timeout")]
    pub timeout: Duration,
}

impl ScanRequest {
    pub fn new(address: impl Into<String>, start_port: u16, end_port: u16) -> Self {
        Self {
            address: address.into(),
            start_port,
            end_port,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Synchronous boundary checks. Hostname resolution happens later, in the scanner.
    pub fn validate(&self) -> Result<(), ScanError> {
        if self.address.trim().is_empty() {
            return Err(ScanError::InvalidRequest("address is empty".into()));
        }
        if self.start_port > self.end_port {
            return Err(ScanError::InvalidRequest(format!(
                "start port {} exceeds end port {}",
                self.start_port, self.end_port
            )));
        }
        if self.timeout.is_zero() {
            return Err(ScanError::InvalidRequest("timeout must be non-zero".into()));
        }
        Ok(())
    }

    /// Number of ports in the inclusive range (zero if the range is inverted).
    pub fn total(&self) -> u32 {
        if self.start_port > self.end_port {
            0
        } else {
            u32::from(self.end_port) - u32::from(self.start_port) + 1
        }
    }
}

fn default_timeout() -> Duration {
    DEFAULT_TIMEOUT
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Open/closed outcome of a single probe.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortVerdict {
    pub port: u16,
    pub open: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanProgress {
    pub total: u32,
    pub completed: u32,
}

impl ScanProgress {
    pub fn is_complete(&self) -> bool {
        self.completed >= self.total
    }

    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        f64::from(self.completed) * 100.0 / f64::from(self.total)
    }
}

/// Final result of a scan. `open_ports` is always ascending.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ScanSummary {
    pub address: String,
    pub open_ports: Vec<u16>,
    pub total: u32,
    pub completed: u32,
    /// Set when the scan was stopped before every port reported.
    pub cancelled: bool,
    pub started_at: String,
    pub elapsed_ms: u64,
}

/// Element of the progressive output stream of a scan.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ScanEvent {
    Verdict(PortVerdict),
    Progress(ScanProgress),
    Warning(String),
    Finished(ScanSummary),
}
