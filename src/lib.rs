//! Library crate for port-sweep: a concurrent TCP connect scanner with progressive results.
pub mod error;
pub mod prober;
pub mod range;
pub mod scanner;
pub mod server;
pub mod types;

pub use error::ScanError;
pub use prober::{probe, ProbeOutcome, Prober, TcpProber};
pub use scanner::{ScanConfig, ScanHandle, ScanTracker, Scanner};
pub use types::{PortVerdict, ScanEvent, ScanProgress, ScanRequest, ScanSummary};
