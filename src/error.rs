use thiserror::Error;

/// Errors surfaced by the scan engine. Per-port connection failures are not
/// errors; they become closed verdicts.
#[derive(Debug, Error)]
pub enum ScanError {
    /// Rejected before any probe was dispatched.
    #[error("invalid scan request: {0}")]
    InvalidRequest(String),

    /// The coordinator task died without producing a summary.
    #[error("scan aborted: {0}")]
    Aborted(String),
}
