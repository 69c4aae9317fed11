use async_trait::async_trait;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time;
use tracing::trace;

use crate::error::ScanError;
use crate::types::PortVerdict;

/// Result of one connection attempt.
///
/// `Exhausted` means the attempt failed because the local host ran out of
/// sockets or ephemeral ports. It still counts as a closed verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Open,
    Closed,
    Exhausted,
}

impl ProbeOutcome {
    pub fn is_open(self) -> bool {
        matches!(self, ProbeOutcome::Open)
    }

    pub fn into_verdict(self, port: u16) -> PortVerdict {
        PortVerdict {
            port,
            open: self.is_open(),
        }
    }
}

/// A single bounded-duration connection attempt against one port.
///
/// Implementations must be total: every failure maps to an outcome.
#[async_trait]
pub trait Prober: Send + Sync + 'static {
    async fn probe(&self, ip: IpAddr, port: u16, timeout: Duration) -> ProbeOutcome;
}

/// TCP connect prober backed by tokio sockets.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpProber;

#[async_trait]
impl Prober for TcpProber {
    async fn probe(&self, ip: IpAddr, port: u16, timeout: Duration) -> ProbeOutcome {
        let addr = SocketAddr::new(ip, port);
        match time::timeout(timeout, TcpStream::connect(addr)).await {
            // Dropping the stream closes the socket.
            Ok(Ok(_stream)) => ProbeOutcome::Open,
            Ok(Err(e)) => {
                trace!(%addr, error = %e, "connect failed");
                if is_resource_exhaustion(&e) {
                    ProbeOutcome::Exhausted
                } else {
                    ProbeOutcome::Closed
                }
            }
            Err(_) => {
                trace!(%addr, "connect timed out");
                ProbeOutcome::Closed
            }
        }
    }
}

/// Probe one port with the TCP prober and fold the outcome into a verdict.
pub async fn probe(ip: IpAddr, port: u16, timeout: Duration) -> PortVerdict {
    TcpProber.probe(ip, port, timeout).await.into_verdict(port)
}

/// Local socket/fd limits, as opposed to anything the target did.
fn is_resource_exhaustion(e: &io::Error) -> bool {
    if e.kind() == io::ErrorKind::AddrNotAvailable || e.kind() == io::ErrorKind::AddrInUse {
        return true;
    }
    match e.raw_os_error() {
        // EMFILE, ENFILE, ENOBUFS (linux 105, macOS 55)
        Some(24) | Some(23) | Some(105) | Some(55) => true,
        // WSAEMFILE, WSAENOBUFS, WSAEADDRINUSE, WSAEADDRNOTAVAIL
        Some(10024) | Some(10055) | Some(10048) | Some(10049) => true,
        _ => false,
    }
}

/// Turn a caller-supplied address into a single IP to probe.
///
/// IP literals (optionally bracketed IPv6) parse directly; anything else is
/// resolved through the system resolver, preferring an IPv4 answer.
pub async fn resolve_address(address: &str) -> Result<IpAddr, ScanError> {
    let trimmed = address.trim();
    let literal = trimmed
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .unwrap_or(trimmed);
    if let Ok(ip) = literal.parse::<IpAddr>() {
        return Ok(ip);
    }
    if literal.is_empty() || literal.contains(char::is_whitespace) {
        return Err(ScanError::InvalidRequest(format!("invalid address: {address:?}")));
    }

    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((literal, 0))
        .await
        .map_err(|e| ScanError::InvalidRequest(format!("cannot resolve {literal}: {e}")))?
        .collect();
    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .map(SocketAddr::ip)
        .ok_or_else(|| ScanError::InvalidRequest(format!("no addresses found for {literal}")))
}
