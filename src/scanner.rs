use crate::error::ScanError;
use crate::prober::{resolve_address, ProbeOutcome, Prober, TcpProber};
use crate::types::{PortVerdict, ScanEvent, ScanProgress, ScanRequest, ScanSummary};
use ::time::{format_description::well_known, OffsetDateTime};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::{self, JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Probes allowed in flight at once unless configured otherwise.
pub const DEFAULT_CONCURRENCY: usize = 100;
const MAX_CONCURRENCY: usize = 5_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanConfig {
    pub max_concurrency: usize,
}

impl ScanConfig {
    pub fn new(max_concurrency: usize) -> Self {
        Self { max_concurrency }
    }

    /// Configured concurrency clamped to a sane window.
    pub fn effective_concurrency(&self) -> usize {
        self.max_concurrency.clamp(1, MAX_CONCURRENCY)
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self::new(DEFAULT_CONCURRENCY)
    }
}

/// Completion set for one scan.
///
/// Each port in the range is recorded at most once; later verdicts for the
/// same port and verdicts for ports outside the range are ignored.
#[derive(Debug, Clone)]
pub struct ScanTracker {
    range: RangeInclusive<u16>,
    total: u32,
    verdicts: BTreeMap<u16, bool>,
}

impl ScanTracker {
    pub fn new(start_port: u16, end_port: u16) -> Self {
        let total = if start_port > end_port {
            0
        } else {
            u32::from(end_port) - u32::from(start_port) + 1
        };
        Self {
            range: start_port..=end_port,
            total,
            verdicts: BTreeMap::new(),
        }
    }

    /// Record a verdict. Returns the new progress only if the port was not seen before.
    pub fn record(&mut self, verdict: PortVerdict) -> Option<ScanProgress> {
        if !self.range.contains(&verdict.port) {
            trace!(port = verdict.port, "verdict outside scanned range ignored");
            return None;
        }
        match self.verdicts.entry(verdict.port) {
            Entry::Occupied(_) => {
                trace!(port = verdict.port, "duplicate verdict ignored");
                None
            }
            Entry::Vacant(slot) => {
                slot.insert(verdict.open);
                Some(self.progress())
            }
        }
    }

    pub fn progress(&self) -> ScanProgress {
        ScanProgress {
            total: self.total,
            completed: self.verdicts.len() as u32,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.verdicts.len() as u32 == self.total
    }

    /// Open ports in ascending order.
    pub fn open_ports(&self) -> Vec<u16> {
        self.verdicts
            .iter()
            .filter(|(_, open)| **open)
            .map(|(port, _)| *port)
            .collect()
    }

    pub fn summary(&self, address: &str, started_at: String, elapsed: Duration) -> ScanSummary {
        let progress = self.progress();
        ScanSummary {
            address: address.to_string(),
            open_ports: self.open_ports(),
            total: progress.total,
            completed: progress.completed,
            cancelled: !self.is_complete(),
            started_at,
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }
}

/// Runs port-range scans against a single host.
///
/// Holds no per-scan state; every call to [`Scanner::start`] gets its own
/// semaphore, completion set and channels.
#[derive(Debug)]
pub struct Scanner<P = TcpProber> {
    config: ScanConfig,
    prober: Arc<P>,
}

impl Scanner<TcpProber> {
    pub fn new(config: ScanConfig) -> Self {
        Self::with_prober(config, TcpProber)
    }
}

impl Default for Scanner<TcpProber> {
    fn default() -> Self {
        Self::new(ScanConfig::default())
    }
}

impl<P: Prober> Scanner<P> {
    pub fn with_prober(config: ScanConfig, prober: P) -> Self {
        Self {
            config,
            prober: Arc::new(prober),
        }
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    /// Validate the request, resolve the target and start scanning in the background.
    pub async fn start(&self, request: ScanRequest) -> Result<ScanHandle, ScanError> {
        self.start_with_cancel(request, CancellationToken::new()).await
    }

    /// Variant of [`Scanner::start`] driven by an external `CancellationToken`.
    pub async fn start_with_cancel(
        &self,
        request: ScanRequest,
        cancel: CancellationToken,
    ) -> Result<ScanHandle, ScanError> {
        request.validate()?;
        let ip = resolve_address(&request.address).await?;

        let tracker = ScanTracker::new(request.start_port, request.end_port);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (progress_tx, progress_rx) = watch::channel(tracker.progress());
        let concurrency = self.config.effective_concurrency();

        info!(
            address = %request.address,
            %ip,
            start = request.start_port,
            end = request.end_port,
            concurrency,
            timeout_ms = request.timeout.as_millis() as u64,
            "starting scan"
        );

        let run = ScanRun {
            request,
            ip,
            prober: self.prober.clone(),
            concurrency,
            cancel: cancel.clone(),
            tracker,
            events: events_tx,
            progress: progress_tx,
        };
        let task = tokio::spawn(run.coordinate());

        Ok(ScanHandle {
            events: events_rx,
            progress: progress_rx,
            cancel,
            task,
        })
    }

    /// Run a scan to completion, discarding the intermediate events.
    pub async fn run(&self, request: ScanRequest) -> Result<ScanSummary, ScanError> {
        self.start(request).await?.finish().await
    }
}

/// Live view of a running scan.
#[derive(Debug)]
pub struct ScanHandle {
    events: mpsc::UnboundedReceiver<ScanEvent>,
    progress: watch::Receiver<ScanProgress>,
    cancel: CancellationToken,
    task: JoinHandle<ScanSummary>,
}

impl ScanHandle {
    /// Next event in completion order. Returns `None` after `Finished` has been delivered.
    pub async fn next_event(&mut self) -> Option<ScanEvent> {
        self.events.recv().await
    }

    /// Latest progress snapshot.
    pub fn progress(&self) -> ScanProgress {
        *self.progress.borrow()
    }

    pub fn subscribe_progress(&self) -> watch::Receiver<ScanProgress> {
        self.progress.clone()
    }

    /// Stop dispatching further ports. In-flight probes are left to finish.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for the scan to end and return its summary.
    pub async fn finish(self) -> Result<ScanSummary, ScanError> {
        let ScanHandle { events, task, .. } = self;
        // Unread events would otherwise pile up until the scan ends.
        drop(events);
        task.await.map_err(|e| ScanError::Aborted(e.to_string()))
    }
}

struct ScanRun<P> {
    request: ScanRequest,
    ip: IpAddr,
    prober: Arc<P>,
    concurrency: usize,
    cancel: CancellationToken,
    tracker: ScanTracker,
    events: mpsc::UnboundedSender<ScanEvent>,
    progress: watch::Sender<ScanProgress>,
}

impl<P: Prober> ScanRun<P> {
    async fn coordinate(mut self) -> ScanSummary {
        let started = Instant::now();
        let started_at = now_iso_like();

        let sem = Arc::new(Semaphore::new(self.concurrency));
        // Slots still usable after permits lost to resource exhaustion.
        let slots = Arc::new(AtomicUsize::new(self.concurrency));
        let mut set: JoinSet<(u16, ProbeOutcome)> = JoinSet::new();
        let mut in_flight: HashMap<task::Id, u16> = HashMap::new();
        let mut ports = self.request.start_port..=self.request.end_port;
        let mut dispatching = true;
        let cancel = self.cancel.clone();

        while !self.tracker.is_complete() {
            tokio::select! {
                biased;

                Some(joined) = set.join_next_with_id(), if !set.is_empty() => {
                    let (port, outcome) = match joined {
                        Ok((id, res)) => {
                            in_flight.remove(&id);
                            res
                        }
                        Err(e) => {
                            let Some(port) = in_flight.remove(&e.id()) else { continue };
                            error!(port, error = %e, "probe task failed");
                            (port, ProbeOutcome::Closed)
                        }
                    };
                    self.complete(port, outcome);
                }

                _ = cancel.cancelled(), if dispatching => {
                    debug!("scan cancelled, draining in-flight probes");
                    dispatching = false;
                }

                permit = sem.clone().acquire_owned(), if dispatching => {
                    let Ok(permit) = permit else {
                        dispatching = false;
                        continue;
                    };
                    let Some(port) = ports.next() else {
                        dispatching = false;
                        continue;
                    };

                    let prober = self.prober.clone();
                    let slots = slots.clone();
                    let ip = self.ip;
                    let timeout = self.request.timeout;
                    let handle = set.spawn(async move {
                        let outcome = prober.probe(ip, port, timeout).await;
                        if outcome == ProbeOutcome::Exhausted && shrink(&slots) {
                            // Keep the slot out of circulation.
                            permit.forget();
                        } else {
                            drop(permit);
                        }
                        (port, outcome)
                    });
                    in_flight.insert(handle.id(), port);
                    trace!(port, "probe dispatched");
                }

                else => break,
            }
        }

        let summary = self
            .tracker
            .summary(&self.request.address, started_at, started.elapsed());
        if summary.cancelled {
            info!(
                completed = summary.completed,
                total = summary.total,
                open = summary.open_ports.len(),
                "scan stopped early"
            );
        } else {
            info!(
                total = summary.total,
                open = summary.open_ports.len(),
                elapsed_ms = summary.elapsed_ms,
                "scan finished"
            );
        }
        let _ = self.events.send(ScanEvent::Finished(summary.clone()));
        summary
    }

    fn complete(&mut self, port: u16, outcome: ProbeOutcome) {
        if outcome == ProbeOutcome::Exhausted {
            let msg = format!(
                "local socket resources exhausted while probing port {port}; reducing concurrency"
            );
            warn!(port, "{msg}");
            let _ = self.events.send(ScanEvent::Warning(msg));
        }

        let verdict = outcome.into_verdict(port);
        if let Some(progress) = self.tracker.record(verdict) {
            if verdict.open {
                debug!(port, "port open");
            }
            let _ = self.events.send(ScanEvent::Verdict(verdict));
            let _ = self.events.send(ScanEvent::Progress(progress));
            self.progress.send_replace(progress);
        }
    }
}

/// Give up one concurrency slot, never going below one.
fn shrink(slots: &AtomicUsize) -> bool {
    slots
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n > 1).then(|| n - 1))
        .is_ok()
}

fn now_iso_like() -> String {
    let now = OffsetDateTime::now_utc();
    now.format(&well_known::Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}
