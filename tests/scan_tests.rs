use async_trait::async_trait;
use port_sweep::prober::{ProbeOutcome, Prober};
use port_sweep::scanner::{ScanConfig, Scanner};
use port_sweep::types::{ScanEvent, ScanProgress, ScanRequest};
use port_sweep::ScanError;
use std::collections::{BTreeSet, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Prober that reports a fixed set of ports as open, after an optional delay,
/// and records how many probes ran at the same time.
#[derive(Clone, Default)]
struct FakeProber {
    open: Arc<HashSet<u16>>,
    exhausted: Arc<HashSet<u16>>,
    delay: Duration,
    calls: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    exhausted_done: Arc<AtomicUsize>,
    peak_after_exhaustion: Arc<AtomicUsize>,
    panic_on: Option<u16>,
}

impl FakeProber {
    fn with_open(open: &[u16]) -> Self {
        Self {
            open: Arc::new(open.iter().copied().collect()),
            ..Default::default()
        }
    }

    fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl Prober for FakeProber {
    async fn probe(&self, _ip: IpAddr, port: u16, _timeout: Duration) -> ProbeOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if !self.exhausted.is_empty()
            && self.exhausted_done.load(Ordering::SeqCst) == self.exhausted.len()
        {
            self.peak_after_exhaustion.fetch_max(now, Ordering::SeqCst);
        }
        if !self.delay.is_zero() {
            // Later ports finish first so arrival order differs from port order.
            let jitter = Duration::from_millis(u64::from(port % 7));
            tokio::time::sleep(self.delay + jitter).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if self.panic_on == Some(port) {
            panic!("prober blew up on port {port}");
        }
        if self.exhausted.contains(&port) {
            self.exhausted_done.fetch_add(1, Ordering::SeqCst);
            ProbeOutcome::Exhausted
        } else if self.open.contains(&port) {
            ProbeOutcome::Open
        } else {
            ProbeOutcome::Closed
        }
    }
}

#[tokio::test]
async fn summary_is_ascending_subset_of_range() {
    let prober = FakeProber::with_open(&[120, 101, 150, 99, 151]).delayed(Duration::from_millis(2));
    let scanner = Scanner::with_prober(ScanConfig::new(16), prober);
    let summary = scanner
        .run(ScanRequest::new("127.0.0.1", 100, 150))
        .await
        .expect("scan ok");

    assert_eq!(summary.open_ports, vec![101, 120, 150]);
    assert_eq!((summary.total, summary.completed), (51, 51));
    assert!(!summary.cancelled);
}

#[tokio::test]
async fn one_verdict_per_port_and_monotonic_progress() {
    let prober = FakeProber::with_open(&[3, 17]).delayed(Duration::from_millis(1));
    let scanner = Scanner::with_prober(ScanConfig::new(8), prober);
    let mut handle = scanner
        .start(ScanRequest::new("127.0.0.1", 1, 40))
        .await
        .unwrap();

    let mut seen = BTreeSet::new();
    let mut progress: Vec<ScanProgress> = Vec::new();
    let mut finished = 0;
    while let Some(event) = handle.next_event().await {
        match event {
            ScanEvent::Verdict(v) => assert!(seen.insert(v.port), "port {} reported twice", v.port),
            ScanEvent::Progress(p) => progress.push(p),
            ScanEvent::Finished(_) => finished += 1,
            ScanEvent::Warning(w) => panic!("unexpected warning: {w}"),
        }
    }

    assert_eq!(seen, (1..=40).collect::<BTreeSet<u16>>());
    assert_eq!(finished, 1);
    assert_eq!(progress.len(), 40);
    for (i, p) in progress.iter().enumerate() {
        assert_eq!(p.total, 40);
        assert_eq!(p.completed as usize, i + 1);
    }
    assert_eq!(progress.iter().filter(|p| p.is_complete()).count(), 1);
    assert_eq!(handle.progress(), ScanProgress { total: 40, completed: 40 });

    let summary = handle.finish().await.unwrap();
    assert_eq!(summary.open_ports, vec![3, 17]);
}

#[tokio::test]
async fn concurrency_never_exceeds_limit() {
    let prober = FakeProber::default().delayed(Duration::from_millis(5));
    let peak = prober.peak.clone();
    let calls = prober.calls.clone();
    let scanner = Scanner::with_prober(ScanConfig::new(8), prober);
    let summary = scanner.run(ScanRequest::new("127.0.0.1", 1, 200)).await.unwrap();

    assert_eq!(summary.completed, 200);
    assert_eq!(calls.load(Ordering::SeqCst), 200);
    let peak = peak.load(Ordering::SeqCst);
    assert!(peak <= 8, "peak in-flight {peak} exceeded limit");
    assert!(peak > 1, "probes never overlapped");
}

#[tokio::test]
async fn inverted_range_is_rejected_before_probing() {
    let prober = FakeProber::default();
    let calls = prober.calls.clone();
    let scanner = Scanner::with_prober(ScanConfig::default(), prober);
    let err = scanner
        .start(ScanRequest::new("127.0.0.1", 1024, 1))
        .await
        .unwrap_err();

    assert!(matches!(err, ScanError::InvalidRequest(_)));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn malformed_address_is_rejected() {
    let prober = FakeProber::default();
    let calls = prober.calls.clone();
    let scanner = Scanner::with_prober(ScanConfig::default(), prober);
    let err = scanner
        .run(ScanRequest::new("999.1.1 .1", 1, 10))
        .await
        .unwrap_err();

    assert!(matches!(err, ScanError::InvalidRequest(_)));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn single_port_range_scans_one_port() {
    let prober = FakeProber::with_open(&[8080]);
    let calls = prober.calls.clone();
    let scanner = Scanner::with_prober(ScanConfig::default(), prober);
    let summary = scanner
        .run(ScanRequest::new("127.0.0.1", 8080, 8080))
        .await
        .unwrap();

    assert_eq!(summary.total, 1);
    assert_eq!(summary.completed, 1);
    assert_eq!(summary.open_ports, vec![8080]);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn cancel_stops_dispatch_and_yields_partial_summary() {
    let prober = FakeProber::with_open(&[1, 2, 3]).delayed(Duration::from_millis(20));
    let calls = prober.calls.clone();
    let scanner = Scanner::with_prober(ScanConfig::new(2), prober);
    let mut handle = scanner
        .start(ScanRequest::new("127.0.0.1", 1, 500))
        .await
        .unwrap();

    // Wait for the first verdict, then stop.
    while let Some(event) = handle.next_event().await {
        if matches!(event, ScanEvent::Verdict(_)) {
            handle.cancel();
            break;
        }
    }
    let summary = handle.finish().await.unwrap();

    assert!(summary.cancelled);
    assert!(summary.completed < summary.total);
    assert_eq!(summary.total, 500);
    // Everything dispatched was allowed to finish.
    assert_eq!(summary.completed as usize, calls.load(Ordering::SeqCst));
    assert!(summary.open_ports.iter().all(|p| (1..=3).contains(p)));
    assert!(summary.open_ports.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test]
async fn resource_exhaustion_warns_but_scan_completes() {
    let mut prober = FakeProber::with_open(&[5]);
    prober.exhausted = Arc::new([2u16, 3, 4].into_iter().collect());
    let scanner = Scanner::with_prober(ScanConfig::new(4), prober);
    let mut handle = scanner
        .start(ScanRequest::new("127.0.0.1", 1, 30))
        .await
        .unwrap();

    let mut warnings = 0;
    while let Some(event) = handle.next_event().await {
        if let ScanEvent::Warning(_) = event {
            warnings += 1;
        }
    }
    let summary = handle.finish().await.unwrap();

    assert_eq!(warnings, 3);
    assert!(!summary.cancelled);
    assert_eq!(summary.completed, 30);
    assert_eq!(summary.open_ports, vec![5]);
}

#[tokio::test]
async fn exhaustion_shrinks_effective_concurrency() {
    let mut prober = FakeProber::default().delayed(Duration::from_millis(2));
    prober.exhausted = Arc::new((1..=8).collect());
    let later_peak = prober.peak_after_exhaustion.clone();
    let scanner = Scanner::with_prober(ScanConfig::new(8), prober);
    let summary = scanner.run(ScanRequest::new("127.0.0.1", 1, 100)).await.unwrap();

    assert_eq!(summary.completed, 100);
    assert!(!summary.cancelled);
    // Seven slots were given up; the floor of one keeps the scan moving.
    assert_eq!(later_peak.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn panicking_prober_counts_as_closed() {
    let mut prober = FakeProber::with_open(&[7]);
    prober.panic_on = Some(5);
    let scanner = Scanner::with_prober(ScanConfig::new(4), prober);
    let summary = scanner.run(ScanRequest::new("127.0.0.1", 1, 10)).await.unwrap();

    assert_eq!(summary.completed, 10);
    assert_eq!(summary.open_ports, vec![7]);
    assert!(!summary.cancelled);
}

#[tokio::test]
async fn token_cancelled_before_start_dispatches_nothing() {
    let prober = FakeProber::with_open(&[1]);
    let calls = prober.calls.clone();
    let scanner = Scanner::with_prober(ScanConfig::default(), prober);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let mut handle = scanner
        .start_with_cancel(ScanRequest::new("127.0.0.1", 1, 50), cancel)
        .await
        .unwrap();
    let mut finished = 0;
    while let Some(event) = handle.next_event().await {
        match event {
            ScanEvent::Finished(_) => finished += 1,
            other => panic!("unexpected event: {other:?}"),
        }
    }
    let summary = handle.finish().await.unwrap();

    assert_eq!(finished, 1);
    assert_eq!(summary.completed, 0);
    assert!(summary.cancelled);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn independent_scans_run_side_by_side() {
    let scanner = Scanner::with_prober(
        ScanConfig::new(4),
        FakeProber::with_open(&[10, 20]).delayed(Duration::from_millis(1)),
    );
    let (a, b) = tokio::join!(
        scanner.run(ScanRequest::new("127.0.0.1", 1, 15)),
        scanner.run(ScanRequest::new("127.0.0.1", 15, 30)),
    );
    assert_eq!(a.unwrap().open_ports, vec![10]);
    assert_eq!(b.unwrap().open_ports, vec![20]);
}

#[tokio::test]
async fn real_listener_is_found_and_released_port_is_not() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let open_port = listener.local_addr().unwrap().port();
    let closed_port = {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        l.local_addr().unwrap().port()
    };

    let scanner = Scanner::new(ScanConfig::default());
    let timeout = Duration::from_millis(500);

    let open = scanner
        .run(ScanRequest::new("127.0.0.1", open_port, open_port).with_timeout(timeout))
        .await
        .unwrap();
    assert_eq!(open.open_ports, vec![open_port]);

    let closed = scanner
        .run(ScanRequest::new("127.0.0.1", closed_port, closed_port).with_timeout(timeout))
        .await
        .unwrap();
    assert!(closed.open_ports.is_empty());
    assert_eq!(closed.completed, 1);
}

#[tokio::test]
async fn one_range_holds_listening_and_idle_ports() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let open_port = listener.local_addr().unwrap().port();

    // Nearest neighbour nobody listens on: binding succeeds, then we let it go.
    let mut idle_port = None;
    for delta in 1..=50i32 {
        for candidate in [i32::from(open_port) + delta, i32::from(open_port) - delta] {
            let Ok(candidate) = u16::try_from(candidate) else { continue };
            if candidate == 0 {
                continue;
            }
            if TcpListener::bind(("127.0.0.1", candidate)).await.is_ok() {
                idle_port = Some(candidate);
                break;
            }
        }
        if idle_port.is_some() {
            break;
        }
    }
    let idle_port = idle_port.expect("a free port near the listener");

    let (start, end) = (open_port.min(idle_port), open_port.max(idle_port));
    let summary = Scanner::default()
        .run(ScanRequest::new("127.0.0.1", start, end).with_timeout(Duration::from_millis(500)))
        .await
        .unwrap();

    assert_eq!(summary.total, u32::from(end - start) + 1);
    assert!(summary.open_ports.contains(&open_port));
    assert!(!summary.open_ports.contains(&idle_port));
}

#[tokio::test]
async fn localhost_hostname_resolves() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let summary = Scanner::default()
        .run(ScanRequest::new("localhost", port, port).with_timeout(Duration::from_millis(500)))
        .await
        .unwrap();
    assert_eq!(summary.address, "localhost");
    assert_eq!(summary.open_ports, vec![port]);
}
