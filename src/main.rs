use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;

use port_sweep::range::{self, DEFAULT_ADDRESS};
use port_sweep::scanner::{ScanConfig, Scanner, DEFAULT_CONCURRENCY};
use port_sweep::server;
use port_sweep::types::{ScanEvent, ScanRequest, ScanSummary};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

/// port-sweep — fast async TCP connect scanner that reports open ports as they are found.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "port-sweep",
    version,
    about = "Fast async TCP connect scanner that reports open ports as they are found.",
    long_about = None
)]
struct Cli {
    /// Target IP address or hostname.
    #[arg(long, short, default_value = DEFAULT_ADDRESS)]
    address: String,

    /// Inclusive port range, e.g. `1-1024`, or a single port.
    #[arg(long, short, default_value = "1-1024")]
    ports: String,

    /// Max concurrent TCP connect attempts.
    #[arg(long, default_value_t = DEFAULT_CONCURRENCY)]
    concurrency: usize,

    /// Socket connect timeout in milliseconds.
    #[arg(long = "timeout-ms", default_value_t = 100)]
    timeout_ms: u64,

    /// Write the final summary as pretty JSON to this path (optional).
    #[arg(long)]
    output: Option<PathBuf>,

    /// Stream every scan event to stdout as one JSON object per line.
    #[arg(long = "json-lines", default_value_t = false)]
    json_lines: bool,

    /// Serve the JSON scan API on this address instead of scanning once (e.g. 127.0.0.1:8080).
    #[arg(long)]
    serve: Option<String>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    if let Some(bind) = cli.serve.as_deref() {
        let server = tokio::spawn({
            let bind = bind.to_string();
            async move { server::spawn_server(&bind).await }
        });
        println!("Scan API listening at http://{} (Ctrl+C to stop)", bind);
        tokio::select! {
            res = server => res.context("server task failed")??,
            _ = tokio::signal::ctrl_c() => info!("shutting down"),
        }
        return Ok(());
    }

    let (start_port, end_port) = range::parse_port_range(&cli.ports)?;
    let request = ScanRequest::new(cli.address.clone(), start_port, end_port)
        .with_timeout(Duration::from_millis(cli.timeout_ms));
    let scanner = Scanner::new(ScanConfig::new(cli.concurrency));

    let mut handle = scanner.start(request).await?;

    // Ctrl-C stops dispatching and reports what was resolved so far.
    let cancel = handle.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    eprintln!(
        "Scanning {} ports {}-{} ({} concurrent, {} ms timeout)...",
        cli.address,
        start_port,
        end_port,
        scanner.config().effective_concurrency(),
        cli.timeout_ms
    );

    let mut stdout = io::stdout().lock();
    let mut last_percent = 0u32;
    while let Some(event) = handle.next_event().await {
        if cli.json_lines {
            serde_json::to_writer(&mut stdout, &event)?;
            writeln!(stdout)?;
            continue;
        }
        match &event {
            ScanEvent::Verdict(v) if v.open => writeln!(stdout, "Port {} is OPEN", v.port)?,
            ScanEvent::Progress(p) => {
                let percent = p.percent() as u32;
                if percent / 10 > last_percent / 10 || p.is_complete() {
                    last_percent = percent;
                    eprintln!("  progress: {}/{} ({}%)", p.completed, p.total, percent);
                }
            }
            ScanEvent::Warning(msg) => warn!("{msg}"),
            _ => {}
        }
    }
    drop(stdout);

    let summary = handle.finish().await?;
    if !cli.json_lines {
        print_summary(&summary);
    }

    if let Some(path) = cli.output.as_deref() {
        if let Err(e) = write_summary_json(path, &summary) {
            eprintln!("Failed to write JSON to {}: {}", path.display(), e);
        } else {
            eprintln!("Wrote JSON summary to {}", path.display());
        }
    }

    Ok(())
}

fn setup_logging(verbosity: u8) {
    let level = match verbosity {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_ascii_lowercase()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .compact()
        .init();
}

fn print_summary(summary: &ScanSummary) {
    if summary.cancelled {
        println!(
            "\nScan cancelled after {}/{} ports.",
            summary.completed, summary.total
        );
    }
    if summary.open_ports.is_empty() {
        println!("No open ports found");
    } else {
        println!(
            "Open ports ({}): {:?}",
            summary.open_ports.len(),
            summary.open_ports
        );
    }
    println!("Elapsed: {} ms", summary.elapsed_ms);
}

fn write_summary_json(path: &std::path::Path, summary: &ScanSummary) -> anyhow::Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, summary)?;
    Ok(())
}
