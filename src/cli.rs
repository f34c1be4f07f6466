use crate::engine::bus::{recv_lossy, EngineEvent, PhaseEdge};
use crate::engine::TestEngine;
use crate::model::{RunConfig, SessionReport};
use anyhow::{Context, Result};
use clap::Parser;
use rand::RngCore;
use std::time::Duration;

#[derive(Debug, Parser, Clone)]
#[command(
    name = "bufferbloat-test",
    version,
    about = "Measures bufferbloat under saturating load against a cooperative origin"
)]
pub struct Cli {
    /// Base URL of the measurement origin (must expose /ping, /download, /upload)
    #[arg(long)]
    pub base_url: String,

    /// Print JSON result and exit
    #[arg(long)]
    pub json: bool,

    /// Print text summary and exit (default when neither --json nor --text is given)
    #[arg(long)]
    pub text: bool,

    /// Baseline (idle) latency measurement duration
    #[arg(long, default_value = "5s")]
    pub baseline_duration: humantime::Duration,

    /// Duration of each frozen-parameter load phase (Download, Upload, Bidirectional)
    #[arg(long, default_value = "5s")]
    pub load_phase_duration: humantime::Duration,

    /// Minimum time Parameter Discovery must hold a stable parameter set
    /// before a warmup is considered converged
    #[arg(long, default_value = "15s")]
    pub min_warmup_duration: humantime::Duration,

    /// Concurrency ceiling for download streams
    #[arg(long, default_value_t = 24)]
    pub max_download_streams: usize,

    /// Concurrency ceiling for upload streams
    #[arg(long, default_value_t = 16)]
    pub max_upload_streams: usize,

    /// Pending-request depth ceiling for upload streams
    #[arg(long, default_value_t = 16)]
    pub max_pending_depth: usize,

    /// Latency probe cadence in milliseconds
    #[arg(long, default_value_t = 100)]
    pub probe_interval_ms: u64,

    /// Minimum adaptive probe timeout in milliseconds
    #[arg(long, default_value_t = 1000)]
    pub probe_timeout_min_ms: u64,

    /// Maximum adaptive probe timeout in milliseconds
    #[arg(long, default_value_t = 2000)]
    pub probe_timeout_max_ms: u64,

    /// Freeform annotation stored alongside the session report
    #[arg(long)]
    pub comments: Option<String>,

    /// Export results as JSON
    #[arg(long)]
    pub export_json: Option<std::path::PathBuf>,

    /// Export results as CSV
    #[arg(long)]
    pub export_csv: Option<std::path::PathBuf>,

    /// Use --auto-save true or --auto-save false to override
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub auto_save: bool,
}

pub async fn run(args: Cli) -> Result<()> {
    if args.json {
        run_json(args).await
    } else {
        run_text(args).await
    }
}

/// Generate a random measurement ID for the session.
fn gen_meas_id() -> String {
    let mut b = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut b);
    u64::from_le_bytes(b).to_string()
}

/// Build a `RunConfig` from CLI arguments.
pub fn build_config(args: &Cli) -> RunConfig {
    RunConfig {
        base_url: args.base_url.clone(),
        meas_id: gen_meas_id(),
        comments: args.comments.clone(),
        user_agent: format!("bufferbloat-test/{}", env!("CARGO_PKG_VERSION")),
        max_download_streams: args.max_download_streams,
        max_upload_streams: args.max_upload_streams,
        max_pending_depth: args.max_pending_depth,
        baseline_duration: Duration::from(args.baseline_duration),
        load_phase_duration: Duration::from(args.load_phase_duration),
        min_warmup_duration: Duration::from(args.min_warmup_duration),
        probe_interval_ms: args.probe_interval_ms,
        probe_timeout_min_ms: args.probe_timeout_min_ms,
        probe_timeout_max_ms: args.probe_timeout_max_ms,
    }
}

async fn run_json(args: Cli) -> Result<()> {
    let cfg = build_config(&args);
    let engine = TestEngine::new(cfg);
    let report = engine.run().await.context("session failed")?;

    handle_exports(&args, &report)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if args.auto_save {
        if let Ok(p) = crate::storage::save_run(&report) {
            eprintln!("Saved: {}", p.display());
        }
    }
    Ok(())
}

async fn run_text(args: Cli) -> Result<()> {
    let cfg = build_config(&args);
    let engine = TestEngine::new(cfg);
    let mut events = engine.bus().subscribe();

    let handle = tokio::spawn(async move { engine.run().await });

    while let Some(event) = recv_lossy(&mut events).await {
        match event {
            EngineEvent::PhaseChange {
                edge: PhaseEdge::Start,
                phase,
                elapsed_time,
            } => {
                eprintln!("[{:>6.1}s] == {phase:?} ==", elapsed_time.as_secs_f64());
            }
            EngineEvent::Throughput(sample) if !sample.is_out_of_phase => {
                eprintln!(
                    "[{:>6.1}s] {:?} {:?}: {:.2} Mbps (smoothed {:.2})",
                    sample.at_elapsed.as_secs_f64(),
                    sample.phase,
                    sample.direction,
                    sample.mbps,
                    sample.smoothed_mbps
                );
            }
            EngineEvent::Latency(sample) if sample.is_timeout => {
                eprintln!(
                    "[{:>6.1}s] ping timeout (#{} consecutive)",
                    sample.send_elapsed.as_secs_f64(),
                    sample.consecutive_timeouts
                );
            }
            EngineEvent::Info { message } => eprintln!("{message}"),
            _ => {}
        }
    }

    let report = handle.await??;
    handle_exports(&args, &report)?;

    println!(
        "Baseline latency: p50 {:.1} ms p99 {:.1} ms (loss {:.1}%)",
        report.baseline_latency.p50_ms.unwrap_or(f64::NAN),
        report.baseline_latency.p99_ms.unwrap_or(f64::NAN),
        report.baseline_latency.loss * 100.0,
    );
    println!(
        "Download: {:.2} Mbps (streams={}, pending={})",
        report.download_throughput.mean_mbps,
        report.optimal_download_params.stream_count,
        report.optimal_download_params.pending_depth,
    );
    println!(
        "Upload:   {:.2} Mbps (streams={}, pending={})",
        report.upload_throughput.mean_mbps,
        report.optimal_upload_params.stream_count,
        report.optimal_upload_params.pending_depth,
    );
    println!(
        "Loaded latency (download): p50 {:.1} ms p99 {:.1} ms (loss {:.1}%)",
        report.loaded_latency_download.p50_ms.unwrap_or(f64::NAN),
        report.loaded_latency_download.p99_ms.unwrap_or(f64::NAN),
        report.loaded_latency_download.loss * 100.0,
    );
    println!(
        "Loaded latency (upload): p50 {:.1} ms p99 {:.1} ms (loss {:.1}%)",
        report.loaded_latency_upload.p50_ms.unwrap_or(f64::NAN),
        report.loaded_latency_upload.p99_ms.unwrap_or(f64::NAN),
        report.loaded_latency_upload.loss * 100.0,
    );
    println!(
        "Bidirectional: down {:.2} Mbps / up {:.2} Mbps, latency p50 {:.1} ms p99 {:.1} ms",
        report.bidirectional_download_throughput.mean_mbps,
        report.bidirectional_upload_throughput.mean_mbps,
        report.loaded_latency_bidirectional.p50_ms.unwrap_or(f64::NAN),
        report.loaded_latency_bidirectional.p99_ms.unwrap_or(f64::NAN),
    );

    if args.auto_save {
        if let Ok(p) = crate::storage::save_run(&report) {
            eprintln!("Saved: {}", p.display());
        }
    }
    Ok(())
}

/// Handle export operations (JSON and CSV) for both text and JSON modes.
fn handle_exports(args: &Cli, report: &SessionReport) -> Result<()> {
    if let Some(p) = args.export_json.as_deref() {
        crate::storage::export_json(p, report)?;
    }
    if let Some(p) = args.export_csv.as_deref() {
        crate::storage::export_csv(p, report)?;
    }
    Ok(())
}
