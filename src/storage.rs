use crate::model::SessionReport;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Get the base directory for storing application data.
fn base_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("bufferbloat-test")
}

/// Get the directory for storing session results.
fn runs_dir() -> PathBuf {
    base_dir().join("runs")
}

/// Ensure the necessary directories exist for storing data.
pub fn ensure_dirs() -> Result<()> {
    std::fs::create_dir_all(runs_dir()).context("create runs dir")?;
    Ok(())
}

pub fn save_run(report: &SessionReport) -> Result<PathBuf> {
    ensure_dirs()?;
    let path = get_run_path(report)?;
    let data = serde_json::to_vec_pretty(report)?;
    std::fs::write(&path, data).context("write run json")?;
    Ok(path)
}

pub fn get_run_path(report: &SessionReport) -> Result<PathBuf> {
    let safe_ts = report.timestamp_utc.replace(':', "-").replace('T', "_");
    Ok(runs_dir().join(format!("run-{safe_ts}-{}.json", report.meas_id)))
}

pub fn delete_run(report: &SessionReport) -> Result<()> {
    let path = get_run_path(report)?;
    if path.exists() {
        std::fs::remove_file(&path).context("delete run file")?;
    }
    Ok(())
}

pub fn export_json(path: &Path, report: &SessionReport) -> Result<()> {
    let data = serde_json::to_vec_pretty(report)?;
    std::fs::write(path, data).context("write export json")?;
    Ok(())
}

pub fn export_csv(path: &Path, report: &SessionReport) -> Result<()> {
    let mut out = String::new();
    out.push_str("timestamp_utc,base_url,meas_id,download_mean_mbps,upload_mean_mbps,bidir_download_mean_mbps,bidir_upload_mean_mbps,baseline_p50_ms,baseline_p90_ms,baseline_p99_ms,baseline_loss,loaded_dl_p50_ms,loaded_dl_p90_ms,loaded_dl_p99_ms,loaded_dl_loss,loaded_ul_p50_ms,loaded_ul_p90_ms,loaded_ul_p99_ms,loaded_ul_loss,optimal_download_streams,optimal_download_pending,optimal_upload_streams,optimal_upload_pending\n");
    out.push_str(&format!(
        "{},{},{},{:.3},{:.3},{:.3},{:.3},{:.3},{:.3},{:.3},{:.6},{:.3},{:.3},{:.3},{:.6},{:.3},{:.3},{:.3},{:.6},{},{},{},{}\n",
        csv_escape(&report.timestamp_utc),
        csv_escape(&report.base_url),
        csv_escape(&report.meas_id),
        report.download_throughput.mean_mbps,
        report.upload_throughput.mean_mbps,
        report.bidirectional_download_throughput.mean_mbps,
        report.bidirectional_upload_throughput.mean_mbps,
        report.baseline_latency.p50_ms.unwrap_or(f64::NAN),
        report.baseline_latency.p90_ms.unwrap_or(f64::NAN),
        report.baseline_latency.p99_ms.unwrap_or(f64::NAN),
        report.baseline_latency.loss,
        report.loaded_latency_download.p50_ms.unwrap_or(f64::NAN),
        report.loaded_latency_download.p90_ms.unwrap_or(f64::NAN),
        report.loaded_latency_download.p99_ms.unwrap_or(f64::NAN),
        report.loaded_latency_download.loss,
        report.loaded_latency_upload.p50_ms.unwrap_or(f64::NAN),
        report.loaded_latency_upload.p90_ms.unwrap_or(f64::NAN),
        report.loaded_latency_upload.p99_ms.unwrap_or(f64::NAN),
        report.loaded_latency_upload.loss,
        report.optimal_download_params.stream_count,
        report.optimal_download_params.pending_depth,
        report.optimal_upload_params.stream_count,
        report.optimal_upload_params.pending_depth,
    ));
    std::fs::write(path, out).context("write export csv")?;
    Ok(())
}

/// Escape a string for CSV format (handles commas, quotes, and newlines).
fn csv_escape(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

pub fn load_recent(limit: usize) -> Result<Vec<SessionReport>> {
    ensure_dirs()?;
    let dir = runs_dir();
    let mut entries: Vec<(std::time::SystemTime, PathBuf)> = Vec::new();
    for e in std::fs::read_dir(&dir).context("read runs dir")? {
        let e = e?;
        let p = e.path();
        if p.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let m = e.metadata()?;
        let mt = m.modified().unwrap_or(std::time::SystemTime::UNIX_EPOCH);
        entries.push((mt, p));
    }
    entries.sort_by_key(|(t, _)| *t);
    entries.reverse();

    let mut out = Vec::new();
    for (_, p) in entries.into_iter().take(limit) {
        let data = std::fs::read(&p).with_context(|| format!("read {}", p.display()))?;
        let r: SessionReport =
            serde_json::from_slice(&data).with_context(|| format!("parse {}", p.display()))?;
        out.push(r);
    }
    Ok(out)
}
