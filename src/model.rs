use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration assembled from CLI arguments (or, in principle, any other
/// front end) and handed to the engine as a single immutable value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub base_url: String,
    pub meas_id: String,
    #[serde(default)]
    pub comments: Option<String>,
    pub user_agent: String,

    /// Concurrency ceiling used by Parameter Discovery for download streams.
    pub max_download_streams: usize,
    /// Concurrency ceiling used by Parameter Discovery for upload streams.
    pub max_upload_streams: usize,
    /// Pending-request depth ceiling for upload streams.
    pub max_pending_depth: usize,

    #[serde(with = "humantime_serde")]
    pub baseline_duration: Duration,
    #[serde(with = "humantime_serde")]
    pub load_phase_duration: Duration,
    #[serde(with = "humantime_serde")]
    pub min_warmup_duration: Duration,

    pub probe_interval_ms: u64,
    pub probe_timeout_min_ms: u64,
    pub probe_timeout_max_ms: u64,
}

/// The seven phases of a session, in the fixed order they must occur.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PhaseKind {
    Baseline,
    DownloadWarmup,
    Download,
    UploadWarmup,
    Upload,
    Bidirectional,
    Complete,
}

impl PhaseKind {
    /// The fixed session order. Used by the Phase Controller to validate
    /// transitions and by components that need to know "what comes next".
    pub const ORDER: [PhaseKind; 7] = [
        PhaseKind::Baseline,
        PhaseKind::DownloadWarmup,
        PhaseKind::Download,
        PhaseKind::UploadWarmup,
        PhaseKind::Upload,
        PhaseKind::Bidirectional,
        PhaseKind::Complete,
    ];

    pub fn index(self) -> usize {
        Self::ORDER.iter().position(|p| *p == self).expect("exhaustive")
    }

    pub fn next(self) -> Option<PhaseKind> {
        Self::ORDER.get(self.index() + 1).copied()
    }

    /// Whether this phase is a warmup during which Parameter Discovery runs.
    pub fn is_warmup(self) -> bool {
        matches!(self, PhaseKind::DownloadWarmup | PhaseKind::UploadWarmup)
    }

    /// Which load direction(s), if any, this phase is meant to exercise.
    /// Used by the Throughput Monitor to flag out-of-phase traffic.
    pub fn expects(self, direction: Direction) -> bool {
        match self {
            PhaseKind::DownloadWarmup | PhaseKind::Download => direction == Direction::Download,
            PhaseKind::UploadWarmup | PhaseKind::Upload => direction == Direction::Upload,
            PhaseKind::Bidirectional => true,
            PhaseKind::Baseline | PhaseKind::Complete => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Download,
    Upload,
}

/// A single phase's recorded lifetime, pushed onto the session's
/// `phase_history` once it ends (or, for the currently running phase,
/// reflected with `end: None`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub kind: PhaseKind,
    #[serde(with = "humantime_serde")]
    pub start_elapsed: Duration,
    #[serde(with = "humantime_serde", default)]
    pub end_elapsed: Option<Duration>,
}

/// One load-parameter candidate: how many concurrent streams, and (for
/// uploads) how many requests each stream keeps in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterSet {
    pub stream_count: usize,
    pub pending_depth: usize,
}

impl ParameterSet {
    pub fn new(stream_count: usize, pending_depth: usize) -> Self {
        Self {
            stream_count: stream_count.max(1),
            pending_depth: pending_depth.max(1),
        }
    }
}

/// One (parameters, outcome) observation recorded during a warmup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterTrial {
    pub params: ParameterSet,
    pub throughput_mbps: f64,
    pub latency_ms: f64,
    #[serde(with = "humantime_serde")]
    pub at_elapsed: Duration,
    pub is_optimal_outcome: bool,
    pub caused_optimal_outcome: bool,
}

/// A round-trip latency observation, successful or timed out.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LatencySample {
    #[serde(with = "humantime_serde")]
    pub send_elapsed: Duration,
    pub rtt_ms: f64,
    pub is_timeout: bool,
    pub phase: PhaseKind,
    pub consecutive_timeouts: u32,
}

/// A throughput observation for one direction at one sampling tick.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ThroughputSample {
    #[serde(with = "humantime_serde")]
    pub at_elapsed: Duration,
    pub direction: Direction,
    pub mbps: f64,
    pub smoothed_mbps: f64,
    pub phase: PhaseKind,
    pub is_out_of_phase: bool,
}

/// Aggregate latency statistics over a sample set (percentiles computed via
/// `hdrhistogram` in `stats.rs`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatencySummary {
    pub sent: u64,
    pub received: u64,
    pub loss: f64,
    pub min_ms: Option<f64>,
    pub p50_ms: Option<f64>,
    pub p90_ms: Option<f64>,
    pub p99_ms: Option<f64>,
    pub max_ms: Option<f64>,
    pub jitter_ms: Option<f64>,
}

impl LatencySummary {
    pub fn failed() -> Self {
        Self {
            sent: 0,
            received: 0,
            loss: 1.0,
            min_ms: None,
            p50_ms: None,
            p90_ms: None,
            p99_ms: None,
            max_ms: None,
            jitter_ms: None,
        }
    }
}

/// Aggregate throughput statistics over a phase's sample set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThroughputSummary {
    pub bytes: u64,
    pub duration_ms: u64,
    pub mean_mbps: f64,
    pub median_mbps: Option<f64>,
    pub p25_mbps: Option<f64>,
    pub p75_mbps: Option<f64>,
}

/// The engine's final output: per-phase series, optimal parameters, and
/// phase transition timestamps, ready for the ambient CLI shell to print,
/// save, or export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionReport {
    pub timestamp_utc: String,
    pub base_url: String,
    pub meas_id: String,
    #[serde(default)]
    pub comments: Option<String>,

    pub baseline_latency: LatencySummary,
    pub download_throughput: ThroughputSummary,
    pub upload_throughput: ThroughputSummary,
    pub bidirectional_download_throughput: ThroughputSummary,
    pub bidirectional_upload_throughput: ThroughputSummary,
    pub loaded_latency_download: LatencySummary,
    pub loaded_latency_upload: LatencySummary,
    pub loaded_latency_bidirectional: LatencySummary,

    pub optimal_download_params: ParameterSet,
    pub optimal_upload_params: ParameterSet,
    pub download_trials: Vec<ParameterTrial>,
    pub upload_trials: Vec<ParameterTrial>,

    pub phase_history: Vec<PhaseRecord>,
}
