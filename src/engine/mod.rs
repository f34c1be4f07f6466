pub mod bus;
pub mod error;
pub mod latency_prober;
pub mod origin_client;
pub mod parameter_discovery;
pub mod phase_controller;
pub mod stream_manager;
pub mod throughput_monitor;

use bus::{Bus, ControlEvent};
use latency_prober::LatencyProber;
use origin_client::OriginClient;
use parameter_discovery::ParameterDiscovery;
use phase_controller::PhaseController;
use stream_manager::StreamManager;
use throughput_monitor::ThroughputMonitor;

use crate::model::{
    Direction, PhaseKind, RunConfig, SessionReport, ThroughputSample, ThroughputSummary,
};
use crate::stats::summarize_latency_samples;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Hard safety cap on how long a warmup is allowed to keep searching even
/// if Parameter Discovery never reports convergence. Must stay comfortably
/// above the documented 15s warmup minimum -- `converged()` can't return
/// true before `min_warmup_duration` has elapsed stable, so a cap at or
/// below that minimum would make convergence unreachable.
const MAX_WARMUP_DURATION: Duration = Duration::from_secs(45);
const WARMUP_SAMPLE_TICK: Duration = Duration::from_millis(250);

pub struct TestEngine {
    cfg: RunConfig,
    bus: Bus,
}

impl TestEngine {
    pub fn new(cfg: RunConfig) -> Self {
        Self {
            cfg,
            bus: Bus::new(),
        }
    }

    /// Callers subscribe before calling `run` to observe the session live.
    pub fn bus(&self) -> Bus {
        self.bus.clone()
    }

    pub async fn run(self) -> Result<SessionReport> {
        let session_start = Instant::now();
        let client = OriginClient::new(&self.cfg).context("building origin client")?;

        let streams = Arc::new(StreamManager::new(
            self.bus.clone(),
            client.clone(),
            session_start,
        ));
        let controller = Arc::new(PhaseController::new(self.bus.clone(), session_start));
        let monitor = ThroughputMonitor::new();
        let prober = LatencyProber::new(
            self.cfg.probe_interval_ms,
            self.cfg.probe_timeout_min_ms,
            self.cfg.probe_timeout_max_ms,
        );
        let (control_tx, mut control_rx) = mpsc::unbounded_channel::<ControlEvent>();

        let monitor_handle = monitor.spawn(self.bus.clone(), streams.clone(), controller.clone());
        let prober_handle = prober.spawn(
            self.bus.clone(),
            client.clone(),
            controller.clone(),
            control_tx,
        );

        controller.begin();

        tokio::time::sleep(self.cfg.baseline_duration).await;
        let baseline_latency =
            summarize_latency_samples(&prober.samples_for_phase(PhaseKind::Baseline));
        let baseline_latency_ms = baseline_latency.p50_ms.unwrap_or(50.0);

        controller
            .start_phase(&streams, PhaseKind::DownloadWarmup)
            .await?;
        let mut download_discovery = self
            .run_warmup(
                Direction::Download,
                baseline_latency_ms,
                session_start,
                &streams,
                &monitor,
                &prober,
                &controller,
                &mut control_rx,
            )
            .await;
        let optimal_download_params = download_discovery.resolve();
        let download_trials = download_discovery.trials().to_vec();

        controller
            .start_phase(&streams, PhaseKind::Download)
            .await?;
        streams
            .start_download_saturation(optimal_download_params)
            .await;
        tokio::time::sleep(self.cfg.load_phase_duration).await;
        let download_bytes = sum_bytes(&streams, Direction::Download);
        let download_throughput = summarize_throughput(
            &monitor.download_series(),
            PhaseKind::Download,
            Direction::Download,
            download_bytes,
            self.cfg.load_phase_duration,
        );
        let loaded_latency_download =
            summarize_latency_samples(&prober.samples_for_phase(PhaseKind::Download));

        controller
            .start_phase(&streams, PhaseKind::UploadWarmup)
            .await?;
        let mut upload_discovery = self
            .run_warmup(
                Direction::Upload,
                baseline_latency_ms,
                session_start,
                &streams,
                &monitor,
                &prober,
                &controller,
                &mut control_rx,
            )
            .await;
        let optimal_upload_params = upload_discovery.resolve();
        let upload_trials = upload_discovery.trials().to_vec();

        controller.start_phase(&streams, PhaseKind::Upload).await?;
        streams.start_upload_saturation(optimal_upload_params).await;
        tokio::time::sleep(self.cfg.load_phase_duration).await;
        let upload_bytes = sum_bytes(&streams, Direction::Upload);
        let upload_throughput = summarize_throughput(
            &monitor.upload_series(),
            PhaseKind::Upload,
            Direction::Upload,
            upload_bytes,
            self.cfg.load_phase_duration,
        );
        let loaded_latency_upload =
            summarize_latency_samples(&prober.samples_for_phase(PhaseKind::Upload));

        controller
            .start_phase(&streams, PhaseKind::Bidirectional)
            .await?;
        streams
            .start_bidirectional_saturation(optimal_download_params, optimal_upload_params)
            .await;
        tokio::time::sleep(self.cfg.load_phase_duration).await;
        let bidir_download_bytes = sum_bytes(&streams, Direction::Download);
        let bidir_upload_bytes = sum_bytes(&streams, Direction::Upload);
        let bidirectional_download_throughput = summarize_throughput(
            &monitor.download_series(),
            PhaseKind::Bidirectional,
            Direction::Download,
            bidir_download_bytes,
            self.cfg.load_phase_duration,
        );
        let bidirectional_upload_throughput = summarize_throughput(
            &monitor.upload_series(),
            PhaseKind::Bidirectional,
            Direction::Upload,
            bidir_upload_bytes,
            self.cfg.load_phase_duration,
        );
        let loaded_latency_bidirectional =
            summarize_latency_samples(&prober.samples_for_phase(PhaseKind::Bidirectional));

        controller
            .start_phase(&streams, PhaseKind::Complete)
            .await?;
        controller.end_phase();

        monitor_handle.abort();
        prober_handle.abort();

        Ok(SessionReport {
            timestamp_utc: time::OffsetDateTime::now_utc()
                .format(&time::format_description::well_known::Rfc3339)
                .unwrap_or_else(|_| "now".into()),
            base_url: self.cfg.base_url.clone(),
            meas_id: self.cfg.meas_id.clone(),
            comments: self.cfg.comments.clone(),
            baseline_latency,
            download_throughput,
            upload_throughput,
            bidirectional_download_throughput,
            bidirectional_upload_throughput,
            loaded_latency_download,
            loaded_latency_upload,
            loaded_latency_bidirectional,
            optimal_download_params,
            optimal_upload_params,
            download_trials,
            upload_trials,
            phase_history: controller.phase_history(),
        })
    }

    /// Drive Parameter Discovery for one direction until it converges or the
    /// safety cap is hit, adjusting the Stream Manager's live stream count
    /// (and, for uploads, pending depth) after every observation that moves.
    #[allow(clippy::too_many_arguments)]
    async fn run_warmup(
        &self,
        direction: Direction,
        baseline_latency_ms: f64,
        session_start: Instant,
        streams: &StreamManager,
        monitor: &ThroughputMonitor,
        prober: &LatencyProber,
        controller: &PhaseController,
        control_rx: &mut mpsc::UnboundedReceiver<ControlEvent>,
    ) -> ParameterDiscovery {
        let max_stream_count = match direction {
            Direction::Download => self.cfg.max_download_streams,
            Direction::Upload => self.cfg.max_upload_streams,
        };
        let mut discovery = ParameterDiscovery::new(
            direction,
            baseline_latency_ms,
            self.cfg.min_warmup_duration,
            session_start,
            max_stream_count,
            self.cfg.max_pending_depth,
        );

        match direction {
            Direction::Download => streams.adjust_download_streams(1),
            Direction::Upload => streams.adjust_upload_streams(1, 1, true),
        }

        let warmup_start = Instant::now();
        loop {
            tokio::time::sleep(WARMUP_SAMPLE_TICK).await;

            while let Ok(event) = control_rx.try_recv() {
                if let ControlEvent::ForceBackoff {
                    direction: event_direction,
                    factor,
                } = event
                {
                    if event_direction == direction {
                        discovery.force_backoff(factor);
                    }
                }
            }

            let phase = controller.current_phase();
            let series = match direction {
                Direction::Download => monitor.download_series(),
                Direction::Upload => monitor.upload_series(),
            };
            let throughput = series
                .iter()
                .rev()
                .find(|s| s.phase == phase)
                .map(|s| s.smoothed_mbps)
                .unwrap_or(0.0);
            let latency = prober
                .samples_for_phase(phase)
                .last()
                .map(|s| s.rtt_ms)
                .unwrap_or(baseline_latency_ms);

            if let Some(next) = discovery.observe(throughput, latency) {
                match direction {
                    Direction::Download => streams.adjust_download_streams(next.stream_count),
                    Direction::Upload => {
                        streams.adjust_upload_streams(next.stream_count, next.pending_depth, true)
                    }
                }
            }

            if discovery.converged(warmup_start.elapsed())
                || warmup_start.elapsed() >= MAX_WARMUP_DURATION
            {
                break;
            }
        }

        discovery
    }
}

fn sum_bytes(streams: &StreamManager, direction: Direction) -> u64 {
    streams
        .snapshot_bytes(direction)
        .into_iter()
        .map(|(_, b)| b)
        .sum()
}

fn summarize_throughput(
    series: &[ThroughputSample],
    phase: PhaseKind,
    direction: Direction,
    bytes: u64,
    duration: Duration,
) -> ThroughputSummary {
    let points: Vec<(f64, f64)> = series
        .iter()
        .filter(|s| s.phase == phase && s.direction == direction)
        .map(|s| (s.at_elapsed.as_secs_f64(), s.mbps))
        .collect();

    let (mean, median, p25, p75) =
        crate::metrics::compute_throughput_metrics(&points).unwrap_or((0.0, 0.0, 0.0, 0.0));

    ThroughputSummary {
        bytes,
        duration_ms: duration.as_millis() as u64,
        mean_mbps: mean,
        median_mbps: Some(median),
        p25_mbps: Some(p25),
        p75_mbps: Some(p75),
    }
}
