//! Throughput Monitor: samples the Stream Manager's byte counters every
//! 200ms, turns the delta into an instantaneous Mbps figure, smooths it with
//! an EWMA, and flags samples taken while traffic the current phase doesn't
//! expect is still draining.

use crate::engine::bus::{Bus, EngineEvent};
use crate::engine::phase_controller::PhaseController;
use crate::engine::stream_manager::StreamManager;
use crate::model::{Direction, ThroughputSample};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::interval;

const SAMPLE_INTERVAL: Duration = Duration::from_millis(200);
const EWMA_ALPHA: f64 = 0.3;

struct DirectionState {
    last_total_bytes: u64,
    smoothed_mbps: f64,
    series: Vec<ThroughputSample>,
}

impl Default for DirectionState {
    fn default() -> Self {
        Self {
            last_total_bytes: 0,
            smoothed_mbps: 0.0,
            series: Vec::new(),
        }
    }
}

pub struct ThroughputMonitor {
    download: Mutex<DirectionState>,
    upload: Mutex<DirectionState>,
}

impl ThroughputMonitor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            download: Mutex::new(DirectionState::default()),
            upload: Mutex::new(DirectionState::default()),
        })
    }

    pub fn download_series(&self) -> Vec<ThroughputSample> {
        self.download.lock().expect("poisoned").series.clone()
    }

    pub fn upload_series(&self) -> Vec<ThroughputSample> {
        self.upload.lock().expect("poisoned").series.clone()
    }

    /// Spawn the sampling task. It runs for the lifetime of the session;
    /// callers hold the returned handle only to abort it at shutdown.
    pub fn spawn(
        self: &Arc<Self>,
        bus: Bus,
        streams: Arc<StreamManager>,
        controller: Arc<PhaseController>,
    ) -> tokio::task::JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(SAMPLE_INTERVAL);
            loop {
                ticker.tick().await;
                monitor.tick(&bus, &streams, &controller, Direction::Download);
                monitor.tick(&bus, &streams, &controller, Direction::Upload);
            }
        })
    }

    fn tick(
        &self,
        bus: &Bus,
        streams: &StreamManager,
        controller: &PhaseController,
        direction: Direction,
    ) {
        let total_bytes: u64 = streams
            .snapshot_bytes(direction)
            .into_iter()
            .map(|(_, b)| b)
            .sum();

        let phase = controller.current_phase();
        let at_elapsed = controller.total_elapsed();

        let state_lock = match direction {
            Direction::Download => &self.download,
            Direction::Upload => &self.upload,
        };
        let mut state = state_lock.lock().expect("poisoned");

        let delta = total_bytes.saturating_sub(state.last_total_bytes);
        state.last_total_bytes = total_bytes;

        let mbps = (delta as f64 * 8.0) / (SAMPLE_INTERVAL.as_secs_f64() * 1_000_000.0);
        state.smoothed_mbps = if state.series.is_empty() {
            mbps
        } else {
            EWMA_ALPHA * mbps + (1.0 - EWMA_ALPHA) * state.smoothed_mbps
        };

        let sample = ThroughputSample {
            at_elapsed,
            direction,
            mbps,
            smoothed_mbps: state.smoothed_mbps,
            phase,
            is_out_of_phase: delta > 0 && !phase.expects(direction),
        };
        state.series.push(sample);
        drop(state);

        bus.publish(EngineEvent::Throughput(sample));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ewma_smooths_toward_latest_sample() {
        let monitor = ThroughputMonitor::new();
        {
            let mut state = monitor.download.lock().unwrap();
            state.series.push(ThroughputSample {
                at_elapsed: Duration::ZERO,
                direction: Direction::Download,
                mbps: 100.0,
                smoothed_mbps: 100.0,
                phase: crate::model::PhaseKind::Download,
                is_out_of_phase: false,
            });
            state.smoothed_mbps = 100.0;
        }
        let next = EWMA_ALPHA * 0.0 + (1.0 - EWMA_ALPHA) * 100.0;
        assert!((next - 70.0).abs() < 1e-9);
    }
}
