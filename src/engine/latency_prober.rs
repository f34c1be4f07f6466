//! Latency Prober: an independent task that pings the origin every 100ms for
//! the entire session, regardless of what phase is running, and raises a
//! forced-backoff signal when probes start timing out back to back.

use crate::engine::bus::{Bus, ControlEvent, EngineEvent};
use crate::engine::origin_client::OriginClient;
use crate::engine::phase_controller::PhaseController;
use crate::model::{Direction, LatencySample, PhaseKind};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::interval;

const CONSECUTIVE_TIMEOUTS_FOR_BACKOFF: u32 = 5;
const CONSECUTIVE_TIMEOUTS_RESET: u32 = 3;

pub struct LatencyProber {
    samples: Mutex<Vec<LatencySample>>,
    consecutive_timeouts: AtomicU32,
    probe_interval: Duration,
    timeout_min: Duration,
    timeout_max: Duration,
}

impl LatencyProber {
    pub fn new(probe_interval_ms: u64, timeout_min_ms: u64, timeout_max_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            samples: Mutex::new(Vec::new()),
            consecutive_timeouts: AtomicU32::new(0),
            probe_interval: Duration::from_millis(probe_interval_ms),
            timeout_min: Duration::from_millis(timeout_min_ms),
            timeout_max: Duration::from_millis(timeout_max_ms),
        })
    }

    pub fn samples(&self) -> Vec<LatencySample> {
        self.samples.lock().expect("poisoned").clone()
    }

    pub fn samples_for_phase(&self, phase: PhaseKind) -> Vec<LatencySample> {
        self.samples
            .lock()
            .expect("poisoned")
            .iter()
            .filter(|s| s.phase == phase)
            .copied()
            .collect()
    }

    /// Spawn the probing task. `control_tx` carries forced-backoff signals
    /// out to whichever Parameter Discovery instance is currently active;
    /// the Phase Controller is the one routing them since it alone knows
    /// which warmup (if any) is running.
    pub fn spawn(
        self: &Arc<Self>,
        bus: Bus,
        client: OriginClient,
        controller: Arc<PhaseController>,
        control_tx: mpsc::UnboundedSender<ControlEvent>,
    ) -> tokio::task::JoinHandle<()> {
        let prober = self.clone();
        let probe_interval = self.probe_interval;
        tokio::spawn(async move {
            let mut ticker = interval(probe_interval);
            loop {
                ticker.tick().await;
                prober
                    .probe_once(&bus, &client, &controller, &control_tx)
                    .await;
            }
        })
    }

    async fn probe_once(
        &self,
        bus: &Bus,
        client: &OriginClient,
        controller: &PhaseController,
        control_tx: &mpsc::UnboundedSender<ControlEvent>,
    ) {
        let consecutive = self.consecutive_timeouts.load(Ordering::Relaxed);
        let timeout =
            (self.timeout_min + Duration::from_millis(100) * consecutive).min(self.timeout_max);
        let phase = controller.current_phase();
        let send_elapsed = controller.total_elapsed();

        let sample = match client.ping("latency-probe", timeout).await {
            Ok(rtt_ms) => {
                self.consecutive_timeouts.store(0, Ordering::Relaxed);
                LatencySample {
                    send_elapsed,
                    rtt_ms,
                    is_timeout: false,
                    phase,
                    consecutive_timeouts: 0,
                }
            }
            Err(_) => {
                let next = consecutive + 1;
                self.consecutive_timeouts.store(next, Ordering::Relaxed);
                let synthetic_ms = (1000.0 + next as f64 * 25.0).min(2000.0);

                if phase.is_warmup() && next >= CONSECUTIVE_TIMEOUTS_FOR_BACKOFF {
                    let direction = match phase {
                        PhaseKind::DownloadWarmup => Some(Direction::Download),
                        PhaseKind::UploadWarmup => Some(Direction::Upload),
                        _ => None,
                    };
                    if let Some(direction) = direction {
                        let factor = match direction {
                            Direction::Upload => 0.9,
                            Direction::Download => 0.5,
                        };
                        let _ = control_tx.send(ControlEvent::ForceBackoff { direction, factor });
                        self.consecutive_timeouts
                            .store(CONSECUTIVE_TIMEOUTS_RESET, Ordering::Relaxed);
                    }
                }

                LatencySample {
                    send_elapsed,
                    rtt_ms: synthetic_ms,
                    is_timeout: true,
                    phase,
                    consecutive_timeouts: next,
                }
            }
        };

        self.samples.lock().expect("poisoned").push(sample);
        bus.publish(EngineEvent::Latency(sample));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adaptive_timeout_climbs_then_clamps() {
        let min = Duration::from_millis(1000);
        let max = Duration::from_millis(2000);
        let t = |c: u32| (min + Duration::from_millis(100) * c).min(max);
        assert_eq!(t(0), Duration::from_millis(1000));
        assert_eq!(t(5), Duration::from_millis(1500));
        assert_eq!(t(20), Duration::from_millis(2000));
    }

    #[test]
    fn synthetic_timeout_duration_matches_formula() {
        let synth = |c: f64| (1000.0 + c * 25.0_f64).min(2000.0);
        assert_eq!(synth(0.0), 1000.0);
        assert_eq!(synth(5.0), 1125.0);
        assert_eq!(synth(100.0), 2000.0);
    }
}
