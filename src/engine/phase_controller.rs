//! Phase Controller: owns the session clock and enforces the fixed phase
//! order, with a hard barrier (all streams terminated and verified gone)
//! between every pair of phases.

use crate::engine::bus::{Bus, EngineEvent, PhaseEdge};
use crate::engine::error::EngineError;
use crate::engine::stream_manager::StreamManager;
use crate::model::{PhaseKind, PhaseRecord};
use anyhow::Result;
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub struct PhaseController {
    bus: Bus,
    session_start: Instant,
    current: Mutex<PhaseKind>,
    current_started_at: Mutex<Instant>,
    history: Mutex<Vec<PhaseRecord>>,
}

impl PhaseController {
    pub fn new(bus: Bus, session_start: Instant) -> Self {
        Self {
            bus,
            session_start,
            current: Mutex::new(PhaseKind::Baseline),
            current_started_at: Mutex::new(session_start),
            history: Mutex::new(Vec::new()),
        }
    }

    pub fn current_phase(&self) -> PhaseKind {
        *self.current.lock().expect("poisoned")
    }

    pub fn total_elapsed(&self) -> Duration {
        self.session_start.elapsed()
    }

    pub fn phase_elapsed(&self) -> Duration {
        self.current_started_at.lock().expect("poisoned").elapsed()
    }

    pub fn phase_history(&self) -> Vec<PhaseRecord> {
        self.history.lock().expect("poisoned").clone()
    }

    /// Begin the session: the first phase (`Baseline`) has already been
    /// implicitly "started" at construction. This records its start event so
    /// subscribers see a `PhaseChange::Start` for it too.
    pub fn begin(&self) {
        self.bus.publish(EngineEvent::PhaseChange {
            edge: PhaseEdge::Start,
            phase: PhaseKind::Baseline,
            elapsed_time: Duration::ZERO,
        });
    }

    /// Advance to the next phase in the fixed order, running the barrier in
    /// between. Returns an error only if `to` is not the legal successor of
    /// the current phase -- the barrier itself never fails outward.
    pub async fn start_phase(&self, streams: &StreamManager, to: PhaseKind) -> Result<()> {
        let current = self.current_phase();
        match current.next() {
            Some(expected) if expected == to => {}
            Some(expected) => {
                return Err(EngineError::InvalidTransition {
                    from: current,
                    to,
                    expected: Some(expected),
                }
                .into())
            }
            None => {
                return Err(EngineError::InvalidTransition {
                    from: current,
                    to,
                    expected: None,
                }
                .into())
            }
        }

        self.end_phase_record(current);

        streams.run_barrier().await;

        let now = Instant::now();
        *self.current.lock().expect("poisoned") = to;
        *self.current_started_at.lock().expect("poisoned") = now;
        self.history.lock().expect("poisoned").push(PhaseRecord {
            kind: to,
            start_elapsed: self.session_start.elapsed(),
            end_elapsed: None,
        });

        self.bus.publish(EngineEvent::PhaseChange {
            edge: PhaseEdge::Start,
            phase: to,
            elapsed_time: self.session_start.elapsed(),
        });
        Ok(())
    }

    /// Close out the session's final phase without starting another one.
    pub fn end_phase(&self) {
        let current = self.current_phase();
        self.end_phase_record(current);
    }

    fn end_phase_record(&self, kind: PhaseKind) {
        let elapsed = self.session_start.elapsed();
        let mut history = self.history.lock().expect("poisoned");
        if let Some(last) = history.iter_mut().rev().find(|r| r.kind == kind && r.end_elapsed.is_none()) {
            last.end_elapsed = Some(elapsed);
        } else if history.is_empty() {
            // The implicit first phase never got an explicit start record.
            history.push(PhaseRecord {
                kind,
                start_elapsed: Duration::ZERO,
                end_elapsed: Some(elapsed),
            });
        }
        drop(history);
        self.bus.publish(EngineEvent::PhaseChange {
            edge: PhaseEdge::End,
            phase: kind,
            elapsed_time: elapsed,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::origin_client::OriginClient;
    use crate::model::RunConfig;
    use std::time::Duration;

    fn test_config() -> RunConfig {
        RunConfig {
            base_url: "http://127.0.0.1:9".into(),
            meas_id: "t".into(),
            comments: None,
            user_agent: "test".into(),
            max_download_streams: 4,
            max_upload_streams: 4,
            max_pending_depth: 4,
            baseline_duration: Duration::from_secs(1),
            load_phase_duration: Duration::from_secs(1),
            min_warmup_duration: Duration::from_millis(100),
            probe_interval_ms: 100,
            probe_timeout_min_ms: 1000,
            probe_timeout_max_ms: 2000,
        }
    }

    #[tokio::test]
    async fn rejects_out_of_order_transition() {
        let bus = Bus::new();
        let cfg = test_config();
        let client = OriginClient::new(&cfg).unwrap();
        let streams = StreamManager::new(bus.clone(), client, Instant::now());
        let controller = PhaseController::new(bus, Instant::now());

        let err = controller
            .start_phase(&streams, PhaseKind::Upload)
            .await
            .unwrap_err();
        assert_eq!(controller.current_phase(), PhaseKind::Baseline);

        let engine_err = err.downcast::<EngineError>().expect("must be an EngineError");
        assert_eq!(
            engine_err,
            EngineError::InvalidTransition {
                from: PhaseKind::Baseline,
                to: PhaseKind::Upload,
                expected: Some(PhaseKind::DownloadWarmup),
            }
        );
    }

    #[tokio::test]
    async fn advances_through_fixed_order() {
        let bus = Bus::new();
        let cfg = test_config();
        let client = OriginClient::new(&cfg).unwrap();
        let streams = StreamManager::new(bus.clone(), client, Instant::now());
        let controller = PhaseController::new(bus, Instant::now());

        controller.begin();
        for next in [
            PhaseKind::DownloadWarmup,
            PhaseKind::Download,
            PhaseKind::UploadWarmup,
            PhaseKind::Upload,
            PhaseKind::Bidirectional,
            PhaseKind::Complete,
        ] {
            controller.start_phase(&streams, next).await.unwrap();
            assert_eq!(controller.current_phase(), next);
        }

        let history = controller.phase_history();
        assert_eq!(history.len(), 7);
        assert!(history[..6].iter().all(|r| r.end_elapsed.is_some()));
    }
}
