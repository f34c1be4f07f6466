//! Parameter Discovery: the adaptive control loop that searches for the
//! stream-count / pending-depth combination that maximizes throughput
//! without driving latency past a direction-specific threshold.
//!
//! One instance runs per warmup phase (download, upload). It owns no
//! streams directly -- it drives a `StreamManager` towards a target
//! `ParameterSet` and watches throughput/latency samples to decide the next
//! move.

use crate::model::{Direction, ParameterSet, ParameterTrial};
use std::time::{Duration, Instant};

/// Tunable thresholds, exposed so the ambient CLI shell can override them
/// for diagnostic runs without touching the control loop itself.
#[derive(Debug, Clone, Copy)]
pub struct DiscoveryConfig {
    pub min_stream_count: usize,
    pub max_stream_count: usize,
    pub min_pending_depth: usize,
    pub max_pending_depth: usize,
    pub soft_min_threshold_ms: f64,
    pub soft_threshold_gain: f64,
    pub hard_min_threshold_ms: f64,
    pub hard_max_threshold_ms: f64,
    pub hard_threshold_gain: f64,
    pub stabilization_delay: Duration,
    pub min_warmup_duration: Duration,
    /// Weight applied to throughput in the trial scoring function.
    pub update_throughput_gain: f64,
    /// Weight applied to the latency-headroom term in the trial scoring
    /// function. `update_throughput_gain + update_score_ratio` is expected
    /// to sum to 1.0 but this isn't enforced.
    pub update_score_ratio: f64,
}

impl DiscoveryConfig {
    /// `max_stream_count` and `max_pending_depth` come from the CLI-level
    /// `RunConfig` ceilings (`--max-download-streams`/`--max-upload-streams`/
    /// `--max-pending-depth`); download's pending depth is additionally
    /// pinned to the specification's 1-3 range regardless of the configured
    /// ceiling, since that knob is meant for upload's wider 1-16 range.
    pub fn for_direction(
        direction: Direction,
        min_warmup_duration: Duration,
        max_stream_count: usize,
        max_pending_depth: usize,
    ) -> Self {
        match direction {
            Direction::Download => Self {
                min_stream_count: 1,
                max_stream_count: max_stream_count.max(1),
                min_pending_depth: 1,
                max_pending_depth: max_pending_depth.clamp(1, 3),
                soft_min_threshold_ms: 75.0,
                soft_threshold_gain: 1.75,
                hard_min_threshold_ms: 150.0,
                hard_max_threshold_ms: 250.0,
                hard_threshold_gain: 2.5,
                stabilization_delay: Duration::from_millis(300),
                min_warmup_duration,
                update_throughput_gain: 0.5,
                update_score_ratio: 0.5,
            },
            Direction::Upload => Self {
                min_stream_count: 1,
                max_stream_count: max_stream_count.max(1),
                min_pending_depth: 1,
                max_pending_depth: max_pending_depth.max(1),
                soft_min_threshold_ms: 100.0,
                soft_threshold_gain: 2.0,
                hard_min_threshold_ms: 200.0,
                hard_max_threshold_ms: 400.0,
                hard_threshold_gain: 3.0,
                stabilization_delay: Duration::from_millis(300),
                min_warmup_duration,
                update_throughput_gain: 0.7,
                update_score_ratio: 0.3,
            },
        }
    }

    pub fn soft_threshold(&self, baseline_latency_ms: f64) -> f64 {
        (self.soft_min_threshold_ms).max(baseline_latency_ms * self.soft_threshold_gain)
    }

    pub fn hard_threshold(&self, baseline_latency_ms: f64) -> f64 {
        (baseline_latency_ms * self.hard_threshold_gain)
            .clamp(self.hard_min_threshold_ms, self.hard_max_threshold_ms)
    }
}

const CONSECUTIVE_STABLE_UPLOAD: u32 = 2;
const CONSECUTIVE_STABLE_DOWNLOAD: u32 = 3;
const RERAMP_DELAY: Duration = Duration::from_secs(3);
const CONSECUTIVE_HIGH_LATENCY_RESET: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopState {
    Ramping,
    Backoff,
    Stable,
}

pub struct ParameterDiscovery {
    direction: Direction,
    cfg: DiscoveryConfig,
    baseline_latency_ms: f64,
    current: ParameterSet,
    state: LoopState,
    consecutive_high_latency: u32,
    consecutive_stable: u32,
    last_move_at: Instant,
    forced_backoff_factor: Option<f64>,
    reramp_deadline: Option<Instant>,
    trials: Vec<ParameterTrial>,
    session_start: Instant,
}

impl ParameterDiscovery {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        direction: Direction,
        baseline_latency_ms: f64,
        min_warmup_duration: Duration,
        session_start: Instant,
        max_stream_count: usize,
        max_pending_depth: usize,
    ) -> Self {
        let cfg = DiscoveryConfig::for_direction(
            direction,
            min_warmup_duration,
            max_stream_count,
            max_pending_depth,
        );
        Self {
            direction,
            current: ParameterSet::new(1, 1),
            cfg,
            baseline_latency_ms,
            state: LoopState::Ramping,
            consecutive_high_latency: 0,
            consecutive_stable: 0,
            last_move_at: Instant::now(),
            forced_backoff_factor: None,
            reramp_deadline: None,
            trials: Vec::new(),
            session_start,
        }
    }

    pub fn current_params(&self) -> ParameterSet {
        self.current
    }

    pub fn trials(&self) -> &[ParameterTrial] {
        &self.trials
    }

    fn required_stable_rounds(&self) -> u32 {
        match self.direction {
            Direction::Upload => CONSECUTIVE_STABLE_UPLOAD,
            Direction::Download => CONSECUTIVE_STABLE_DOWNLOAD,
        }
    }

    fn score(&self, throughput_mbps: f64, latency_ms: f64) -> f64 {
        let soft = self.cfg.soft_threshold(self.baseline_latency_ms);
        let headroom = (1.0 - latency_ms / soft).max(0.0);
        self.cfg.update_throughput_gain * throughput_mbps
            + self.cfg.update_score_ratio * headroom * throughput_mbps
    }

    /// The Latency Prober signals a forced backoff. The most recent such
    /// signal wins: if a re-ramp timer was already pending it is replaced,
    /// not stacked.
    pub fn force_backoff(&mut self, factor: f64) {
        self.forced_backoff_factor = Some(factor);
        self.reramp_deadline = Some(Instant::now() + RERAMP_DELAY);
    }

    /// Feed one (throughput, latency) observation taken after `current` has
    /// had at least `stabilization_delay` to settle, and decide the next
    /// move. Returns `Some(next)` when the target parameters change.
    pub fn observe(&mut self, throughput_mbps: f64, latency_ms: f64) -> Option<ParameterSet> {
        if self.last_move_at.elapsed() < self.cfg.stabilization_delay {
            return None;
        }

        if let Some(factor) = self.forced_backoff_factor.take() {
            let next = ParameterSet::new(
                (self.current.stream_count as f64 * factor).ceil().max(1.0) as usize,
                self.current.pending_depth,
            );
            self.record_trial(throughput_mbps, latency_ms);
            self.state = LoopState::Backoff;
            self.consecutive_high_latency = CONSECUTIVE_HIGH_LATENCY_RESET;
            self.consecutive_stable = 0;
            return self.move_to(next);
        }

        if let Some(deadline) = self.reramp_deadline {
            if Instant::now() >= deadline {
                self.reramp_deadline = None;
                self.state = LoopState::Ramping;
            }
        }

        let hard = self.cfg.hard_threshold(self.baseline_latency_ms);
        let soft = self.cfg.soft_threshold(self.baseline_latency_ms);

        self.record_trial(throughput_mbps, latency_ms);

        if latency_ms > hard {
            self.consecutive_high_latency += 1;
            self.consecutive_stable = 0;
            self.state = LoopState::Backoff;
            let next = self.back_off_one_step();
            return self.move_to(next);
        }

        if latency_ms > soft {
            self.consecutive_high_latency += 1;
            self.consecutive_stable = 0;
            if self.consecutive_high_latency >= 2 {
                self.state = LoopState::Backoff;
                let next = self.back_off_one_step();
                return self.move_to(next);
            }
            return None;
        }

        self.consecutive_high_latency = 0;
        self.consecutive_stable += 1;

        if self.consecutive_stable >= self.required_stable_rounds() {
            self.state = LoopState::Stable;
            return None;
        }

        self.state = LoopState::Ramping;
        let next = self.ramp_up_one_step();
        self.move_to(next)
    }

    fn back_off_one_step(&self) -> ParameterSet {
        let streams = (self.current.stream_count.max(2) - 1).max(self.cfg.min_stream_count);
        ParameterSet::new(streams, self.current.pending_depth)
    }

    fn ramp_up_one_step(&self) -> ParameterSet {
        if self.direction == Direction::Upload
            && self.current.stream_count >= self.cfg.max_stream_count
            && self.current.pending_depth < self.cfg.max_pending_depth
        {
            return ParameterSet::new(self.current.stream_count, self.current.pending_depth + 1);
        }
        let streams = (self.current.stream_count + 1).min(self.cfg.max_stream_count);
        ParameterSet::new(streams, self.current.pending_depth)
    }

    fn move_to(&mut self, next: ParameterSet) -> Option<ParameterSet> {
        let clamped = ParameterSet::new(
            next.stream_count
                .clamp(self.cfg.min_stream_count, self.cfg.max_stream_count),
            next.pending_depth
                .clamp(self.cfg.min_pending_depth, self.cfg.max_pending_depth),
        );
        if clamped == self.current {
            return None;
        }
        self.current = clamped;
        self.last_move_at = Instant::now();
        Some(clamped)
    }

    /// Append one observation to the trial history. `is_optimal_outcome` and
    /// `caused_optimal_outcome` are left false here -- they're only ever
    /// meaningful relative to the *whole* trial set, and are assigned once,
    /// at `resolve`, by rescoring everything recorded.
    fn record_trial(&mut self, throughput_mbps: f64, latency_ms: f64) {
        self.trials.push(ParameterTrial {
            params: self.current,
            throughput_mbps,
            latency_ms,
            at_elapsed: self.session_start.elapsed(),
            is_optimal_outcome: false,
            caused_optimal_outcome: false,
        });
    }

    /// The converged answer: `stable` for at least `min_warmup_duration`
    /// without moving, else the highest-scoring trial observed so far, else
    /// the direction's documented fallback.
    pub fn converged(&self, _phase_elapsed: Duration) -> bool {
        self.state == LoopState::Stable && self.last_move_at.elapsed() >= self.cfg.min_warmup_duration
    }

    /// The end-of-phase look-back: rescore every recorded trial, find the
    /// highest-scoring one, and return the parameters of the trial
    /// immediately preceding it -- the "causal" parameters whose application
    /// produced the best outcome. Tags exactly that trial
    /// `is_optimal_outcome` and its predecessor (if any) `caused_optimal_outcome`.
    /// Falls back to the direction's documented defaults if no trial was
    /// ever recorded.
    pub fn resolve(&mut self) -> ParameterSet {
        for t in self.trials.iter_mut() {
            t.is_optimal_outcome = false;
            t.caused_optimal_outcome = false;
        }

        if self.trials.is_empty() {
            return match self.direction {
                Direction::Download => ParameterSet::new(3, 1),
                Direction::Upload => ParameterSet::new(2, 2),
            };
        }

        let best_idx = (0..self.trials.len())
            .max_by(|&a, &b| {
                let sa = self.score(self.trials[a].throughput_mbps, self.trials[a].latency_ms);
                let sb = self.score(self.trials[b].throughput_mbps, self.trials[b].latency_ms);
                sa.partial_cmp(&sb).unwrap_or(std::cmp::Ordering::Equal)
            })
            .expect("trials is non-empty");

        self.trials[best_idx].is_optimal_outcome = true;

        if best_idx == 0 {
            return self.trials[0].params;
        }

        self.trials[best_idx - 1].caused_optimal_outcome = true;
        self.trials[best_idx - 1].params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_discovery(direction: Direction, baseline_latency_ms: f64) -> ParameterDiscovery {
        ParameterDiscovery::new(
            direction,
            baseline_latency_ms,
            Duration::from_secs(1),
            Instant::now(),
            24,
            16,
        )
    }

    #[test]
    fn boundary_soft_and_hard_thresholds_for_download_baseline_20ms() {
        let cfg = DiscoveryConfig::for_direction(Direction::Download, Duration::from_secs(1), 24, 3);
        assert_eq!(cfg.soft_threshold(20.0), 75.0);
        assert_eq!(cfg.hard_threshold(20.0), 150.0);
    }

    #[test]
    fn cli_bounds_are_threaded_through_and_download_pending_depth_stays_pinned() {
        let cfg = DiscoveryConfig::for_direction(Direction::Download, Duration::from_secs(1), 10, 16);
        assert_eq!(cfg.max_stream_count, 10);
        assert_eq!(cfg.max_pending_depth, 3);

        let cfg = DiscoveryConfig::for_direction(Direction::Upload, Duration::from_secs(1), 8, 5);
        assert_eq!(cfg.max_stream_count, 8);
        assert_eq!(cfg.max_pending_depth, 5);
    }

    #[test]
    fn starts_at_one_and_one() {
        let discovery = new_discovery(Direction::Download, 20.0);
        assert_eq!(discovery.current_params(), ParameterSet::new(1, 1));
    }

    #[test]
    fn forced_backoff_reduces_streams_and_resets_counter_to_two() {
        let mut discovery = new_discovery(Direction::Download, 20.0);
        discovery.current = ParameterSet::new(8, 1);
        discovery.last_move_at = Instant::now() - Duration::from_secs(1);
        discovery.force_backoff(0.5);
        let next = discovery.observe(50.0, 50.0).expect("must move");
        assert_eq!(next.stream_count, 4);
        assert_eq!(discovery.consecutive_high_latency, CONSECUTIVE_HIGH_LATENCY_RESET);
    }

    #[test]
    fn ramps_up_while_latency_stays_below_soft_threshold() {
        let mut discovery = new_discovery(Direction::Download, 20.0);
        discovery.last_move_at = Instant::now() - Duration::from_secs(1);
        let next = discovery.observe(50.0, 30.0).expect("should ramp");
        assert_eq!(next, ParameterSet::new(2, 1));
    }

    #[test]
    fn backs_off_when_latency_exceeds_hard_threshold() {
        let mut discovery = new_discovery(Direction::Download, 20.0);
        discovery.current = ParameterSet::new(5, 1);
        discovery.last_move_at = Instant::now() - Duration::from_secs(1);
        let next = discovery.observe(50.0, 200.0).expect("should back off");
        assert_eq!(next.stream_count, 4);
    }

    /// Spec §8 end-to-end scenario 5: trials `(1,1)->50/25ms,
    /// (2,1)->95/30ms, (3,1)->180/35ms, (4,1)->190/120ms` with a soft
    /// threshold of 100ms score highest at trial 3, so the look-back
    /// returns trial 2's parameters -- the ones that *produced* trial 3's
    /// throughput, not trial 3's own (which already drove latency over the
    /// threshold).
    #[test]
    fn look_back_selection_matches_worked_example() {
        let mut discovery = new_discovery(Direction::Download, 57.142857142857146);
        assert_eq!(discovery.cfg.soft_threshold(discovery.baseline_latency_ms), 100.0);

        for (streams, throughput, latency) in
            [(1, 50.0, 25.0), (2, 95.0, 30.0), (3, 180.0, 35.0), (4, 190.0, 120.0)]
        {
            discovery.current = ParameterSet::new(streams, 1);
            discovery.record_trial(throughput, latency);
        }

        let resolved = discovery.resolve();
        assert_eq!(resolved, ParameterSet::new(2, 1));

        let trials = discovery.trials();
        assert_eq!(trials.iter().filter(|t| t.is_optimal_outcome).count(), 1);
        assert_eq!(trials.iter().filter(|t| t.caused_optimal_outcome).count(), 1);
        assert!(trials[2].is_optimal_outcome);
        assert!(trials[1].caused_optimal_outcome);
    }

    #[test]
    fn resolve_returns_own_params_when_first_trial_is_best() {
        let mut discovery = new_discovery(Direction::Download, 20.0);
        discovery.current = ParameterSet::new(1, 1);
        discovery.record_trial(100.0, 10.0);
        discovery.current = ParameterSet::new(2, 1);
        discovery.record_trial(10.0, 200.0);

        let resolved = discovery.resolve();
        assert_eq!(resolved, ParameterSet::new(1, 1));
        assert!(discovery.trials()[0].is_optimal_outcome);
        assert!(!discovery.trials().iter().any(|t| t.caused_optimal_outcome));
    }

    #[test]
    fn resolve_falls_back_to_documented_defaults_with_no_trials() {
        let mut download = new_discovery(Direction::Download, 20.0);
        assert_eq!(download.resolve(), ParameterSet::new(3, 1));

        let mut upload = new_discovery(Direction::Upload, 20.0);
        assert_eq!(upload.resolve(), ParameterSet::new(2, 2));
    }

    #[test]
    fn resolve_is_idempotent_across_repeated_calls() {
        let mut discovery = new_discovery(Direction::Download, 20.0);
        for (streams, throughput, latency) in [(1, 50.0, 25.0), (2, 95.0, 30.0), (3, 60.0, 40.0)] {
            discovery.current = ParameterSet::new(streams, 1);
            discovery.record_trial(throughput, latency);
        }

        let first = discovery.resolve();
        let second = discovery.resolve();
        assert_eq!(first, second);
        assert_eq!(
            discovery.trials().iter().filter(|t| t.is_optimal_outcome).count(),
            1
        );
    }
}
