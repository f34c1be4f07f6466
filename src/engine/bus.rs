//! The engine's single shared event bus.
//!
//! Components never hold references to each other; they hold a `Bus` handle
//! (cheaply cloneable, itself just a `broadcast::Sender`) and either publish
//! on it or subscribe to it. The Phase Controller is the one exception: it
//! calls directly into the Stream Manager for the barrier, because barrier
//! correctness depends on synchronously observing the registry drain before
//! the next phase's start event goes out — round-tripping that through the
//! bus would let a subscriber observe `phase:start` before streams are
//! actually gone.

use crate::model::{Direction, LatencySample, PhaseKind, ThroughputSample};
use std::time::Duration;
use tokio::sync::broadcast;

/// Capacity of the broadcast channel. Control events (phase, lifecycle) are
/// infrequent enough that this never lags in practice; high-frequency sample
/// events are lossy-tolerant by design (see module docs on `EngineEvent`).
const BUS_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleKind {
    Created,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseEdge {
    Start,
    End,
}

/// Every event the engine publishes, tagged per the external interface in
/// the specification. Subscribers match on the variant; no runtime type
/// inspection is needed.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    PhaseChange {
        edge: PhaseEdge,
        phase: PhaseKind,
        elapsed_time: Duration,
    },
    StreamLifecycle {
        kind: LifecycleKind,
        stream_id: u64,
        direction: Direction,
        elapsed_time: Duration,
    },
    StreamReset {
        elapsed_time: Duration,
    },
    Throughput(ThroughputSample),
    Latency(LatencySample),
    Info {
        message: String,
    },
}

/// A control event an external caller (or the Latency Prober) may send to
/// influence the currently running warmup's Parameter Discovery instance.
/// Delivered out-of-band from the broadcast bus via a dedicated mpsc channel,
/// since only one consumer (the Phase Controller, forwarding to whichever
/// discovery instance is active) ever needs to see it.
#[derive(Debug, Clone, Copy)]
pub enum ControlEvent {
    ForceBackoff { direction: Direction, factor: f64 },
    SetMinDuration { direction: Direction, min_duration: Duration },
}

/// Handle to the shared event bus. Cloning is cheap (it's a broadcast sender
/// handle) and every component gets its own clone at construction.
#[derive(Clone)]
pub struct Bus {
    tx: broadcast::Sender<EngineEvent>,
}

impl Bus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, event: EngineEvent) {
        // A send error just means there are currently no subscribers; every
        // publisher treats the bus as fire-and-forget.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

/// Read the next event off a broadcast receiver, transparently skipping past
/// a `Lagged` gap instead of treating it as fatal -- per the bus's
/// lossy-tolerant contract for high-frequency samples.
pub async fn recv_lossy(rx: &mut broadcast::Receiver<EngineEvent>) -> Option<EngineEvent> {
    loop {
        match rx.recv().await {
            Ok(event) => return Some(event),
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}
