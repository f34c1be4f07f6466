//! The small set of engine errors a caller might want to match on
//! programmatically, as opposed to the `anyhow::Result` used for everything
//! that's only ever reported, never branched on.

use crate::model::PhaseKind;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// `start_phase` was asked to move to a phase other than the current
    /// phase's fixed successor.
    InvalidTransition {
        from: PhaseKind,
        to: PhaseKind,
        expected: Option<PhaseKind>,
    },
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::InvalidTransition {
                from,
                to,
                expected: Some(expected),
            } => write!(
                f,
                "invalid phase transition: {from:?} -> {to:?} (expected {expected:?})"
            ),
            EngineError::InvalidTransition {
                from,
                to,
                expected: None,
            } => write!(f, "invalid phase transition: {from:?} has no successor, got {to:?}"),
        }
    }
}

impl std::error::Error for EngineError {}
