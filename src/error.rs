use thiserror::Error;

use crate::motor::SlotState;

/// Convenience alias used across the engine.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors surfaced by the engine core.
///
/// Configuration errors are raised synchronously by the call that applied the
/// offending configuration. Dispatch races (CAS retries on the cycle cursor or
/// the rate timeline) are handled internally and never appear here.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("rate must be greater than 0.0 and at most 1e9 ops/s, got {0}")]
    InvalidRate(f64),

    #[error("start cycle {start} must be less than or equal to end cycle {end}")]
    InvalidCycleRange { start: u64, end: u64 },

    #[error("stride {stride} must be at least 1 and divide the cycle count {cycles}")]
    InvalidStride { stride: u64, cycles: u64 },

    #[error("invalid value {value:?} for parameter {name}: {reason}")]
    InvalidParameter {
        name: String,
        value: String,
        reason: String,
    },

    #[error("invalid slot state transition from {from:?} to {to:?}")]
    InvalidTransition { from: SlotState, to: SlotState },

    #[error("motor {slot} did not reach Started within the startup timeout (still {state:?})")]
    StartupTimeout { slot: usize, state: SlotState },

    #[error("activity did not complete within the allotted time")]
    CompletionTimeout,

    #[error("failed to spawn thread for motor {slot}")]
    Spawn {
        slot: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("action init failed in motor {slot}")]
    ActionInit {
        slot: usize,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("action failed in motor {slot} on cycle {cycle}")]
    Action {
        slot: usize,
        cycle: u64,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("motor {slot} thread panicked")]
    MotorPanicked { slot: usize },
}
