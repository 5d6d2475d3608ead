//! # Coordination Signals
//!
//! The pheromone layer: decaying signals written by the scheduler and
//! recovery engine and read back as guidance for future spawns.

pub mod analysis;
pub mod coordinator;

pub use analysis::{PatternCorrelation, RoleTrend, Trend};
pub use coordinator::{
    ContextualSignals, DecayReport, Pheromone, SignalCoordinator, SignalKind, SignalPattern,
    SignalQuery, MIN_STRENGTH,
};
