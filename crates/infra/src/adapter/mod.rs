//! Domain adapters shipped with Minstrel

pub mod simulated;

pub use simulated::{DomainEvents, SimulatedDomainAdapter, SimulatedTiming};
