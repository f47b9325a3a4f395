//! Lossy-link simulation for the reliable messaging engine.

pub mod link;
pub mod scenarios;

pub use link::{LinkSimulation, SimError, SimReport};
pub use scenarios::{practical_baseline, LossScenario, HOSTILE, LOSSLESS, PRACTICAL_BASELINE};
