//! Survival Runtime
//!
//! The cycle-driven core of the agent: classify balances into a mode,
//! act within the mode's means, breed when thriving, inscribe history on
//! schedule, and die when both resources are exhausted.

pub mod breeding;
pub mod death;
pub mod inscription;
pub mod modes;
pub mod scheduler;

pub use breeding::{is_eligible, survival_days, BreedingEngine};
pub use inscription::{flush_history, InscriptionScheduler};
pub use modes::{classify, is_death};
pub use scheduler::{CycleReport, SchedulerConfig, SchedulerDeps, SurvivalScheduler};
