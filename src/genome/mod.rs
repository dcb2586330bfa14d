//! Genetic Blending & Identity Engine
//!
//! Derives a deterministic, tamper-evident identity for any agent state
//! and produces a child record from two parents. Performs no I/O of its
//! own; ancestry lookups go through an injected registry collaborator and
//! randomness through an injected `rand::Rng`.

pub mod ancestry;
pub mod blend;
pub mod identity;

pub use ancestry::are_related;
pub use blend::{blend, contribution_weights, BlendConfig, BlendError, BlendOutcome};
pub use identity::{compute_identity, record_leaves, reincarnate, verify_identity};
