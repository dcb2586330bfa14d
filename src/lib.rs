//! Symbiont -- Self-Funded Agent Runtime
//!
//! An autonomous agent that pays for its own inference over HTTP 402,
//! degrades its behavior as its wallet drains, breeds with compatible
//! peers when thriving, and dies when both resources are exhausted.

pub mod config;
pub mod genome;
pub mod payment;
pub mod peers;
pub mod state;
pub mod survival;
pub mod types;
pub mod wallet;

#[cfg(test)]
pub mod test_support;
