//! Persistent State
//!
//! SQLite-backed storage for the agent's append-only history log, mode
//! transitions, pending settlement evidence, price history, and the
//! terminal death record.

pub mod database;

pub use database::StateStore;
