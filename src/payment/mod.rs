//! Payment Protocol Client
//!
//! Turns an HTTP 402 challenge into a signed, single-use payment
//! authorization and confirms settlement out of band. Economic violations
//! get specific, non-generic handling: rejected outright, retried exactly
//! once with a fresh nonce, or treated as fatal - never silently reduced
//! or silently retried.

pub mod client;
pub mod descriptor;
pub mod settlement;

use thiserror::Error;

pub use client::{PaidCall, PaymentClient, PaymentConfig};
pub use descriptor::parse_descriptor;
pub use settlement::{SettlementConfig, SettlementTracker};

/// The payment protocol error taxonomy. Economic and integrity errors
/// surface to the caller undecorated; the scheduler decides what a
/// failure means for the survival cycle.
#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("could not parse payment descriptor from 402 response")]
    MalformedDescriptor,

    #[error("unsupported payment scheme '{0}' (only 'exact' is supported)")]
    UnsupportedScheme(String),

    #[error("challenge network '{challenge}' does not match configured network '{configured}'")]
    NetworkMismatch { challenge: String, configured: String },

    #[error("requested amount {requested} exceeds price ceiling {ceiling}")]
    PriceCeilingExceeded { requested: f64, ceiling: f64 },

    #[error(
        "requested amount {requested} exceeds {multiple}x the historical average {average} for this target"
    )]
    PriceDeviation {
        requested: f64,
        average: f64,
        multiple: f64,
    },

    #[error("insufficient funds: have {available}, challenge requires {required}")]
    InsufficientFunds { available: f64, required: f64 },

    #[error("payee rejected the authorization as a funds-exceeded double spend")]
    FundsExceeded,

    #[error("payee rejected the authorization as invalid after a fresh-nonce retry")]
    InvalidAfterRetry,

    #[error("failed to sign payment authorization: {0}")]
    Signing(String),

    #[error("wallet collaborator failed: {0}")]
    Wallet(String),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
}
