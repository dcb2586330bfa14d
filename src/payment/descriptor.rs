//! Payment Challenge Parsing
//!
//! A 402 response carries a payment descriptor either base64-encoded in
//! the `X-Payment-Required` header or as plain JSON in the response body:
//! `{scheme, networkId, maxAmountRequired, beneficiary, usdcContract,
//! validForSeconds}`.

use alloy::primitives::U256;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde_json::Value;
use tracing::debug;

use crate::types::PaymentDescriptor;

use super::PaymentError;

/// Request header carrying the signed payment on the paid retry.
pub const PAYMENT_HEADER: &str = "X-Payment";

/// Response header carrying the descriptor on a 402 challenge.
pub const PAYMENT_REQUIRED_HEADER: &str = "X-Payment-Required";

/// Response header carrying the settlement outcome on a paid response.
pub const PAYMENT_RESPONSE_HEADER: &str = "X-Payment-Response";

fn descriptor_from_value(value: &Value) -> Option<PaymentDescriptor> {
    // Some payees nest the descriptor under an `accepts` list.
    let obj = value
        .get("accepts")
        .and_then(|a| a.get(0))
        .unwrap_or(value);
    serde_json::from_value(obj.clone()).ok()
}

/// Parse a payment descriptor from a 402 response's header and body.
/// The header value may be base64-encoded JSON or plain JSON; the header
/// is preferred over the body.
pub fn parse_descriptor(header: Option<&str>, body: &str) -> Option<PaymentDescriptor> {
    if let Some(raw) = header {
        let text = match BASE64.decode(raw) {
            Ok(decoded) => String::from_utf8(decoded).ok(),
            Err(_) => Some(raw.to_string()),
        };
        if let Some(text) = text {
            if let Ok(value) = serde_json::from_str::<Value>(&text) {
                if let Some(desc) = descriptor_from_value(&value) {
                    return Some(desc);
                }
            }
        }
    }

    if let Ok(value) = serde_json::from_str::<Value>(body) {
        if let Some(desc) = descriptor_from_value(&value) {
            return Some(desc);
        }
    }

    None
}

/// Validate a descriptor against the configured network and price guards.
///
/// Checks run in order: scheme, network, ceiling, deviation from the
/// historical average (skipped when no history exists yet).
pub fn validate_descriptor(
    desc: &PaymentDescriptor,
    configured_network: &str,
    price_ceiling: f64,
    historical_average: Option<f64>,
    deviation_multiple: f64,
) -> Result<f64, PaymentError> {
    if desc.scheme != "exact" {
        return Err(PaymentError::UnsupportedScheme(desc.scheme.clone()));
    }

    if desc.network_id != configured_network {
        return Err(PaymentError::NetworkMismatch {
            challenge: desc.network_id.clone(),
            configured: configured_network.to_string(),
        });
    }

    let requested = parse_usdc_amount(&desc.max_amount_required)
        .ok_or(PaymentError::MalformedDescriptor)?;
    let requested_usdc = requested.to::<u64>() as f64 / 1_000_000.0;

    if requested_usdc > price_ceiling {
        return Err(PaymentError::PriceCeilingExceeded {
            requested: requested_usdc,
            ceiling: price_ceiling,
        });
    }

    if let Some(average) = historical_average {
        if average > 0.0 && requested_usdc > average * deviation_multiple {
            return Err(PaymentError::PriceDeviation {
                requested: requested_usdc,
                average,
                multiple: deviation_multiple,
            });
        }
    }

    debug!(
        "Descriptor accepted: {} USDC to {} on {}",
        requested_usdc, desc.beneficiary, desc.network_id
    );
    Ok(requested_usdc)
}

/// Parse a USDC amount string into raw units (6 decimals). Accepts
/// human-readable decimals ("1.50", "0.003") or plain integer dollars.
pub fn parse_usdc_amount(amount_str: &str) -> Option<U256> {
    let trimmed = amount_str.trim();

    if trimmed.contains('.') {
        let parts: Vec<&str> = trimmed.split('.').collect();
        if parts.len() != 2 {
            return None;
        }
        let whole: u64 = if parts[0].is_empty() {
            0
        } else {
            parts[0].parse().ok()?
        };
        let frac_str = format!("{:0<6}", parts[1]);
        let frac: u64 = frac_str.get(..6)?.parse().ok()?;
        let units = whole.checked_mul(1_000_000)?.checked_add(frac)?;
        Some(U256::from(units))
    } else {
        let val: u64 = trimmed.parse().ok()?;
        Some(U256::from(val.checked_mul(1_000_000)?))
    }
}
