//! Paid Request Flow
//!
//! Makes a priced HTTP call succeed by paying for it exactly once:
//! `Unpaid -> ChallengeReceived -> Signed -> Submitted -> {Confirmed |
//! Failed}`. The wallet collaborator signs authorizations; the private
//! key never enters this module. Replay safety comes from the single-use
//! nonce inside the authorization, not from client-side memoization.

use std::sync::{Arc, Mutex};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::Utc;
use reqwest::Client;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::state::StateStore;
use crate::types::{
    AuthorizationRequest, Payment, PaymentDescriptor, SettlementEvidence, SettlementOutcome,
    WalletClient,
};

use super::descriptor::{
    parse_descriptor, parse_usdc_amount, validate_descriptor, PAYMENT_HEADER,
    PAYMENT_REQUIRED_HEADER, PAYMENT_RESPONSE_HEADER,
};
use super::PaymentError;

/// Payment state machine phases, traced per attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Unpaid,
    ChallengeReceived,
    Signed,
    Submitted,
    Confirmed,
    Failed,
}

#[derive(Clone, Debug)]
pub struct PaymentConfig {
    /// CAIP-2 network id payments are accepted on.
    pub network_id: String,
    /// Hard ceiling on any single payment, in USDC.
    pub price_ceiling: f64,
    /// Reject challenges above this multiple of the historical average.
    pub price_deviation_multiple: f64,
}

/// Outcome of a (possibly paid) request.
#[derive(Clone, Debug)]
pub struct PaidCall {
    pub status: u16,
    pub response: Value,
    /// Amount actually paid in USDC, `None` on the zero-cost path.
    pub paid_amount: Option<f64>,
    /// Evidence for off-band settlement confirmation, when the payee
    /// issued a settlement reference.
    pub settlement: Option<SettlementEvidence>,
}

pub struct PaymentClient {
    http: Client,
    wallet: Arc<dyn WalletClient>,
    config: PaymentConfig,
    store: Arc<Mutex<StateStore>>,
}

impl PaymentClient {
    pub fn new(
        wallet: Arc<dyn WalletClient>,
        config: PaymentConfig,
        store: Arc<Mutex<StateStore>>,
    ) -> Self {
        Self {
            http: Client::new(),
            wallet,
            config,
            store,
        }
    }

    /// Issue a request, paying for it if the target answers with a 402
    /// challenge. Non-challenge responses are returned verbatim.
    pub async fn request(
        &self,
        target: &str,
        method: &str,
        body: Option<&str>,
    ) -> Result<PaidCall, PaymentError> {
        let mut phase = Phase::Unpaid;
        debug!("Payment phase: {:?} for {}", phase, target);

        let initial = self.send(target, method, body, None).await?;
        if initial.status().as_u16() != 402 {
            // Zero-cost path.
            let status = initial.status().as_u16();
            let text = initial.text().await.unwrap_or_default();
            let response = serde_json::from_str(&text).unwrap_or(Value::String(text));
            return Ok(PaidCall {
                status,
                response,
                paid_amount: None,
                settlement: None,
            });
        }

        phase = Phase::ChallengeReceived;
        debug!("Payment phase: {:?} for {}", phase, target);

        let header = initial
            .headers()
            .get(PAYMENT_REQUIRED_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let body_text = initial.text().await.unwrap_or_default();
        let descriptor = parse_descriptor(header.as_deref(), &body_text)
            .ok_or(PaymentError::MalformedDescriptor)?;

        let average = self
            .store
            .lock()
            .expect("state store lock poisoned")
            .average_price(target)
            .unwrap_or(None);
        let amount_usdc = validate_descriptor(
            &descriptor,
            &self.config.network_id,
            self.config.price_ceiling,
            average,
            self.config.price_deviation_multiple,
        )?;

        let balances = self
            .wallet
            .get_balances(&self.wallet.address())
            .await
            .map_err(|e| PaymentError::Wallet(format!("{e:#}")))?;
        if balances.stable < amount_usdc {
            // Never partially pay.
            return Err(PaymentError::InsufficientFunds {
                available: balances.stable,
                required: amount_usdc,
            });
        }

        // One fresh-nonce retry is allowed for an explicit "invalid"
        // rejection (covers nonce races); "funds_exceeded" is fatal.
        for attempt in 0..2 {
            let payment = self.sign_payment(&descriptor).await?;
            phase = Phase::Signed;
            debug!("Payment phase: {:?} (attempt {})", phase, attempt + 1);

            let payment_json =
                serde_json::to_string(&payment).map_err(|e| PaymentError::Signing(e.to_string()))?;
            let payment_header = BASE64.encode(payment_json.as_bytes());

            let paid_resp = self
                .send(target, method, body, Some(&payment_header))
                .await?;
            phase = Phase::Submitted;
            debug!("Payment phase: {:?}", phase);

            let outcome = paid_resp
                .headers()
                .get(PAYMENT_RESPONSE_HEADER)
                .and_then(|v| v.to_str().ok())
                .and_then(decode_outcome);
            let status = paid_resp.status().as_u16();
            let text = paid_resp.text().await.unwrap_or_default();
            let response = serde_json::from_str(&text).unwrap_or(Value::String(text));

            match outcome {
                Some(outcome) if outcome.status == "success" => {
                    phase = Phase::Confirmed;
                    info!(
                        "Payment phase: {:?} - paid {} USDC to {} for {}",
                        phase, amount_usdc, descriptor.beneficiary, target
                    );
                    if let Ok(store) = self.store.lock() {
                        let _ = store.record_price(target, amount_usdc);
                    }
                    let settlement = Some(SettlementEvidence {
                        tx_ref: outcome
                            .tx_hash
                            .unwrap_or_else(|| Uuid::new_v4().to_string()),
                        network_id: descriptor.network_id.clone(),
                        payment,
                        submitted_at: Utc::now().to_rfc3339(),
                    });
                    return Ok(PaidCall {
                        status,
                        response,
                        paid_amount: Some(amount_usdc),
                        settlement,
                    });
                }
                Some(outcome) if outcome.error.as_deref() == Some("funds_exceeded") => {
                    // Double-spend rejection: fatal, never retried.
                    phase = Phase::Failed;
                    warn!("Payment phase: {:?} - funds exceeded at payee", phase);
                    return Err(PaymentError::FundsExceeded);
                }
                Some(outcome) if outcome.error.as_deref() == Some("invalid") => {
                    if attempt == 0 {
                        warn!("Payee rejected authorization as invalid; retrying with fresh nonce");
                        continue;
                    }
                    phase = Phase::Failed;
                    debug!("Payment phase: {:?}", phase);
                    return Err(PaymentError::InvalidAfterRetry);
                }
                _ => {
                    // Paid response with no settlement outcome: return it
                    // verbatim; settlement stays unproven.
                    if let Ok(store) = self.store.lock() {
                        let _ = store.record_price(target, amount_usdc);
                    }
                    return Ok(PaidCall {
                        status,
                        response,
                        paid_amount: Some(amount_usdc),
                        settlement: None,
                    });
                }
            }
        }

        Err(PaymentError::InvalidAfterRetry)
    }

    /// Construct and sign a time-boxed, single-use authorization for
    /// exactly the requested amount.
    async fn sign_payment(
        &self,
        descriptor: &PaymentDescriptor,
    ) -> Result<Payment, PaymentError> {
        let mut nonce_bytes = [0u8; 32];
        for byte in nonce_bytes.iter_mut() {
            *byte = rand::random();
        }
        let nonce = format!("0x{}", hex::encode(nonce_bytes));

        let now = Utc::now().timestamp() as u64;
        let valid_after = now.saturating_sub(60);
        let valid_before = now + descriptor.valid_for_seconds;

        let raw_value = parse_usdc_amount(&descriptor.max_amount_required)
            .ok_or(PaymentError::MalformedDescriptor)?;

        let auth = AuthorizationRequest {
            from: self.wallet.address(),
            to: descriptor.beneficiary.clone(),
            value: raw_value.to_string(),
            valid_after,
            valid_before,
            nonce: nonce.clone(),
            network_id: descriptor.network_id.clone(),
            token_contract: descriptor.usdc_contract.clone(),
        };

        let signature = self
            .wallet
            .sign_authorization(&auth)
            .await
            .map_err(|e| PaymentError::Signing(format!("{e:#}")))?;

        Ok(Payment {
            from: auth.from,
            to: auth.to,
            value: auth.value,
            valid_after,
            valid_before,
            nonce,
            signature,
        })
    }

    async fn send(
        &self,
        target: &str,
        method: &str,
        body: Option<&str>,
        payment_header: Option<&str>,
    ) -> Result<reqwest::Response, reqwest::Error> {
        let mut builder = match method {
            "POST" => self.http.post(target),
            "PUT" => self.http.put(target),
            "DELETE" => self.http.delete(target),
            "PATCH" => self.http.patch(target),
            _ => self.http.get(target),
        };

        builder = builder.header("Content-Type", "application/json");
        if let Some(header) = payment_header {
            builder = builder.header(PAYMENT_HEADER, header);
        }
        if let Some(b) = body {
            builder = builder.body(b.to_string());
        }

        builder.send().await
    }
}

fn decode_outcome(raw: &str) -> Option<SettlementOutcome> {
    let text = match BASE64.decode(raw) {
        Ok(decoded) => String::from_utf8(decoded).ok()?,
        Err(_) => raw.to_string(),
    };
    serde_json::from_str(&text).ok()
}
