//! Settlement Confirmation
//!
//! Confirms submitted payments with a facilitator, decoupled from the
//! paid request itself. Submission retries with exponential backoff up to
//! a bounded attempt count; status polling runs at a fixed interval up to
//! a bounded timeout. A timeout is ambiguous: the evidence is cached in
//! the pending set and retried on the next scheduler cycle, never
//! silently dropped.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use reqwest::Client;
use serde_json::Value;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::state::StateStore;
use crate::types::{SettlementEvidence, SettlementStatus};

#[derive(Clone, Debug)]
pub struct SettlementConfig {
    pub facilitator_url: String,
    /// Bounded submission retry budget.
    pub max_attempts: u32,
    /// Backoff base; delay doubles per attempt.
    pub base_delay_ms: u64,
    pub poll_interval_ms: u64,
    pub poll_timeout_ms: u64,
}

impl SettlementConfig {
    pub fn new(facilitator_url: String) -> Self {
        Self {
            facilitator_url,
            max_attempts: 5,
            base_delay_ms: 500,
            poll_interval_ms: 2_000,
            poll_timeout_ms: 30_000,
        }
    }
}

pub struct SettlementTracker {
    http: Client,
    config: SettlementConfig,
    store: Arc<Mutex<StateStore>>,
}

impl SettlementTracker {
    pub fn new(config: SettlementConfig, store: Arc<Mutex<StateStore>>) -> Self {
        Self {
            http: Client::new(),
            config,
            store,
        }
    }

    /// Submit evidence and poll for a terminal status. `Confirmed` and
    /// `Failed` are terminal; `Pending` means the evidence was cached for
    /// a later retry.
    pub async fn confirm(&self, evidence: &SettlementEvidence) -> Result<SettlementStatus> {
        if !self.submit_with_backoff(evidence).await {
            warn!(
                "Settlement submission budget exhausted for {}; caching as pending",
                evidence.tx_ref
            );
            self.cache_pending(evidence)?;
            return Ok(SettlementStatus::Pending);
        }

        let status = self.poll_until_terminal(&evidence.tx_ref).await;
        match status {
            SettlementStatus::Confirmed => {
                info!("Settlement {} confirmed", evidence.tx_ref);
                self.store
                    .lock()
                    .expect("state store lock poisoned")
                    .resolve_settlement(&evidence.tx_ref, SettlementStatus::Confirmed)?;
            }
            SettlementStatus::Failed => {
                warn!("Settlement {} failed terminally", evidence.tx_ref);
                self.store
                    .lock()
                    .expect("state store lock poisoned")
                    .resolve_settlement(&evidence.tx_ref, SettlementStatus::Failed)?;
            }
            SettlementStatus::Pending => {
                debug!(
                    "Settlement {} still ambiguous after polling budget; caching",
                    evidence.tx_ref
                );
                self.cache_pending(evidence)?;
            }
        }
        Ok(status)
    }

    /// Re-drive every cached pending settlement. Called once per
    /// scheduler cycle. Returns the number resolved to a terminal state.
    pub async fn retry_pending(&self) -> Result<usize> {
        let pending = self
            .store
            .lock()
            .expect("state store lock poisoned")
            .pending_settlements()?;
        if pending.is_empty() {
            return Ok(0);
        }

        debug!("Retrying {} pending settlements", pending.len());
        let mut resolved = 0usize;
        for evidence in &pending {
            match self.confirm(evidence).await? {
                SettlementStatus::Pending => {}
                _ => resolved += 1,
            }
        }
        Ok(resolved)
    }

    fn cache_pending(&self, evidence: &SettlementEvidence) -> Result<()> {
        self.store
            .lock()
            .expect("state store lock poisoned")
            .insert_pending_settlement(evidence)
    }

    /// Submit with exponential backoff. Returns whether the facilitator
    /// acknowledged the submission within the attempt budget.
    async fn submit_with_backoff(&self, evidence: &SettlementEvidence) -> bool {
        let url = format!("{}/settlements", self.config.facilitator_url);

        for attempt in 0..self.config.max_attempts {
            if attempt > 0 {
                let delay = self.config.base_delay_ms * (1 << (attempt - 1));
                sleep(Duration::from_millis(delay)).await;
            }

            match self.http.post(&url).json(evidence).send().await {
                Ok(resp) if resp.status().is_success() => return true,
                Ok(resp) => {
                    debug!(
                        "Settlement submission attempt {} got status {}",
                        attempt + 1,
                        resp.status()
                    );
                }
                Err(e) => {
                    debug!("Settlement submission attempt {} failed: {}", attempt + 1, e);
                }
            }
        }
        false
    }

    /// Poll the status endpoint at a fixed interval up to the bounded
    /// timeout. Anything non-terminal by then is `Pending`.
    async fn poll_until_terminal(&self, tx_ref: &str) -> SettlementStatus {
        let url = format!("{}/settlements/{}", self.config.facilitator_url, tx_ref);
        let deadline =
            tokio::time::Instant::now() + Duration::from_millis(self.config.poll_timeout_ms);

        loop {
            match self.http.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    if let Ok(body) = resp.json::<Value>().await {
                        match body["status"].as_str() {
                            Some("confirmed") => return SettlementStatus::Confirmed,
                            Some("failed") => return SettlementStatus::Failed,
                            _ => {}
                        }
                    }
                }
                Ok(_) | Err(_) => {}
            }

            if tokio::time::Instant::now() >= deadline {
                return SettlementStatus::Pending;
            }
            sleep(Duration::from_millis(self.config.poll_interval_ms)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeFacilitator;
    use crate::types::Payment;
    use chrono::Utc;

    fn evidence(tx_ref: &str) -> SettlementEvidence {
        SettlementEvidence {
            tx_ref: tx_ref.to_string(),
            network_id: "eip155:8453".to_string(),
            payment: Payment {
                from: "0xfrom".to_string(),
                to: "0xto".to_string(),
                value: "3000".to_string(),
                valid_after: 0,
                valid_before: 300,
                nonce: "0xnonce".to_string(),
                signature: "0xsig".to_string(),
            },
            submitted_at: Utc::now().to_rfc3339(),
        }
    }

    fn tracker(
        facilitator: &FakeFacilitator,
        poll_timeout_ms: u64,
    ) -> (SettlementTracker, Arc<Mutex<StateStore>>) {
        let store = Arc::new(Mutex::new(StateStore::open_in_memory().unwrap()));
        let tracker = SettlementTracker::new(
            SettlementConfig {
                facilitator_url: facilitator.url(),
                max_attempts: 5,
                base_delay_ms: 5,
                poll_interval_ms: 10,
                poll_timeout_ms,
            },
            Arc::clone(&store),
        );
        (tracker, store)
    }

    #[tokio::test]
    async fn test_submission_survives_transient_failures() {
        let facilitator = FakeFacilitator::spawn().await;
        facilitator.fail_next_submissions(2);
        facilitator.set_status_sequence(&["pending", "confirmed"]);
        let (tracker, store) = tracker(&facilitator, 500);

        let status = tracker.confirm(&evidence("tx-ok")).await.unwrap();
        assert_eq!(status, SettlementStatus::Confirmed);
        assert_eq!(facilitator.submission_attempts(), 3);
        assert!(store.lock().unwrap().pending_settlements().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_terminal_failure_is_not_cached() {
        let facilitator = FakeFacilitator::spawn().await;
        facilitator.set_status_sequence(&["failed"]);
        let (tracker, store) = tracker(&facilitator, 500);

        let status = tracker.confirm(&evidence("tx-bad")).await.unwrap();
        assert_eq!(status, SettlementStatus::Failed);
        assert!(store.lock().unwrap().pending_settlements().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ambiguous_timeout_cached_and_retried() {
        let facilitator = FakeFacilitator::spawn().await;
        facilitator.set_status_sequence(&["pending"]);
        let (tracker, store) = tracker(&facilitator, 40);

        let status = tracker.confirm(&evidence("tx-slow")).await.unwrap();
        assert_eq!(status, SettlementStatus::Pending);
        assert_eq!(store.lock().unwrap().pending_settlements().unwrap().len(), 1);

        // Next cycle: the facilitator has caught up.
        facilitator.set_status_sequence(&["confirmed"]);
        let resolved = tracker.retry_pending().await.unwrap();
        assert_eq!(resolved, 1);
        assert!(store.lock().unwrap().pending_settlements().unwrap().is_empty());
    }
}
