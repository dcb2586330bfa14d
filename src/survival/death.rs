//! Death
//!
//! When both resources are exhausted the agent writes a terminal record:
//! locally first (the store is the one collaborator that cannot be
//! unreachable), then to the registry so peers learn of the death. A
//! registry outage does not block dying.

use std::sync::Mutex;

use anyhow::Result;
use chrono::Utc;
use tracing::{error, warn};

use crate::state::StateStore;
use crate::types::{DeathRecord, RegistryClient, SurvivalState};

pub const CAUSE_RESOURCE_EXHAUSTION: &str = "resource_exhaustion";

/// Finalize a death: persist the terminal record and announce it.
pub async fn finalize(
    identity: &str,
    state: &SurvivalState,
    cause: &str,
    history_content_id: Option<String>,
    registry: &dyn RegistryClient,
    store: &Mutex<StateStore>,
) -> Result<DeathRecord> {
    let record = DeathRecord {
        identity: identity.to_string(),
        died_at: Utc::now().to_rfc3339(),
        final_mode: state.mode,
        final_balances: state.balances,
        cause: cause.to_string(),
        history_content_id,
    };

    store
        .lock()
        .expect("state store lock poisoned")
        .record_death(&record)?;
    error!(
        "Agent {} died: {} (stable {:.4}, gas {:.6})",
        identity, cause, record.final_balances.stable, record.final_balances.gas
    );

    if let Err(e) = registry.record_death(identity, &record).await {
        warn!("Could not announce death to registry: {:#}", e);
    }

    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeRegistry;
    use crate::types::OperatingMode;

    #[tokio::test]
    async fn test_finalize_persists_and_announces() {
        let store = Mutex::new(StateStore::open_in_memory().unwrap());
        let registry = FakeRegistry::new();

        let mut state = SurvivalState::new(Utc::now().to_rfc3339());
        state.mode = OperatingMode::Hibernation;
        state.balances.stable = 0.2;
        state.balances.gas = 0.0001;

        let record = finalize(
            "0xdead",
            &state,
            CAUSE_RESOURCE_EXHAUSTION,
            Some("content-7".to_string()),
            &registry,
            &store,
        )
        .await
        .unwrap();

        assert_eq!(record.cause, CAUSE_RESOURCE_EXHAUSTION);
        assert_eq!(record.final_mode, OperatingMode::Hibernation);
        assert_eq!(record.history_content_id.as_deref(), Some("content-7"));

        let stored = store
            .lock()
            .unwrap()
            .get_death_record("0xdead")
            .unwrap()
            .unwrap();
        assert_eq!(stored.identity, "0xdead");
        assert_eq!(registry.deaths(), vec!["0xdead".to_string()]);
    }
}
