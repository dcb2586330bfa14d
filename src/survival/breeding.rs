//! Breeding
//!
//! Eligibility is a pure predicate over survival state; the attempt flow
//! is a guarded sequence around the escrow lock. The external escrow is
//! the source of truth for the contribution, so every exit path that does
//! not produce a child releases the lock before returning.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::SurvivalThresholds;
use crate::genome::ancestry::are_related;
use crate::genome::blend::{blend, BlendConfig};
use crate::types::{
    AgentRecord, BreedingOpportunity, EscrowClient, OperatingMode, PeerDiscovery, RegistryClient,
    SurvivalState,
};

/// Days survived since `born_at`; zero if the timestamp does not parse.
pub fn survival_days(born_at: &str, now: DateTime<Utc>) -> f64 {
    born_at
        .parse::<DateTime<Utc>>()
        .map(|born| (now - born).num_seconds() as f64 / 86_400.0)
        .unwrap_or(0.0)
}

/// Breeding eligibility. All four conditions must hold at once: Normal
/// mode, a stable surplus above the breeding floor, proven longevity, and
/// no attempt already in flight.
pub fn is_eligible(
    state: &SurvivalState,
    thresholds: &SurvivalThresholds,
    now: DateTime<Utc>,
) -> bool {
    state.mode == OperatingMode::Normal
        && state.balances.stable >= thresholds.breeding_floor
        && survival_days(&state.born_at, now) >= thresholds.min_survival_days
        && !state.breeding_in_progress
}

pub struct BreedingEngine {
    registry: Arc<dyn RegistryClient>,
    peers: Arc<dyn PeerDiscovery>,
    escrow: Arc<dyn EscrowClient>,
    thresholds: SurvivalThresholds,
    blend_config: BlendConfig,
}

impl BreedingEngine {
    pub fn new(
        registry: Arc<dyn RegistryClient>,
        peers: Arc<dyn PeerDiscovery>,
        escrow: Arc<dyn EscrowClient>,
        thresholds: SurvivalThresholds,
        blend_config: BlendConfig,
    ) -> Self {
        Self {
            registry,
            peers,
            escrow,
            thresholds,
            blend_config,
        }
    }

    /// Drive one breeding attempt to completion. `Ok(None)` is the normal
    /// outcome for a declined proposal, an acceptance timeout, or a
    /// related peer; `Ok(Some(child))` means the child was bred and
    /// registered, with the escrow contribution consumed.
    pub async fn attempt(
        &self,
        own: &AgentRecord,
        own_survival_days: f64,
        opportunity: &BreedingOpportunity,
    ) -> Result<Option<AgentRecord>> {
        let self_id = &opportunity.self_identity;
        let peer_id = &opportunity.peer_identity;

        // The relatedness check runs before any funds move.
        if are_related(Some(self.registry.as_ref()), self_id, peer_id).await {
            info!("Declining opportunity {}: peer {} is related", opportunity.id, peer_id);
            return Ok(None);
        }

        let lock_id = self
            .escrow
            .lock_funds(self_id, self.thresholds.breeding_contribution)
            .await
            .context("failed to lock breeding contribution")?;
        debug!("Locked breeding contribution under {}", lock_id);

        match self.attempt_locked(own, own_survival_days, opportunity).await {
            Ok(Some(child)) => Ok(Some(child)),
            Ok(None) => {
                self.release(&lock_id).await;
                Ok(None)
            }
            Err(e) => {
                self.release(&lock_id).await;
                Err(e)
            }
        }
    }

    /// The portion of the attempt that runs with the contribution locked.
    /// Must not early-return around the caller's release handling.
    async fn attempt_locked(
        &self,
        own: &AgentRecord,
        own_survival_days: f64,
        opportunity: &BreedingOpportunity,
    ) -> Result<Option<AgentRecord>> {
        let peer_id = &opportunity.peer_identity;

        let proposal_id = self
            .peers
            .send_proposal(&opportunity.self_identity, peer_id)
            .await
            .context("failed to send breeding proposal")?;

        let Some(accepted) = self.await_acceptance(&proposal_id).await? else {
            info!("Proposal {} timed out without an answer", proposal_id);
            return Ok(None);
        };
        if !accepted {
            info!("Proposal {} declined by {}", proposal_id, peer_id);
            return Ok(None);
        }

        let peer_record = self
            .peers
            .fetch_peer_record(peer_id)
            .await
            .with_context(|| format!("failed to fetch record for accepted peer {peer_id}"))?;
        let peer_survival = survival_days(&peer_record.identity.born_at, Utc::now());

        let outcome = blend(
            own,
            &peer_record,
            own_survival_days,
            peer_survival,
            &self.blend_config,
            &mut rand::thread_rng(),
        )
        .context("blend rejected the accepted pair")?;
        let child = outcome.child;

        self.registry
            .register_birth(&child.identity.gene_hash, &child.identity)
            .await
            .context("failed to register child birth")?;

        info!(
            "Bred child {} with {} ({} mutations)",
            child.identity.gene_hash,
            peer_id,
            outcome.mutations.len()
        );
        Ok(Some(child))
    }

    /// Poll the pending-proposal table until answered or timed out.
    /// `None` means the timeout elapsed; the peer simply never answered.
    async fn await_acceptance(&self, proposal_id: &str) -> Result<Option<bool>> {
        let deadline = tokio::time::Instant::now()
            + Duration::from_secs(self.thresholds.acceptance_timeout_secs);

        loop {
            if let Some(decision) = self
                .peers
                .poll_acceptance(proposal_id)
                .await
                .context("acceptance poll failed")?
            {
                return Ok(Some(decision));
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            sleep(Duration::from_secs(self.thresholds.acceptance_poll_secs)).await;
        }
    }

    async fn release(&self, lock_id: &str) {
        if let Err(e) = self.escrow.release_funds(lock_id).await {
            // The lock will be reaped by the escrow's own expiry; all we
            // can do here is make the leak visible.
            warn!("Failed to release escrow lock {}: {:#}", lock_id, e);
        }
    }
}
