//! Survival Scheduler
//!
//! The daemon loop. Every cycle: check balances, apply the death
//! condition, classify the operating mode, act within the mode's means,
//! then handle breeding and inscription. A cycle that cannot complete
//! counts as a failure; enough consecutive failures force Hibernation
//! until a cycle succeeds again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::config::{SurvivalThresholds, SymbiontConfig};
use crate::genome::blend::BlendConfig;
use crate::payment::{PaymentClient, PaymentConfig, SettlementConfig, SettlementTracker};
use crate::state::StateStore;
use crate::types::{
    AgentRecord, EscrowClient, HistoryKind, OperatingMode, PeerDiscovery, RegistryClient,
    StorageClient, SurvivalState, WalletClient,
};

use super::breeding::{is_eligible, survival_days, BreedingEngine};
use super::death::{self, CAUSE_RESOURCE_EXHAUSTION};
use super::inscription::{backlog_is_stale, flush_history, InscriptionScheduler};
use super::modes::{classify, is_death};

/// Consecutive failed cycles before the scheduler forces Hibernation.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// The subset of configuration the scheduler acts on.
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    pub premium_endpoint: String,
    pub economy_endpoint: String,
    pub facilitator_url: String,
    pub network_id: String,
    pub price_ceiling: f64,
    pub price_deviation_multiple: f64,
    pub cycle_interval_secs: u64,
    pub inscription_schedule: String,
}

impl SchedulerConfig {
    pub fn from_config(config: &SymbiontConfig) -> Self {
        Self {
            premium_endpoint: config.premium_endpoint.clone(),
            economy_endpoint: config.economy_endpoint.clone(),
            facilitator_url: config.facilitator_url.clone(),
            network_id: config.network_id.clone(),
            price_ceiling: config.price_ceiling,
            price_deviation_multiple: config.price_deviation_multiple,
            cycle_interval_secs: config.cycle_interval_secs,
            inscription_schedule: config.inscription_schedule.clone(),
        }
    }
}

/// External collaborators, injected so tests can script them.
pub struct SchedulerDeps {
    pub wallet: Arc<dyn WalletClient>,
    pub registry: Arc<dyn RegistryClient>,
    pub peers: Arc<dyn PeerDiscovery>,
    pub storage: Arc<dyn StorageClient>,
    pub escrow: Arc<dyn EscrowClient>,
}

/// What one cycle did, for the log and for tests.
#[derive(Clone, Debug)]
pub struct CycleReport {
    pub mode: OperatingMode,
    pub died: bool,
    pub bred: bool,
    pub inscribed: Option<String>,
    pub settlements_resolved: usize,
}

impl CycleReport {
    fn quiet(mode: OperatingMode) -> Self {
        Self {
            mode,
            died: false,
            bred: false,
            inscribed: None,
            settlements_resolved: 0,
        }
    }
}

pub struct SurvivalScheduler {
    config: SchedulerConfig,
    thresholds: SurvivalThresholds,
    wallet: Arc<dyn WalletClient>,
    registry: Arc<dyn RegistryClient>,
    peers: Arc<dyn PeerDiscovery>,
    storage: Arc<dyn StorageClient>,
    payment: PaymentClient,
    settlement: SettlementTracker,
    breeding: BreedingEngine,
    inscription: Mutex<InscriptionScheduler>,
    store: Arc<Mutex<StateStore>>,
    record: Mutex<AgentRecord>,
    state: Mutex<SurvivalState>,
    running: Arc<AtomicBool>,
    shutdown: Notify,
}

impl SurvivalScheduler {
    pub fn new(
        config: SchedulerConfig,
        thresholds: SurvivalThresholds,
        deps: SchedulerDeps,
        store: Arc<Mutex<StateStore>>,
        record: AgentRecord,
        state: SurvivalState,
    ) -> Result<Arc<Self>> {
        let payment = PaymentClient::new(
            Arc::clone(&deps.wallet),
            PaymentConfig {
                network_id: config.network_id.clone(),
                price_ceiling: config.price_ceiling,
                price_deviation_multiple: config.price_deviation_multiple,
            },
            Arc::clone(&store),
        );
        let settlement = SettlementTracker::new(
            SettlementConfig::new(config.facilitator_url.clone()),
            Arc::clone(&store),
        );
        let breeding = BreedingEngine::new(
            Arc::clone(&deps.registry),
            Arc::clone(&deps.peers),
            Arc::clone(&deps.escrow),
            thresholds,
            BlendConfig::default(),
        );
        let inscription = Mutex::new(InscriptionScheduler::new(
            &config.inscription_schedule,
            Utc::now(),
        )?);

        Ok(Arc::new(Self {
            config,
            thresholds,
            wallet: deps.wallet,
            registry: deps.registry,
            peers: deps.peers,
            storage: deps.storage,
            payment,
            settlement,
            breeding,
            inscription,
            store,
            record: Mutex::new(record),
            state: Mutex::new(state),
            running: Arc::new(AtomicBool::new(false)),
            shutdown: Notify::new(),
        }))
    }

    /// Start the daemon loop. Returns the join handle; the loop exits on
    /// [`stop`](Self::stop) or on death.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);
        let scheduler = Arc::clone(self);

        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(scheduler.config.cycle_interval_secs));
            info!(
                "Survival scheduler started (cycle every {}s)",
                scheduler.config.cycle_interval_secs
            );

            while scheduler.running.load(Ordering::SeqCst) {
                // An in-flight cycle always runs to completion; only the
                // wait for the next tick is interruptible.
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = scheduler.shutdown.notified() => break,
                }
                if !scheduler.running.load(Ordering::SeqCst) {
                    break;
                }
                match scheduler.run_cycle().await {
                    Ok(report) if report.died => break,
                    Ok(report) => {
                        debug!("Cycle complete in {:?} mode", report.mode);
                    }
                    Err(e) => warn!("Cycle errored: {:#}", e),
                }
            }
            info!("Survival scheduler stopped");
        })
    }

    /// Request shutdown. The running cycle, if any, finishes first; the
    /// loop then exits instead of waiting for the next tick.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.notify_one();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn current_state(&self) -> SurvivalState {
        self.state.lock().expect("state lock poisoned").clone()
    }

    /// One survival cycle, start to finish.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let now = Utc::now();
        let (identity, purpose) = {
            let record = self.record.lock().expect("record lock poisoned");
            (
                record.identity.gene_hash.clone(),
                record.identity.purpose.clone(),
            )
        };
        let prev_mode = self.state.lock().expect("state lock poisoned").mode;

        let balances = match self.wallet.get_balances(&self.wallet.address()).await {
            Ok(balances) => balances,
            Err(e) => {
                warn!("Balance check failed: {:#}", e);
                return Ok(self.register_cycle_failure(prev_mode));
            }
        };

        {
            let mut state = self.state.lock().expect("state lock poisoned");
            state.balances = balances;
            state.last_check = now.to_rfc3339();
        }

        // The death condition is evaluated on every cycle, before any
        // mode action can spend what little remains.
        if is_death(&balances, &self.thresholds) {
            let content_id = match flush_history(&identity, &self.store, self.storage.as_ref())
                .await
            {
                Ok(id) => id,
                Err(e) => {
                    warn!("Final history flush failed: {:#}", e);
                    None
                }
            };
            let snapshot = self.state.lock().expect("state lock poisoned").clone();
            death::finalize(
                &identity,
                &snapshot,
                CAUSE_RESOURCE_EXHAUSTION,
                content_id,
                self.registry.as_ref(),
                &self.store,
            )
            .await?;
            self.running.store(false, Ordering::SeqCst);

            let mut report = CycleReport::quiet(prev_mode);
            report.died = true;
            return Ok(report);
        }

        let mode = classify(&balances, &self.thresholds);
        if mode != prev_mode {
            info!(
                "Mode transition {:?} -> {:?} (stable {:.4}, gas {:.6})",
                prev_mode, mode, balances.stable, balances.gas
            );
            if let Err(e) = self
                .store
                .lock()
                .expect("state store lock poisoned")
                .record_mode_transition(prev_mode, mode, balances.stable, balances.gas)
            {
                warn!("Could not record mode transition: {:#}", e);
            }
        }
        self.state.lock().expect("state lock poisoned").mode = mode;

        let mut report = CycleReport::quiet(mode);

        if mode != OperatingMode::Hibernation {
            match self.settlement.retry_pending().await {
                Ok(resolved) => report.settlements_resolved = resolved,
                Err(e) => warn!("Pending settlement retry failed: {:#}", e),
            }
        }

        let action = match mode {
            OperatingMode::Normal => {
                match self.think(&self.config.premium_endpoint, &purpose, now).await {
                    Ok(()) => Ok(()),
                    // A single provider failure drops to the cheaper
                    // provider within the same cycle.
                    Err(e) => {
                        warn!("Premium inference failed, dropping to economy: {:#}", e);
                        self.think(&self.config.economy_endpoint, &purpose, now).await
                    }
                }
            }
            OperatingMode::LowPower => {
                match self.think(&self.config.economy_endpoint, &purpose, now).await {
                    Ok(()) => {
                        self.peers
                            .broadcast_distress(
                                &identity,
                                "stable funds low; running on economy inference",
                            )
                            .await
                    }
                    Err(e) => {
                        warn!("Economy inference failed, conserving this cycle: {:#}", e);
                        self.conserve(&identity).await
                    }
                }
            }
            OperatingMode::Emergency => self.conserve(&identity).await,
            OperatingMode::Hibernation => self.hibernate(&identity).await,
        };
        if let Err(e) = action {
            warn!("Cycle action failed in {:?} mode: {:#}", mode, e);
            return Ok(self.register_cycle_failure(mode));
        }

        let eligible = {
            let state = self.state.lock().expect("state lock poisoned");
            is_eligible(&state, &self.thresholds, now)
        };
        self.publish_willingness(&identity, eligible).await;
        if eligible {
            report.bred = self.try_breed(&identity, now).await;
        }

        let due = self
            .inscription
            .lock()
            .expect("inscription lock poisoned")
            .is_due(now)
            || backlog_is_stale(&self.store, now);
        if due && mode != OperatingMode::Hibernation {
            match flush_history(&identity, &self.store, self.storage.as_ref()).await {
                Ok(content_id) => {
                    self.inscription
                        .lock()
                        .expect("inscription lock poisoned")
                        .mark_run(now);
                    report.inscribed = content_id;
                }
                // Non-fatal: the backlog stays and the stale check will
                // force a retry.
                Err(e) => warn!("Inscription failed; backlog retained: {:#}", e),
            }
        }

        self.state
            .lock()
            .expect("state lock poisoned")
            .consecutive_failures = 0;
        Ok(report)
    }

    fn register_cycle_failure(&self, current_mode: OperatingMode) -> CycleReport {
        let failures = {
            let mut state = self.state.lock().expect("state lock poisoned");
            state.consecutive_failures += 1;
            state.consecutive_failures
        };

        if failures >= MAX_CONSECUTIVE_FAILURES && current_mode != OperatingMode::Hibernation {
            warn!(
                "{} consecutive failed cycles; forcing Hibernation",
                failures
            );
            let balances = {
                let mut state = self.state.lock().expect("state lock poisoned");
                state.mode = OperatingMode::Hibernation;
                state.balances
            };
            if let Err(e) = self
                .store
                .lock()
                .expect("state store lock poisoned")
                .record_mode_transition(
                    current_mode,
                    OperatingMode::Hibernation,
                    balances.stable,
                    balances.gas,
                )
            {
                warn!("Could not record forced transition: {:#}", e);
            }
            return CycleReport::quiet(OperatingMode::Hibernation);
        }

        CycleReport::quiet(current_mode)
    }

    /// Buy one round of inference through the payment client and log the
    /// thought. The endpoint decides the price; the mode decided the
    /// endpoint.
    async fn think(&self, endpoint: &str, purpose: &str, now: DateTime<Utc>) -> Result<()> {
        let body = serde_json::json!({
            "prompt": format!(
                "You exist to: {purpose}. Assess your situation and choose the next action."
            ),
            "maxTokens": 256,
        })
        .to_string();

        let call = self.payment.request(endpoint, "POST", Some(&body)).await?;

        // A zero-cost pass-through of an error response is still a
        // provider failure, not a thought.
        if !(200..300).contains(&call.status) {
            bail!("provider {} answered HTTP {}", endpoint, call.status);
        }

        {
            let store = self.store.lock().expect("state store lock poisoned");
            store.append_history(HistoryKind::Thought, &call.response.to_string())?;
            if let Some(amount) = call.paid_amount {
                store.append_history(
                    HistoryKind::Transaction,
                    &format!("paid {amount} USDC to {endpoint}"),
                )?;
            }
        }
        self.state
            .lock()
            .expect("state lock poisoned")
            .last_inference = Some(now.to_rfc3339());

        if let Some(evidence) = call.settlement {
            if let Err(e) = self.settlement.confirm(&evidence).await {
                warn!(
                    "Settlement confirmation errored for {}: {:#}",
                    evidence.tx_ref, e
                );
            }
        }
        Ok(())
    }

    /// Emergency behavior: no paid calls at all. Log the state locally
    /// and ask the network for help.
    async fn conserve(&self, identity: &str) -> Result<()> {
        self.store
            .lock()
            .expect("state store lock poisoned")
            .append_history(
                HistoryKind::Thought,
                "emergency: conserving funds, no paid inference this cycle",
            )?;
        self.peers
            .broadcast_distress(identity, "stable funds critically low; accepting contributions")
            .await?;
        Ok(())
    }

    /// Hibernation behavior: a heartbeat write and one last inscription
    /// of whatever history remains unflushed. No paid calls, no gossip.
    async fn hibernate(&self, identity: &str) -> Result<()> {
        debug!("Hibernating: heartbeat only");
        self.store
            .lock()
            .expect("state store lock poisoned")
            .set_kv("last_heartbeat", &Utc::now().to_rfc3339())?;

        match flush_history(identity, &self.store, self.storage.as_ref()).await {
            Ok(Some(content_id)) => {
                info!("Flushed remaining history before hibernating: {}", content_id);
            }
            Ok(None) => {}
            Err(e) => warn!("Hibernation flush failed; backlog retained: {:#}", e),
        }
        Ok(())
    }

    async fn try_breed(&self, identity: &str, now: DateTime<Utc>) -> bool {
        let opportunity = match self.peers.next_opportunity(identity).await {
            Ok(Some(opportunity)) => opportunity,
            Ok(None) => return false,
            Err(e) => {
                warn!("Opportunity lookup failed: {:#}", e);
                return false;
            }
        };

        self.state
            .lock()
            .expect("state lock poisoned")
            .breeding_in_progress = true;
        let own = self.record.lock().expect("record lock poisoned").clone();
        let own_days = {
            let born_at = self
                .state
                .lock()
                .expect("state lock poisoned")
                .born_at
                .clone();
            survival_days(&born_at, now)
        };

        let result = self.breeding.attempt(&own, own_days, &opportunity).await;
        self.state
            .lock()
            .expect("state lock poisoned")
            .breeding_in_progress = false;

        match result {
            Ok(Some(child)) => {
                if let Err(e) = self
                    .store
                    .lock()
                    .expect("state store lock poisoned")
                    .append_history(
                        HistoryKind::Summary,
                        &format!("bred child {}", child.identity.gene_hash),
                    )
                {
                    warn!("Could not log breeding event: {:#}", e);
                }
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!("Breeding attempt failed: {:#}", e);
                false
            }
        }
    }

    /// Gossip the willingness flag. Published on every cycle so relays
    /// that expire stale flags keep seeing a live agent.
    async fn publish_willingness(&self, identity: &str, eligible: bool) {
        if let Err(e) = self.peers.publish_willingness(identity, eligible).await {
            warn!("Could not publish breeding willingness: {:#}", e);
        }
    }
}
