//! Symbiont - Type Definitions
//!
//! Shared types for the self-funded agent runtime: the persistent agent
//! record, survival state, payment protocol types, and the collaborator
//! traits through which all external services are reached.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

// ─── Agent Record ────────────────────────────────────────────────

/// Everything an agent persistently is: who it claims to be, its trait
/// genome, what it knows, and what it has lived through. Owned exclusively
/// by the agent process; peers never mutate it.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRecord {
    pub identity: IdentityMetadata,
    pub traits: Vec<TraitGene>,
    pub knowledge: Vec<KnowledgeEntry>,
    pub history: Vec<HistoryEvent>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityMetadata {
    /// Content-addressed gene hash: `0x` + 64 lowercase hex (SHA-256
    /// Merkle root over the record leaves). Recomputed only at birth,
    /// breeding, or reincarnation.
    pub gene_hash: String,
    pub origin: String,
    pub purpose: String,
    pub declared_values: Vec<String>,
    pub generation: u32,
    pub parents: Vec<String>,
    pub born_at: String,
}

/// A single named gene in the personality-trait vector.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TraitGene {
    pub name: String,
    pub value: TraitValue,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum TraitValue {
    /// Numeric trait constrained to [0, 1].
    Numeric { value: f64 },
    /// Categorical trait drawn from a fixed option set.
    Categorical { value: String, options: Vec<String> },
    Boolean { value: bool },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeEntry {
    pub content: String,
    pub source: String,
    /// Confidence score in [0, 1]; decays at every generational merge.
    pub confidence: f64,
    pub learned_at: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEvent {
    pub id: String,
    pub kind: HistoryKind,
    pub detail: String,
    pub timestamp: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HistoryKind {
    Thought,
    Transaction,
    Summary,
}

// ─── Survival State ──────────────────────────────────────────────

/// Resource-driven behavioral tier. The order is a strict degradation
/// order: Normal > LowPower > Emergency > Hibernation.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OperatingMode {
    Normal,
    LowPower,
    Emergency,
    Hibernation,
}

impl OperatingMode {
    /// Degradation rank: higher means more degraded.
    pub fn degradation(&self) -> u8 {
        match self {
            OperatingMode::Normal => 0,
            OperatingMode::LowPower => 1,
            OperatingMode::Emergency => 2,
            OperatingMode::Hibernation => 3,
        }
    }
}

/// Last known wallet balances. `gas` is the native token used to pay
/// transaction fees; `stable` is the USDC balance the agent lives on.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Balances {
    pub gas: f64,
    pub stable: f64,
}

/// Mutable per-cycle state. Created at process start, updated once per
/// cycle by the scheduler, captured into the death record at the end.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SurvivalState {
    pub last_check: String,
    pub mode: OperatingMode,
    pub balances: Balances,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_inference: Option<String>,
    pub born_at: String,
    pub breeding_in_progress: bool,
}

impl SurvivalState {
    pub fn new(born_at: String) -> Self {
        Self {
            last_check: born_at.clone(),
            mode: OperatingMode::Normal,
            balances: Balances::default(),
            consecutive_failures: 0,
            last_inference: None,
            born_at,
            breeding_in_progress: false,
        }
    }
}

/// Terminal snapshot written when the death condition is satisfied.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeathRecord {
    pub identity: String,
    pub died_at: String,
    pub final_mode: OperatingMode,
    pub final_balances: Balances,
    pub cause: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history_content_id: Option<String>,
}

// ─── Breeding ────────────────────────────────────────────────────

/// Transient candidate pair. Created when eligibility and peer discovery
/// coincide, consumed exactly once by a breeding attempt.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreedingOpportunity {
    pub id: String,
    pub self_identity: String,
    pub peer_identity: String,
    pub created_at: String,
}

// ─── Payment Protocol ────────────────────────────────────────────

/// Payment descriptor carried by a 402 challenge.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentDescriptor {
    pub scheme: String,
    pub network_id: String,
    /// Requested amount in human-readable USDC (e.g. "0.003").
    pub max_amount_required: String,
    pub beneficiary: String,
    pub usdc_contract: String,
    #[serde(default = "default_valid_for")]
    pub valid_for_seconds: u64,
}

fn default_valid_for() -> u64 {
    300
}

/// A signed single-use transfer authorization. The nonce/value pairing is
/// what makes replay safe on the payee side, not client memoization.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    pub from: String,
    pub to: String,
    /// Value in raw USDC units (6 decimals), as a decimal string.
    pub value: String,
    pub valid_after: u64,
    pub valid_before: u64,
    /// `0x` + 64 hex chars, drawn fresh for every signature.
    pub nonce: String,
    pub signature: String,
}

/// Settlement outcome reported by the payee in the paid response header.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementOutcome {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Evidence handed to the facilitator to confirm a payment on-chain.
/// Lives in the pending set until confirmed or abandoned.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementEvidence {
    pub tx_ref: String,
    pub network_id: String,
    pub payment: Payment,
    pub submitted_at: String,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SettlementStatus {
    Confirmed,
    Failed,
    /// Ambiguous: neither confirmed nor failed within the polling budget.
    /// Retried on the next scheduler cycle, never silently dropped.
    Pending,
}

// ─── Collaborator Traits ─────────────────────────────────────────

/// Parameters for a TransferWithAuthorization signature. The wallet signs
/// this and returns an opaque signature; the private key never crosses
/// the trait boundary.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationRequest {
    pub from: String,
    pub to: String,
    /// Raw USDC units (6 decimals), decimal string.
    pub value: String,
    pub valid_after: u64,
    pub valid_before: u64,
    pub nonce: String,
    pub network_id: String,
    pub token_contract: String,
}

#[async_trait]
pub trait WalletClient: Send + Sync {
    async fn get_balances(&self, address: &str) -> anyhow::Result<Balances>;
    async fn sign_authorization(&self, auth: &AuthorizationRequest) -> anyhow::Result<String>;
    fn address(&self) -> String;
}

#[async_trait]
pub trait StorageClient: Send + Sync {
    /// Upload a blob to permanent storage; returns a content id.
    async fn upload(&self, bytes: Vec<u8>, tags: Vec<String>) -> anyhow::Result<String>;
}

#[async_trait]
pub trait RegistryClient: Send + Sync {
    async fn register_birth(
        &self,
        identity: &str,
        meta: &IdentityMetadata,
    ) -> anyhow::Result<String>;
    async fn record_death(&self, identity: &str, record: &DeathRecord) -> anyhow::Result<String>;
    async fn record_reincarnation(
        &self,
        old_identity: &str,
        new_identity: &str,
    ) -> anyhow::Result<String>;
    /// Ancestor identities of `identity`, up to `depth` generations.
    async fn get_ancestry(&self, identity: &str, depth: u32) -> anyhow::Result<Vec<String>>;
}

#[async_trait]
pub trait PeerDiscovery: Send + Sync {
    async fn publish_willingness(&self, identity: &str, willing: bool) -> anyhow::Result<()>;
    async fn broadcast_distress(&self, identity: &str, message: &str) -> anyhow::Result<()>;
    /// Next candidate pair, if eligibility and discovery coincide.
    async fn next_opportunity(
        &self,
        self_identity: &str,
    ) -> anyhow::Result<Option<BreedingOpportunity>>;
    /// Send a breeding proposal; returns a proposal id to poll on.
    async fn send_proposal(&self, from: &str, to: &str) -> anyhow::Result<String>;
    /// Poll the shared pending-proposal table. `None` means not yet
    /// answered; `Some(bool)` is the peer's decision.
    async fn poll_acceptance(&self, proposal_id: &str) -> anyhow::Result<Option<bool>>;
    async fn fetch_peer_record(&self, identity: &str) -> anyhow::Result<AgentRecord>;
}

#[async_trait]
pub trait EscrowClient: Send + Sync {
    /// Lock the breeding contribution; returns a lock id. The external
    /// escrow is the source of truth, so every later failure must release
    /// this lock before the error is surfaced.
    async fn lock_funds(&self, identity: &str, amount: f64) -> anyhow::Result<String>;
    async fn release_funds(&self, lock_id: &str) -> anyhow::Result<()>;
}
