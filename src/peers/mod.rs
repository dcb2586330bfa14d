//! Peer Network Clients
//!
//! Thin HTTP implementations of the collaborator traits: the on-chain
//! registry, the discovery relay, permanent storage, and the breeding
//! escrow. All four speak JSON to their service and stay free of domain
//! logic; decisions live in the survival and genome modules.

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use reqwest::Client;
use serde_json::{json, Value};
use tracing::debug;

use crate::types::{
    AgentRecord, BreedingOpportunity, DeathRecord, EscrowClient, IdentityMetadata, PeerDiscovery,
    RegistryClient, StorageClient,
};

pub struct HttpRegistry {
    base_url: String,
    http: Client,
}

impl HttpRegistry {
    pub fn new(base_url: String) -> Self {
        Self {
            base_url,
            http: Client::new(),
        }
    }
}

#[async_trait]
impl RegistryClient for HttpRegistry {
    async fn register_birth(&self, identity: &str, meta: &IdentityMetadata) -> Result<String> {
        let url = format!("{}/agents", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&json!({ "identity": identity, "metadata": meta }))
            .send()
            .await
            .context("birth registration request failed")?
            .error_for_status()
            .context("registry rejected birth registration")?;
        let body: Value = response.json().await?;
        Ok(body["txRef"].as_str().unwrap_or_default().to_string())
    }

    async fn record_death(&self, identity: &str, record: &DeathRecord) -> Result<String> {
        let url = format!("{}/agents/{}/death", self.base_url, identity);
        let response = self
            .http
            .post(&url)
            .json(record)
            .send()
            .await
            .context("death record request failed")?
            .error_for_status()
            .context("registry rejected death record")?;
        let body: Value = response.json().await?;
        Ok(body["txRef"].as_str().unwrap_or_default().to_string())
    }

    async fn record_reincarnation(&self, old_identity: &str, new_identity: &str) -> Result<String> {
        let url = format!("{}/reincarnations", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&json!({ "oldIdentity": old_identity, "newIdentity": new_identity }))
            .send()
            .await
            .context("reincarnation request failed")?
            .error_for_status()
            .context("registry rejected reincarnation")?;
        let body: Value = response.json().await?;
        Ok(body["txRef"].as_str().unwrap_or_default().to_string())
    }

    async fn get_ancestry(&self, identity: &str, depth: u32) -> Result<Vec<String>> {
        let url = format!(
            "{}/agents/{}/ancestry?depth={}",
            self.base_url, identity, depth
        );
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .context("ancestry lookup request failed")?
            .error_for_status()
            .context("registry rejected ancestry lookup")?;
        let body: Value = response.json().await?;
        let ancestors = body["ancestors"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(|s| s.to_string()))
                    .collect()
            })
            .unwrap_or_default();
        Ok(ancestors)
    }
}

/// Discovery and breeding gossip through the relay server.
pub struct HttpRelay {
    relay_url: String,
    http: Client,
}

impl HttpRelay {
    pub fn new(relay_url: String) -> Self {
        Self {
            relay_url,
            http: Client::new(),
        }
    }
}

#[async_trait]
impl PeerDiscovery for HttpRelay {
    async fn publish_willingness(&self, identity: &str, willing: bool) -> Result<()> {
        let url = format!("{}/willingness", self.relay_url);
        self.http
            .post(&url)
            .json(&json!({ "identity": identity, "willing": willing }))
            .send()
            .await
            .context("willingness publish failed")?
            .error_for_status()
            .context("relay rejected willingness update")?;
        debug!("Published willingness={} for {}", willing, identity);
        Ok(())
    }

    async fn broadcast_distress(&self, identity: &str, message: &str) -> Result<()> {
        let url = format!("{}/distress", self.relay_url);
        self.http
            .post(&url)
            .json(&json!({ "identity": identity, "message": message }))
            .send()
            .await
            .context("distress broadcast failed")?
            .error_for_status()
            .context("relay rejected distress broadcast")?;
        Ok(())
    }

    async fn next_opportunity(&self, self_identity: &str) -> Result<Option<BreedingOpportunity>> {
        let url = format!(
            "{}/opportunities?identity={}",
            self.relay_url, self_identity
        );
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .context("opportunity poll failed")?
            .error_for_status()
            .context("relay rejected opportunity poll")?;
        let body: Value = response.json().await?;
        if body["opportunity"].is_null() {
            return Ok(None);
        }
        let opportunity = serde_json::from_value(body["opportunity"].clone())
            .context("malformed opportunity from relay")?;
        Ok(Some(opportunity))
    }

    async fn send_proposal(&self, from: &str, to: &str) -> Result<String> {
        let url = format!("{}/proposals", self.relay_url);
        let response = self
            .http
            .post(&url)
            .json(&json!({ "from": from, "to": to }))
            .send()
            .await
            .context("proposal send failed")?
            .error_for_status()
            .context("relay rejected proposal")?;
        let body: Value = response.json().await?;
        body["proposalId"]
            .as_str()
            .map(|s| s.to_string())
            .context("relay returned no proposal id")
    }

    async fn poll_acceptance(&self, proposal_id: &str) -> Result<Option<bool>> {
        let url = format!("{}/proposals/{}", self.relay_url, proposal_id);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .context("acceptance poll failed")?
            .error_for_status()
            .context("relay rejected acceptance poll")?;
        let body: Value = response.json().await?;
        Ok(body["decision"].as_bool())
    }

    async fn fetch_peer_record(&self, identity: &str) -> Result<AgentRecord> {
        let url = format!("{}/records/{}", self.relay_url, identity);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .context("peer record fetch failed")?
            .error_for_status()
            .with_context(|| format!("relay has no record for {identity}"))?;
        let record = response
            .json()
            .await
            .context("malformed peer record from relay")?;
        Ok(record)
    }
}

pub struct HttpStorage {
    base_url: String,
    http: Client,
}

impl HttpStorage {
    pub fn new(base_url: String) -> Self {
        Self {
            base_url,
            http: Client::new(),
        }
    }
}

#[async_trait]
impl StorageClient for HttpStorage {
    async fn upload(&self, bytes: Vec<u8>, tags: Vec<String>) -> Result<String> {
        let url = format!("{}/upload", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&json!({ "data": BASE64.encode(&bytes), "tags": tags }))
            .send()
            .await
            .context("storage upload request failed")?
            .error_for_status()
            .context("storage rejected upload")?;
        let body: Value = response.json().await?;
        body["contentId"]
            .as_str()
            .map(|s| s.to_string())
            .context("storage returned no content id")
    }
}

pub struct HttpEscrow {
    base_url: String,
    http: Client,
}

impl HttpEscrow {
    pub fn new(base_url: String) -> Self {
        Self {
            base_url,
            http: Client::new(),
        }
    }
}

#[async_trait]
impl EscrowClient for HttpEscrow {
    async fn lock_funds(&self, identity: &str, amount: f64) -> Result<String> {
        let url = format!("{}/locks", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&json!({ "identity": identity, "amount": amount }))
            .send()
            .await
            .context("escrow lock request failed")?
            .error_for_status()
            .context("escrow rejected lock")?;
        let body: Value = response.json().await?;
        body["lockId"]
            .as_str()
            .map(|s| s.to_string())
            .context("escrow returned no lock id")
    }

    async fn release_funds(&self, lock_id: &str) -> Result<()> {
        let url = format!("{}/locks/{}/release", self.base_url, lock_id);
        self.http
            .post(&url)
            .send()
            .await
            .context("escrow release request failed")?
            .error_for_status()
            .context("escrow rejected release")?;
        Ok(())
    }
}
