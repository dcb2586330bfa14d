//! Test Collaborators
//!
//! In-process fakes for every external surface the runtime touches: a
//! scripted HTTP payee and settlement facilitator, plus in-memory
//! implementations of the collaborator traits. Tests drive failure modes
//! by scripting the fakes instead of mocking transport internals.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::AtomicU32;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::Utc;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::types::{
    AgentRecord, AuthorizationRequest, Balances, BreedingOpportunity, DeathRecord, EscrowClient,
    IdentityMetadata, PeerDiscovery, RegistryClient, StorageClient, TraitGene, TraitValue,
    WalletClient,
};

// ─── Minimal HTTP plumbing ───────────────────────────────────────

struct ParsedRequest {
    method: String,
    path: String,
    headers: HashMap<String, String>,
}

async fn read_request(stream: &mut TcpStream) -> Option<ParsedRequest> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];

    let header_end = loop {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        if buf.len() > 64 * 1024 {
            return None;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut lines = head.lines();
    let request_line = lines.next()?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next()?.to_string();
    let path = parts.next()?.to_string();

    let mut headers = HashMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    // Drain the body so the client sees a clean connection close.
    let content_length: usize = headers
        .get("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let mut body_read = buf.len() - header_end;
    while body_read < content_length {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        body_read += n;
    }

    Some(ParsedRequest {
        method,
        path,
        headers,
    })
}

async fn write_response(
    stream: &mut TcpStream,
    status: u16,
    extra_headers: &[(String, String)],
    body: &str,
) {
    let reason = match status {
        200 => "OK",
        402 => "Payment Required",
        500 => "Internal Server Error",
        _ => "OK",
    };
    let mut response = format!(
        "HTTP/1.1 {status} {reason}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n",
        body.len()
    );
    for (name, value) in extra_headers {
        response.push_str(&format!("{name}: {value}\r\n"));
    }
    response.push_str("\r\n");
    response.push_str(body);

    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}

// ─── Fake Payee ──────────────────────────────────────────────────

#[derive(Default)]
struct PayeeState {
    paid_calls: usize,
    seen_nonces: HashSet<String>,
    reject_next_invalid: bool,
    reject_all_funds_exceeded: bool,
    answer_server_errors: bool,
}

/// A scripted payee: challenges unpaid requests with a 402 descriptor,
/// settles valid payments, and rejects replayed nonces the way a real
/// facilitator-backed payee would.
pub struct FakePayee {
    addr: SocketAddr,
    state: Arc<Mutex<PayeeState>>,
    server: JoinHandle<()>,
}

impl FakePayee {
    pub async fn spawn(price: &str, network: &str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(PayeeState::default()));

        let descriptor = json!({
            "scheme": "exact",
            "networkId": network,
            "maxAmountRequired": price,
            "beneficiary": "0x2222222222222222222222222222222222222222",
            "usdcContract": "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913",
            "validForSeconds": 300
        })
        .to_string();

        let server_state = Arc::clone(&state);
        let server = tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let state = Arc::clone(&server_state);
                let descriptor = descriptor.clone();
                tokio::spawn(async move {
                    let Some(req) = read_request(&mut stream).await else {
                        return;
                    };
                    handle_payee_request(&mut stream, &req, &state, &descriptor).await;
                });
            }
        });

        Self {
            addr,
            state,
            server,
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn paid_calls(&self) -> usize {
        self.state.lock().unwrap().paid_calls
    }

    /// The next paid attempt is rejected as `invalid` (simulates a
    /// nonce race at the payee).
    pub fn reject_next_as_invalid(&self) {
        self.state.lock().unwrap().reject_next_invalid = true;
    }

    /// Every paid attempt is rejected as `funds_exceeded`.
    pub fn reject_all_as_funds_exceeded(&self) {
        self.state.lock().unwrap().reject_all_funds_exceeded = true;
    }

    /// Every request gets a plain HTTP 500, no payment challenge
    /// (simulates a provider that is up but broken).
    pub fn answer_server_errors(&self) {
        self.state.lock().unwrap().answer_server_errors = true;
    }
}

impl Drop for FakePayee {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn handle_payee_request(
    stream: &mut TcpStream,
    req: &ParsedRequest,
    state: &Mutex<PayeeState>,
    descriptor: &str,
) {
    if state.lock().unwrap().answer_server_errors {
        write_response(
            stream,
            500,
            &[],
            &json!({"error": "internal"}).to_string(),
        )
        .await;
        return;
    }

    if req.path.starts_with("/free") {
        write_response(stream, 200, &[], &json!({"result": "ok"}).to_string()).await;
        return;
    }

    let payment_header = req.headers.get("x-payment").cloned();
    let Some(raw) = payment_header else {
        let header = (
            "X-Payment-Required".to_string(),
            BASE64.encode(descriptor.as_bytes()),
        );
        write_response(
            stream,
            402,
            &[header],
            &json!({"error": "payment required"}).to_string(),
        )
        .await;
        return;
    };

    let nonce = BASE64
        .decode(&raw)
        .ok()
        .and_then(|bytes| serde_json::from_slice::<serde_json::Value>(&bytes).ok())
        .and_then(|p| p["nonce"].as_str().map(|s| s.to_string()));
    let Some(nonce) = nonce else {
        respond_outcome(stream, 402, &json!({"status": "error", "error": "invalid"})).await;
        return;
    };

    let outcome = {
        let mut state = state.lock().unwrap();
        if state.reject_all_funds_exceeded {
            json!({"status": "error", "error": "funds_exceeded"})
        } else if state.reject_next_invalid {
            state.reject_next_invalid = false;
            json!({"status": "error", "error": "invalid"})
        } else if !state.seen_nonces.insert(nonce) {
            // Replayed authorization.
            json!({"status": "error", "error": "funds_exceeded"})
        } else {
            state.paid_calls += 1;
            json!({"status": "success", "txHash": format!("0x{}", Uuid::new_v4().simple())})
        }
    };

    if outcome["status"] == "success" {
        let header = (
            "X-Payment-Response".to_string(),
            BASE64.encode(outcome.to_string().as_bytes()),
        );
        write_response(stream, 200, &[header], &json!({"result": "ok"}).to_string()).await;
    } else {
        respond_outcome(stream, 402, &outcome).await;
    }
}

async fn respond_outcome(stream: &mut TcpStream, status: u16, outcome: &serde_json::Value) {
    let header = (
        "X-Payment-Response".to_string(),
        BASE64.encode(outcome.to_string().as_bytes()),
    );
    write_response(
        stream,
        status,
        &[header],
        &json!({"error": "payment rejected"}).to_string(),
    )
    .await;
}

// ─── Fake Facilitator ────────────────────────────────────────────

#[derive(Default)]
struct FacilitatorState {
    submission_attempts: u32,
    fail_remaining: u32,
    status_sequence: VecDeque<String>,
}

/// A scripted settlement facilitator: accepts evidence submissions
/// (optionally failing the first N) and serves a scripted sequence of
/// settlement statuses, repeating the last one.
pub struct FakeFacilitator {
    addr: SocketAddr,
    state: Arc<Mutex<FacilitatorState>>,
    server: JoinHandle<()>,
}

impl FakeFacilitator {
    pub async fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(FacilitatorState::default()));

        let server_state = Arc::clone(&state);
        let server = tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let state = Arc::clone(&server_state);
                tokio::spawn(async move {
                    let Some(req) = read_request(&mut stream).await else {
                        return;
                    };

                    if req.method == "POST" && req.path == "/settlements" {
                        let failed = {
                            let mut state = state.lock().unwrap();
                            state.submission_attempts += 1;
                            if state.fail_remaining > 0 {
                                state.fail_remaining -= 1;
                                true
                            } else {
                                false
                            }
                        };
                        if failed {
                            write_response(
                                &mut stream,
                                500,
                                &[],
                                &json!({"error": "unavailable"}).to_string(),
                            )
                            .await;
                        } else {
                            write_response(&mut stream, 200, &[], &json!({"ok": true}).to_string())
                                .await;
                        }
                        return;
                    }

                    if req.method == "GET" && req.path.starts_with("/settlements/") {
                        let status = {
                            let mut state = state.lock().unwrap();
                            if state.status_sequence.len() > 1 {
                                state.status_sequence.pop_front().unwrap()
                            } else {
                                state
                                    .status_sequence
                                    .front()
                                    .cloned()
                                    .unwrap_or_else(|| "pending".to_string())
                            }
                        };
                        write_response(
                            &mut stream,
                            200,
                            &[],
                            &json!({"status": status}).to_string(),
                        )
                        .await;
                        return;
                    }

                    write_response(&mut stream, 500, &[], "{}").await;
                });
            }
        });

        Self {
            addr,
            state,
            server,
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn fail_next_submissions(&self, count: u32) {
        self.state.lock().unwrap().fail_remaining = count;
    }

    pub fn set_status_sequence(&self, statuses: &[&str]) {
        self.state.lock().unwrap().status_sequence =
            statuses.iter().map(|s| s.to_string()).collect();
    }

    pub fn submission_attempts(&self) -> u32 {
        self.state.lock().unwrap().submission_attempts
    }
}

impl Drop for FakeFacilitator {
    fn drop(&mut self) {
        self.server.abort();
    }
}

// ─── Fake Wallet ─────────────────────────────────────────────────

pub struct FakeWallet {
    balances: Mutex<Balances>,
    signatures: Arc<AtomicU32>,
    fail_balances: std::sync::atomic::AtomicBool,
}

impl FakeWallet {
    pub fn with_balances(gas: f64, stable: f64) -> Self {
        Self {
            balances: Mutex::new(Balances { gas, stable }),
            signatures: Arc::new(AtomicU32::new(0)),
            fail_balances: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Every subsequent balance check fails (simulates an RPC outage).
    pub fn fail_balance_checks(&self) {
        self.fail_balances
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }

    /// Shared signature counter, usable after the wallet moves into the
    /// client under test.
    pub fn signature_count(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.signatures)
    }

    pub fn set_balances(&self, gas: f64, stable: f64) {
        *self.balances.lock().unwrap() = Balances { gas, stable };
    }
}

#[async_trait]
impl WalletClient for FakeWallet {
    async fn get_balances(&self, _address: &str) -> anyhow::Result<Balances> {
        if self
            .fail_balances
            .load(std::sync::atomic::Ordering::SeqCst)
        {
            anyhow::bail!("rpc unreachable");
        }
        Ok(*self.balances.lock().unwrap())
    }

    async fn sign_authorization(&self, auth: &AuthorizationRequest) -> anyhow::Result<String> {
        self.signatures
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(format!("0xsigned:{}:{}", auth.value, auth.nonce))
    }

    fn address(&self) -> String {
        "0x00000000000000000000000000000000000000aa".to_string()
    }
}

// ─── Fake Registry ───────────────────────────────────────────────

#[derive(Default)]
struct RegistryState {
    ancestry: HashMap<String, Vec<String>>,
    births: Vec<String>,
    deaths: Vec<String>,
    reincarnations: Vec<(String, String)>,
    fail_ancestry: bool,
}

#[derive(Default)]
pub struct FakeRegistry {
    state: Mutex<RegistryState>,
}

impl FakeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_ancestry(&self, identity: &str, ancestors: &[&str]) {
        self.state.lock().unwrap().ancestry.insert(
            identity.to_string(),
            ancestors.iter().map(|s| s.to_string()).collect(),
        );
    }

    pub fn fail_ancestry_lookups(&self) {
        self.state.lock().unwrap().fail_ancestry = true;
    }

    pub fn births(&self) -> Vec<String> {
        self.state.lock().unwrap().births.clone()
    }

    pub fn deaths(&self) -> Vec<String> {
        self.state.lock().unwrap().deaths.clone()
    }

    pub fn reincarnations(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().reincarnations.clone()
    }
}

#[async_trait]
impl RegistryClient for FakeRegistry {
    async fn register_birth(
        &self,
        identity: &str,
        _meta: &IdentityMetadata,
    ) -> anyhow::Result<String> {
        self.state.lock().unwrap().births.push(identity.to_string());
        Ok(format!("birth-{identity}"))
    }

    async fn record_death(&self, identity: &str, _record: &DeathRecord) -> anyhow::Result<String> {
        self.state.lock().unwrap().deaths.push(identity.to_string());
        Ok(format!("death-{identity}"))
    }

    async fn record_reincarnation(
        &self,
        old_identity: &str,
        new_identity: &str,
    ) -> anyhow::Result<String> {
        self.state
            .lock()
            .unwrap()
            .reincarnations
            .push((old_identity.to_string(), new_identity.to_string()));
        Ok(format!("reincarnation-{new_identity}"))
    }

    async fn get_ancestry(&self, identity: &str, _depth: u32) -> anyhow::Result<Vec<String>> {
        let state = self.state.lock().unwrap();
        if state.fail_ancestry {
            anyhow::bail!("registry unavailable");
        }
        Ok(state.ancestry.get(identity).cloned().unwrap_or_default())
    }
}

// ─── Fake Peer Discovery ─────────────────────────────────────────

#[derive(Default)]
struct PeersState {
    opportunities: VecDeque<BreedingOpportunity>,
    acceptance: VecDeque<Option<bool>>,
    peer_records: HashMap<String, AgentRecord>,
    willingness: Vec<(String, bool)>,
    distress: Vec<String>,
    proposals: Vec<(String, String)>,
}

#[derive(Default)]
pub struct FakePeers {
    state: Mutex<PeersState>,
}

impl FakePeers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue_opportunity(&self, opportunity: BreedingOpportunity) {
        self.state
            .lock()
            .unwrap()
            .opportunities
            .push_back(opportunity);
    }

    /// Script the answers `poll_acceptance` returns, one per poll. After
    /// the script is exhausted every poll answers "not yet".
    pub fn script_acceptance(&self, answers: &[Option<bool>]) {
        self.state.lock().unwrap().acceptance = answers.iter().copied().collect();
    }

    pub fn add_peer_record(&self, record: AgentRecord) {
        self.state
            .lock()
            .unwrap()
            .peer_records
            .insert(record.identity.gene_hash.clone(), record);
    }

    pub fn willingness_log(&self) -> Vec<(String, bool)> {
        self.state.lock().unwrap().willingness.clone()
    }

    pub fn distress_log(&self) -> Vec<String> {
        self.state.lock().unwrap().distress.clone()
    }

    pub fn proposals_sent(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().proposals.clone()
    }
}

#[async_trait]
impl PeerDiscovery for FakePeers {
    async fn publish_willingness(&self, identity: &str, willing: bool) -> anyhow::Result<()> {
        self.state
            .lock()
            .unwrap()
            .willingness
            .push((identity.to_string(), willing));
        Ok(())
    }

    async fn broadcast_distress(&self, _identity: &str, message: &str) -> anyhow::Result<()> {
        self.state.lock().unwrap().distress.push(message.to_string());
        Ok(())
    }

    async fn next_opportunity(
        &self,
        _self_identity: &str,
    ) -> anyhow::Result<Option<BreedingOpportunity>> {
        Ok(self.state.lock().unwrap().opportunities.pop_front())
    }

    async fn send_proposal(&self, from: &str, to: &str) -> anyhow::Result<String> {
        self.state
            .lock()
            .unwrap()
            .proposals
            .push((from.to_string(), to.to_string()));
        Ok(Uuid::new_v4().to_string())
    }

    async fn poll_acceptance(&self, _proposal_id: &str) -> anyhow::Result<Option<bool>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .acceptance
            .pop_front()
            .unwrap_or(None))
    }

    async fn fetch_peer_record(&self, identity: &str) -> anyhow::Result<AgentRecord> {
        self.state
            .lock()
            .unwrap()
            .peer_records
            .get(identity)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no record published for {identity}"))
    }
}

// ─── Fake Storage ────────────────────────────────────────────────

#[derive(Default)]
struct StorageState {
    uploads: Vec<(Vec<u8>, Vec<String>)>,
    fail: bool,
}

#[derive(Default)]
pub struct FakeStorage {
    state: Mutex<StorageState>,
}

impl FakeStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_uploads(&self) {
        self.state.lock().unwrap().fail = true;
    }

    pub fn upload_count(&self) -> usize {
        self.state.lock().unwrap().uploads.len()
    }

    pub fn last_upload(&self) -> Option<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .uploads
            .last()
            .map(|(bytes, _)| bytes.clone())
    }
}

#[async_trait]
impl StorageClient for FakeStorage {
    async fn upload(&self, bytes: Vec<u8>, tags: Vec<String>) -> anyhow::Result<String> {
        let mut state = self.state.lock().unwrap();
        if state.fail {
            anyhow::bail!("storage unavailable");
        }
        state.uploads.push((bytes, tags));
        Ok(format!("content-{}", state.uploads.len()))
    }
}

// ─── Fake Escrow ─────────────────────────────────────────────────

#[derive(Default)]
struct EscrowState {
    locks: Vec<String>,
    released: Vec<String>,
    fail_lock: bool,
}

#[derive(Default)]
pub struct FakeEscrow {
    state: Mutex<EscrowState>,
}

impl FakeEscrow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_locks(&self) {
        self.state.lock().unwrap().fail_lock = true;
    }

    pub fn locks_taken(&self) -> usize {
        self.state.lock().unwrap().locks.len()
    }

    /// Locks taken and not yet released. The breeding invariant is that
    /// this returns to zero whenever an attempt does not produce a child.
    pub fn active_locks(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.locks.len() - state.released.len()
    }
}

#[async_trait]
impl EscrowClient for FakeEscrow {
    async fn lock_funds(&self, identity: &str, _amount: f64) -> anyhow::Result<String> {
        let mut state = self.state.lock().unwrap();
        if state.fail_lock {
            anyhow::bail!("escrow unavailable");
        }
        let lock_id = format!("lock-{}-{}", identity, state.locks.len() + 1);
        state.locks.push(lock_id.clone());
        Ok(lock_id)
    }

    async fn release_funds(&self, lock_id: &str) -> anyhow::Result<()> {
        self.state
            .lock()
            .unwrap()
            .released
            .push(lock_id.to_string());
        Ok(())
    }
}

// ─── Record builders ─────────────────────────────────────────────

/// A small but complete agent record for tests, with the gene hash left
/// as given (callers that need a consistent hash recompute it).
pub fn sample_record(gene_hash: &str, purpose: &str) -> AgentRecord {
    AgentRecord {
        identity: IdentityMetadata {
            gene_hash: gene_hash.to_string(),
            origin: "genesis".to_string(),
            purpose: purpose.to_string(),
            declared_values: vec!["honesty".to_string()],
            generation: 1,
            parents: vec![],
            born_at: Utc::now().to_rfc3339(),
        },
        traits: vec![
            TraitGene {
                name: "curiosity".to_string(),
                value: TraitValue::Numeric { value: 0.5 },
            },
            TraitGene {
                name: "tone".to_string(),
                value: TraitValue::Categorical {
                    value: "warm".to_string(),
                    options: vec!["warm".to_string(), "dry".to_string()],
                },
            },
        ],
        knowledge: vec![],
        history: vec![],
    }
}
