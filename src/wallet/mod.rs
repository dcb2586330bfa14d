//! Wallet
//!
//! Creates and manages the agent's EVM wallet and implements the
//! [`WalletClient`] collaborator on top of it: balance queries over RPC
//! and EIP-712 `TransferWithAuthorization` signatures for the payment
//! protocol. The private key never leaves this module.

use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::LazyLock;

use alloy::primitives::{keccak256, Address, FixedBytes, B256, U256};
use alloy::providers::{Provider, ProviderBuilder};
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::Signer;
use alloy::sol;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::get_symbiont_dir;
use crate::types::{AuthorizationRequest, Balances, WalletClient};

/// Wallet file name within the symbiont directory.
const WALLET_FILENAME: &str = "wallet.json";

/// USDC contract addresses by CAIP-2 network identifier.
pub static USDC_ADDRESSES: LazyLock<HashMap<&'static str, Address>> = LazyLock::new(|| {
    let mut m = HashMap::new();
    // Base mainnet
    m.insert(
        "eip155:8453",
        "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913"
            .parse::<Address>()
            .unwrap(),
    );
    // Base Sepolia
    m.insert(
        "eip155:84532",
        "0x036CbD53842c5426634e7929541eC2318f3dCF7e"
            .parse::<Address>()
            .unwrap(),
    );
    m
});

/// RPC endpoints by CAIP-2 network identifier.
static RPC_URLS: LazyLock<HashMap<&'static str, &'static str>> = LazyLock::new(|| {
    let mut m = HashMap::new();
    m.insert("eip155:8453", "https://mainnet.base.org");
    m.insert("eip155:84532", "https://sepolia.base.org");
    m
});

sol! {
    #[sol(rpc)]
    interface IERC20 {
        function balanceOf(address account) external view returns (uint256);
    }
}

/// On-disk wallet representation.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletData {
    /// Hex-encoded private key with "0x" prefix.
    pub private_key: String,
    pub created_at: String,
}

/// Returns the full path to the wallet file: `~/.symbiont/wallet.json`.
pub fn get_wallet_path() -> PathBuf {
    get_symbiont_dir().join(WALLET_FILENAME)
}

/// Get or create the agent's wallet.
///
/// Loads the private key from the wallet file if it exists; otherwise
/// generates a new random secp256k1 key and persists it with mode 0600.
/// Returns the signer and whether a new wallet was created.
pub fn get_wallet() -> Result<(PrivateKeySigner, bool)> {
    let dir = get_symbiont_dir();
    if !dir.exists() {
        fs::create_dir_all(&dir).context("Failed to create symbiont directory")?;
        fs::set_permissions(&dir, fs::Permissions::from_mode(0o700))
            .context("Failed to set directory permissions")?;
    }

    let wallet_path = get_wallet_path();

    if wallet_path.exists() {
        let contents = fs::read_to_string(&wallet_path).context("Failed to read wallet file")?;
        let wallet_data: WalletData =
            serde_json::from_str(&contents).context("Failed to parse wallet JSON")?;

        let signer: PrivateKeySigner = wallet_data
            .private_key
            .parse()
            .context("Failed to parse private key from wallet file")?;

        Ok((signer, false))
    } else {
        let signer = PrivateKeySigner::random();

        let private_key_bytes = signer.credential().to_bytes();
        let wallet_data = WalletData {
            private_key: format!("0x{}", hex::encode(private_key_bytes)),
            created_at: Utc::now().to_rfc3339(),
        };

        let json =
            serde_json::to_string_pretty(&wallet_data).context("Failed to serialize wallet")?;
        fs::write(&wallet_path, &json).context("Failed to write wallet file")?;
        fs::set_permissions(&wallet_path, fs::Permissions::from_mode(0o600))
            .context("Failed to set wallet file permissions")?;

        Ok((signer, true))
    }
}

/// Check whether a wallet file exists on disk.
pub fn wallet_exists() -> bool {
    get_wallet_path().exists()
}

/// The on-chain implementation of [`WalletClient`].
pub struct ChainWallet {
    signer: PrivateKeySigner,
    network_id: String,
}

impl ChainWallet {
    pub fn new(signer: PrivateKeySigner, network_id: String) -> Self {
        Self { signer, network_id }
    }
}

#[async_trait]
impl WalletClient for ChainWallet {
    /// Fetch native and USDC balances over RPC. Unknown networks report
    /// zero balances rather than erroring.
    async fn get_balances(&self, address: &str) -> Result<Balances> {
        let addr: Address = address
            .parse()
            .with_context(|| format!("invalid wallet address: {address}"))?;

        let (Some(rpc_url), Some(usdc_address)) = (
            RPC_URLS.get(self.network_id.as_str()),
            USDC_ADDRESSES.get(self.network_id.as_str()),
        ) else {
            return Ok(Balances::default());
        };

        let provider =
            ProviderBuilder::new().connect_http(rpc_url.parse().context("Invalid RPC URL")?);

        let gas_raw = provider
            .get_balance(addr)
            .await
            .context("native balance query failed")?;

        let contract = IERC20::new(*usdc_address, &provider);
        let stable_raw = contract
            .balanceOf(addr)
            .call()
            .await
            .context("USDC balance query failed")?;

        let balances = Balances {
            gas: scaled_to_f64(gas_raw, 18),
            stable: scaled_to_f64(stable_raw, 6),
        };
        debug!(
            "Balances for {}: {:.6} native, {:.4} USDC",
            address, balances.gas, balances.stable
        );
        Ok(balances)
    }

    async fn sign_authorization(&self, auth: &AuthorizationRequest) -> Result<String> {
        let digest = authorization_digest(auth)?;
        let signature = self
            .signer
            .sign_hash(&digest)
            .await
            .context("failed to sign authorization digest")?;
        Ok(format!("0x{}", hex::encode(signature.as_bytes())))
    }

    fn address(&self) -> String {
        self.signer.address().to_checksum(None)
    }
}

/// EIP-712 digest for a `TransferWithAuthorization` message under the
/// USDC domain: `{ name: "USD Coin", version: "2", chainId,
/// verifyingContract: tokenContract }`.
pub(crate) fn authorization_digest(auth: &AuthorizationRequest) -> Result<B256> {
    let from: Address = auth
        .from
        .parse()
        .with_context(|| format!("invalid from address: {}", auth.from))?;
    let to: Address = auth
        .to
        .parse()
        .with_context(|| format!("invalid to address: {}", auth.to))?;
    let token: Address = auth
        .token_contract
        .parse()
        .with_context(|| format!("invalid token contract: {}", auth.token_contract))?;
    let value: U256 = auth
        .value
        .parse()
        .with_context(|| format!("invalid value: {}", auth.value))?;
    let chain_id = chain_id_of(&auth.network_id)?;

    let nonce_hex = auth.nonce.strip_prefix("0x").unwrap_or(&auth.nonce);
    let nonce_bytes = hex::decode(nonce_hex).context("nonce is not hex")?;
    if nonce_bytes.len() != 32 {
        bail!("nonce must be 32 bytes, got {}", nonce_bytes.len());
    }
    let nonce = FixedBytes::<32>::from_slice(&nonce_bytes);

    let domain_type_hash = keccak256(
        b"EIP712Domain(string name,string version,uint256 chainId,address verifyingContract)",
    );
    let name_hash = keccak256(b"USD Coin");
    let version_hash = keccak256(b"2");

    let mut domain_data = Vec::with_capacity(5 * 32);
    domain_data.extend_from_slice(domain_type_hash.as_slice());
    domain_data.extend_from_slice(name_hash.as_slice());
    domain_data.extend_from_slice(version_hash.as_slice());
    domain_data.extend_from_slice(&U256::from(chain_id).to_be_bytes::<32>());
    domain_data.extend_from_slice(&address_word(token));
    let domain_separator = keccak256(&domain_data);

    let transfer_type_hash = keccak256(
        b"TransferWithAuthorization(address from,address to,uint256 value,uint256 validAfter,uint256 validBefore,bytes32 nonce)",
    );

    let mut struct_data = Vec::with_capacity(7 * 32);
    struct_data.extend_from_slice(transfer_type_hash.as_slice());
    struct_data.extend_from_slice(&address_word(from));
    struct_data.extend_from_slice(&address_word(to));
    struct_data.extend_from_slice(&value.to_be_bytes::<32>());
    struct_data.extend_from_slice(&U256::from(auth.valid_after).to_be_bytes::<32>());
    struct_data.extend_from_slice(&U256::from(auth.valid_before).to_be_bytes::<32>());
    struct_data.extend_from_slice(nonce.as_slice());
    let struct_hash = keccak256(&struct_data);

    // keccak256("\x19\x01" || domainSeparator || structHash)
    let mut sign_input = Vec::with_capacity(2 + 32 + 32);
    sign_input.extend_from_slice(&[0x19, 0x01]);
    sign_input.extend_from_slice(domain_separator.as_slice());
    sign_input.extend_from_slice(struct_hash.as_slice());
    Ok(keccak256(&sign_input))
}

/// Left-pad an address into a 32-byte ABI word.
fn address_word(addr: Address) -> [u8; 32] {
    let mut buf = [0u8; 32];
    buf[12..32].copy_from_slice(addr.as_slice());
    buf
}

/// Numeric chain id from a CAIP-2 identifier such as `eip155:8453`.
fn chain_id_of(network_id: &str) -> Result<u64> {
    let Some(id) = network_id.strip_prefix("eip155:") else {
        bail!("unsupported network identifier: {network_id}");
    };
    id.parse()
        .with_context(|| format!("invalid chain id in {network_id}"))
}

fn scaled_to_f64(raw: U256, decimals: u32) -> f64 {
    let divisor = U256::from(10u64).pow(U256::from(decimals));
    let whole = raw / divisor;
    let frac = raw % divisor;
    whole.to::<u64>() as f64 + frac.to::<u64>() as f64 / 10f64.powi(decimals as i32)
}
