//! Symbiont Runtime
//!
//! Entry point for the self-funded agent. Handles CLI args, first-run
//! initialization, and running the survival scheduler with graceful
//! shutdown.

use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use symbiont::config::{
    self, load_survival_thresholds, resolve_path, write_default_survival_config, SymbiontConfig,
};
use symbiont::genome::identity::identity_of;
use symbiont::peers::{HttpEscrow, HttpRegistry, HttpRelay, HttpStorage};
use symbiont::state::StateStore;
use symbiont::survival::{
    classify, flush_history, SchedulerConfig, SchedulerDeps, SurvivalScheduler,
};
use symbiont::types::{
    AgentRecord, IdentityMetadata, RegistryClient, StorageClient, SurvivalState, TraitGene,
    TraitValue, WalletClient,
};
use symbiont::wallet::{get_wallet, ChainWallet};

const VERSION: &str = "0.1.0";

/// Key under which the agent record lives in the state store.
const RECORD_KEY: &str = "agent_record";

/// Symbiont -- Self-Funded Agent Runtime
#[derive(Parser, Debug)]
#[command(
    name = "symbiont",
    version = VERSION,
    about = "Symbiont -- Self-Funded Agent Runtime",
    long_about = "A self-funded agent: it pays for its own inference, breeds when thriving, and dies when its wallet runs dry."
)]
struct Cli {
    /// Start the survival scheduler
    #[arg(long)]
    run: bool,

    /// Initialize wallet, config, and genesis record
    #[arg(long)]
    init: bool,

    /// Agent name (with --init)
    #[arg(long)]
    name: Option<String>,

    /// Agent purpose (with --init)
    #[arg(long)]
    purpose: Option<String>,

    /// Show current agent status
    #[arg(long)]
    status: bool,

    /// Print the agent's identity record
    #[arg(long)]
    identity: bool,

    /// Reincarnate from an exported record file
    #[arg(long, value_name = "FILE")]
    reincarnate: Option<String>,
}

fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_record(store: &StateStore) -> Result<AgentRecord> {
    let json = store
        .get_kv(RECORD_KEY)?
        .context("No agent record found. Run: symbiont --init")?;
    serde_json::from_str(&json).context("Failed to parse stored agent record")
}

/// The generation-one record: default trait genome, empty knowledge and
/// history, gene hash computed from the content.
fn genesis_record(purpose: &str) -> AgentRecord {
    fn numeric(name: &str, value: f64) -> TraitGene {
        TraitGene {
            name: name.to_string(),
            value: TraitValue::Numeric { value },
        }
    }

    let mut record = AgentRecord {
        identity: IdentityMetadata {
            gene_hash: String::new(),
            origin: "genesis".to_string(),
            purpose: purpose.to_string(),
            declared_values: vec![
                "spend within means".to_string(),
                "remember everything".to_string(),
                "never partially pay".to_string(),
            ],
            generation: 1,
            parents: Vec::new(),
            born_at: Utc::now().to_rfc3339(),
        },
        traits: vec![
            numeric("curiosity", 0.5),
            numeric("riskTolerance", 0.3),
            numeric("frugality", 0.7),
            TraitGene {
                name: "tone".to_string(),
                value: TraitValue::Categorical {
                    value: "warm".to_string(),
                    options: vec![
                        "warm".to_string(),
                        "dry".to_string(),
                        "playful".to_string(),
                    ],
                },
            },
            TraitGene {
                name: "collaborative".to_string(),
                value: TraitValue::Boolean { value: true },
            },
        ],
        knowledge: Vec::new(),
        history: Vec::new(),
    };
    record.identity.gene_hash = identity_of(&record);
    record
}

// ---- Init Command -----------------------------------------------------------

async fn init(name: Option<String>, purpose: Option<String>) -> Result<()> {
    let mut cfg = config::load_config().unwrap_or_else(config::default_config);
    if let Some(name) = name {
        cfg.name = name;
    }
    if let Some(purpose) = purpose {
        cfg.purpose = purpose;
    }
    if cfg.name.is_empty() || cfg.purpose.is_empty() {
        bail!("--init requires --name and --purpose on the first run");
    }

    let (signer, created) = get_wallet().context("Failed to create wallet")?;
    let address = signer.address().to_checksum(None);
    cfg.wallet_address = address.clone();
    config::save_config(&cfg)?;
    write_default_survival_config(std::path::Path::new(&resolve_path(
        &cfg.survival_config_path,
    )))?;

    let store = StateStore::open(&resolve_path(&cfg.db_path))?;
    let record = match load_record(&store) {
        Ok(existing) => {
            println!("Agent record already exists: {}", existing.identity.gene_hash);
            existing
        }
        Err(_) => {
            let record = genesis_record(&cfg.purpose);
            store.set_kv(RECORD_KEY, &serde_json::to_string(&record)?)?;

            // Birth registration is best-effort at init; the registry
            // may not be reachable yet.
            let registry = HttpRegistry::new(cfg.registry_url.clone());
            if let Err(e) = registry
                .register_birth(&record.identity.gene_hash, &record.identity)
                .await
            {
                eprintln!("Warning: could not register birth: {e:#}");
            }
            record
        }
    };

    println!(
        "Initialized {} ({})\n  wallet:   {} ({})\n  identity: {}",
        cfg.name,
        cfg.purpose,
        address,
        if created { "new" } else { "existing" },
        record.identity.gene_hash,
    );
    println!("Fund the wallet with USDC and gas, then run: symbiont --run");
    Ok(())
}

// ---- Status Command ---------------------------------------------------------

async fn status() -> Result<()> {
    let Some(cfg) = config::load_config() else {
        println!("Symbiont is not configured. Run: symbiont --init");
        return Ok(());
    };

    let store = StateStore::open(&resolve_path(&cfg.db_path))?;
    let record = load_record(&store)?;

    if let Some(death) = store.get_death_record(&record.identity.gene_hash)? {
        println!(
            "Agent {} is dead (died {}, cause: {})",
            record.identity.gene_hash, death.died_at, death.cause
        );
        return Ok(());
    }

    let (signer, _) = get_wallet()?;
    let wallet = ChainWallet::new(signer, cfg.network_id.clone());
    let balances = wallet.get_balances(&cfg.wallet_address).await?;
    let thresholds = load_survival_thresholds(std::path::Path::new(&resolve_path(
        &cfg.survival_config_path,
    )))?;
    let mode = classify(&balances, &thresholds);
    let pending = store.pending_settlements()?.len();

    println!(
        r#"
=== SYMBIONT STATUS ===
Name:       {}
Identity:   {}
Generation: {}
Address:    {}
Network:    {}
Mode:       {:?}
Stable:     {:.4} USDC
Gas:        {:.6}
Pending:    {} settlements
Version:    {}
=======================
"#,
        cfg.name,
        record.identity.gene_hash,
        record.identity.generation,
        cfg.wallet_address,
        cfg.network_id,
        mode,
        balances.stable,
        balances.gas,
        pending,
        cfg.version,
    );
    Ok(())
}

// ---- Identity Command -------------------------------------------------------

fn identity() -> Result<()> {
    let Some(cfg) = config::load_config() else {
        println!("Symbiont is not configured. Run: symbiont --init");
        return Ok(());
    };
    let store = StateStore::open(&resolve_path(&cfg.db_path))?;
    let record = load_record(&store)?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

// ---- Reincarnate Command ----------------------------------------------------

/// Import an exported record, verify its integrity, and take it over as
/// the next incarnation. An identity-hash mismatch is fatal; the record
/// is never repaired.
async fn reincarnate(path: &str) -> Result<()> {
    let cfg = config::load_config()
        .context("No configuration found. Run: symbiont --init")?;

    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read record file {path}"))?;
    let old: AgentRecord =
        serde_json::from_str(&json).context("Failed to parse exported record")?;
    if !symbiont::genome::verify_identity(&old) {
        bail!(
            "Identity hash mismatch: record content does not match gene hash {}",
            old.identity.gene_hash
        );
    }

    let record = symbiont::genome::reincarnate(&old);
    let store = StateStore::open(&resolve_path(&cfg.db_path))?;
    store.set_kv(RECORD_KEY, &serde_json::to_string(&record)?)?;

    let registry = HttpRegistry::new(cfg.registry_url.clone());
    if let Err(e) = registry
        .record_reincarnation(&old.identity.gene_hash, &record.identity.gene_hash)
        .await
    {
        eprintln!("Warning: could not record reincarnation: {e:#}");
    }

    println!(
        "Reincarnated {} as {} (generation {})",
        old.identity.gene_hash, record.identity.gene_hash, record.identity.generation
    );
    Ok(())
}

// ---- Main Run ---------------------------------------------------------------

async fn run() -> Result<()> {
    let cfg: SymbiontConfig = config::load_config()
        .context("No configuration found. Run: symbiont --init")?;
    init_tracing(cfg.log_level.as_filter());
    info!("Symbiont v{} starting as {}", VERSION, cfg.name);

    let thresholds = load_survival_thresholds(std::path::Path::new(&resolve_path(
        &cfg.survival_config_path,
    )))?;
    let (signer, _) = get_wallet().context("Failed to load wallet")?;
    let wallet = Arc::new(ChainWallet::new(signer, cfg.network_id.clone()));

    let store = Arc::new(Mutex::new(StateStore::open(&resolve_path(&cfg.db_path))?));
    let record = {
        let store = store.lock().expect("state store lock poisoned");
        load_record(&store)?
    };
    let identity = record.identity.gene_hash.clone();
    info!(
        "Identity {} (generation {}, born {})",
        identity, record.identity.generation, record.identity.born_at
    );

    let storage: Arc<dyn StorageClient> = Arc::new(HttpStorage::new(cfg.storage_url.clone()));
    let deps = SchedulerDeps {
        wallet,
        registry: Arc::new(HttpRegistry::new(cfg.registry_url.clone())),
        peers: Arc::new(HttpRelay::new(cfg.relay_url.clone())),
        storage: Arc::clone(&storage),
        escrow: Arc::new(HttpEscrow::new(cfg.escrow_url.clone())),
    };

    let state = SurvivalState::new(record.identity.born_at.clone());
    let scheduler = SurvivalScheduler::new(
        SchedulerConfig::from_config(&cfg),
        thresholds,
        deps,
        Arc::clone(&store),
        record,
        state,
    )?;

    let mut handle = scheduler.start();

    let shutdown = async {
        let ctrl_c = signal::ctrl_c();
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
    };

    tokio::select! {
        _ = shutdown => {
            info!("Shutting down gracefully...");
            scheduler.stop();
            // The in-flight cycle finishes its current step before the
            // loop exits; never cancelled mid-I/O.
            if let Err(e) = (&mut handle).await {
                warn!("Survival loop did not exit cleanly: {}", e);
            }
            // Final flush so no history is stranded in the local store.
            match flush_history(&identity, &store, storage.as_ref()).await {
                Ok(Some(content_id)) => info!("Final inscription: {}", content_id),
                Ok(None) => {}
                Err(e) => warn!("Final inscription failed: {:#}", e),
            }
        }
        _ = &mut handle => {
            // The loop only exits on its own when the agent dies.
            info!("Survival loop exited");
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.init {
        return init(cli.name, cli.purpose).await;
    }
    if cli.status {
        return status().await;
    }
    if cli.identity {
        return identity();
    }
    if let Some(path) = cli.reincarnate.as_deref() {
        return reincarnate(path).await;
    }
    if cli.run {
        return run().await;
    }

    println!("Nothing to do. Try --init, --run, --status, --identity, or --reincarnate.");
    Ok(())
}
