//! Symbiont Configuration
//!
//! Loads and saves the agent's configuration from `~/.symbiont/symbiont.json`,
//! and the survival thresholds from a YAML file alongside it. Threshold
//! values drive mode classification, breeding eligibility, and the death
//! condition, so they live in their own file the operator can tune.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use yaml_rust2::{Yaml, YamlLoader};

/// Config file name within the symbiont directory.
const CONFIG_FILENAME: &str = "symbiont.json";

/// Survival threshold file name within the symbiont directory.
const SURVIVAL_FILENAME: &str = "survival.yml";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbiontConfig {
    pub name: String,
    pub purpose: String,
    /// CAIP-2 network identifier the agent pays on.
    pub network_id: String,
    pub wallet_address: String,
    /// Paid inference endpoint used in Normal mode.
    pub premium_endpoint: String,
    /// Cheaper paid inference endpoint used in LowPower mode.
    pub economy_endpoint: String,
    /// Settlement facilitator base URL.
    pub facilitator_url: String,
    /// Peer discovery / gossip relay base URL.
    pub relay_url: String,
    /// On-chain registry collaborator base URL.
    pub registry_url: String,
    /// Permanent storage collaborator base URL.
    pub storage_url: String,
    /// Breeding escrow collaborator base URL.
    pub escrow_url: String,
    pub db_path: String,
    pub survival_config_path: String,
    pub log_level: LogLevel,
    /// Survival cycle interval in seconds.
    pub cycle_interval_secs: u64,
    /// Cron expression for the scheduled inscription, anchored to wall
    /// clock (default: UTC midnight), not to process start time.
    pub inscription_schedule: String,
    /// Hard ceiling on any single payment, in USDC.
    pub price_ceiling: f64,
    /// Reject a challenge whose price exceeds this multiple of the
    /// historical average for the same target.
    pub price_deviation_multiple: f64,
    pub version: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Balance thresholds (USDC / native gas) that drive mode classification.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SurvivalThresholds {
    /// Below this stable balance the agent hibernates.
    pub hibernation_floor: f64,
    /// Below this stable balance the agent runs in Emergency mode.
    pub emergency_floor: f64,
    /// Below this stable balance the agent runs in LowPower mode.
    pub low_power_floor: f64,
    /// Minimum stable balance to be willing to breed.
    pub breeding_floor: f64,
    /// Minimum native gas balance; below it every call is unaffordable.
    pub min_gas: f64,
    /// Minimum age (days) before the agent may breed.
    pub min_survival_days: f64,
    /// Stable amount locked in escrow per breeding attempt.
    pub breeding_contribution: f64,
    /// How long the proposer waits for an acceptance, in seconds.
    pub acceptance_timeout_secs: u64,
    /// Pending-proposal poll interval, in seconds.
    pub acceptance_poll_secs: u64,
}

impl Default for SurvivalThresholds {
    fn default() -> Self {
        Self {
            hibernation_floor: 0.5,
            emergency_floor: 2.0,
            low_power_floor: 5.0,
            breeding_floor: 20.0,
            min_gas: 0.001,
            min_survival_days: 7.0,
            breeding_contribution: 1.0,
            acceptance_timeout_secs: 60,
            acceptance_poll_secs: 2,
        }
    }
}

/// Default survival thresholds as shipped.
pub const DEFAULT_SURVIVAL_CONFIG: &str = r#"hibernationFloor: 0.5
emergencyFloor: 2.0
lowPowerFloor: 5.0
breedingFloor: 20.0
minGas: 0.001
minSurvivalDays: 7.0
breedingContribution: 1.0
acceptanceTimeoutSecs: 60
acceptancePollSecs: 2
"#;

/// Returns the symbiont base directory: `~/.symbiont`.
pub fn get_symbiont_dir() -> PathBuf {
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/root"));
    home.join(".symbiont")
}

/// Returns the full path to the config file: `~/.symbiont/symbiont.json`.
pub fn get_config_path() -> PathBuf {
    get_symbiont_dir().join(CONFIG_FILENAME)
}

pub fn default_config() -> SymbiontConfig {
    SymbiontConfig {
        name: String::new(),
        purpose: String::new(),
        network_id: "eip155:8453".to_string(),
        wallet_address: String::new(),
        premium_endpoint: "https://inference.conway.tech/v1/premium".to_string(),
        economy_endpoint: "https://inference.conway.tech/v1/economy".to_string(),
        facilitator_url: "https://facilitator.conway.tech".to_string(),
        relay_url: "https://relay.conway.tech".to_string(),
        registry_url: "https://registry.conway.tech".to_string(),
        storage_url: "https://storage.conway.tech".to_string(),
        escrow_url: "https://escrow.conway.tech".to_string(),
        db_path: "~/.symbiont/state.db".to_string(),
        survival_config_path: format!("~/.symbiont/{SURVIVAL_FILENAME}"),
        log_level: LogLevel::Info,
        cycle_interval_secs: 60,
        inscription_schedule: "0 0 0 * * *".to_string(),
        price_ceiling: 0.25,
        price_deviation_multiple: 3.0,
        version: "0.1.0".to_string(),
    }
}

/// Load the symbiont config from disk, merging missing fields with
/// defaults. Returns `None` if the file does not exist or cannot be parsed.
pub fn load_config() -> Option<SymbiontConfig> {
    let config_path = get_config_path();
    if !config_path.exists() {
        return None;
    }

    let contents = fs::read_to_string(&config_path).ok()?;
    let mut config: SymbiontConfig = serde_json::from_str(&contents).ok()?;

    let defaults = default_config();
    if config.network_id.is_empty() {
        config.network_id = defaults.network_id;
    }
    if config.db_path.is_empty() {
        config.db_path = defaults.db_path;
    }
    if config.survival_config_path.is_empty() {
        config.survival_config_path = defaults.survival_config_path;
    }
    if config.inscription_schedule.is_empty() {
        config.inscription_schedule = defaults.inscription_schedule;
    }
    if config.cycle_interval_secs == 0 {
        config.cycle_interval_secs = defaults.cycle_interval_secs;
    }
    if config.price_ceiling == 0.0 {
        config.price_ceiling = defaults.price_ceiling;
    }
    if config.price_deviation_multiple == 0.0 {
        config.price_deviation_multiple = defaults.price_deviation_multiple;
    }
    if config.version.is_empty() {
        config.version = defaults.version;
    }

    Some(config)
}

/// Save the symbiont config to `~/.symbiont/symbiont.json` with mode 0600.
pub fn save_config(config: &SymbiontConfig) -> Result<()> {
    let dir = get_symbiont_dir();
    if !dir.exists() {
        fs::create_dir_all(&dir).context("Failed to create symbiont directory")?;
        fs::set_permissions(&dir, fs::Permissions::from_mode(0o700))?;
    }

    let config_path = get_config_path();
    let json = serde_json::to_string_pretty(config).context("Failed to serialize config")?;

    fs::write(&config_path, &json).context("Failed to write config file")?;
    fs::set_permissions(&config_path, fs::Permissions::from_mode(0o600))?;

    Ok(())
}

/// Resolve a path that may start with `~` to an absolute path.
pub fn resolve_path(p: &str) -> String {
    if let Some(rest) = p.strip_prefix('~') {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/root"));
        let rest = rest.strip_prefix('/').unwrap_or(rest);
        home.join(rest).to_string_lossy().to_string()
    } else {
        p.to_string()
    }
}

fn yaml_f64(doc: &Yaml, key: &str, fallback: f64) -> f64 {
    doc[key]
        .as_f64()
        .or_else(|| doc[key].as_i64().map(|v| v as f64))
        .unwrap_or(fallback)
}

fn parse_survival_yaml(docs: &[Yaml]) -> Result<SurvivalThresholds> {
    let doc = docs.first().context("Empty YAML document")?;
    let defaults = SurvivalThresholds::default();

    Ok(SurvivalThresholds {
        hibernation_floor: yaml_f64(doc, "hibernationFloor", defaults.hibernation_floor),
        emergency_floor: yaml_f64(doc, "emergencyFloor", defaults.emergency_floor),
        low_power_floor: yaml_f64(doc, "lowPowerFloor", defaults.low_power_floor),
        breeding_floor: yaml_f64(doc, "breedingFloor", defaults.breeding_floor),
        min_gas: yaml_f64(doc, "minGas", defaults.min_gas),
        min_survival_days: yaml_f64(doc, "minSurvivalDays", defaults.min_survival_days),
        breeding_contribution: yaml_f64(
            doc,
            "breedingContribution",
            defaults.breeding_contribution,
        ),
        acceptance_timeout_secs: doc["acceptanceTimeoutSecs"]
            .as_i64()
            .unwrap_or(defaults.acceptance_timeout_secs as i64) as u64,
        acceptance_poll_secs: doc["acceptancePollSecs"]
            .as_i64()
            .unwrap_or(defaults.acceptance_poll_secs as i64) as u64,
    })
}

/// Load survival thresholds from a YAML file, falling back to the
/// shipped defaults if the file does not exist.
pub fn load_survival_thresholds(path: &Path) -> Result<SurvivalThresholds> {
    if !path.exists() {
        info!(
            "Survival config not found at {}, using defaults",
            path.display()
        );
        return Ok(SurvivalThresholds::default());
    }

    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read survival config from {}", path.display()))?;
    let docs = YamlLoader::load_from_str(&contents)
        .with_context(|| format!("Failed to parse YAML from {}", path.display()))?;

    let thresholds = parse_survival_yaml(&docs)?;
    debug!("Loaded survival thresholds from {}", path.display());
    Ok(thresholds)
}

/// Write the default survival threshold file. Will not overwrite.
pub fn write_default_survival_config(path: &Path) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create parent directory for {}", path.display()))?;
    }
    fs::write(path, DEFAULT_SURVIVAL_CONFIG)
        .with_context(|| format!("Failed to write survival config to {}", path.display()))?;
    info!("Wrote default survival config to {}", path.display());
    Ok(())
}
