//! Configuration for the Starshard core.
//!
//! TOML on disk, validated on load, sensible defaults for everything. Mirrors the
//! teacher's per-subsystem nested-struct config shape, but scoped to what this core's
//! components actually consume plus pass-through fields for external collaborators
//! (chart proxy, TTS, QQ app id) that the core itself never reads.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GamesConfig {
    #[serde(default = "default_true")]
    pub enable_blackjack: bool,
    #[serde(default = "default_true")]
    pub enable_mines: bool,
    #[serde(default = "default_true")]
    pub enable_onestroke: bool,
    #[serde(default)]
    pub enable_cck: bool,
    #[serde(default)]
    pub enable_guess_chart: bool,

    #[serde(default = "default_blackjack_min_bet")]
    pub blackjack_min_bet: i64,
    #[serde(default = "default_mines_count")]
    pub mines_default_mines: i64,
    #[serde(default = "default_onestroke_difficulty")]
    pub onestroke_default_difficulty: String,
}

fn default_true() -> bool {
    true
}
fn default_blackjack_min_bet() -> i64 {
    1
}
fn default_mines_count() -> i64 {
    5
}
fn default_onestroke_difficulty() -> String {
    "normal".to_string()
}

impl Default for GamesConfig {
    fn default() -> Self {
        GamesConfig {
            enable_blackjack: true,
            enable_mines: true,
            enable_onestroke: true,
            enable_cck: false,
            enable_guess_chart: false,
            blackjack_min_bet: default_blackjack_min_bet(),
            mines_default_mines: default_mines_count(),
            onestroke_default_difficulty: default_onestroke_difficulty(),
        }
    }
}

/// Per-game upgrade-cost and nickname-cost knobs, named directly after the §6 formulas.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EconomyConfig {
    #[serde(default = "default_nickname_reset_cost")]
    pub nickname_reset_cost: i64,
    #[serde(default = "default_upgrade_tier1_cutoff")]
    pub upgrade_tier1_cutoff: i64,
    #[serde(default = "default_upgrade_tier2_cutoff")]
    pub upgrade_tier2_cutoff: i64,
}

fn default_nickname_reset_cost() -> i64 {
    30
}
fn default_upgrade_tier1_cutoff() -> i64 {
    20
}
fn default_upgrade_tier2_cutoff() -> i64 {
    60
}

impl Default for EconomyConfig {
    fn default() -> Self {
        EconomyConfig {
            nickname_reset_cost: default_nickname_reset_cost(),
            upgrade_tier1_cutoff: default_upgrade_tier1_cutoff(),
            upgrade_tier2_cutoff: default_upgrade_tier2_cutoff(),
        }
    }
}

/// Pass-through settings for external collaborators. The core never dereferences these;
/// it only carries them so one config file can drive the whole deployed stack.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExternalServicesConfig {
    #[serde(default)]
    pub chart_proxy_url: Option<String>,
    #[serde(default)]
    pub tts_endpoint: Option<String>,
    #[serde(default)]
    pub qq_app_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root directory under which every per-subsystem SQLite file is created.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default)]
    pub games: GamesConfig,
    #[serde(default)]
    pub economy: EconomyConfig,
    #[serde(default)]
    pub external: ExternalServicesConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_data_dir() -> String {
    "data".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data_dir: default_data_dir(),
            games: GamesConfig::default(),
            economy: EconomyConfig::default(),
            external: ExternalServicesConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, validating it on the way in.
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .await
            .map_err(|e| anyhow!("failed to read config {}: {e}", path.as_ref().display()))?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Write a default configuration file at `path`, failing if one already exists.
    pub async fn create_default<P: AsRef<Path>>(path: P) -> Result<()> {
        if fs::metadata(path.as_ref()).await.is_ok() {
            return Err(anyhow!("config already exists at {}", path.as_ref().display()));
        }
        let config = Config::default();
        let toml = toml::to_string_pretty(&config)?;
        fs::write(path.as_ref(), toml).await?;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.data_dir.trim().is_empty() {
            return Err(anyhow!("data_dir must not be empty"));
        }
        if self.games.blackjack_min_bet < 1 {
            return Err(anyhow!("blackjack_min_bet must be >= 1"));
        }
        if !(1..=24).contains(&self.games.mines_default_mines) {
            return Err(anyhow!("mines_default_mines must be in 1..=24"));
        }
        if self.economy.nickname_reset_cost < 0 {
            return Err(anyhow!("nickname_reset_cost must be >= 0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        Config::default().validate().expect("defaults must validate");
    }

    #[tokio::test]
    async fn create_default_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        Config::create_default(&path).await.unwrap();
        let loaded = Config::load(&path).await.unwrap();
        assert_eq!(loaded.data_dir, "data");
        assert!(loaded.games.enable_blackjack);
    }

    #[tokio::test]
    async fn create_default_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        Config::create_default(&path).await.unwrap();
        assert!(Config::create_default(&path).await.is_err());
    }

    #[test]
    fn rejects_bad_mines_count() {
        let mut config = Config::default();
        config.games.mines_default_mines = 0;
        assert!(config.validate().is_err());
    }
}
