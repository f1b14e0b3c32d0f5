//! # Configuration Module
//!
//! Engine tuning parameters and data directory setup for Resonance.
//!
//! ## Engine Configuration
//!
//! [`EngineConfig`] nests one section per strategy plus the registry's
//! selection weights. Every field has a default, so a config file only needs
//! the values it changes:
//!
//! ```json
//! {
//!   "confidence_threshold": 0.4,
//!   "hybrid": { "algorithm": "rank_fusion" },
//!   "semantic": { "similarity_threshold": 0.65 }
//! }
//! ```
//!
//! A missing config file is not an error; defaults are used.
//!
//! ## Data Storage
//!
//! Resonance keeps its SQLite store and config file in the platform-standard
//! data directory:
//! - Linux: `~/.local/share/resonance/`
//! - macOS: `~/Library/Application Support/resonance/`
//! - Windows: `%APPDATA%\resonance\`

use crate::model::StrategyKind;
use crate::strategy::collaborative::CollaborativeConfig;
use crate::strategy::content::ContentConfig;
use crate::strategy::hybrid::HybridConfig;
use crate::strategy::registry::SelectionConfig;
use crate::strategy::semantic::SemanticConfig;
use anyhow::{Context, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on the candidate pool requested from a strategy.
    pub max_candidates: usize,
    pub default_limit: usize,
    /// Share of the result list a single artist may occupy.
    pub diversity_threshold: f64,
    /// Candidates below this effective score are dropped.
    pub confidence_threshold: f64,
    /// Strategy used when a request names none. `None` selects heuristically.
    pub default_strategy: Option<StrategyKind>,
    pub collaborative: CollaborativeConfig,
    pub content: ContentConfig,
    pub semantic: SemanticConfig,
    pub hybrid: HybridConfig,
    pub selection: SelectionConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_candidates: 100,
            default_limit: 20,
            diversity_threshold: 0.7,
            confidence_threshold: 0.5,
            default_strategy: Some(StrategyKind::Hybrid),
            collaborative: CollaborativeConfig::default(),
            content: ContentConfig::default(),
            semantic: SemanticConfig::default(),
            hybrid: HybridConfig::default(),
            selection: SelectionConfig::default(),
        }
    }
}

/// Loads an [`EngineConfig`] from a JSON file.
///
/// Returns the defaults when `path` does not exist.
///
/// # Errors
///
/// Fails when the file exists but cannot be read or is not valid JSON for
/// the config schema.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        debug!("No config file at {}, using defaults", path.display());
        return Ok(EngineConfig::default());
    }

    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let config: EngineConfig = serde_json::from_str(&raw)
        .with_context(|| format!("Invalid config file: {}", path.display()))?;
    info!("Loaded configuration from {}", path.display());
    Ok(config)
}

/// Returns the platform-appropriate data directory for Resonance, creating
/// it if needed.
///
/// # Errors
///
/// Fails when the system data directory cannot be determined or the
/// `resonance` subdirectory cannot be created.
pub fn get_data_dir() -> Result<PathBuf> {
    let data_dir = dirs::data_dir().ok_or_else(|| {
        anyhow::anyhow!(
            "Could not determine system data directory. Please ensure your platform supports standard data directories."
        )
    })?;

    let resonance_dir = data_dir.join("resonance");
    fs::create_dir_all(&resonance_dir).with_context(|| {
        format!(
            "Failed to create Resonance data directory at {}. Please check file permissions.",
            resonance_dir.display()
        )
    })?;

    Ok(resonance_dir)
}

/// Default SQLite store location: `<data dir>/resonance/resonance.db`.
pub fn get_db_path() -> Result<PathBuf> {
    Ok(get_data_dir()?.join("resonance.db"))
}

/// Default config file location: `<data dir>/resonance/config.json`.
pub fn get_config_path() -> Result<PathBuf> {
    Ok(get_data_dir()?.join("config.json"))
}
