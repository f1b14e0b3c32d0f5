//! # Command-Line Interface Module
//!
//! This module defines the command-line interface for Resonance using Clap
//! derive macros.
//!
//! ## Commands
//!
//! - `recommend`: Generate recommendations for a user
//! - `explain`: Explain `{track, provenance}` pairs read from a JSON file
//! - `strategies`: List registered strategies
//! - `evaluate`: Run one strategy directly and report metrics
//! - `init-db`: Import a JSON dataset into the SQLite store
//! - `completion`: Generate shell completions
//!
//! Every command prints JSON to stdout.
//!
//! ## Data Source
//!
//! `--data <file.json>` serves a dataset from memory. Otherwise the SQLite
//! store at `--db` (default: the platform data directory) is used.
//!
//! ## Examples
//!
//! ```bash
//! resonance init-db catalogue.json
//! resonance recommend u1 --strategy collaborative --limit 10
//! resonance --data catalogue.json recommend u2 --query "late night jazz" --explain
//! ```

use crate::engine::RecommendationRequest;
use crate::model::{Filters, HistoryEntry, RunParams, StrategyKind, UserContext};
use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Shell types supported for completion generation
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Shell {
    /// Bash shell
    Bash,
    /// Zsh shell
    Zsh,
    /// Fish shell
    Fish,
    /// PowerShell
    PowerShell,
    /// Elvish shell
    Elvish,
}

/// Main application arguments structure.
#[derive(Parser, Debug)]
#[command(name = "resonance")]
#[command(about = "Resonance: multi-strategy music recommendations with auditable provenance")]
#[command(version)]
pub struct Args {
    /// Engine configuration file (JSON)
    ///
    /// Defaults to `config.json` in the Resonance data directory. A missing
    /// file means built-in defaults.
    #[arg(long, global = true, env = "RESONANCE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Serve a JSON dataset from memory instead of the SQLite store
    #[arg(long, global = true, conflicts_with = "db")]
    pub data: Option<PathBuf>,

    /// SQLite store location
    #[arg(long, global = true, env = "RESONANCE_DB")]
    pub db: Option<PathBuf>,

    /// The subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Request-shaping options shared by `recommend` and `evaluate`.
#[derive(clap::Args, Debug, Clone, Default)]
pub struct RequestArgs {
    /// Seed track ids (repeatable)
    #[arg(long = "seed")]
    pub seeds: Vec<String>,

    /// Recently played track ids, most recent first (repeatable)
    #[arg(long = "history")]
    pub history: Vec<String>,

    /// Free-text message from the listener
    #[arg(long)]
    pub message: Option<String>,

    /// Explicit semantic query
    #[arg(long)]
    pub query: Option<String>,

    #[arg(long)]
    pub mood: Option<String>,

    #[arg(long)]
    pub activity: Option<String>,

    /// Only recommend tracks whose genre contains this text
    #[arg(long)]
    pub genre: Option<String>,

    /// Favourite genres (repeatable)
    #[arg(long = "favorite-genre")]
    pub favorite_genres: Vec<String>,

    #[arg(long)]
    pub min_energy: Option<f64>,

    /// Declare the listener new
    #[arg(long)]
    pub cold_start: bool,
}

impl RequestArgs {
    #[must_use]
    pub fn user_context(&self) -> UserContext {
        UserContext {
            listening_history: self.history.iter().map(|id| HistoryEntry::new(id)).collect(),
            user_message: self.message.clone(),
            semantic_query: self.query.clone(),
            favorite_genres: self.favorite_genres.clone(),
            cold_start: self.cold_start,
        }
    }

    #[must_use]
    pub fn filters(&self) -> Filters {
        Filters {
            genre: self.genre.clone(),
            min_energy: self.min_energy,
            mood: self.mood.clone(),
            activity: self.activity.clone(),
            ..Filters::default()
        }
    }

    /// Builds an engine request.
    ///
    /// # Errors
    ///
    /// Fails with `UNKNOWN_STRATEGY` when `strategy` is not a known name.
    pub fn to_request(&self, user: &str, strategy: Option<&str>, limit: Option<usize>) -> Result<RecommendationRequest> {
        Ok(RecommendationRequest {
            user_id: user.to_string(),
            user_context: self.user_context(),
            strategy: strategy.map(str::parse::<StrategyKind>).transpose()?,
            limit,
            seeds: self.seeds.clone(),
            filters: self.filters(),
        })
    }

    #[must_use]
    pub fn to_run_params(&self, user: &str, limit: usize) -> RunParams {
        let mut params = RunParams::for_user(user);
        params.seeds = self.seeds.clone();
        params.limits.final_count = limit;
        params.limits.candidates = params.limits.candidates.max(limit);
        params.context = self.user_context();
        params.filters = self.filters();
        params
    }
}

/// Enumeration of all available subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Generate recommendations for a user
    ///
    /// Without `--strategy`, the configured default strategy is used; with
    /// no default configured, one is picked from the request (long history,
    /// cold start, semantic query, otherwise hybrid).
    Recommend {
        /// User id
        user: String,

        /// collaborative, content, semantic or hybrid (long aliases accepted)
        #[arg(short, long)]
        strategy: Option<String>,

        /// Maximum number of recommendations
        #[arg(short, long)]
        limit: Option<usize>,

        #[command(flatten)]
        request: RequestArgs,

        /// Attach a human-readable explanation to each recommendation
        #[arg(long)]
        explain: bool,
    },

    /// Explain recommendations from a JSON file
    ///
    /// The file holds one `{"track": ..., "provenance": ...}` object or an
    /// array of them. Items that cannot be explained degrade to a generic
    /// explanation carrying the error.
    Explain {
        /// Path to the JSON input
        #[arg(value_hint = clap::ValueHint::FilePath)]
        input: PathBuf,
    },

    /// List registered strategies
    Strategies,

    /// Run one strategy directly and report candidate count, average score
    /// and artist diversity
    Evaluate {
        /// Strategy name
        strategy: String,

        /// User id
        user: String,

        #[arg(short, long, default_value = "20")]
        limit: usize,

        #[command(flatten)]
        request: RequestArgs,
    },

    /// Import a JSON dataset into the SQLite store
    ///
    /// The dataset holds `tracks`, `interactions` and `embeddings` arrays.
    /// Tracks and embeddings are upserted; interactions are appended.
    InitDb {
        /// Path to the dataset file
        #[arg(value_hint = clap::ValueHint::FilePath)]
        dataset: PathBuf,

        /// Delete an existing store before importing
        #[arg(long)]
        force: bool,
    },

    /// Generate shell completions
    ///
    /// Usage: resonance completion bash > ~/.local/share/bash-completion/completions/resonance
    Completion {
        /// Shell to generate completions for
        shell: Shell,
    },

    /// List strategy names for completion (hidden command)
    #[command(hide = true)]
    CompleteStrategies,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_parse_recommend() {
        let args = Args::try_parse_from([
            "resonance", "--data", "d.json", "recommend", "u1", "-s", "hybrid-rerank", "--seed", "t1", "--seed",
            "t2", "--query", "rainy jazz", "--explain",
        ])
        .unwrap();
        assert_eq!(args.data, Some(PathBuf::from("d.json")));

        let Command::Recommend { user, strategy, request, explain, .. } = args.command else {
            panic!("expected recommend");
        };
        assert!(explain);
        let built = request.to_request(&user, strategy.as_deref(), Some(5)).unwrap();
        assert_eq!(built.strategy, Some(StrategyKind::Hybrid));
        assert_eq!(built.seeds, vec!["t1", "t2"]);
        assert_eq!(built.user_context.semantic_query.as_deref(), Some("rainy jazz"));
    }

    #[test]
    fn test_unknown_strategy_is_rejected() {
        let err = RequestArgs::default().to_request("u1", Some("popularity"), None).unwrap_err();
        assert!(err.to_string().starts_with("UNKNOWN_STRATEGY"));
    }

    #[test]
    fn test_data_conflicts_with_db() {
        let result = Args::try_parse_from(["resonance", "--data", "d.json", "--db", "x.db", "strategies"]);
        assert!(result.is_err());
    }
}
