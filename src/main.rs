//! # Resonance
//!
//! Command-line front end for the recommendation engine. Every command
//! prints JSON to stdout; logs go to stderr and are controlled via
//! `RUST_LOG`:
//! - `RUST_LOG=debug resonance recommend u1` - per-run counters
//! - `RUST_LOG=resonance::strategy::hybrid=debug resonance recommend u1` - module-specific logging
//!
//! ## Usage
//!
//! ```bash
//! # Import a dataset into the SQLite store
//! resonance init-db catalogue.json
//!
//! # Recommend with the configured default strategy
//! resonance recommend u1
//!
//! # Semantic search over an in-memory dataset, with explanations
//! resonance --data catalogue.json recommend u1 --query "late night jazz" --explain
//! ```

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use log::info;
use resonance::cli::{Args, Command};
use resonance::completion;
use resonance::config;
use resonance::embedding::HashingEmbedder;
use resonance::engine::RecommendationEngine;
use resonance::explanation::{generate_batch_explanations, ExplanationRequest};
use resonance::store::{DataSource, Dataset, MemoryStore, SqliteStore};
use serde::Serialize;
use serde_json::json;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn db_path(args: &Args) -> Result<PathBuf> {
    match &args.db {
        Some(path) => Ok(path.clone()),
        None => config::get_db_path(),
    }
}

/// In-memory dataset when `--data` is given, the SQLite store otherwise.
fn open_source(args: &Args) -> Result<Arc<dyn DataSource>> {
    if let Some(path) = &args.data {
        info!("Serving dataset from {}", path.display());
        return Ok(Arc::new(MemoryStore::from_json_file(path)?));
    }
    let path = db_path(args)?;
    Ok(Arc::new(SqliteStore::open(&path)?))
}

fn build_engine(args: &Args) -> Result<RecommendationEngine> {
    let config_path = match &args.config {
        Some(path) => path.clone(),
        None => config::get_config_path()?,
    };
    let engine_config = config::load_config(&config_path)?;
    let embedder = Arc::new(HashingEmbedder::new(engine_config.semantic.embedding_dimension));
    let engine = RecommendationEngine::new(engine_config, open_source(args)?, embedder);
    engine.initialize()?;
    Ok(engine)
}

fn read_explanation_requests(path: &Path) -> Result<Vec<ExplanationRequest>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read explanation input: {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&raw)
        .with_context(|| format!("Invalid JSON in {}", path.display()))?;
    let requests = if value.is_array() {
        serde_json::from_value(value)?
    } else {
        vec![serde_json::from_value(value)?]
    };
    Ok(requests)
}

fn main() -> Result<()> {
    env_logger::init();

    let args = Args::parse();

    match &args.command {
        Command::Recommend { user, strategy, limit, request, explain } => {
            let engine = build_engine(&args)?;
            let request = request.to_request(user, strategy.as_deref(), *limit)?;
            let envelope = engine.generate(&request);

            if *explain {
                let explanations: Vec<serde_json::Value> = envelope
                    .candidates
                    .iter()
                    .map(|candidate| match engine.explain(candidate) {
                        Ok(explanation) => json!({ "trackId": candidate.track_id, "explanation": explanation }),
                        Err(err) => json!({ "trackId": candidate.track_id, "error": err.to_string() }),
                    })
                    .collect();
                print_json(&json!({ "recommendations": envelope, "explanations": explanations }))?;
            } else {
                print_json(&envelope)?;
            }
        }
        Command::Explain { input } => {
            let requests = read_explanation_requests(input)?;
            print_json(&generate_batch_explanations(&requests))?;
        }
        Command::Strategies => {
            let engine = build_engine(&args)?;
            let strategies: Vec<serde_json::Value> = engine
                .registry()
                .strategies()
                .map(|strategy| json!({ "name": strategy.kind().as_str(), "mock": strategy.is_mock() }))
                .collect();
            print_json(&strategies)?;
        }
        Command::Evaluate { strategy, user, limit, request } => {
            let engine = build_engine(&args)?;
            let params = request.to_run_params(user, *limit);
            print_json(&engine.evaluate_strategy(strategy, &params))?;
        }
        Command::InitDb { dataset, force } => {
            let path = db_path(&args)?;
            if *force && path.exists() {
                fs::remove_file(&path)
                    .with_context(|| format!("Failed to remove existing store at {}", path.display()))?;
            }
            info!("Importing {} into {}", dataset.display(), path.display());
            let data = Dataset::from_json_file(dataset)?;
            let store = SqliteStore::open(&path)?;
            store.import_dataset(&data)?;
            print_json(&json!({
                "db": path.display().to_string(),
                "tracks": data.tracks.len(),
                "interactions": data.interactions.len(),
                "embeddings": data.embeddings.len(),
            }))?;
        }
        Command::Completion { shell } => {
            let mut cmd = Args::command();
            completion::generate_completions(completion::shell_to_completion_shell(*shell), &mut cmd);
        }
        Command::CompleteStrategies => {
            completion::print_strategy_completions(&mut io::stdout())?;
        }
    }

    Ok(())
}
