//! Multi-strategy music recommendations with auditable provenance.
//!
//! Core modules:
//! - [`strategy`] - Collaborative, content, semantic and hybrid strategies
//! - [`engine`] - Strategy selection, post-processing and fallback handling
//! - [`provenance`] - Validated records of why a track was recommended
//! - [`explanation`] - Human-readable explanations grounded in audio features
//! - [`store`] - Read-only data sources (in-memory and SQLite)
//!
//! ### Supporting Modules
//!
//! - [`model`] - Shared domain types
//! - [`cache`] - Read-through caches with injected loaders
//! - [`embedding`] - Embedding providers and cosine similarity
//! - [`error`] - Coded error enums
//! - [`config`] - Engine configuration and data directory management
//! - [`cli`] - Command-line interface definitions with clap integration
//! - [`completion`] - Shell completion generation
//!
//! ## Quick Start Example
//!
//! ```no_run
//! use resonance::config::EngineConfig;
//! use resonance::embedding::HashingEmbedder;
//! use resonance::engine::{RecommendationEngine, RecommendationRequest};
//! use resonance::model::StrategyKind;
//! use resonance::store::MemoryStore;
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! let store = MemoryStore::from_json_file(Path::new("catalogue.json"))?;
//! let engine = RecommendationEngine::new(
//!     EngineConfig::default(),
//!     Arc::new(store),
//!     Arc::new(HashingEmbedder::new(768)),
//! );
//!
//! let mut request = RecommendationRequest::for_user("u1");
//! request.strategy = Some(StrategyKind::Collaborative);
//! let envelope = engine.generate(&request);
//! for candidate in &envelope.candidates {
//!     println!("{} {:.3}", candidate.track_id, candidate.effective_score());
//! }
//! # Ok::<(), anyhow::Error>(())
//! ```
//!
//! ## Degradation
//!
//! Missing data is never an error. A new user, a request with no seeds, or
//! an empty embeddings table produces an empty candidate list tagged with a
//! [`strategy::Degradation`]. Structural problems (malformed provenance,
//! embedding dimension mismatches, unknown strategy names) are errors with a
//! stable code, and the engine turns strategy failures into a fallback
//! envelope.

pub mod cache;
pub mod cli;
pub mod completion;
pub mod config;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod explanation;
pub mod model;
pub mod provenance;
pub mod store;
pub mod strategy;
