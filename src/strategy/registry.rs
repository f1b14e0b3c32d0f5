//! # Strategy Registry
//!
//! Holds one [`RegisteredStrategy`] per [`StrategyKind`]. [`StrategyRegistry::load`]
//! builds and initializes the four core strategies; any that fails to
//! initialize is registered as a [`MockStrategy`] of the same kind, so a
//! missing embeddings table degrades semantic search instead of taking the
//! whole engine down.
//!
//! ## Heuristic selection
//!
//! [`StrategyRegistry::select_strategy`] picks, in order:
//! 1. collaborative for long histories (more than 50 entries by default)
//! 2. content for a declared cold start
//! 3. semantic for an explicit semantic query
//! 4. hybrid otherwise
//!
//! When the pick is missing or mocked, the highest-weighted live strategy
//! is used instead.

use super::{
    CollaborativeStrategy, ContentStrategy, HybridStrategy, MockStrategy, RegisteredStrategy, SemanticStrategy,
};
use crate::config::EngineConfig;
use crate::embedding::EmbeddingProvider;
use crate::error::RegistryError;
use crate::model::{StrategyKind, UserContext};
use crate::store::DataSource;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    /// Histories longer than this go to collaborative filtering.
    pub long_history_threshold: usize,
    pub weights: BTreeMap<StrategyKind, f64>,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            long_history_threshold: 50,
            weights: BTreeMap::from([
                (StrategyKind::Collaborative, 0.4),
                (StrategyKind::Content, 0.3),
                (StrategyKind::Semantic, 0.2),
                (StrategyKind::Hybrid, 0.1),
            ]),
        }
    }
}

#[derive(Debug, Default)]
pub struct StrategyRegistry {
    strategies: BTreeMap<StrategyKind, RegisteredStrategy>,
    selection: SelectionConfig,
}

impl StrategyRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new(selection: SelectionConfig) -> Self {
        Self {
            strategies: BTreeMap::new(),
            selection,
        }
    }

    /// Builds and initializes the core strategies over `source`.
    ///
    /// Never fails: a strategy that cannot initialize is replaced by a mock
    /// and a warning is logged.
    pub fn load(config: &EngineConfig, source: Arc<dyn DataSource>, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        let mut registry = Self::new(config.selection.clone());

        let collaborative = RegisteredStrategy::Collaborative(Arc::new(CollaborativeStrategy::new(
            config.collaborative.clone(),
            Arc::clone(&source),
        )));
        let content = RegisteredStrategy::Content(Arc::new(ContentStrategy::new(
            config.content.clone(),
            Arc::clone(&source),
        )));
        let semantic = RegisteredStrategy::Semantic(Arc::new(SemanticStrategy::new(
            config.semantic.clone(),
            source,
            embedder,
        )));

        let base: Vec<RegisteredStrategy> = [collaborative, content, semantic]
            .into_iter()
            .map(initialize_or_mock)
            .collect();
        let hybrid = RegisteredStrategy::Hybrid(Arc::new(HybridStrategy::new(config.hybrid.clone(), base.clone())));

        for strategy in base {
            registry.register(strategy);
        }
        registry.register(initialize_or_mock(hybrid));

        info!("Strategy registry initialized with {} strategies", registry.strategies.len());
        registry
    }

    /// Registers `strategy`, replacing any previous one of the same kind.
    pub fn register(&mut self, strategy: RegisteredStrategy) {
        info!(
            "Registered strategy: {}{}",
            strategy.kind(),
            if strategy.is_mock() { " (mock)" } else { "" }
        );
        self.strategies.insert(strategy.kind(), strategy);
    }

    /// Looks up a strategy; hybrid falls back to collaborative.
    pub fn get_strategy(&self, kind: StrategyKind) -> Result<&RegisteredStrategy, RegistryError> {
        if let Some(strategy) = self.strategies.get(&kind) {
            return Ok(strategy);
        }
        if kind == StrategyKind::Hybrid {
            if let Some(collaborative) = self.strategies.get(&StrategyKind::Collaborative) {
                warn!("No hybrid strategy registered, falling back to collaborative");
                return Ok(collaborative);
            }
        }
        Err(RegistryError::NotRegistered(kind.to_string()))
    }

    pub fn get_by_name(&self, name: &str) -> Result<&RegisteredStrategy, RegistryError> {
        self.get_strategy(name.parse()?)
    }

    #[must_use]
    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.keys().map(|kind| kind.as_str()).collect()
    }

    pub fn strategies(&self) -> impl Iterator<Item = &RegisteredStrategy> {
        self.strategies.values()
    }

    fn is_live(&self, kind: StrategyKind) -> bool {
        self.strategies.get(&kind).is_some_and(|strategy| !strategy.is_mock())
    }

    /// Picks a strategy for `context`. `weights` override the configured
    /// selection weights used to choose a replacement.
    #[must_use]
    pub fn select_strategy(&self, context: &UserContext, weights: &BTreeMap<StrategyKind, f64>) -> StrategyKind {
        let preferred = if context.listening_history.len() > self.selection.long_history_threshold {
            StrategyKind::Collaborative
        } else if context.cold_start {
            StrategyKind::Content
        } else if context.semantic_query.is_some() {
            StrategyKind::Semantic
        } else {
            StrategyKind::Hybrid
        };
        if self.is_live(preferred) {
            return preferred;
        }

        let mut merged = self.selection.weights.clone();
        merged.extend(weights.iter().map(|(kind, weight)| (*kind, *weight)));
        let weight_of = |kind: &StrategyKind| merged.get(kind).copied().unwrap_or(0.0);

        self.strategies
            .values()
            .filter(|strategy| !strategy.is_mock())
            .map(RegisteredStrategy::kind)
            .max_by(|a, b| weight_of(a).partial_cmp(&weight_of(b)).unwrap_or(Ordering::Equal))
            .unwrap_or(preferred)
    }
}

fn initialize_or_mock(strategy: RegisteredStrategy) -> RegisteredStrategy {
    let kind = strategy.kind();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| strategy.initialize()));
    let reason = match outcome {
        Ok(Ok(())) => return strategy,
        Ok(Err(err)) => format!("{:#}", err),
        Err(_) => "initialization panicked".to_string(),
    };
    warn!("Failed to load strategy {}: {}; using mock", kind, reason);
    RegisteredStrategy::Mock(MockStrategy::new(kind, &reason))
}
