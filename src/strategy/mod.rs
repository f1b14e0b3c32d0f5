//! # Recommendation Strategies
//!
//! Every strategy implements [`RecommendationStrategy`]: an idempotent
//! `initialize()` that loads read-only data once, and a `run()` that turns
//! [`RunParams`] into scored [`Candidate`]s plus [`Diagnostics`].
//!
//! ## Degradation, not failure
//!
//! Missing data (a new user, no seeds, no embeddings) is a normal outcome:
//! `run` returns `Ok` with an empty candidate list and a [`Degradation`] in
//! the diagnostics. The `Err` arm is reserved for structural problems such as
//! a dimension mismatch or a data source that fails to load.
//!
//! ## Available Strategies
//!
//! - [`collaborative::CollaborativeStrategy`]: user-user Jaccard neighbourhoods
//! - [`content::ContentStrategy`]: audio-feature similarity to seed tracks
//! - [`semantic::SemanticStrategy`]: embedding similarity to seeds and free-text queries
//! - [`hybrid::HybridStrategy`]: concurrent fusion of the above
//!
//! The set is closed; [`RegisteredStrategy`] also carries an explicit
//! [`MockStrategy`] variant standing in for strategies that failed to load.

pub mod collaborative;
pub mod content;
pub mod hybrid;
pub mod registry;
pub mod semantic;

use crate::error::StrategyError;
use crate::model::{Candidate, Feedback, RunParams, StrategyKind};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Instant;

pub use collaborative::CollaborativeStrategy;
pub use content::ContentStrategy;
pub use hybrid::HybridStrategy;
pub use registry::StrategyRegistry;
pub use semantic::SemanticStrategy;

/// Why a strategy produced no candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Degradation {
    ColdStart,
    InsufficientData,
    NoSeeds,
    NoEmbeddings,
    InsufficientStrategies,
}

impl Degradation {
    #[must_use]
    pub const fn reason(self) -> &'static str {
        match self {
            Self::ColdStart => "Insufficient user history for collaborative filtering",
            Self::InsufficientData => "Not enough similar users found",
            Self::NoSeeds => "No seed tracks with audio features available",
            Self::NoEmbeddings => "No seed embeddings available",
            Self::InsufficientStrategies => "Not enough strategies available for hybrid approach",
        }
    }
}

/// Outcome summary of one sub-strategy inside a hybrid run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubStrategyReport {
    pub strategy: StrategyKind,
    pub weight: f64,
    pub candidates: usize,
    pub confidence: f64,
    pub execution_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degradation: Option<Degradation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostics {
    pub strategy: StrategyKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degradation: Option<Degradation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub mock: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub confidence: f64,
    pub execution_time_ms: u64,
    pub counters: BTreeMap<String, f64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sub_results: Vec<SubStrategyReport>,
}

impl Diagnostics {
    #[must_use]
    pub fn new(strategy: StrategyKind) -> Self {
        Self {
            strategy,
            degradation: None,
            reason: None,
            mock: false,
            error: None,
            confidence: 0.0,
            execution_time_ms: 0,
            counters: BTreeMap::new(),
            sub_results: Vec::new(),
        }
    }

    #[must_use]
    pub fn degraded(strategy: StrategyKind, degradation: Degradation) -> Self {
        Self {
            degradation: Some(degradation),
            reason: Some(degradation.reason().to_string()),
            ..Self::new(strategy)
        }
    }

    #[must_use]
    pub fn with_counter(mut self, name: &str, value: f64) -> Self {
        self.counters.insert(name.to_string(), value);
        self
    }

    #[must_use]
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    #[must_use]
    pub fn timed(mut self, start: Instant) -> Self {
        self.execution_time_ms = elapsed_ms(start);
        self
    }

    #[must_use]
    pub fn counter(&self, name: &str) -> Option<f64> {
        self.counters.get(name).copied()
    }

    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.degradation.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrategyOutput {
    pub candidates: Vec<Candidate>,
    pub diagnostics: Diagnostics,
}

impl StrategyOutput {
    #[must_use]
    pub fn new(candidates: Vec<Candidate>, diagnostics: Diagnostics) -> Self {
        Self {
            candidates,
            diagnostics,
        }
    }

    /// Empty result tagged with a degradation.
    #[must_use]
    pub fn degraded(diagnostics: Diagnostics) -> Self {
        Self::new(Vec::new(), diagnostics)
    }
}

/// Shared contract of every recommendation strategy.
pub trait RecommendationStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Loads read-only data. Calling it again after success is a no-op.
    fn initialize(&self) -> anyhow::Result<()>;

    fn run(&self, params: &RunParams) -> Result<StrategyOutput, StrategyError>;

    /// Folds a feedback event into the strategy's user model. Never fails;
    /// problems are logged.
    fn update_user_model(&self, _user_id: &str, _feedback: &Feedback) {}
}

/// Stand-in for a strategy that could not be loaded.
#[derive(Debug, Clone)]
pub struct MockStrategy {
    kind: StrategyKind,
    reason: String,
}

impl MockStrategy {
    #[must_use]
    pub fn new(kind: StrategyKind, reason: &str) -> Self {
        Self {
            kind,
            reason: reason.to_string(),
        }
    }
}

impl RecommendationStrategy for MockStrategy {
    fn kind(&self) -> StrategyKind {
        self.kind
    }

    fn initialize(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn run(&self, _params: &RunParams) -> Result<StrategyOutput, StrategyError> {
        let mut diagnostics = Diagnostics::new(self.kind);
        diagnostics.mock = true;
        diagnostics.reason = Some(format!("Strategy implementation not available: {}", self.reason));
        Ok(StrategyOutput::degraded(diagnostics))
    }
}

/// The closed set of strategies a registry can hold.
#[derive(Clone)]
pub enum RegisteredStrategy {
    Collaborative(Arc<CollaborativeStrategy>),
    Content(Arc<ContentStrategy>),
    Semantic(Arc<SemanticStrategy>),
    Hybrid(Arc<HybridStrategy>),
    Mock(MockStrategy),
}

impl RegisteredStrategy {
    #[must_use]
    pub fn as_strategy(&self) -> &dyn RecommendationStrategy {
        match self {
            Self::Collaborative(strategy) => strategy.as_ref(),
            Self::Content(strategy) => strategy.as_ref(),
            Self::Semantic(strategy) => strategy.as_ref(),
            Self::Hybrid(strategy) => strategy.as_ref(),
            Self::Mock(strategy) => strategy,
        }
    }

    #[must_use]
    pub fn kind(&self) -> StrategyKind {
        self.as_strategy().kind()
    }

    #[must_use]
    pub fn is_mock(&self) -> bool {
        matches!(self, Self::Mock(_))
    }

    pub fn initialize(&self) -> anyhow::Result<()> {
        self.as_strategy().initialize()
    }

    pub fn run(&self, params: &RunParams) -> Result<StrategyOutput, StrategyError> {
        self.as_strategy().run(params)
    }

    pub fn update_user_model(&self, user_id: &str, feedback: &Feedback) {
        self.as_strategy().update_user_model(user_id, feedback);
    }
}

impl std::fmt::Debug for RegisteredStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredStrategy")
            .field("kind", &self.kind())
            .field("mock", &self.is_mock())
            .finish()
    }
}

/// One-time, fallible initialization guarded against concurrent callers.
pub(crate) struct InitOnce<T> {
    cell: OnceLock<T>,
    guard: Mutex<()>,
}

impl<T> InitOnce<T> {
    pub(crate) fn new() -> Self {
        Self {
            cell: OnceLock::new(),
            guard: Mutex::new(()),
        }
    }

    pub(crate) fn get(&self) -> Option<&T> {
        self.cell.get()
    }

    /// Runs `init` at most once successfully; failures may be retried.
    pub(crate) fn get_or_try_init<F>(&self, init: F) -> anyhow::Result<&T>
    where
        F: FnOnce() -> anyhow::Result<T>,
    {
        if let Some(value) = self.cell.get() {
            return Ok(value);
        }
        let _lock = self.guard.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(value) = self.cell.get() {
            return Ok(value);
        }
        let value = init()?;
        Ok(self.cell.get_or_init(|| value))
    }
}

/// Descending by score; NaN sorts as equal.
pub(crate) fn sort_by_score(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
}

pub(crate) fn sort_by_effective_score(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| {
        b.effective_score()
            .partial_cmp(&a.effective_score())
            .unwrap_or(Ordering::Equal)
    });
}

pub(crate) fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Mean of the values, 0 for an empty slice.
pub(crate) fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}
