//! # Recommendation Engine
//!
//! The single entry point callers use. [`RecommendationEngine::generate`]
//! resolves a strategy, runs it, and post-processes the candidates:
//!
//! 1. **Artist fill**: candidates without an artist get one from the catalogue
//! 2. **Diversity cap**: at most `max(1, ⌊diversity_threshold × N⌋)` slots per artist
//! 3. **Confidence filter**: drop candidates whose effective score is below
//!    `confidence_threshold`
//! 4. **Truncation** to the requested limit
//! 5. **Provenance**: each survivor gets a validated [`Provenance`] built
//!    from its score components and the features actually present on its
//!    track record
//!
//! ## Provenance Features
//!
//! Content candidates name the features their strategy compared,
//! intersected with the record. Collaborative and semantic picks compare no
//! audio features, so their provenance lists the features present on the
//! track record instead: the track's audio description, not a claim that
//! those features drove the score. A track with no features gets no
//! provenance at all.
//!
//! ## Failure Handling
//!
//! `generate` never fails. Any strategy error or panic is logged and turned
//! into a fallback envelope (`strategy: "fallback"`, no candidates) that
//! preserves the error message.

use crate::config::EngineConfig;
use crate::embedding::EmbeddingProvider;
use crate::error::{ExplanationError, StrategyError};
use crate::explanation::{generate_explanation, Explanation};
use crate::model::{
    Candidate, Feedback, Filters, Limits, RunParams, StrategyKind, TrackRecord, UserContext,
};
use crate::provenance::{build_provenance, Provenance, ProvenanceSpec};
use crate::store::DataSource;
use crate::strategy::registry::StrategyRegistry;
use crate::strategy::{elapsed_ms, mean, Diagnostics, InitOnce, RegisteredStrategy};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

pub const ENGINE_NAME: &str = "RecommendationEngine";
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Strategy label used by fallback envelopes.
pub const FALLBACK_STRATEGY: &str = "fallback";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RecommendationRequest {
    pub user_id: String,
    pub user_context: UserContext,
    /// Explicit strategy; the configured default or the heuristic otherwise.
    pub strategy: Option<StrategyKind>,
    pub limit: Option<usize>,
    pub seeds: Vec<String>,
    pub filters: Filters,
}

impl RecommendationRequest {
    #[must_use]
    pub fn for_user(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeMetadata {
    pub original_count: usize,
    pub filtered_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<Diagnostics>,
    pub execution_time_ms: u64,
    pub engine: &'static str,
    pub version: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub fallback: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecommendationEnvelope {
    pub candidates: Vec<Candidate>,
    pub strategy: String,
    pub metadata: EnvelopeMetadata,
}

impl RecommendationEnvelope {
    fn fallback(message: String) -> Self {
        Self {
            candidates: Vec::new(),
            strategy: FALLBACK_STRATEGY.to_string(),
            metadata: EnvelopeMetadata {
                original_count: 0,
                filtered_count: 0,
                diagnostics: None,
                execution_time_ms: 0,
                engine: ENGINE_NAME,
                version: ENGINE_VERSION,
                error: Some(message),
                fallback: true,
            },
        }
    }

    #[must_use]
    pub fn is_fallback(&self) -> bool {
        self.metadata.fallback
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiversityReport {
    /// Distinct artists per candidate.
    pub artist_diversity: f64,
    pub genre_diversity: usize,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyEvaluation {
    pub strategy: String,
    pub execution_time_ms: u64,
    pub candidate_count: usize,
    pub avg_score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diversity: Option<DiversityReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<Diagnostics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

type Catalog = HashMap<String, TrackRecord>;

pub struct RecommendationEngine {
    config: EngineConfig,
    source: Arc<dyn DataSource>,
    embedder: Arc<dyn EmbeddingProvider>,
    registry: OnceLock<StrategyRegistry>,
    catalog: InitOnce<Catalog>,
}

impl RecommendationEngine {
    pub fn new(config: EngineConfig, source: Arc<dyn DataSource>, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            config,
            source,
            embedder,
            registry: OnceLock::new(),
            catalog: InitOnce::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Loads strategies and the track catalogue. Safe to call repeatedly;
    /// every other method initializes lazily anyway.
    pub fn initialize(&self) -> Result<()> {
        self.registry();
        self.catalog()?;
        info!("{} initialized over {}", ENGINE_NAME, self.source.describe());
        Ok(())
    }

    pub fn registry(&self) -> &StrategyRegistry {
        self.registry.get_or_init(|| {
            StrategyRegistry::load(&self.config, Arc::clone(&self.source), Arc::clone(&self.embedder))
        })
    }

    fn catalog(&self) -> Result<&Catalog> {
        self.catalog.get_or_try_init(|| {
            let tracks = self
                .source
                .tracks()
                .with_context(|| format!("Failed to load track catalogue from {}", self.source.describe()))?;
            Ok(tracks.into_iter().map(|track| (track.id.clone(), track)).collect())
        })
    }

    /// Generates recommendations. Never fails; see the module docs.
    pub fn generate(&self, request: &RecommendationRequest) -> RecommendationEnvelope {
        let start = Instant::now();
        match panic::catch_unwind(AssertUnwindSafe(|| self.try_generate(request, start))) {
            Ok(Ok(envelope)) => envelope,
            Ok(Err(err)) => {
                error!("Error generating recommendations for {}: {:#}", request.user_id, err);
                RecommendationEnvelope::fallback(format!("{:#}", err))
            }
            Err(payload) => {
                let err = StrategyError::from_panic(payload.as_ref());
                error!("Recommendation run for {} panicked: {}", request.user_id, err);
                RecommendationEnvelope::fallback(err.to_string())
            }
        }
    }

    fn resolve_strategy(&self, request: &RecommendationRequest) -> Result<&RegisteredStrategy> {
        let registry = self.registry();
        let kind = match request.strategy.or(self.config.default_strategy) {
            Some(kind) => kind,
            None => registry.select_strategy(&request.user_context, &self.config.selection.weights),
        };
        Ok(registry.get_strategy(kind)?)
    }

    fn try_generate(&self, request: &RecommendationRequest, start: Instant) -> Result<RecommendationEnvelope> {
        let strategy = self.resolve_strategy(request)?;
        let served_by = strategy.kind();
        let limit = request.limit.unwrap_or(self.config.default_limit);

        let params = RunParams {
            user_id: request.user_id.clone(),
            seeds: request.seeds.clone(),
            limits: Limits {
                candidates: self.config.max_candidates.min(limit.saturating_mul(3)),
                final_count: limit,
            },
            context: request.user_context.clone(),
            filters: request.filters.clone(),
        };

        let output = strategy.run(&params)?;
        let original_count = output.candidates.len();
        let catalog = self.catalog()?;
        let candidates = self.post_process(output.candidates, catalog, &request.user_context, served_by, limit);

        debug!(
            "Generated {} of {} candidates for {} with {}",
            candidates.len(),
            original_count,
            request.user_id,
            served_by
        );

        Ok(RecommendationEnvelope {
            strategy: served_by.to_string(),
            metadata: EnvelopeMetadata {
                original_count,
                filtered_count: candidates.len(),
                diagnostics: Some(output.diagnostics),
                execution_time_ms: elapsed_ms(start),
                engine: ENGINE_NAME,
                version: ENGINE_VERSION,
                error: None,
                fallback: false,
            },
            candidates,
        })
    }

    fn post_process(
        &self,
        mut candidates: Vec<Candidate>,
        catalog: &Catalog,
        context: &UserContext,
        served_by: StrategyKind,
        limit: usize,
    ) -> Vec<Candidate> {
        for candidate in &mut candidates {
            if candidate.artist.is_none() {
                candidate.artist = catalog.get(&candidate.track_id).and_then(|t| t.artist.clone());
            }
        }

        if self.config.diversity_threshold > 0.0 {
            candidates = cap_per_artist(candidates, self.config.diversity_threshold);
        }

        candidates.retain(|c| c.effective_score() >= self.config.confidence_threshold);
        candidates.truncate(limit);

        for candidate in &mut candidates {
            candidate.provenance =
                attach_provenance(candidate, catalog.get(&candidate.track_id), context, served_by);
        }
        candidates
    }

    /// Folds feedback into every strategy's user model.
    pub fn update_user_model(&self, user_id: &str, feedback: &Feedback) {
        // Hybrid holds the same sub-strategy instances; skip it so feedback
        // lands once per strategy.
        for strategy in self
            .registry()
            .strategies()
            .filter(|s| s.kind() != StrategyKind::Hybrid)
        {
            strategy.update_user_model(user_id, feedback);
        }
        debug!("Recorded {} feedback from {} on {}", feedback.signal.as_str(), user_id, feedback.track_id);
    }

    #[must_use]
    pub fn available_strategies(&self) -> Vec<&'static str> {
        self.registry().strategy_names()
    }

    /// Runs one strategy directly and summarizes its output.
    pub fn evaluate_strategy(&self, name: &str, params: &RunParams) -> StrategyEvaluation {
        let start = Instant::now();
        let outcome = self
            .registry()
            .get_by_name(name)
            .map_err(anyhow::Error::from)
            .and_then(|strategy| Ok(strategy.run(params)?));

        match outcome {
            Ok(output) => {
                let scores: Vec<f64> = output.candidates.iter().map(|c| c.score).collect();
                StrategyEvaluation {
                    strategy: name.to_string(),
                    execution_time_ms: elapsed_ms(start),
                    candidate_count: output.candidates.len(),
                    avg_score: mean(&scores),
                    diversity: Some(self.diversity(&output.candidates)),
                    diagnostics: Some(output.diagnostics),
                    error: None,
                    timestamp: Utc::now(),
                }
            }
            Err(err) => {
                error!("Error evaluating strategy {}: {:#}", name, err);
                StrategyEvaluation {
                    strategy: name.to_string(),
                    execution_time_ms: elapsed_ms(start),
                    candidate_count: 0,
                    avg_score: 0.0,
                    diversity: None,
                    diagnostics: None,
                    error: Some(format!("{:#}", err)),
                    timestamp: Utc::now(),
                }
            }
        }
    }

    fn diversity(&self, candidates: &[Candidate]) -> DiversityReport {
        if candidates.is_empty() {
            return DiversityReport {
                artist_diversity: 0.0,
                genre_diversity: 0,
                score: 0.0,
            };
        }
        let catalog = self.catalog().ok();
        let record = |id: &str| catalog.and_then(|c| c.get(id));

        let artists: HashSet<&str> = candidates
            .iter()
            .filter_map(|c| c.artist.as_deref().or_else(|| record(&c.track_id)?.artist.as_deref()))
            .collect();
        let genres: HashSet<&str> = candidates
            .iter()
            .filter_map(|c| record(&c.track_id)?.genre.as_deref())
            .collect();

        let count = candidates.len() as f64;
        DiversityReport {
            artist_diversity: artists.len() as f64 / count,
            genre_diversity: genres.len(),
            score: (artists.len() as f64 / (count * 0.7).max(1.0)).min(1.0),
        }
    }

    /// Renders a served candidate's provenance against its catalogue record.
    pub fn explain(&self, candidate: &Candidate) -> Result<Explanation, ExplanationError> {
        let provenance = candidate
            .provenance
            .as_ref()
            .ok_or_else(|| ExplanationError::MissingInput("provenance is required".to_string()))?;
        let catalog = self
            .catalog()
            .map_err(|err| ExplanationError::MissingInput(format!("track catalogue unavailable: {:#}", err)))?;
        let track = catalog
            .get(&candidate.track_id)
            .ok_or_else(|| ExplanationError::MissingInput(format!("track {} is not in the catalogue", candidate.track_id)))?;
        generate_explanation(track, provenance)
    }
}

/// Keeps candidates in order, allowing each artist at most
/// `max(1, ⌊threshold × N⌋)` slots. Candidates without an artist always pass.
fn cap_per_artist(candidates: Vec<Candidate>, threshold: f64) -> Vec<Candidate> {
    let cap = ((threshold * candidates.len() as f64).floor() as usize).max(1);
    let mut slots: HashMap<String, usize> = HashMap::new();
    candidates
        .into_iter()
        .filter(|candidate| match &candidate.artist {
            Some(artist) => {
                let used = slots.entry(artist.clone()).or_insert(0);
                *used += 1;
                *used <= cap
            }
            None => true,
        })
        .collect()
}

/// Builds a validated provenance for a served candidate, or `None` when the
/// track has no audio features to ground it on.
///
/// Candidates that compared no features (collaborative and semantic picks) fall back to
/// every whitelisted feature present on the record.
fn attach_provenance(
    candidate: &Candidate,
    record: Option<&TrackRecord>,
    context: &UserContext,
    served_by: StrategyKind,
) -> Option<Provenance> {
    let present = record?.audio_features.as_ref()?.present_features();
    let mut features: Vec<_> = candidate
        .features_used
        .iter()
        .copied()
        .filter(|feature| present.contains(feature))
        .collect();
    if features.is_empty() {
        features = present;
    }
    if features.is_empty() {
        return None;
    }

    let mut strategies = Vec::new();
    if served_by == StrategyKind::Hybrid {
        strategies.push(StrategyKind::Hybrid);
    }
    for strategy in &candidate.strategy_support {
        if !strategies.contains(strategy) {
            strategies.push(*strategy);
        }
    }

    let spec = ProvenanceSpec {
        track_id: candidate.track_id.clone(),
        strategies: strategies.iter().map(ToString::to_string).collect(),
        score_components: normalized_components(candidate)
            .into_iter()
            .map(|(strategy, share)| (strategy.to_string(), share))
            .collect(),
        features_used: features.iter().map(ToString::to_string).collect(),
        diversity_penalty_applied: None,
        novelty_days_since_last_play: context.last_played(&candidate.track_id).map(days_since),
        explanation_ref: None,
    };

    match build_provenance(&spec) {
        Ok(provenance) => Some(provenance),
        Err(err) => {
            warn!("Dropping provenance for {}: {}", candidate.track_id, err);
            None
        }
    }
}

/// Each strategy's share of the candidate's score. Negative contributions
/// count as zero; all-zero contributions split evenly across the support.
fn normalized_components(candidate: &Candidate) -> BTreeMap<StrategyKind, f64> {
    let positive: BTreeMap<StrategyKind, f64> = candidate
        .components
        .iter()
        .map(|(strategy, value)| (*strategy, if value.is_finite() { value.max(0.0) } else { 0.0 }))
        .collect();
    let total: f64 = positive.values().sum();
    if total > 0.0 {
        return positive
            .into_iter()
            .map(|(strategy, value)| (strategy, value / total))
            .collect();
    }

    let support: HashSet<StrategyKind> = candidate.strategy_support.iter().copied().collect();
    let share = 1.0 / support.len().max(1) as f64;
    support.into_iter().map(|strategy| (strategy, share)).collect()
}

fn days_since(played_at: DateTime<Utc>) -> f64 {
    let seconds = (Utc::now() - played_at).num_seconds().max(0) as f64;
    seconds / 86_400.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AudioFeature, AudioFeatureVector, HistoryEntry};
    use approx::assert_relative_eq;

    fn artist_candidate(id: &str, score: f64, artist: Option<&str>) -> Candidate {
        let mut candidate = Candidate::new(id, score, StrategyKind::Content);
        candidate.artist = artist.map(ToString::to_string);
        candidate
    }

    #[test]
    fn test_cap_per_artist() {
        let candidates = vec![
            artist_candidate("a1", 0.9, Some("A")),
            artist_candidate("a2", 0.8, Some("A")),
            artist_candidate("a3", 0.7, Some("A")),
            artist_candidate("b1", 0.6, Some("B")),
            artist_candidate("x", 0.5, None),
        ];
        // floor(0.5 x 5) = 2 slots per artist
        let kept = cap_per_artist(candidates, 0.5);
        let ids: Vec<&str> = kept.iter().map(|c| c.track_id.as_str()).collect();
        assert_eq!(ids, vec!["a1", "a2", "b1", "x"]);
    }

    #[test]
    fn test_cap_per_artist_allows_at_least_one() {
        let kept = cap_per_artist(vec![artist_candidate("a1", 0.9, Some("A"))], 0.1);
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn test_normalized_components_sum_to_one() {
        let mut candidate = Candidate::new("t", 0.4, StrategyKind::Collaborative);
        candidate.components.insert(StrategyKind::Content, 0.3);
        candidate.strategy_support.push(StrategyKind::Content);

        let shares = normalized_components(&candidate);
        assert_relative_eq!(shares[&StrategyKind::Collaborative], 0.4 / 0.7, epsilon = 1e-9);
        assert_relative_eq!(shares.values().sum::<f64>(), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_normalized_components_split_zero_scores() {
        let mut candidate = Candidate::new("t", 0.0, StrategyKind::Collaborative);
        candidate.components.insert(StrategyKind::Content, 0.0);
        candidate.strategy_support.push(StrategyKind::Content);

        let shares = normalized_components(&candidate);
        assert_relative_eq!(shares[&StrategyKind::Content], 0.5, epsilon = 1e-9);
    }

    #[test]
    fn test_provenance_is_grounded_on_record() {
        let record = TrackRecord::new("t").with_features(
            AudioFeatureVector::new()
                .with(AudioFeature::Energy, 0.8)
                .with(AudioFeature::Tempo, 120.0),
        );
        let mut candidate = Candidate::new("t", 0.7, StrategyKind::Content);
        candidate.features_used = vec![AudioFeature::Energy, AudioFeature::Valence];

        let provenance = attach_provenance(&candidate, Some(&record), &UserContext::default(), StrategyKind::Content)
            .unwrap();
        assert_eq!(provenance.features_used(), &[AudioFeature::Energy]);
        assert_eq!(provenance.strategies(), &[StrategyKind::Content]);
        assert!(provenance.novelty_days_since_last_play().is_none());
    }

    #[test]
    fn test_provenance_falls_back_to_present_features() {
        let record = TrackRecord::new("t").with_features(AudioFeatureVector::new().with(AudioFeature::Valence, 0.4));
        let candidate = Candidate::new("t", 1.2, StrategyKind::Collaborative);
        let provenance = attach_provenance(&candidate, Some(&record), &UserContext::default(), StrategyKind::Hybrid)
            .unwrap();
        assert_eq!(provenance.features_used(), &[AudioFeature::Valence]);
        assert_eq!(provenance.strategies(), &[StrategyKind::Hybrid, StrategyKind::Collaborative]);
    }

    #[test]
    fn test_no_provenance_without_features() {
        let candidate = Candidate::new("t", 0.9, StrategyKind::Collaborative);
        let bare = TrackRecord::new("t");
        assert!(attach_provenance(&candidate, Some(&bare), &UserContext::default(), StrategyKind::Collaborative).is_none());
        assert!(attach_provenance(&candidate, None, &UserContext::default(), StrategyKind::Collaborative).is_none());
    }

    #[test]
    fn test_novelty_from_last_play() {
        let record = TrackRecord::new("t").with_features(AudioFeatureVector::new().with(AudioFeature::Energy, 0.5));
        let candidate = Candidate::new("t", 0.9, StrategyKind::Content);
        let context = UserContext {
            listening_history: vec![HistoryEntry {
                track_id: "t".to_string(),
                played_at: Some(Utc::now() - chrono::Duration::days(3)),
            }],
            ..UserContext::default()
        };
        let provenance = attach_provenance(&candidate, Some(&record), &context, StrategyKind::Content).unwrap();
        let days = provenance.novelty_days_since_last_play().unwrap();
        assert!((2.99..=3.01).contains(&days));
    }
}
