//! # Hybrid Strategy
//!
//! Runs the applicable sub-strategies concurrently, fuses their candidate
//! lists and reranks the result.
//!
//! ## Sub-strategy selection
//!
//! - collaborative: only when the request carries more than five history entries
//! - content: always
//! - semantic: only when there is a message, a semantic query, a mood or an activity
//!
//! Mock sub-strategies are never selected. Sub-strategies are joined
//! all-settled: one that fails or panics contributes an empty list with
//! weight 0 and its error, and never cancels its siblings.
//!
//! ## Fusion
//!
//! - **Weighted fusion**: Σ `score × weight`, then a multi-strategy bonus
//!   `1 + bonus × (support − 1)`.
//! - **Rank fusion**: Σ `weight / (rank + 1)`.
//! - **Interleaving**: repeatedly draw a source list with probability
//!   proportional to its weight and take its next unseen candidate.

use super::{
    elapsed_ms, sort_by_effective_score, sort_by_score, Degradation, Diagnostics, RecommendationStrategy,
    RegisteredStrategy, StrategyOutput, SubStrategyReport,
};
use crate::error::StrategyError;
use crate::model::{Candidate, Feedback, Filters, RunParams, StrategyKind, UserContext};
use log::{debug, error, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::str::FromStr;
use std::time::Instant;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FusionAlgorithm {
    #[default]
    WeightedFusion,
    RankFusion,
    Interleaving,
}

impl FromStr for FusionAlgorithm {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.replace('-', "_").as_str() {
            "weighted_fusion" | "weighted" => Ok(Self::WeightedFusion),
            "rank_fusion" | "rank" => Ok(Self::RankFusion),
            "interleaving" | "interleave" => Ok(Self::Interleaving),
            other => Err(anyhow::anyhow!("unknown fusion algorithm '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HybridConfig {
    pub strategy_weights: BTreeMap<StrategyKind, f64>,
    pub min_strategies: usize,
    pub diversity_weight: f64,
    pub novelty_weight: f64,
    pub multi_strategy_bonus: f64,
    pub algorithm: FusionAlgorithm,
    /// Collaborative joins only above this many history entries.
    pub collaborative_min_history: usize,
    /// Fixed seed for interleaving; random when absent.
    pub interleave_seed: Option<u64>,
}

impl Default for HybridConfig {
    fn default() -> Self {
        Self {
            strategy_weights: BTreeMap::from([
                (StrategyKind::Collaborative, 0.4),
                (StrategyKind::Content, 0.35),
                (StrategyKind::Semantic, 0.25),
            ]),
            min_strategies: 2,
            diversity_weight: 0.3,
            novelty_weight: 0.2,
            multi_strategy_bonus: 0.2,
            algorithm: FusionAlgorithm::WeightedFusion,
            collaborative_min_history: 5,
            interleave_seed: None,
        }
    }
}

const DEFAULT_SUB_WEIGHT: f64 = 0.1;
const UNKNOWN_CONFIDENCE: f64 = 0.5;

/// Settled result of one sub-strategy.
#[derive(Debug, Clone)]
pub struct StrategyRun {
    pub strategy: StrategyKind,
    pub weight: f64,
    pub output: StrategyOutput,
    pub execution_time_ms: u64,
}

impl StrategyRun {
    #[must_use]
    pub fn new(strategy: StrategyKind, weight: f64, candidates: Vec<Candidate>) -> Self {
        Self {
            strategy,
            weight,
            output: StrategyOutput::new(candidates, Diagnostics::new(strategy)),
            execution_time_ms: 0,
        }
    }

    fn failed(strategy: StrategyKind, message: String, execution_time_ms: u64) -> Self {
        let mut diagnostics = Diagnostics::new(strategy);
        diagnostics.error = Some(message);
        Self {
            strategy,
            weight: 0.0,
            output: StrategyOutput::degraded(diagnostics),
            execution_time_ms,
        }
    }

    fn report(&self) -> SubStrategyReport {
        let diagnostics = &self.output.diagnostics;
        SubStrategyReport {
            strategy: self.strategy,
            weight: self.weight,
            candidates: self.output.candidates.len(),
            confidence: diagnostics.confidence,
            execution_time_ms: self.execution_time_ms,
            degradation: diagnostics.degradation,
            error: diagnostics.error.clone(),
        }
    }
}

pub struct HybridStrategy {
    config: HybridConfig,
    subs: Vec<RegisteredStrategy>,
}

impl HybridStrategy {
    #[must_use]
    pub fn new(config: HybridConfig, subs: Vec<RegisteredStrategy>) -> Self {
        Self { config, subs }
    }

    fn weight_for(&self, strategy: StrategyKind) -> f64 {
        self.config
            .strategy_weights
            .get(&strategy)
            .copied()
            .unwrap_or(DEFAULT_SUB_WEIGHT)
    }

    fn sub(&self, kind: StrategyKind) -> Option<&RegisteredStrategy> {
        self.subs.iter().find(|sub| sub.kind() == kind && !sub.is_mock())
    }

    /// Sub-strategies worth running for this request.
    fn select_active(&self, context: &UserContext, filters: &Filters) -> Vec<&RegisteredStrategy> {
        let mut active = Vec::new();

        if context.listening_history.len() > self.config.collaborative_min_history {
            active.extend(self.sub(StrategyKind::Collaborative));
        }
        active.extend(self.sub(StrategyKind::Content));

        let has_text = context.user_message.is_some()
            || context.semantic_query.is_some()
            || filters.mood.is_some()
            || filters.activity.is_some();
        if has_text {
            active.extend(self.sub(StrategyKind::Semantic));
        }
        active
    }

    /// Runs one sub-strategy, turning errors and panics into an empty,
    /// zero-weight result.
    fn settle(&self, sub: &RegisteredStrategy, params: &RunParams) -> StrategyRun {
        let start = Instant::now();
        let kind = sub.kind();
        match panic::catch_unwind(AssertUnwindSafe(|| sub.run(params))) {
            Ok(Ok(output)) => StrategyRun {
                strategy: kind,
                weight: self.weight_for(kind),
                output,
                execution_time_ms: elapsed_ms(start),
            },
            Ok(Err(err)) => {
                error!("Error running {} strategy: {}", kind, err);
                StrategyRun::failed(kind, err.to_string(), elapsed_ms(start))
            }
            Err(payload) => {
                let err = StrategyError::from_panic(payload.as_ref());
                error!("{} strategy panicked: {}", kind, err);
                StrategyRun::failed(kind, err.to_string(), elapsed_ms(start))
            }
        }
    }

    fn fuse(&self, runs: &[StrategyRun], limit: usize) -> Vec<Candidate> {
        match self.config.algorithm {
            FusionAlgorithm::WeightedFusion => weighted_fusion(runs, self.config.multi_strategy_bonus, limit),
            FusionAlgorithm::RankFusion => rank_fusion(runs, limit),
            FusionAlgorithm::Interleaving => {
                let mut rng = match self.config.interleave_seed {
                    Some(seed) => StdRng::seed_from_u64(seed),
                    None => StdRng::from_entropy(),
                };
                interleave(runs, limit, &mut rng)
            }
        }
    }

    /// Diversity boost for multi-strategy candidates, novelty boost for
    /// tracks absent from a non-empty history, then sort and truncate.
    #[must_use]
    pub fn apply_final_ranking(&self, mut candidates: Vec<Candidate>, context: &UserContext, limit: usize) -> Vec<Candidate> {
        let recent: HashSet<&str> = context
            .listening_history
            .iter()
            .map(|entry| entry.track_id.as_str())
            .collect();

        for candidate in &mut candidates {
            let mut final_score = candidate.score;
            if candidate.strategy_support.len() > 1 {
                final_score *= 1.0 + self.config.diversity_weight;
            }
            if !recent.is_empty() && !recent.contains(candidate.track_id.as_str()) {
                final_score *= 1.0 + self.config.novelty_weight;
            }
            candidate.final_score = Some(final_score);
        }

        sort_by_effective_score(&mut candidates);
        candidates.truncate(limit);
        candidates
    }

    /// Weighted mean of sub-strategy confidences, with a bonus for breadth.
    fn confidence(runs: &[StrategyRun]) -> f64 {
        if runs.is_empty() {
            return 0.0;
        }
        let (total, weight) = runs.iter().fold((0.0, 0.0), |(total, weight), run| {
            let confidence = if run.output.diagnostics.confidence > 0.0 {
                run.output.diagnostics.confidence
            } else {
                UNKNOWN_CONFIDENCE
            };
            (total + confidence * run.weight, weight + run.weight)
        });
        let average = if weight > 0.0 { total / weight } else { 0.0 };
        average * (1.0 + (runs.len() as f64 / 3.0).min(1.0) * 0.2)
    }
}

impl RecommendationStrategy for HybridStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Hybrid
    }

    fn initialize(&self) -> anyhow::Result<()> {
        for sub in self.subs.iter().filter(|sub| !sub.is_mock()) {
            if let Err(err) = sub.initialize() {
                warn!("Failed to initialize {} sub-strategy: {:#}", sub.kind(), err);
            }
        }
        Ok(())
    }

    fn run(&self, params: &RunParams) -> Result<StrategyOutput, StrategyError> {
        let start = Instant::now();
        let active = self.select_active(&params.context, &params.filters);

        if active.len() < self.config.min_strategies {
            return Ok(StrategyOutput::degraded(
                Diagnostics::degraded(StrategyKind::Hybrid, Degradation::InsufficientStrategies)
                    .with_counter("activeStrategies", active.len() as f64)
                    .with_counter("minRequired", self.config.min_strategies as f64)
                    .timed(start),
            ));
        }

        // Sub-strategies hand over their whole pool; truncation happens after fusion.
        let mut sub_params = params.clone();
        sub_params.limits.final_count = params.limits.candidates;

        let runs: Vec<StrategyRun> = active.par_iter().map(|sub| self.settle(sub, &sub_params)).collect();

        let fused = self.fuse(&runs, params.limits.candidates);
        let combined = fused.len();
        let candidates = self.apply_final_ranking(fused, &params.context, params.limits.final_count);

        debug!(
            "Hybrid run for {}: {} sub-strategies, {} combined, {} final in {}ms",
            params.user_id,
            runs.len(),
            combined,
            candidates.len(),
            elapsed_ms(start)
        );

        let mut diagnostics = Diagnostics::new(StrategyKind::Hybrid)
            .with_counter("activeStrategies", runs.len() as f64)
            .with_counter("combinedCandidates", combined as f64)
            .with_confidence(Self::confidence(&runs))
            .timed(start);
        diagnostics.sub_results = runs.iter().map(StrategyRun::report).collect();

        Ok(StrategyOutput::new(candidates, diagnostics))
    }

    fn update_user_model(&self, user_id: &str, feedback: &Feedback) {
        for sub in &self.subs {
            sub.update_user_model(user_id, feedback);
        }
    }
}

/// Σ `score × weight` per track, then `× (1 + bonus × (support − 1))`.
#[must_use]
pub fn weighted_fusion(runs: &[StrategyRun], multi_strategy_bonus: f64, limit: usize) -> Vec<Candidate> {
    let mut fused: Vec<Candidate> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();

    for run in runs {
        for candidate in &run.output.candidates {
            let contribution = candidate.score * run.weight;
            match positions.get(&candidate.track_id) {
                Some(&position) => {
                    let existing = &mut fused[position];
                    existing.score += contribution;
                    *existing.components.entry(run.strategy).or_insert(0.0) += contribution;
                    if !existing.strategy_support.contains(&run.strategy) {
                        existing.strategy_support.push(run.strategy);
                    }
                    existing.reasons.extend(candidate.reasons.iter().cloned());
                    for feature in &candidate.features_used {
                        if !existing.features_used.contains(feature) {
                            existing.features_used.push(*feature);
                        }
                    }
                    if existing.artist.is_none() {
                        existing.artist = candidate.artist.clone();
                    }
                }
                None => {
                    let mut first = candidate.clone();
                    first.score = contribution;
                    first.components = BTreeMap::from([(run.strategy, contribution)]);
                    first.strategy_support = vec![run.strategy];
                    first.final_score = None;
                    positions.insert(candidate.track_id.clone(), fused.len());
                    fused.push(first);
                }
            }
        }
    }

    for candidate in &mut fused {
        let support = candidate.strategy_support.len();
        if support > 1 {
            candidate.score *= 1.0 + multi_strategy_bonus * (support - 1) as f64;
        }
    }

    sort_by_score(&mut fused);
    fused.truncate(limit);
    fused
}

/// Σ `weight / (rank + 1)` per track, ranks being 0-based positions.
#[must_use]
pub fn rank_fusion(runs: &[StrategyRun], limit: usize) -> Vec<Candidate> {
    let mut fused: Vec<Candidate> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();

    for run in runs {
        for (rank, candidate) in run.output.candidates.iter().enumerate() {
            let rank_score = run.weight / (rank + 1) as f64;
            match positions.get(&candidate.track_id) {
                Some(&position) => {
                    let existing = &mut fused[position];
                    existing.score += rank_score;
                    *existing.components.entry(run.strategy).or_insert(0.0) += rank_score;
                    if !existing.strategy_support.contains(&run.strategy) {
                        existing.strategy_support.push(run.strategy);
                    }
                    existing.reasons.extend(candidate.reasons.iter().cloned());
                }
                None => {
                    let mut first = candidate.clone();
                    first.score = rank_score;
                    first.components = BTreeMap::from([(run.strategy, rank_score)]);
                    first.strategy_support = vec![run.strategy];
                    first.final_score = None;
                    positions.insert(candidate.track_id.clone(), fused.len());
                    fused.push(first);
                }
            }
        }
    }

    sort_by_score(&mut fused);
    fused.truncate(limit);
    fused
}

/// Weighted random interleaving of the source lists, skipping duplicates.
/// Sources with zero total weight are drawn in list order.
pub fn interleave<R: Rng>(runs: &[StrategyRun], limit: usize, rng: &mut R) -> Vec<Candidate> {
    let mut cursors = vec![0usize; runs.len()];
    let mut seen: HashSet<&str> = HashSet::new();
    let mut interleaved = Vec::new();

    while interleaved.len() < limit {
        let available: Vec<usize> = (0..runs.len())
            .filter(|i| cursors[*i] < runs[*i].output.candidates.len())
            .collect();
        let Some(&first) = available.first() else {
            break;
        };

        let total: f64 = available.iter().map(|i| runs[*i].weight).sum();
        let mut remaining = rng.gen::<f64>() * total;
        let mut selected = first;
        for &i in &available {
            remaining -= runs[i].weight;
            if remaining <= 0.0 {
                selected = i;
                break;
            }
        }

        let candidate = &runs[selected].output.candidates[cursors[selected]];
        cursors[selected] += 1;
        if seen.insert(candidate.track_id.as_str()) {
            let mut picked = candidate.clone();
            picked.components = BTreeMap::from([(runs[selected].strategy, candidate.score)]);
            picked.strategy_support = vec![runs[selected].strategy];
            picked.final_score = None;
            interleaved.push(picked);
        }
    }

    interleaved
}
