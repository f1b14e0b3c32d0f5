//! # Collaborative Strategy
//!
//! User-user collaborative filtering over interaction history.
//!
//! ## Algorithm
//!
//! 1. Merge the stored history with in-context plays (deduplicated by
//!    track and signal).
//! 2. Find users whose interacted track sets overlap with the target's
//!    (Jaccard similarity, polarity ignored).
//! 3. Each similar user's interactions with unknown tracks add
//!    `weight × similarity` to that track's score.
//! 4. Tracks backed by several users get a bounded support boost.
//!
//! Users with too little history degrade to `coldStart`; too few neighbours
//! degrade to `insufficientData`.

use super::{
    elapsed_ms, mean, sort_by_score, Degradation, Diagnostics, InitOnce, RecommendationStrategy,
    StrategyOutput,
};
use crate::cache::ReadThroughCache;
use crate::error::StrategyError;
use crate::model::{Candidate, Feedback, Filters, Interaction, RunParams, Signal, StrategyKind, UserContext};
use crate::store::DataSource;
use anyhow::Context;
use chrono::{Duration, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollaborativeConfig {
    pub min_interactions: usize,
    pub similarity_threshold: f64,
    pub max_similar_users: usize,
    pub min_similar_users: usize,
    /// Only interactions this recent are loaded. `None` loads everything.
    pub history_window_days: Option<i64>,
    /// Sliding window of interactions kept per user.
    pub max_interactions_per_user: usize,
    pub support_boost_step: f64,
    pub max_support_boost: f64,
}

impl Default for CollaborativeConfig {
    fn default() -> Self {
        Self {
            min_interactions: 3,
            similarity_threshold: 0.1,
            max_similar_users: 50,
            min_similar_users: 1,
            history_window_days: Some(90),
            max_interactions_per_user: 1000,
            support_boost_step: 0.1,
            max_support_boost: 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimilarUser {
    pub user_id: String,
    pub similarity: f64,
}

/// Catalogue data loaded once at initialization.
#[derive(Debug, Default)]
struct CatalogIndex {
    genres: HashMap<String, String>,
}

pub struct CollaborativeStrategy {
    config: CollaborativeConfig,
    source: Arc<dyn DataSource>,
    interactions: ReadThroughCache<String, Vec<Interaction>>,
    similar_users: ReadThroughCache<String, Vec<SimilarUser>>,
    catalog: InitOnce<CatalogIndex>,
}

impl CollaborativeStrategy {
    pub fn new(config: CollaborativeConfig, source: Arc<dyn DataSource>) -> Self {
        let loader_source = Arc::clone(&source);
        let loader_config = config.clone();
        let interactions = ReadThroughCache::new(move |user_id: &String| {
            let history = loader_source
                .user_interactions(user_id)
                .with_context(|| format!("Failed to load interactions for user {}", user_id))?;
            let history = trim_history(history, &loader_config);
            Ok((!history.is_empty()).then_some(history))
        });

        Self {
            config,
            source,
            interactions,
            similar_users: ReadThroughCache::unbacked(),
            catalog: InitOnce::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &CollaborativeConfig {
        &self.config
    }

    fn load(&self) -> anyhow::Result<CatalogIndex> {
        let all = self
            .source
            .interactions()
            .with_context(|| format!("Failed to load interactions from {}", self.source.describe()))?;

        let mut by_user: HashMap<String, Vec<Interaction>> = HashMap::new();
        for interaction in all {
            by_user.entry(interaction.user_id.clone()).or_default().push(interaction);
        }

        let users: Vec<(String, Vec<Interaction>)> = by_user
            .into_iter()
            .map(|(user, history)| (user, trim_history(history, &self.config)))
            .filter(|(_, history)| history.len() >= self.config.min_interactions)
            .collect();
        info!("Loaded interactions for {} users", users.len());
        self.interactions.prime(users);

        let genres = self
            .source
            .tracks()
            .with_context(|| format!("Failed to load tracks from {}", self.source.describe()))?
            .into_iter()
            .filter_map(|track| track.genre.map(|genre| (track.id, genre)))
            .collect();

        Ok(CatalogIndex { genres })
    }

    /// Stored history merged with in-context plays, keeping the first
    /// interaction per `(track, signal)`.
    fn user_history(&self, user_id: &str, context: &UserContext) -> Result<Vec<Interaction>, StrategyError> {
        let stored = self
            .interactions
            .get(&user_id.to_string())
            .map_err(StrategyError::DataSource)?;

        let merged = stored
            .iter()
            .flat_map(|history| history.iter().cloned())
            .chain(context.listening_history.iter().map(|entry| {
                let timestamp = entry.played_at.unwrap_or_else(Utc::now);
                Interaction::new(user_id, &entry.track_id, Signal::Play, timestamp)
            }));

        let mut seen: HashSet<(String, Signal)> = HashSet::new();
        Ok(merged
            .filter(|interaction| seen.insert((interaction.track_id.clone(), interaction.signal)))
            .collect())
    }

    /// Users whose track sets overlap the target's, most similar first.
    pub fn find_similar_users(&self, user_id: &str, history: &[Interaction]) -> Vec<SimilarUser> {
        let target: HashSet<&str> = history.iter().map(|i| i.track_id.as_str()).collect();

        let mut similar: Vec<SimilarUser> = self
            .interactions
            .snapshot()
            .into_iter()
            .filter(|(other, _)| other != user_id)
            // Neighbours meet the same floor as users primed at initialization.
            .filter(|(_, interactions)| interactions.len() >= self.config.min_interactions)
            .filter_map(|(other, interactions)| {
                let theirs: HashSet<&str> = interactions.iter().map(|i| i.track_id.as_str()).collect();
                let similarity = jaccard_similarity(&target, &theirs);
                (similarity >= self.config.similarity_threshold).then_some(SimilarUser {
                    user_id: other,
                    similarity,
                })
            })
            .collect();

        similar.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.user_id.cmp(&b.user_id))
        });
        similar.truncate(self.config.max_similar_users);
        similar
    }

    fn generate_candidates(&self, similar: &[SimilarUser], history: &[Interaction], limit: usize) -> Vec<Candidate> {
        let known: HashSet<&str> = history.iter().map(|i| i.track_id.as_str()).collect();

        struct Evidence {
            score: f64,
            supporters: usize,
            last_supporter: usize,
            first_similarity: f64,
        }

        let mut order: Vec<String> = Vec::new();
        let mut evidence: HashMap<String, Evidence> = HashMap::new();

        for (index, neighbour) in similar.iter().enumerate() {
            let Some(interactions) = self.interactions.peek(&neighbour.user_id) else {
                continue;
            };
            for interaction in interactions.iter().filter(|i| !known.contains(i.track_id.as_str())) {
                let entry = evidence.entry(interaction.track_id.clone()).or_insert_with(|| {
                    order.push(interaction.track_id.clone());
                    Evidence {
                        score: 0.0,
                        supporters: 0,
                        last_supporter: usize::MAX,
                        first_similarity: neighbour.similarity,
                    }
                });
                entry.score += interaction.weight * neighbour.similarity;
                if entry.last_supporter != index {
                    entry.supporters += 1;
                    entry.last_supporter = index;
                }
            }
        }

        let mut candidates: Vec<Candidate> = order
            .into_iter()
            .filter_map(|track_id| {
                let evidence = evidence.remove(&track_id)?;
                if evidence.score <= 0.0 {
                    return None;
                }
                let mut candidate = Candidate::new(&track_id, evidence.score, StrategyKind::Collaborative);
                candidate.reasons.push(format!(
                    "Liked by similar users ({}% taste overlap)",
                    (evidence.first_similarity * 100.0).round()
                ));
                if evidence.supporters > 1 {
                    candidate
                        .reasons
                        .push(format!("{} similar users enjoyed this", evidence.supporters));
                }
                self.apply_support_boost(&mut candidate, evidence.supporters);
                Some(candidate)
            })
            .collect();

        sort_by_score(&mut candidates);
        candidates.truncate(limit);
        candidates
    }

    /// `score × min(1 + step × (supporters − 1), max)`
    fn apply_support_boost(&self, candidate: &mut Candidate, supporters: usize) {
        let boost = (1.0 + self.config.support_boost_step * supporters.saturating_sub(1) as f64)
            .min(self.config.max_support_boost);
        candidate.score *= boost;
    }

    fn apply_filters(&self, candidates: Vec<Candidate>, filters: &Filters) -> Vec<Candidate> {
        let genres = self.catalog.get().map(|catalog| &catalog.genres);
        candidates
            .into_iter()
            .filter(|candidate| {
                let genre = genres.and_then(|g| g.get(&candidate.track_id)).map(String::as_str);
                filters.allows_genre(genre)
            })
            .filter(|candidate| filters.min_score.map_or(true, |min| candidate.score >= min))
            .collect()
    }
}

impl RecommendationStrategy for CollaborativeStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Collaborative
    }

    fn initialize(&self) -> anyhow::Result<()> {
        self.catalog.get_or_try_init(|| self.load()).map(|_| ())
    }

    fn run(&self, params: &RunParams) -> Result<StrategyOutput, StrategyError> {
        let start = Instant::now();
        self.initialize().map_err(StrategyError::Initialization)?;

        let history = self.user_history(&params.user_id, &params.context)?;
        if history.len() < self.config.min_interactions {
            debug!(
                "User {} has {} interactions, below {}",
                params.user_id,
                history.len(),
                self.config.min_interactions
            );
            return Ok(StrategyOutput::degraded(
                Diagnostics::degraded(StrategyKind::Collaborative, Degradation::ColdStart)
                    .with_counter("userHistorySize", history.len() as f64)
                    .timed(start),
            ));
        }

        // Context history changes the neighbourhood, so only bare requests are memoized.
        let similar = if params.context.listening_history.is_empty() {
            self.similar_users
                .get_or_try_insert_with(params.user_id.clone(), || {
                    Ok::<_, StrategyError>(self.find_similar_users(&params.user_id, &history))
                })?
                .as_ref()
                .clone()
        } else {
            self.find_similar_users(&params.user_id, &history)
        };

        if similar.len() < self.config.min_similar_users {
            return Ok(StrategyOutput::degraded(
                Diagnostics::degraded(StrategyKind::Collaborative, Degradation::InsufficientData)
                    .with_counter("similarUsers", similar.len() as f64)
                    .with_counter("userHistorySize", history.len() as f64)
                    .timed(start),
            ));
        }

        let generated = self.generate_candidates(&similar, &history, params.limits.candidates);
        let generated_count = generated.len();
        let mut candidates = self.apply_filters(generated, &params.filters);
        let filtered_count = candidates.len();
        candidates.truncate(params.limits.final_count);

        let similarities: Vec<f64> = similar.iter().map(|s| s.similarity).collect();
        let confidence = mean(&similarities) * (history.len() as f64 / 20.0).min(1.0);

        let diagnostics = Diagnostics::new(StrategyKind::Collaborative)
            .with_counter("similarUsers", similar.len() as f64)
            .with_counter("candidatesGenerated", generated_count as f64)
            .with_counter("candidatesFiltered", filtered_count as f64)
            .with_counter("userHistorySize", history.len() as f64)
            .with_confidence(confidence)
            .timed(start);
        debug!(
            "Collaborative run for {}: {} similar users, {} candidates in {}ms",
            params.user_id,
            similar.len(),
            candidates.len(),
            elapsed_ms(start)
        );

        Ok(StrategyOutput::new(candidates, diagnostics))
    }

    fn update_user_model(&self, user_id: &str, feedback: &Feedback) {
        if let Err(err) = self.initialize() {
            warn!("Skipping collaborative model update for {}: {:#}", user_id, err);
            return;
        }

        // Users below the initialization floor are not primed; read their
        // stored history through first so the feedback extends it.
        let key = user_id.to_string();
        if let Err(err) = self.interactions.get(&key) {
            warn!("Skipping collaborative model update for {}: {:#}", user_id, err);
            return;
        }

        let interaction = feedback.clone().into_interaction(user_id);
        let window = self.config.max_interactions_per_user;
        self.interactions.upsert(key.clone(), Vec::new, |history| {
            history.insert(0, interaction);
            history.truncate(window);
        });
        self.similar_users.invalidate(&key);
        info!(
            "Updated collaborative model for user {} with {} on {}",
            user_id,
            feedback.signal.as_str(),
            feedback.track_id
        );
    }
}

/// Applies the history window and keeps the most recent interactions.
fn trim_history(mut history: Vec<Interaction>, config: &CollaborativeConfig) -> Vec<Interaction> {
    if let Some(days) = config.history_window_days {
        let cutoff = Utc::now() - Duration::days(days);
        history.retain(|interaction| interaction.timestamp >= cutoff);
    }
    history.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    history.truncate(config.max_interactions_per_user);
    history
}

/// `|A ∩ B| / |A ∪ B|`, 0 when both sets are empty.
pub fn jaccard_similarity<T: Eq + Hash>(a: &HashSet<T>, b: &HashSet<T>) -> f64 {
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}
