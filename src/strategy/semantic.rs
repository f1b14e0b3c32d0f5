//! # Semantic Strategy
//!
//! Embedding-based recommendations. Seeds are embeddings of explicit seed
//! tracks, of free-text queries derived from the request (embedded on
//! demand through a read-through cache) and, when those are scarce, of
//! recently played tracks. Tracks close to any seed are scored by their
//! seed-weighted mean cosine similarity.

use super::{
    elapsed_ms, sort_by_score, Degradation, Diagnostics, InitOnce, RecommendationStrategy,
    StrategyOutput,
};
use crate::cache::ReadThroughCache;
use crate::embedding::{cosine_similarity, Embedding, EmbeddingProvider, TrackEmbedding};
use crate::error::StrategyError;
use crate::model::{Candidate, Filters, RunParams, StrategyKind, UserContext};
use crate::store::DataSource;
use anyhow::Context;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SemanticConfig {
    pub similarity_threshold: f64,
    pub seed_weight: f64,
    pub query_weight: f64,
    pub history_weight: f64,
    /// History is only consulted below this many seed embeddings.
    pub min_seed_embeddings: usize,
    pub history_seed_count: usize,
    pub query_match_boost: f64,
    pub high_similarity_boost: f64,
    pub high_similarity_cutoff: f64,
    /// Dimension of the built-in query embedder.
    pub embedding_dimension: usize,
    /// Queries embedded at initialization.
    pub common_queries: Vec<String>,
}

impl Default for SemanticConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.7,
            seed_weight: 1.0,
            query_weight: 0.8,
            history_weight: 0.6,
            min_seed_embeddings: 3,
            history_seed_count: 5,
            query_match_boost: 1.2,
            high_similarity_boost: 1.1,
            high_similarity_cutoff: 0.85,
            embedding_dimension: crate::embedding::DEFAULT_DIMENSION,
            common_queries: [
                "upbeat dance music",
                "relaxing jazz",
                "energetic rock",
                "ambient electronic",
                "classical piano",
                "romantic ballads",
                "workout music",
                "study music",
                "party songs",
                "melancholy indie",
            ]
            .iter()
            .map(ToString::to_string)
            .collect(),
        }
    }
}

/// Where a seed embedding came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeedSource {
    Track(String),
    Query(String),
    History(String),
}

#[derive(Debug, Clone)]
pub struct SeedEmbedding {
    pub source: SeedSource,
    pub vector: Arc<Embedding>,
    pub weight: f64,
}

#[derive(Debug, Default)]
struct EmbeddingIndex {
    tracks: Vec<TrackEmbedding>,
    by_id: HashMap<String, usize>,
}

impl EmbeddingIndex {
    fn get(&self, track_id: &str) -> Option<&TrackEmbedding> {
        self.by_id.get(track_id).map(|index| &self.tracks[*index])
    }
}

pub struct SemanticStrategy {
    config: SemanticConfig,
    source: Arc<dyn DataSource>,
    queries: ReadThroughCache<String, Embedding>,
    index: InitOnce<EmbeddingIndex>,
}

impl SemanticStrategy {
    pub fn new(config: SemanticConfig, source: Arc<dyn DataSource>, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        let queries = ReadThroughCache::new(move |query: &String| {
            embedder
                .embed(query)
                .map(Some)
                .with_context(|| format!("Failed to embed query \"{}\"", query))
        });
        Self {
            config,
            source,
            queries,
            index: InitOnce::new(),
        }
    }

    fn load(&self) -> anyhow::Result<EmbeddingIndex> {
        let mut tracks = self
            .source
            .track_embeddings()
            .with_context(|| format!("Failed to load track embeddings from {}", self.source.describe()))?;
        tracks.sort_by(|a, b| a.track_id.cmp(&b.track_id));
        let by_id = tracks
            .iter()
            .enumerate()
            .map(|(index, track)| (track.track_id.clone(), index))
            .collect();

        if tracks.is_empty() {
            warn!("No track embeddings available; semantic recommendations will be empty");
        } else {
            info!("Loaded embeddings for {} tracks", tracks.len());
        }

        for query in &self.config.common_queries {
            if let Err(err) = self.queries.get(query) {
                warn!("Could not prime query embedding: {:#}", err);
            }
        }

        Ok(EmbeddingIndex { tracks, by_id })
    }

    /// Free-text queries derived from the request, deduplicated.
    #[must_use]
    pub fn extract_queries(context: &UserContext, filters: &Filters) -> Vec<String> {
        let mut queries: Vec<String> = Vec::new();
        queries.extend(context.user_message.iter().cloned());
        queries.extend(context.semantic_query.iter().cloned());
        if let Some(mood) = &filters.mood {
            queries.push(format!("{} music", mood));
        }
        if let Some(activity) = &filters.activity {
            queries.push(format!("music for {}", activity));
        }
        queries.extend(context.favorite_genres.iter().map(|genre| format!("{} music", genre)));

        let mut seen = HashSet::new();
        queries.retain(|query| !query.trim().is_empty() && seen.insert(query.clone()));
        queries
    }

    fn seed_embeddings(
        &self,
        index: &EmbeddingIndex,
        params: &RunParams,
        queries: &[String],
    ) -> Result<Vec<SeedEmbedding>, StrategyError> {
        let mut seeds: Vec<SeedEmbedding> = params
            .seeds
            .iter()
            .filter_map(|id| index.get(id))
            .map(|track| SeedEmbedding {
                source: SeedSource::Track(track.track_id.clone()),
                vector: Arc::new(track.embedding.clone()),
                weight: self.config.seed_weight,
            })
            .collect();

        for query in queries {
            let Some(vector) = self.queries.get(query).map_err(StrategyError::Embedding)? else {
                continue;
            };
            seeds.push(SeedEmbedding {
                source: SeedSource::Query(query.clone()),
                vector,
                weight: self.config.query_weight,
            });
        }

        if seeds.len() < self.config.min_seed_embeddings {
            let history = params
                .context
                .listening_history
                .iter()
                .take(self.config.history_seed_count)
                .filter_map(|entry| index.get(&entry.track_id))
                .map(|track| SeedEmbedding {
                    source: SeedSource::History(track.track_id.clone()),
                    vector: Arc::new(track.embedding.clone()),
                    weight: self.config.history_weight,
                })
                .collect::<Vec<_>>();
            seeds.extend(history);
        }

        Ok(seeds)
    }

    fn find_similar(
        &self,
        index: &EmbeddingIndex,
        seeds: &[SeedEmbedding],
        limit: usize,
    ) -> Result<Vec<(Candidate, f64, bool)>, StrategyError> {
        let seed_tracks: HashSet<&str> = seeds
            .iter()
            .filter_map(|seed| match &seed.source {
                SeedSource::Track(id) | SeedSource::History(id) => Some(id.as_str()),
                SeedSource::Query(_) => None,
            })
            .collect();
        let total_weight: f64 = seeds.iter().map(|seed| seed.weight).sum();

        let mut found = Vec::new();
        for track in index.tracks.iter().filter(|t| !seed_tracks.contains(t.track_id.as_str())) {
            let mut weighted = 0.0;
            let mut best: Option<(f64, &SeedEmbedding)> = None;

            for seed in seeds {
                let similarity = cosine_similarity(&track.embedding, &seed.vector)?;
                weighted += similarity * seed.weight;
                if best.map_or(true, |(max, _)| similarity > max) {
                    best = Some((similarity, seed));
                }
            }

            let Some((max_similarity, best_seed)) = best else {
                continue;
            };
            if max_similarity < self.config.similarity_threshold {
                continue;
            }

            let score = if total_weight > 0.0 { weighted / total_weight } else { 0.0 };
            let mut candidate = Candidate::new(&track.track_id, score, StrategyKind::Semantic);
            candidate
                .reasons
                .push(format!("{}% semantic similarity", (max_similarity * 100.0).round()));
            let query_match = match &best_seed.source {
                SeedSource::Query(query) => {
                    candidate.reasons.push(format!("Matches \"{}\"", query));
                    true
                }
                _ => {
                    candidate.reasons.push("Similar musical characteristics".to_string());
                    false
                }
            };
            found.push((candidate, max_similarity, query_match));
        }

        found.sort_by(|a, b| b.0.score.partial_cmp(&a.0.score).unwrap_or(std::cmp::Ordering::Equal));
        found.truncate(limit);
        Ok(found)
    }

    fn rank(&self, found: Vec<(Candidate, f64, bool)>) -> Vec<Candidate> {
        let mut ranked: Vec<Candidate> = found
            .into_iter()
            .map(|(mut candidate, max_similarity, query_match)| {
                let mut boost = 1.0;
                if query_match {
                    boost *= self.config.query_match_boost;
                }
                if max_similarity > self.config.high_similarity_cutoff {
                    boost *= self.config.high_similarity_boost;
                }
                candidate.score *= boost;
                candidate
            })
            .collect();
        sort_by_score(&mut ranked);
        ranked
    }
}

impl RecommendationStrategy for SemanticStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Semantic
    }

    fn initialize(&self) -> anyhow::Result<()> {
        self.index.get_or_try_init(|| self.load()).map(|_| ())
    }

    fn run(&self, params: &RunParams) -> Result<StrategyOutput, StrategyError> {
        let start = Instant::now();
        let index = self
            .index
            .get_or_try_init(|| self.load())
            .map_err(StrategyError::Initialization)?;

        if index.tracks.is_empty() {
            let mut diagnostics = Diagnostics::degraded(StrategyKind::Semantic, Degradation::NoEmbeddings);
            diagnostics.reason = Some("No track embeddings loaded".to_string());
            return Ok(StrategyOutput::degraded(diagnostics.timed(start)));
        }

        let queries = Self::extract_queries(&params.context, &params.filters);
        let seeds = self.seed_embeddings(index, params, &queries)?;
        if seeds.is_empty() {
            return Ok(StrategyOutput::degraded(
                Diagnostics::degraded(StrategyKind::Semantic, Degradation::NoEmbeddings)
                    .with_counter("queries", queries.len() as f64)
                    .timed(start),
            ));
        }

        let found = self.find_similar(index, &seeds, params.limits.candidates)?;
        let found_count = found.len();
        let filtered: Vec<(Candidate, f64, bool)> = found
            .into_iter()
            .filter(|(candidate, _, _)| {
                let genre = index.get(&candidate.track_id).and_then(|t| t.genre.as_deref());
                params.filters.allows_genre(genre)
                    && params
                        .filters
                        .min_semantic_score
                        .map_or(true, |min| candidate.score >= min)
            })
            .collect();
        let filtered_count = filtered.len();

        let mut candidates = self.rank(filtered);
        candidates.truncate(params.limits.final_count);

        let query_factor = if queries.is_empty() { 0.8 } else { 1.2 };
        let confidence = (seeds.len() as f64 / 5.0).min(1.0) * query_factor * 0.75;

        debug!(
            "Semantic run for {}: {} seeds, {} queries, {} candidates in {}ms",
            params.user_id,
            seeds.len(),
            queries.len(),
            candidates.len(),
            elapsed_ms(start)
        );
        let diagnostics = Diagnostics::new(StrategyKind::Semantic)
            .with_counter("queries", queries.len() as f64)
            .with_counter("seedEmbeddings", seeds.len() as f64)
            .with_counter("candidatesFound", found_count as f64)
            .with_counter("candidatesFiltered", filtered_count as f64)
            .with_counter("cachedQueries", self.queries.len() as f64)
            .with_confidence(confidence)
            .timed(start);

        Ok(StrategyOutput::new(candidates, diagnostics))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashingEmbedder;
    use crate::model::HistoryEntry;
    use crate::store::MemoryStore;

    fn embedding(track_id: &str, vector: Vec<f32>) -> TrackEmbedding {
        TrackEmbedding {
            track_id: track_id.to_string(),
            embedding: vector,
            model: None,
            genre: Some("jazz".to_string()),
        }
    }

    fn store() -> MemoryStore {
        MemoryStore::new()
            .with_embedding(embedding("seed", vec![1.0, 0.0, 0.0, 0.0]))
            .with_embedding(embedding("twin", vec![0.95, 0.05, 0.0, 0.0]))
            .with_embedding(embedding("cousin", vec![0.6, 0.6, 0.0, 0.0]))
            .with_embedding(embedding("stranger", vec![0.0, 0.0, 1.0, 0.0]))
    }

    fn strategy(store: MemoryStore, dimension: usize) -> SemanticStrategy {
        let config = SemanticConfig {
            common_queries: Vec::new(),
            ..SemanticConfig::default()
        };
        SemanticStrategy::new(config, Arc::new(store), Arc::new(HashingEmbedder::new(dimension)))
    }

    #[test]
    fn test_seed_track_finds_neighbours() {
        let strategy = strategy(store(), 4);
        let mut params = RunParams::for_user("u1");
        params.seeds = vec!["seed".to_string()];
        let output = strategy.run(&params).unwrap();

        let ids: Vec<&str> = output.candidates.iter().map(|c| c.track_id.as_str()).collect();
        assert_eq!(ids, vec!["twin", "cousin"]);
        assert_eq!(output.candidates[0].reasons[1], "Similar musical characteristics");
        // twin clears the high-similarity cutoff
        assert!(output.candidates[0].score > 0.99);
    }

    #[test]
    fn test_history_seeds_when_few_seeds() {
        let strategy = strategy(store(), 4);
        let mut params = RunParams::for_user("u1");
        params.context.listening_history = vec![HistoryEntry::new("stranger")];
        let output = strategy.run(&params).unwrap();
        assert_eq!(output.diagnostics.counter("seedEmbeddings"), Some(1.0));
        assert!(output.candidates.is_empty());
    }

    #[test]
    fn test_no_embeddings_degrades() {
        let strategy = strategy(MemoryStore::new(), 4);
        let output = strategy.run(&RunParams::for_user("u1")).unwrap();
        assert_eq!(output.diagnostics.degradation, Some(Degradation::NoEmbeddings));

        let strategy = self::strategy(store(), 4);
        let output = strategy.run(&RunParams::for_user("u1")).unwrap();
        assert_eq!(output.diagnostics.degradation, Some(Degradation::NoEmbeddings));
    }

    #[test]
    fn test_query_dimension_mismatch_is_an_error() {
        let strategy = strategy(store(), 16);
        let mut params = RunParams::for_user("u1");
        params.context.user_message = Some("late night jazz".to_string());
        let err = strategy.run(&params).unwrap_err();
        assert_eq!(err.code(), "DIMENSION_MISMATCH");
    }

    #[test]
    fn test_queries_are_cached() {
        let strategy = strategy(store(), 4);
        let mut params = RunParams::for_user("u1");
        params.context.semantic_query = Some("smoky bar".to_string());
        strategy.run(&params).unwrap();
        strategy.run(&params).unwrap();
        assert_eq!(strategy.queries.len(), 1);
    }

    #[test]
    fn test_extract_queries() {
        let context = UserContext {
            user_message: Some("something mellow".to_string()),
            favorite_genres: vec!["jazz".to_string()],
            ..UserContext::default()
        };
        let filters = Filters {
            mood: Some("calm".to_string()),
            activity: Some("reading".to_string()),
            ..Filters::default()
        };
        assert_eq!(
            SemanticStrategy::extract_queries(&context, &filters),
            vec!["something mellow", "calm music", "music for reading", "jazz music"]
        );
    }
}
