//! # Content Strategy
//!
//! Recommends tracks whose audio features resemble a set of seed tracks.
//!
//! ## Seeds
//!
//! Seeds resolve in priority order: explicit seed ids, then the five most
//! recent history entries, then up to three representative tracks from each
//! of the first two favourite genres. Seeds without audio features are
//! ignored.
//!
//! ## Similarity
//!
//! For every weighted feature present on both tracks the per-feature
//! similarity is `1 − |v1 − v2|`, with tempo and loudness first normalized by
//! their ranges. The track similarity is the weighted average, each weight
//! being the feature's importance scaled by the user profile's weight.
//!
//! A track qualifies when its best similarity to any seed reaches the
//! threshold; it is scored by its average similarity over all seeds.

use super::{
    elapsed_ms, sort_by_score, Degradation, Diagnostics, InitOnce, RecommendationStrategy,
    StrategyOutput,
};
use crate::error::StrategyError;
use crate::model::{
    AudioFeature, AudioFeatureVector, Candidate, Feedback, Filters, RunParams, StrategyKind, UserContext,
};
use crate::store::DataSource;
use anyhow::Context;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContentConfig {
    pub feature_weights: BTreeMap<AudioFeature, f64>,
    pub similarity_threshold: f64,
    pub diversity_weight: f64,
    pub tempo_range: f64,
    pub loudness_range: f64,
    pub energy_boost: f64,
    pub history_seed_count: usize,
    pub favorite_genre_count: usize,
    pub tracks_per_genre: usize,
}

impl Default for ContentConfig {
    fn default() -> Self {
        Self {
            feature_weights: BTreeMap::from([
                (AudioFeature::Acousticness, 0.8),
                (AudioFeature::Danceability, 1.0),
                (AudioFeature::Energy, 1.2),
                (AudioFeature::Instrumentalness, 0.6),
                (AudioFeature::Liveness, 0.4),
                (AudioFeature::Loudness, 0.7),
                (AudioFeature::Speechiness, 0.5),
                (AudioFeature::Tempo, 1.0),
                (AudioFeature::Valence, 1.1),
            ]),
            similarity_threshold: 0.75,
            diversity_weight: 0.2,
            tempo_range: 200.0,
            loudness_range: 60.0,
            energy_boost: 0.2,
            history_seed_count: 5,
            favorite_genre_count: 2,
            tracks_per_genre: 3,
        }
    }
}

const NEUTRAL_PREFERENCE: f64 = 0.5;
const NEUTRAL_TOLERANCE: f64 = 0.3;
const FALLBACK_TOLERANCE: f64 = 0.2;

/// Preferred value and spread of one feature for one user.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeaturePreference {
    pub preferred: f64,
    pub tolerance: f64,
    pub weight: f64,
}

pub type AudioProfile = BTreeMap<AudioFeature, FeaturePreference>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeatureStats {
    pub mean: f64,
    pub std_dev: f64,
}

#[derive(Debug, Clone)]
struct FeatureTrack {
    id: String,
    artist: Option<String>,
    genre: Option<String>,
    features: AudioFeatureVector,
}

#[derive(Debug, Default)]
struct FeatureIndex {
    tracks: Vec<FeatureTrack>,
    by_id: HashMap<String, usize>,
    genre_profiles: HashMap<String, BTreeMap<AudioFeature, FeatureStats>>,
}

impl FeatureIndex {
    fn track(&self, id: &str) -> Option<&FeatureTrack> {
        self.by_id.get(id).map(|index| &self.tracks[*index])
    }
}

pub struct ContentStrategy {
    config: ContentConfig,
    source: Arc<dyn DataSource>,
    index: InitOnce<FeatureIndex>,
}

impl ContentStrategy {
    pub fn new(config: ContentConfig, source: Arc<dyn DataSource>) -> Self {
        Self {
            config,
            source,
            index: InitOnce::new(),
        }
    }

    fn load(&self) -> anyhow::Result<FeatureIndex> {
        let mut tracks: Vec<FeatureTrack> = self
            .source
            .tracks()
            .with_context(|| format!("Failed to load audio features from {}", self.source.describe()))?
            .into_iter()
            .filter_map(|track| {
                let features = track.audio_features.filter(|f| !f.present_features().is_empty())?;
                Some(FeatureTrack {
                    id: track.id,
                    artist: track.artist,
                    genre: track.genre,
                    features,
                })
            })
            .collect();
        tracks.sort_by(|a, b| a.id.cmp(&b.id));

        let by_id = tracks
            .iter()
            .enumerate()
            .map(|(index, track)| (track.id.clone(), index))
            .collect();

        let mut by_genre: HashMap<String, Vec<&FeatureTrack>> = HashMap::new();
        for track in &tracks {
            if let Some(genre) = &track.genre {
                by_genre.entry(genre.to_lowercase()).or_default().push(track);
            }
        }
        let genre_profiles = by_genre
            .into_iter()
            .map(|(genre, members)| (genre, self.genre_profile(&members)))
            .collect();

        info!("Loaded audio features for {} tracks", tracks.len());
        Ok(FeatureIndex {
            tracks,
            by_id,
            genre_profiles,
        })
    }

    fn genre_profile(&self, members: &[&FeatureTrack]) -> BTreeMap<AudioFeature, FeatureStats> {
        self.config
            .feature_weights
            .keys()
            .filter_map(|feature| {
                let values: Vec<f64> = members.iter().filter_map(|t| t.features.get(*feature)).collect();
                (!values.is_empty()).then(|| {
                    let (mean, std_dev) = mean_and_std(&values);
                    (*feature, FeatureStats { mean, std_dev })
                })
            })
            .collect()
    }

    /// Per-feature statistics of a genre, if any loaded track belongs to it.
    pub fn genre_statistics(&self, genre: &str) -> Option<BTreeMap<AudioFeature, FeatureStats>> {
        self.index.get()?.genre_profiles.get(&genre.to_lowercase()).cloned()
    }

    /// Mean and spread of each weighted feature over the user's history.
    /// Falls back to a neutral profile when no history track has features.
    fn build_user_profile(&self, index: &FeatureIndex, context: &UserContext) -> AudioProfile {
        let history: Vec<&FeatureTrack> = context
            .listening_history
            .iter()
            .filter_map(|entry| index.track(&entry.track_id))
            .collect();

        if history.is_empty() {
            return self
                .config
                .feature_weights
                .iter()
                .map(|(feature, weight)| {
                    (
                        *feature,
                        FeaturePreference {
                            preferred: NEUTRAL_PREFERENCE,
                            tolerance: NEUTRAL_TOLERANCE,
                            weight: *weight,
                        },
                    )
                })
                .collect();
        }

        self.config
            .feature_weights
            .iter()
            .filter_map(|(feature, weight)| {
                let values: Vec<f64> = history.iter().filter_map(|t| t.features.get(*feature)).collect();
                if values.is_empty() {
                    return None;
                }
                let (mean, std_dev) = mean_and_std(&values);
                let tolerance = if std_dev > 0.0 { std_dev } else { FALLBACK_TOLERANCE };
                Some((
                    *feature,
                    FeaturePreference {
                        preferred: mean,
                        tolerance,
                        weight: *weight,
                    },
                ))
            })
            .collect()
    }

    fn resolve_seeds<'a>(&self, index: &'a FeatureIndex, params: &RunParams) -> Vec<&'a FeatureTrack> {
        let explicit: Vec<&FeatureTrack> = params.seeds.iter().filter_map(|id| index.track(id)).collect();
        if !explicit.is_empty() {
            return explicit;
        }

        let recent: Vec<&FeatureTrack> = params
            .context
            .listening_history
            .iter()
            .take(self.config.history_seed_count)
            .filter_map(|entry| index.track(&entry.track_id))
            .collect();
        if !recent.is_empty() {
            return recent;
        }

        params
            .context
            .favorite_genres
            .iter()
            .take(self.config.favorite_genre_count)
            .map(|genre| genre.to_lowercase())
            .filter(|genre| index.genre_profiles.contains_key(genre))
            .flat_map(|genre| {
                index
                    .tracks
                    .iter()
                    .filter(move |track| track.genre.as_deref().map(str::to_lowercase).as_deref() == Some(genre.as_str()))
                    .take(self.config.tracks_per_genre)
            })
            .collect()
    }

    /// Weighted audio similarity in `[0, 1]`.
    pub fn audio_similarity(&self, a: &AudioFeatureVector, b: &AudioFeatureVector, profile: &AudioProfile) -> f64 {
        let mut weighted = 0.0;
        let mut total_weight = 0.0;

        for (feature, importance) in &self.config.feature_weights {
            let (Some(v1), Some(v2)) = (a.get(*feature), b.get(*feature)) else {
                continue;
            };
            let weight = importance * profile.get(feature).map_or(1.0, |p| p.weight);
            weighted += self.feature_similarity(*feature, v1, v2) * weight;
            total_weight += weight;
        }

        if total_weight > 0.0 {
            weighted / total_weight
        } else {
            0.0
        }
    }

    fn feature_similarity(&self, feature: AudioFeature, v1: f64, v2: f64) -> f64 {
        let range = match feature {
            AudioFeature::Tempo => self.config.tempo_range,
            AudioFeature::Loudness => self.config.loudness_range,
            _ => 1.0,
        };
        (1.0 - (v1 - v2).abs() / range).clamp(0.0, 1.0)
    }

    /// The `count` weighted features on which two tracks agree most.
    fn top_matching_features(&self, a: &AudioFeatureVector, b: &AudioFeatureVector, count: usize) -> Vec<AudioFeature> {
        let mut matches: Vec<(AudioFeature, f64)> = self
            .config
            .feature_weights
            .keys()
            .filter_map(|feature| {
                let (v1, v2) = (a.get(*feature)?, b.get(*feature)?);
                Some((*feature, self.feature_similarity(*feature, v1, v2)))
            })
            .collect();
        matches.sort_by(|x, y| y.1.partial_cmp(&x.1).unwrap_or(std::cmp::Ordering::Equal));
        matches.into_iter().take(count).map(|(feature, _)| feature).collect()
    }

    fn find_similar_tracks(
        &self,
        index: &FeatureIndex,
        seeds: &[&FeatureTrack],
        profile: &AudioProfile,
        limit: usize,
    ) -> Vec<Candidate> {
        let seed_ids: HashSet<&str> = seeds.iter().map(|s| s.id.as_str()).collect();

        let mut candidates: Vec<Candidate> = index
            .tracks
            .iter()
            .filter(|track| !seed_ids.contains(track.id.as_str()))
            .filter_map(|track| {
                let similarities: Vec<f64> = seeds
                    .iter()
                    .map(|seed| self.audio_similarity(&track.features, &seed.features, profile))
                    .collect();
                let max = similarities.iter().copied().fold(0.0, f64::max);
                if max < self.config.similarity_threshold {
                    return None;
                }
                let average = similarities.iter().sum::<f64>() / similarities.len() as f64;

                let mut candidate = Candidate::new(&track.id, average, StrategyKind::Content);
                candidate.artist = track.artist.clone();
                candidate.features_used = self.top_matching_features(&track.features, &seeds[0].features, 3);
                candidate
                    .reasons
                    .push(format!("{}% audio feature match", (max * 100.0).round()));
                let top_two: Vec<&str> = candidate.features_used.iter().take(2).map(|f| f.as_str()).collect();
                if !top_two.is_empty() {
                    candidate.reasons.push(format!("Similar {}", top_two.join(", ")));
                }
                Some(candidate)
            })
            .collect();

        sort_by_score(&mut candidates);
        candidates.truncate(limit);
        candidates
    }

    fn apply_filters(
        &self,
        index: &FeatureIndex,
        candidates: Vec<Candidate>,
        filters: &Filters,
        profile: &AudioProfile,
    ) -> Vec<Candidate> {
        candidates
            .into_iter()
            .filter(|candidate| {
                let Some(track) = index.track(&candidate.track_id) else {
                    return false;
                };
                let features = &track.features;
                if !filters.allows_genre(track.genre.as_deref()) {
                    return false;
                }
                if let (Some(min), Some(energy)) = (filters.min_energy, features.get(AudioFeature::Energy)) {
                    if energy < min {
                        return false;
                    }
                }
                if let (Some(max), Some(value)) =
                    (filters.max_instrumentalness, features.get(AudioFeature::Instrumentalness))
                {
                    if value > max {
                        return false;
                    }
                }
                if let (Some(pref), Some(valence)) =
                    (profile.get(&AudioFeature::Valence), features.get(AudioFeature::Valence))
                {
                    if (valence - pref.preferred).abs() > pref.tolerance * 2.0 {
                        return false;
                    }
                }
                true
            })
            .filter(|candidate| filters.min_score.map_or(true, |min| candidate.score >= min))
            .collect()
    }

    /// Energy-match boost and a flat diversity factor.
    fn rank(&self, index: &FeatureIndex, mut candidates: Vec<Candidate>, profile: &AudioProfile) -> Vec<Candidate> {
        for candidate in &mut candidates {
            let mut boost = 1.0;
            let energy = index
                .track(&candidate.track_id)
                .and_then(|track| track.features.get(AudioFeature::Energy));
            if let (Some(pref), Some(energy)) = (profile.get(&AudioFeature::Energy), energy) {
                let energy_match = 1.0 - (energy - pref.preferred).abs();
                boost *= 1.0 + energy_match * self.config.energy_boost;
            }
            boost *= 1.0 - self.config.diversity_weight * 0.1;
            candidate.score *= boost;
        }
        sort_by_score(&mut candidates);
        candidates
    }
}

impl RecommendationStrategy for ContentStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Content
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

        let profile = self.build_user_profile(index, &params.context);
        let seeds = self.resolve_seeds(index, params);
        if seeds.is_empty() {
            return Ok(StrategyOutput::degraded(
                Diagnostics::degraded(StrategyKind::Content, Degradation::NoSeeds).timed(start),
            ));
        }

        let similar = self.find_similar_tracks(index, &seeds, &profile, params.limits.candidates);
        let similar_count = similar.len();
        let filtered = self.apply_filters(index, similar, &params.filters, &profile);
        let filtered_count = filtered.len();
        let mut candidates = self.rank(index, filtered, &profile);
        candidates.truncate(params.limits.final_count);

        let profile_factor = if profile.is_empty() { 0.5 } else { 1.0 };
        let confidence = (seeds.len() as f64 / 3.0).min(1.0) * profile_factor * 0.8;

        debug!(
            "Content run for {}: {} seeds, {} candidates in {}ms",
            params.user_id,
            seeds.len(),
            candidates.len(),
            elapsed_ms(start)
        );
        let diagnostics = Diagnostics::new(StrategyKind::Content)
            .with_counter("seedTracks", seeds.len() as f64)
            .with_counter("candidatesFound", similar_count as f64)
            .with_counter("candidatesFiltered", filtered_count as f64)
            .with_counter("profileFeatures", profile.len() as f64)
            .with_confidence(confidence)
            .timed(start);

        Ok(StrategyOutput::new(candidates, diagnostics))
    }

    fn update_user_model(&self, user_id: &str, feedback: &Feedback) {
        let polarity = if feedback.signal.is_positive() { "positive" } else { "negative" };
        info!(
            "Content feedback from {}: {} signal on {}",
            user_id, polarity, feedback.track_id
        );
    }
}

fn mean_and_std(values: &[f64]) -> (f64, f64) {
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    (mean, variance.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{HistoryEntry, TrackRecord};
    use crate::store::MemoryStore;
    use approx::assert_relative_eq;

    fn features(energy: f64, valence: f64, tempo: f64) -> AudioFeatureVector {
        AudioFeatureVector::new()
            .with(AudioFeature::Energy, energy)
            .with(AudioFeature::Valence, valence)
            .with(AudioFeature::Tempo, tempo)
            .with(AudioFeature::Danceability, 0.6)
    }

    fn store() -> MemoryStore {
        MemoryStore::new()
            .with_track(TrackRecord::new("seed").with_artist("A").with_genre("house").with_features(features(0.8, 0.6, 124.0)))
            .with_track(TrackRecord::new("near").with_artist("B").with_genre("house").with_features(features(0.78, 0.62, 126.0)))
            .with_track(TrackRecord::new("far").with_artist("C").with_genre("ambient").with_features(features(0.1, 0.1, 70.0)))
            .with_track(TrackRecord::new("bare").with_artist("D"))
    }

    fn strategy() -> ContentStrategy {
        ContentStrategy::new(ContentConfig::default(), Arc::new(store()))
    }

    #[test]
    fn test_similarity_of_identical_tracks_is_one() {
        let strategy = strategy();
        let a = features(0.5, 0.5, 120.0);
        assert_relative_eq!(strategy.audio_similarity(&a, &a, &AudioProfile::new()), 1.0);
    }

    #[test]
    fn test_tempo_uses_its_range() {
        let strategy = strategy();
        let a = AudioFeatureVector::new().with(AudioFeature::Tempo, 100.0);
        let b = AudioFeatureVector::new().with(AudioFeature::Tempo, 150.0);
        assert_relative_eq!(strategy.audio_similarity(&a, &b, &AudioProfile::new()), 0.75);
    }

    #[test]
    fn test_explicit_seed_finds_close_track() {
        let strategy = strategy();
        let mut params = RunParams::for_user("u1");
        params.seeds = vec!["seed".to_string()];
        let output = strategy.run(&params).unwrap();

        let ids: Vec<&str> = output.candidates.iter().map(|c| c.track_id.as_str()).collect();
        assert_eq!(ids, vec!["near"]);
        let near = &output.candidates[0];
        assert_eq!(near.artist.as_deref(), Some("B"));
        assert_eq!(near.features_used.len(), 3);
        assert!(near.reasons[0].ends_with("audio feature match"));
    }

    #[test]
    fn test_match_reason_reports_best_seed_similarity() {
        let strategy = strategy();
        let mut params = RunParams::for_user("u1");
        params.seeds = vec!["seed".to_string(), "far".to_string()];
        let output = strategy.run(&params).unwrap();

        let near = output.candidates.iter().find(|c| c.track_id == "near").unwrap();
        let percent: f64 = near.reasons[0].split('%').next().unwrap().parse().unwrap();
        // "near" is almost identical to "seed"; the average is dragged down by "far".
        assert!(percent >= 95.0);
        assert!(percent > (near.score * 100.0).round());
    }

    #[test]
    fn test_history_seeds_when_no_explicit_seeds() {
        let strategy = strategy();
        let mut params = RunParams::for_user("u1");
        params.context.listening_history = vec![HistoryEntry::new("near")];
        let output = strategy.run(&params).unwrap();
        assert!(output.candidates.iter().any(|c| c.track_id == "seed"));
    }

    #[test]
    fn test_favorite_genre_seeds() {
        let strategy = strategy();
        let mut params = RunParams::for_user("u1");
        params.context.favorite_genres = vec!["House".to_string()];
        let output = strategy.run(&params).unwrap();
        assert_eq!(output.diagnostics.counter("seedTracks"), Some(2.0));
    }

    #[test]
    fn test_no_seeds_degrades() {
        let strategy = strategy();
        let mut params = RunParams::for_user("u1");
        params.seeds = vec!["bare".to_string(), "unknown".to_string()];
        let output = strategy.run(&params).unwrap();
        assert_eq!(output.diagnostics.degradation, Some(Degradation::NoSeeds));
    }

    #[test]
    fn test_min_energy_filter() {
        let strategy = strategy();
        let mut params = RunParams::for_user("u1");
        params.seeds = vec!["seed".to_string()];
        params.filters.min_energy = Some(0.9);
        assert!(strategy.run(&params).unwrap().candidates.is_empty());
    }

    #[test]
    fn test_genre_statistics() {
        let strategy = strategy();
        strategy.initialize().unwrap();
        let house = strategy.genre_statistics("house").unwrap();
        assert_relative_eq!(house[&AudioFeature::Energy].mean, 0.79, epsilon = 1e-9);
        assert!(strategy.genre_statistics("polka").is_none());
    }
}
