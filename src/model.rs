//! # Domain Model
//!
//! Plain data shared by every strategy: interactions, audio features, catalogue
//! records, request parameters and candidates.
//!
//! ## Audio Features
//!
//! The feature set is closed. A stored [`AudioFeatureVector`] may carry extra
//! numeric fields (data providers return them), but only the twelve
//! [`AudioFeature`] names are ever accepted in provenance or explanations.

use crate::error::{ProvenanceError, RegistryError};
use crate::provenance::Provenance;
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

/// The closed set of recommendation strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Collaborative,
    Content,
    Semantic,
    Hybrid,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 4] = [
        StrategyKind::Collaborative,
        StrategyKind::Content,
        StrategyKind::Semantic,
        StrategyKind::Hybrid,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Collaborative => "collaborative",
            Self::Content => "content",
            Self::Semantic => "semantic",
            Self::Hybrid => "hybrid",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accepts the canonical names plus the long registry aliases
/// (`content-based`, `embedding-semantic`, `hybrid-rerank`).
impl FromStr for StrategyKind {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "collaborative" => Ok(Self::Collaborative),
            "content" | "content-based" => Ok(Self::Content),
            "semantic" | "embedding-semantic" => Ok(Self::Semantic),
            "hybrid" | "hybrid-rerank" => Ok(Self::Hybrid),
            _ => Err(RegistryError::UnknownStrategy(s.to_string())),
        }
    }
}

/// Whitelisted audio features.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioFeature {
    Danceability,
    Energy,
    Valence,
    Tempo,
    Acousticness,
    Instrumentalness,
    Liveness,
    Speechiness,
    Loudness,
    Key,
    Mode,
    TimeSignature,
}

lazy_static! {
    static ref FEATURES_BY_NAME: HashMap<&'static str, AudioFeature> = AudioFeature::ALL
        .iter()
        .map(|feature| (feature.as_str(), *feature))
        .collect();
}

impl AudioFeature {
    pub const ALL: [AudioFeature; 12] = [
        AudioFeature::Danceability,
        AudioFeature::Energy,
        AudioFeature::Valence,
        AudioFeature::Tempo,
        AudioFeature::Acousticness,
        AudioFeature::Instrumentalness,
        AudioFeature::Liveness,
        AudioFeature::Speechiness,
        AudioFeature::Loudness,
        AudioFeature::Key,
        AudioFeature::Mode,
        AudioFeature::TimeSignature,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Danceability => "danceability",
            Self::Energy => "energy",
            Self::Valence => "valence",
            Self::Tempo => "tempo",
            Self::Acousticness => "acousticness",
            Self::Instrumentalness => "instrumentalness",
            Self::Liveness => "liveness",
            Self::Speechiness => "speechiness",
            Self::Loudness => "loudness",
            Self::Key => "key",
            Self::Mode => "mode",
            Self::TimeSignature => "time_signature",
        }
    }

    /// Looks up a whitelisted feature by its snake_case name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        FEATURES_BY_NAME.get(name).copied()
    }
}

impl fmt::Display for AudioFeature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AudioFeature {
    type Err = ProvenanceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s).ok_or_else(|| ProvenanceError::InvalidFeature(s.to_string()))
    }
}

/// Per-track audio features as stored by the data provider.
///
/// Keys are raw names so that non-whitelisted provider fields survive a
/// round trip; typed access goes through [`AudioFeatureVector::get`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AudioFeatureVector(BTreeMap<String, f64>);

impl AudioFeatureVector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a vector from raw provider fields, whitelisted or not.
    #[must_use]
    pub fn from_raw(fields: BTreeMap<String, f64>) -> Self {
        Self(fields)
    }

    #[must_use]
    pub fn with(mut self, feature: AudioFeature, value: f64) -> Self {
        self.0.insert(feature.as_str().to_string(), value);
        self
    }

    #[must_use]
    pub fn get(&self, feature: AudioFeature) -> Option<f64> {
        self.get_raw(feature.as_str())
    }

    #[must_use]
    pub fn get_raw(&self, name: &str) -> Option<f64> {
        self.0.get(name).copied().filter(|value| value.is_finite())
    }

    #[must_use]
    pub fn contains_raw(&self, name: &str) -> bool {
        self.get_raw(name).is_some()
    }

    /// Every stored field name, whitelisted or not.
    pub fn raw_names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Whitelisted features present with a finite value, in canonical order.
    #[must_use]
    pub fn present_features(&self) -> Vec<AudioFeature> {
        AudioFeature::ALL
            .iter()
            .copied()
            .filter(|feature| self.get(*feature).is_some())
            .collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(AudioFeature, f64)> for AudioFeatureVector {
    fn from_iter<I: IntoIterator<Item = (AudioFeature, f64)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(feature, value)| (feature.as_str().to_string(), value))
                .collect(),
        )
    }
}

/// Listening signals and their signed weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    Play,
    Like,
    Love,
    Replay,
    Skip,
    Dislike,
    Hate,
}

impl Signal {
    #[must_use]
    pub const fn weight(self) -> f64 {
        match self {
            Self::Love => 3.0,
            Self::Like => 2.0,
            Self::Replay => 1.5,
            Self::Play => 1.0,
            Self::Skip => -0.5,
            Self::Dislike => -1.0,
            Self::Hate => -2.0,
        }
    }

    #[must_use]
    pub const fn is_positive(self) -> bool {
        self.weight() > 0.0
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Play => "play",
            Self::Like => "like",
            Self::Love => "love",
            Self::Replay => "replay",
            Self::Skip => "skip",
            Self::Dislike => "dislike",
            Self::Hate => "hate",
        }
    }
}

impl FromStr for Signal {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "play" => Ok(Self::Play),
            "like" => Ok(Self::Like),
            "love" => Ok(Self::Love),
            "replay" => Ok(Self::Replay),
            "skip" => Ok(Self::Skip),
            "dislike" => Ok(Self::Dislike),
            "hate" => Ok(Self::Hate),
            other => Err(anyhow::anyhow!("unknown signal '{}'", other)),
        }
    }
}

/// One listening event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interaction {
    pub user_id: String,
    pub track_id: String,
    pub signal: Signal,
    pub weight: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl Interaction {
    /// An interaction weighted by its signal.
    #[must_use]
    pub fn new(user_id: &str, track_id: &str, signal: Signal, timestamp: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.to_string(),
            track_id: track_id.to_string(),
            signal,
            weight: signal.weight(),
            timestamp,
            session_id: None,
        }
    }
}

/// Catalogue view of a track.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackRecord {
    pub id: String,
    pub name: Option<String>,
    pub artist: Option<String>,
    pub genre: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_features: Option<AudioFeatureVector>,
}

impl TrackRecord {
    #[must_use]
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    #[must_use]
    pub fn with_artist(mut self, artist: &str) -> Self {
        self.artist = Some(artist.to_string());
        self
    }

    #[must_use]
    pub fn with_genre(mut self, genre: &str) -> Self {
        self.genre = Some(genre.to_string());
        self
    }

    #[must_use]
    pub fn with_features(mut self, features: AudioFeatureVector) -> Self {
        self.audio_features = Some(features);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub track_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub played_at: Option<DateTime<Utc>>,
}

impl HistoryEntry {
    #[must_use]
    pub fn new(track_id: &str) -> Self {
        Self {
            track_id: track_id.to_string(),
            played_at: None,
        }
    }
}

/// Request-scoped knowledge about the listener. Most recent history first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserContext {
    pub listening_history: Vec<HistoryEntry>,
    pub user_message: Option<String>,
    pub semantic_query: Option<String>,
    pub favorite_genres: Vec<String>,
    pub cold_start: bool,
}

impl UserContext {
    #[must_use]
    pub fn with_history<'a>(mut self, track_ids: impl IntoIterator<Item = &'a str>) -> Self {
        self.listening_history
            .extend(track_ids.into_iter().map(HistoryEntry::new));
        self
    }

    #[must_use]
    pub fn has_played(&self, track_id: &str) -> bool {
        self.listening_history.iter().any(|entry| entry.track_id == track_id)
    }

    /// Latest recorded play of `track_id`, if the history carries timestamps.
    #[must_use]
    pub fn last_played(&self, track_id: &str) -> Option<DateTime<Utc>> {
        self.listening_history
            .iter()
            .filter(|entry| entry.track_id == track_id)
            .filter_map(|entry| entry.played_at)
            .max()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Filters {
    pub genre: Option<String>,
    pub min_score: Option<f64>,
    pub min_energy: Option<f64>,
    pub max_instrumentalness: Option<f64>,
    pub mood: Option<String>,
    pub activity: Option<String>,
    pub min_semantic_score: Option<f64>,
}

impl Filters {
    /// Case-insensitive genre gate; unknown genres pass.
    #[must_use]
    pub fn allows_genre(&self, genre: Option<&str>) -> bool {
        match (self.genre.as_deref(), genre) {
            (Some(wanted), Some(actual)) => actual.to_lowercase().contains(&wanted.to_lowercase()),
            _ => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    pub candidates: usize,
    #[serde(rename = "final")]
    pub final_count: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            candidates: 60,
            final_count: 20,
        }
    }
}

/// Input of a single strategy run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunParams {
    pub user_id: String,
    pub seeds: Vec<String>,
    pub limits: Limits,
    pub context: UserContext,
    pub filters: Filters,
}

impl RunParams {
    #[must_use]
    pub fn for_user(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            ..Self::default()
        }
    }
}

/// A feedback event fed back into user models.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    pub track_id: String,
    pub signal: Signal,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub session_id: Option<String>,
}

impl Feedback {
    #[must_use]
    pub fn into_interaction(self, user_id: &str) -> Interaction {
        Interaction {
            user_id: user_id.to_string(),
            track_id: self.track_id,
            signal: self.signal,
            weight: self.signal.weight(),
            timestamp: self.timestamp,
            session_id: self.session_id,
        }
    }
}

/// A scored track proposed by a strategy. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub track_id: String,
    pub score: f64,
    pub reasons: Vec<String>,
    pub strategy_support: Vec<StrategyKind>,
    /// Each strategy's contribution to `score`.
    pub components: BTreeMap<StrategyKind, f64>,
    /// Audio features the strategy actually compared.
    pub features_used: Vec<AudioFeature>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artist: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provenance: Option<Provenance>,
}

impl Candidate {
    #[must_use]
    pub fn new(track_id: &str, score: f64, strategy: StrategyKind) -> Self {
        Self {
            track_id: track_id.to_string(),
            score,
            reasons: Vec::new(),
            strategy_support: vec![strategy],
            components: BTreeMap::from([(strategy, score)]),
            features_used: Vec::new(),
            artist: None,
            final_score: None,
            provenance: None,
        }
    }

    /// `final_score` once a reranker has set it, `score` otherwise.
    #[must_use]
    pub fn effective_score(&self) -> f64 {
        self.final_score.unwrap_or(self.score)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_aliases() {
        assert_eq!("content-based".parse::<StrategyKind>().unwrap(), StrategyKind::Content);
        assert_eq!("embedding-semantic".parse::<StrategyKind>().unwrap(), StrategyKind::Semantic);
        assert_eq!("Hybrid-Rerank".parse::<StrategyKind>().unwrap(), StrategyKind::Hybrid);
        let err = "popularity".parse::<StrategyKind>().unwrap_err();
        assert_eq!(err.code(), "UNKNOWN_STRATEGY");
    }

    #[test]
    fn test_feature_names_round_trip() {
        for feature in AudioFeature::ALL {
            assert_eq!(AudioFeature::from_name(feature.as_str()), Some(feature));
        }
        assert!(AudioFeature::from_name("mood").is_none());
        assert_eq!(AudioFeature::TimeSignature.as_str(), "time_signature");
    }

    #[test]
    fn test_signal_weights() {
        assert_eq!(Signal::Love.weight(), 3.0);
        assert_eq!(Signal::Hate.weight(), -2.0);
        assert!(!Signal::Skip.is_positive());
        assert!(Signal::Replay.is_positive());
    }

    #[test]
    fn test_feature_vector_keeps_raw_fields() {
        let json = r#"{"energy": 0.8, "popularity": 42.0}"#;
        let vector: AudioFeatureVector = serde_json::from_str(json).unwrap();
        assert_eq!(vector.get(AudioFeature::Energy), Some(0.8));
        assert!(vector.contains_raw("popularity"));
        assert_eq!(vector.present_features(), vec![AudioFeature::Energy]);
    }

    #[test]
    fn test_candidate_components_start_with_own_score() {
        let candidate = Candidate::new("t1", 0.6, StrategyKind::Content);
        assert_eq!(candidate.components.get(&StrategyKind::Content), Some(&0.6));
        assert_eq!(candidate.effective_score(), 0.6);
    }

    #[test]
    fn test_last_played_picks_latest() {
        let early = Utc::now() - chrono::Duration::days(10);
        let late = Utc::now() - chrono::Duration::days(2);
        let context = UserContext {
            listening_history: vec![
                HistoryEntry { track_id: "a".into(), played_at: Some(early) },
                HistoryEntry { track_id: "a".into(), played_at: Some(late) },
            ],
            ..UserContext::default()
        };
        assert_eq!(context.last_played("a"), Some(late));
        assert!(context.last_played("b").is_none());
    }
}
