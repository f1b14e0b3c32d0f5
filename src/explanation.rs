//! # Explanation Generator
//!
//! Renders a [`Provenance`] into human-readable text using only audio
//! features that actually exist on the track record. A provenance that
//! references a feature the track lacks is refused with `FEATURE_MISSING`
//! rather than explained with invented values.

use crate::error::ExplanationError;
use crate::model::{AudioFeature, AudioFeatureVector, StrategyKind, TrackRecord};
use crate::provenance::{build_provenance, Provenance, ProvenanceSpec};
use chrono::Utc;
use log::{error, warn};
use serde::{Deserialize, Serialize};

const KEY_NAMES: [&str; 12] = ["C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B"];

const FALLBACK_TEXT: &str = "This track is recommended based on your listening preferences.";
const FALLBACK_CONFIDENCE: f64 = 0.3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Explanation {
    pub text: String,
    pub confidence: f64,
    pub strategies: Vec<StrategyKind>,
    pub features_used: Vec<AudioFeature>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explanation_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Explanation {
    /// Generic explanation used when a batch item cannot be explained.
    #[must_use]
    pub fn fallback(error: &ExplanationError) -> Self {
        Self {
            text: FALLBACK_TEXT.to_string(),
            confidence: FALLBACK_CONFIDENCE,
            strategies: vec![StrategyKind::Content],
            features_used: Vec::new(),
            explanation_ref: None,
            error: Some(error.to_string()),
        }
    }
}

/// Raw `{track, provenance}` pair, as read from JSON.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ExplanationRequest {
    pub track: Option<TrackRecord>,
    pub provenance: Option<ProvenanceSpec>,
}

/// Explains a validated provenance against its track record.
pub fn generate_explanation(
    track: &TrackRecord,
    provenance: &Provenance,
) -> Result<Explanation, ExplanationError> {
    let empty = AudioFeatureVector::new();
    let features = track.audio_features.as_ref().unwrap_or(&empty);

    for feature in provenance.features_used() {
        if features.get(*feature).is_none() {
            return Err(feature_missing(feature.as_str(), features));
        }
    }

    let mut text = base_explanation(track, features, provenance);

    if let Some(days) = provenance.novelty_days_since_last_play() {
        text.push_str(&novelty_sentence(days));
    }
    if let Some(penalty) = provenance.diversity_penalty_applied().filter(|p| *p > 0.0) {
        text.push_str(&format!(" This adds {}% diversity to your recommendations.", percent(penalty)));
    }

    let explanation_ref = provenance
        .explanation_ref()
        .map(ToString::to_string)
        .unwrap_or_else(|| explanation_ref(&track.id, provenance.strategies()));

    Ok(Explanation {
        text: text.trim().to_string(),
        confidence: calculate_explanation_confidence(
            provenance.features_used().len(),
            provenance.strategies().len(),
        ),
        strategies: provenance.strategies().to_vec(),
        features_used: provenance.features_used().to_vec(),
        explanation_ref: Some(explanation_ref),
        error: None,
    })
}

/// Explains an untrusted request.
///
/// Grounding is checked on the raw feature names first, so a name that is
/// absent from the track reports `FEATURE_MISSING` even when it is also not
/// whitelisted. Remaining provenance invariants are checked afterwards.
pub fn explain_request(request: &ExplanationRequest) -> Result<Explanation, ExplanationError> {
    let track = request
        .track
        .as_ref()
        .ok_or_else(|| ExplanationError::MissingInput("track is required".to_string()))?;
    let spec = request
        .provenance
        .as_ref()
        .ok_or_else(|| ExplanationError::MissingInput("provenance is required".to_string()))?;

    let empty = AudioFeatureVector::new();
    let features = track.audio_features.as_ref().unwrap_or(&empty);

    for name in &spec.features_used {
        if !features.contains_raw(name) {
            return Err(feature_missing(name, features));
        }
        if AudioFeature::from_name(name).is_none() {
            return Err(ExplanationError::InvalidFeature(name.clone()));
        }
    }

    let provenance = build_provenance(spec)?;
    generate_explanation(track, &provenance)
}

/// Explains every request, degrading failed items to a generic explanation
/// that carries the error.
pub fn generate_batch_explanations(requests: &[ExplanationRequest]) -> Vec<Explanation> {
    requests
        .iter()
        .enumerate()
        .map(|(index, request)| {
            explain_request(request).unwrap_or_else(|err| {
                error!("Error generating explanation for recommendation {}: {}", index, err);
                Explanation::fallback(&err)
            })
        })
        .collect()
}

/// True when the explanation references only features and strategies that
/// appear in the provenance.
pub fn validate_explanation(explanation: &Explanation, provenance: &Provenance) -> bool {
    if let Some(feature) = explanation
        .features_used
        .iter()
        .find(|f| !provenance.features_used().contains(f))
    {
        warn!("Explanation references feature '{}' not in provenance", feature);
        return false;
    }

    if let Some(strategy) = explanation
        .strategies
        .iter()
        .find(|s| !provenance.strategies().contains(s))
    {
        warn!("Explanation references strategy '{}' not in provenance", strategy);
        return false;
    }

    true
}

/// `min(0.5 + 0.1 × features + 0.15 × strategies, 1.0)`
#[must_use]
pub fn calculate_explanation_confidence(features: usize, strategies: usize) -> f64 {
    (0.5 + features as f64 * 0.1 + strategies as f64 * 0.15).min(1.0)
}

/// Feature phrases in provenance order. Features whose value falls below
/// every descriptive band produce no phrase.
#[must_use]
pub fn feature_phrases(features: &AudioFeatureVector, used: &[AudioFeature]) -> Vec<String> {
    used.iter()
        .filter_map(|feature| features.get(*feature).and_then(|value| feature_phrase(*feature, value)))
        .collect()
}

fn feature_phrase(feature: AudioFeature, value: f64) -> Option<String> {
    let phrase = match feature {
        AudioFeature::Energy => banded(value, ["high energy", "moderate energy", "calm energy"]),
        AudioFeature::Valence => banded(value, ["positive mood", "neutral mood", "melancholic mood"]),
        AudioFeature::Danceability => banded(
            value,
            ["high danceability", "moderate danceability", "low danceability"],
        ),
        AudioFeature::Tempo => {
            let label = if value >= 140.0 {
                "fast"
            } else if value >= 90.0 {
                "moderate"
            } else {
                "slow"
            };
            format!("{} tempo ({} BPM)", label, value.round())
        }
        AudioFeature::Acousticness => thresholded(value, "acoustic sound", Some((0.3, "mixed acoustic elements")))?,
        AudioFeature::Instrumentalness => thresholded(
            value,
            "primarily instrumental",
            Some((0.3, "some instrumental passages")),
        )?,
        AudioFeature::Liveness => thresholded(value, "live recording feel", None)?,
        AudioFeature::Speechiness => thresholded(
            value,
            "speech-like characteristics",
            Some((0.4, "some spoken elements")),
        )?,
        AudioFeature::Loudness => format!("{:.1} dB loudness", value),
        AudioFeature::Key => {
            let key = value.trunc();
            if !(0.0..12.0).contains(&key) {
                return None;
            }
            format!("{} key", KEY_NAMES[key as usize])
        }
        AudioFeature::Mode => {
            let mode = if value.trunc() == 1.0 { "major mode" } else { "minor mode" };
            mode.to_string()
        }
        AudioFeature::TimeSignature => format!("{}/4 time signature", value.trunc()),
    };
    Some(phrase)
}

/// High (>= 0.7), middle (>= 0.4), low bands.
fn banded(value: f64, labels: [&str; 3]) -> String {
    let label = if value >= 0.7 {
        labels[0]
    } else if value >= 0.4 {
        labels[1]
    } else {
        labels[2]
    };
    format!("{} ({:.2})", label, value)
}

fn thresholded(value: f64, high: &str, middle: Option<(f64, &str)>) -> Option<String> {
    if value >= 0.7 {
        return Some(format!("{} ({:.2})", high, value));
    }
    match middle {
        Some((cutoff, label)) if value >= cutoff => Some(format!("{} ({:.2})", label, value)),
        _ => None,
    }
}

fn base_explanation(track: &TrackRecord, features: &AudioFeatureVector, provenance: &Provenance) -> String {
    let name = track.name.as_deref().unwrap_or("This track");
    let artist = track.artist.as_deref().unwrap_or("the artist");
    let primary = provenance.primary_strategy();

    let mut text = match primary {
        StrategyKind::Collaborative => format!(
            "{} by {} is recommended because users with similar taste also enjoyed it. ",
            name, artist
        ),
        StrategyKind::Content => format!(
            "{} by {} matches your preferences based on its musical characteristics. ",
            name, artist
        ),
        StrategyKind::Semantic => format!(
            "{} by {} is recommended based on semantic similarity to your listening history. ",
            name, artist
        ),
        StrategyKind::Hybrid => format!(
            "{} by {} is recommended based on multiple analysis approaches. ",
            name, artist
        ),
    };

    let phrases = feature_phrases(features, provenance.features_used());
    if !phrases.is_empty() {
        text.push_str(&format!("It features {}.", phrases.join(", ")));
    }

    let others: Vec<String> = provenance
        .strategies()
        .iter()
        .filter(|s| **s != primary)
        .map(|s| {
            let share = provenance.score_components().get(s).copied().unwrap_or(0.0);
            format!("{} analysis ({}%)", s, percent(share))
        })
        .collect();
    if !others.is_empty() {
        text.push_str(&format!(" This recommendation also incorporates {}.", others.join(" and ")));
    }

    text
}

fn novelty_sentence(days: f64) -> String {
    let days = days.round() as u64;
    if days == 0 {
        " You recently played this track.".to_string()
    } else if days < 7 {
        format!(" You last played this {} {} ago.", days, plural(days, "day"))
    } else if days < 30 {
        let weeks = (days as f64 / 7.0).round() as u64;
        format!(" You last played this {} {} ago.", weeks, plural(weeks, "week"))
    } else {
        let months = (days as f64 / 30.0).round() as u64;
        format!(" It's been {} {} since you last played this.", months, plural(months, "month"))
    }
}

fn plural(count: u64, unit: &str) -> String {
    if count > 1 {
        format!("{}s", unit)
    } else {
        unit.to_string()
    }
}

fn percent(share: f64) -> i64 {
    (share * 100.0).round() as i64
}

fn feature_missing(feature: &str, features: &AudioFeatureVector) -> ExplanationError {
    ExplanationError::FeatureMissing {
        feature: feature.to_string(),
        available: features.raw_names().collect::<Vec<_>>().join(", "),
    }
}

/// `exp_<strategies>_<last 8 chars of track id>_<millis>`
fn explanation_ref(track_id: &str, strategies: &[StrategyKind]) -> String {
    let track_id = if track_id.is_empty() { "unknown" } else { track_id };
    let tail: String = {
        let chars: Vec<char> = track_id.chars().collect();
        chars[chars.len().saturating_sub(8)..].iter().collect()
    };
    let names: Vec<&str> = strategies.iter().map(|s| s.as_str()).collect();
    format!("exp_{}_{}_{}", names.join("_"), tail, Utc::now().timestamp_millis())
}
