//! # Provenance
//!
//! An auditable record of why a track was recommended: which strategies
//! proposed it, how much each contributed, and which audio features were
//! compared.
//!
//! ## Invariants
//!
//! - `track_id` is non-empty after trimming.
//! - `strategies` is non-empty and every entry is a known strategy.
//! - `score_components` is non-empty, each value lies in `[0, 1]`, and the
//!   values sum to `1.0 ± 0.01`.
//! - `features_used` is non-empty and every entry is whitelisted.
//! - Optional `diversity_penalty_applied` lies in `[0, 1]`, optional
//!   `novelty_days_since_last_play` is non-negative, and optional
//!   `explanation_ref` is non-empty.
//!
//! A [`Provenance`] can only be obtained through validation, so holding one
//! means the invariants hold. Raw, untrusted input uses [`ProvenanceSpec`].
//!
//! Grounding (every feature exists on the track record) is not checked here;
//! see [`crate::explanation`].

use crate::error::ProvenanceError;
use crate::model::{AudioFeature, StrategyKind};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Allowed deviation of the component sum from 1.0.
pub const SCORE_SUM_TOLERANCE: f64 = 0.01;

/// Untyped provenance as it arrives from callers or JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProvenanceSpec {
    pub track_id: String,
    pub strategies: Vec<String>,
    pub score_components: BTreeMap<String, f64>,
    pub features_used: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diversity_penalty_applied: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub novelty_days_since_last_play: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explanation_ref: Option<String>,
}

/// Validated, immutable provenance record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "ProvenanceSpec")]
pub struct Provenance {
    track_id: String,
    strategies: Vec<StrategyKind>,
    score_components: BTreeMap<StrategyKind, f64>,
    features_used: Vec<AudioFeature>,
    #[serde(skip_serializing_if = "Option::is_none")]
    diversity_penalty_applied: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    novelty_days_since_last_play: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    explanation_ref: Option<String>,
    /// Number of original records folded into this one.
    #[serde(skip)]
    merged_count: u32,
}

impl TryFrom<ProvenanceSpec> for Provenance {
    type Error = ProvenanceError;

    fn try_from(spec: ProvenanceSpec) -> Result<Self, Self::Error> {
        build_provenance(&spec)
    }
}

/// Checks `spec` against the provenance invariants, reporting the first
/// violation found.
pub fn validate_provenance(spec: &ProvenanceSpec) -> Result<(), ProvenanceError> {
    parse(spec).map(|_| ())
}

/// Validates `spec` and returns an independent, typed copy of it.
pub fn build_provenance(spec: &ProvenanceSpec) -> Result<Provenance, ProvenanceError> {
    parse(spec)
}

fn parse(spec: &ProvenanceSpec) -> Result<Provenance, ProvenanceError> {
    if spec.track_id.trim().is_empty() {
        return Err(ProvenanceError::InvalidTrackId);
    }

    if spec.strategies.is_empty() {
        return Err(ProvenanceError::InvalidStrategies);
    }
    let strategies = spec
        .strategies
        .iter()
        .map(|name| parse_strategy(name))
        .collect::<Result<Vec<_>, _>>()?;

    if spec.score_components.is_empty() {
        return Err(ProvenanceError::InvalidScoreComponents);
    }
    let mut score_components = BTreeMap::new();
    for (name, value) in &spec.score_components {
        let strategy = parse_strategy(name)?;
        if !value.is_finite() || !(0.0..=1.0).contains(value) {
            return Err(ProvenanceError::InvalidScoreValue(*value));
        }
        score_components.insert(strategy, *value);
    }
    let sum: f64 = score_components.values().sum();
    if (sum - 1.0).abs() > SCORE_SUM_TOLERANCE {
        return Err(ProvenanceError::InvalidScoreSum(sum));
    }

    if spec.features_used.is_empty() {
        return Err(ProvenanceError::InvalidFeaturesUsed);
    }
    let features_used = spec
        .features_used
        .iter()
        .map(|name| name.parse::<AudioFeature>())
        .collect::<Result<Vec<_>, _>>()?;

    if let Some(penalty) = spec.diversity_penalty_applied {
        if !penalty.is_finite() || !(0.0..=1.0).contains(&penalty) {
            return Err(ProvenanceError::InvalidDiversityPenalty(penalty));
        }
    }

    if let Some(days) = spec.novelty_days_since_last_play {
        if !days.is_finite() || days < 0.0 {
            return Err(ProvenanceError::InvalidNoveltyDays(days));
        }
    }

    if let Some(reference) = &spec.explanation_ref {
        if reference.trim().is_empty() {
            return Err(ProvenanceError::InvalidExplanationRef);
        }
    }

    Ok(Provenance {
        track_id: spec.track_id.clone(),
        strategies,
        score_components,
        features_used,
        diversity_penalty_applied: spec.diversity_penalty_applied,
        novelty_days_since_last_play: spec.novelty_days_since_last_play,
        explanation_ref: spec.explanation_ref.clone(),
        merged_count: 1,
    })
}

fn parse_strategy(name: &str) -> Result<StrategyKind, ProvenanceError> {
    name.parse::<StrategyKind>()
        .map_err(|_| ProvenanceError::InvalidStrategy(name.to_string()))
}

impl Provenance {
    /// Provenance of a track proposed by exactly one strategy.
    pub fn single_strategy(
        track_id: &str,
        strategy: StrategyKind,
        features: &[AudioFeature],
    ) -> Result<Self, ProvenanceError> {
        build_provenance(&ProvenanceSpec {
            track_id: track_id.to_string(),
            strategies: vec![strategy.to_string()],
            score_components: BTreeMap::from([(strategy.to_string(), 1.0)]),
            features_used: features.iter().map(ToString::to_string).collect(),
            ..ProvenanceSpec::default()
        })
    }

    #[must_use]
    pub fn track_id(&self) -> &str {
        &self.track_id
    }

    #[must_use]
    pub fn strategies(&self) -> &[StrategyKind] {
        &self.strategies
    }

    /// The first listed strategy.
    #[must_use]
    pub fn primary_strategy(&self) -> StrategyKind {
        self.strategies[0]
    }

    #[must_use]
    pub fn score_components(&self) -> &BTreeMap<StrategyKind, f64> {
        &self.score_components
    }

    #[must_use]
    pub fn features_used(&self) -> &[AudioFeature] {
        &self.features_used
    }

    #[must_use]
    pub fn diversity_penalty_applied(&self) -> Option<f64> {
        self.diversity_penalty_applied
    }

    #[must_use]
    pub fn novelty_days_since_last_play(&self) -> Option<f64> {
        self.novelty_days_since_last_play
    }

    #[must_use]
    pub fn explanation_ref(&self) -> Option<&str> {
        self.explanation_ref.as_deref()
    }

    /// Returns a copy carrying the given explanation reference.
    pub fn with_explanation_ref(&self, reference: &str) -> Result<Self, ProvenanceError> {
        if reference.trim().is_empty() {
            return Err(ProvenanceError::InvalidExplanationRef);
        }
        Ok(Self {
            explanation_ref: Some(reference.to_string()),
            ..self.clone()
        })
    }

    /// The untyped form, suitable for JSON or re-validation.
    #[must_use]
    pub fn to_spec(&self) -> ProvenanceSpec {
        ProvenanceSpec {
            track_id: self.track_id.clone(),
            strategies: self.strategies.iter().map(ToString::to_string).collect(),
            score_components: self
                .score_components
                .iter()
                .map(|(strategy, value)| (strategy.to_string(), *value))
                .collect(),
            features_used: self.features_used.iter().map(ToString::to_string).collect(),
            diversity_penalty_applied: self.diversity_penalty_applied,
            novelty_days_since_last_play: self.novelty_days_since_last_play,
            explanation_ref: self.explanation_ref.clone(),
        }
    }
}

/// Folds several provenance records for the same track into one.
///
/// Strategies and features are unioned in first-seen order. Score components
/// and the optional numeric fields are averaged, each record weighted by the
/// number of originals it already represents, which keeps the merge
/// associative. The result gets a fresh `merged_*` explanation reference.
pub fn merge_provenance(items: &[Provenance]) -> Result<Provenance, ProvenanceError> {
    let first = items.first().ok_or(ProvenanceError::EmptyMerge)?;
    if items.len() == 1 {
        return Ok(first.clone());
    }

    if let Some(other) = items.iter().find(|p| p.track_id != first.track_id) {
        return Err(ProvenanceError::MergeTrackMismatch {
            expected: first.track_id.clone(),
            found: other.track_id.clone(),
        });
    }

    let total: u32 = items.iter().map(|p| p.merged_count).sum();
    let total_weight = f64::from(total);

    let mut strategies: Vec<StrategyKind> = Vec::new();
    let mut features_used: Vec<AudioFeature> = Vec::new();
    let mut score_components: BTreeMap<StrategyKind, f64> = BTreeMap::new();

    for item in items {
        let weight = f64::from(item.merged_count) / total_weight;
        for strategy in &item.strategies {
            if !strategies.contains(strategy) {
                strategies.push(*strategy);
            }
        }
        for feature in &item.features_used {
            if !features_used.contains(feature) {
                features_used.push(*feature);
            }
        }
        for (strategy, value) in &item.score_components {
            *score_components.entry(*strategy).or_insert(0.0) += value * weight;
        }
    }

    let names: Vec<&str> = strategies.iter().map(|s| s.as_str()).collect();
    let explanation_ref = format!("merged_{}_{}", names.join("_"), Utc::now().timestamp_millis());

    let merged = Provenance {
        track_id: first.track_id.clone(),
        strategies,
        score_components,
        features_used,
        diversity_penalty_applied: weighted_optional(items, |p| p.diversity_penalty_applied),
        novelty_days_since_last_play: weighted_optional(items, |p| p.novelty_days_since_last_play),
        explanation_ref: Some(explanation_ref),
        merged_count: total,
    };

    // Floating-point accumulation must still satisfy the invariants.
    let mut checked = build_provenance(&merged.to_spec())?;
    checked.merged_count = total;
    Ok(checked)
}

/// Merge-count weighted mean over the records that carry the field.
fn weighted_optional(items: &[Provenance], field: impl Fn(&Provenance) -> Option<f64>) -> Option<f64> {
    let (sum, weight) = items
        .iter()
        .filter_map(|p| field(p).map(|value| (value, f64::from(p.merged_count))))
        .fold((0.0, 0.0), |(sum, total), (value, weight)| (sum + value * weight, total + weight));

    (weight > 0.0).then(|| sum / weight)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn spec(track: &str, components: &[(&str, f64)], features: &[&str]) -> ProvenanceSpec {
        ProvenanceSpec {
            track_id: track.to_string(),
            strategies: components.iter().map(|(s, _)| s.to_string()).collect(),
            score_components: components.iter().map(|(s, v)| (s.to_string(), *v)).collect(),
            features_used: features.iter().map(|f| f.to_string()).collect(),
            ..ProvenanceSpec::default()
        }
    }

    #[test]
    fn test_valid_provenance_builds() {
        let provenance =
            build_provenance(&spec("t1", &[("collaborative", 0.6), ("content", 0.4)], &["energy"])).unwrap();
        assert_eq!(provenance.track_id(), "t1");
        assert_eq!(provenance.primary_strategy(), StrategyKind::Collaborative);
        assert_eq!(provenance.features_used(), &[AudioFeature::Energy]);
    }

    #[test]
    fn test_score_sum_outside_tolerance_rejected() {
        let err = build_provenance(&spec("t1", &[("collaborative", 0.5), ("content", 0.3)], &["energy"]))
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_SCORE_SUM");

        // Within tolerance is fine.
        assert!(validate_provenance(&spec("t1", &[("collaborative", 0.505), ("content", 0.5)], &["energy"])).is_ok());
    }

    #[test]
    fn test_unknown_feature_rejected() {
        let err = validate_provenance(&spec("t1", &[("content", 1.0)], &["energy", "mood"])).unwrap_err();
        assert_eq!(err, ProvenanceError::InvalidFeature("mood".to_string()));
    }

    #[test]
    fn test_structural_errors_have_specific_codes() {
        let cases = vec![
            (spec("  ", &[("content", 1.0)], &["energy"]), "INVALID_TRACK_ID"),
            (
                ProvenanceSpec { strategies: vec![], ..spec("t", &[("content", 1.0)], &["energy"]) },
                "INVALID_STRATEGIES",
            ),
            (spec("t", &[("popularity", 1.0)], &["energy"]), "INVALID_STRATEGY"),
            (
                ProvenanceSpec { score_components: BTreeMap::new(), ..spec("t", &[("content", 1.0)], &["energy"]) },
                "INVALID_SCORE_COMPONENTS",
            ),
            (spec("t", &[("content", 1.2)], &["energy"]), "INVALID_SCORE_VALUE"),
            (spec("t", &[("content", 1.0)], &[]), "INVALID_FEATURES_USED"),
        ];
        for (input, code) in cases {
            assert_eq!(validate_provenance(&input).unwrap_err().code(), code);
        }
    }

    #[test]
    fn test_optional_fields_validated() {
        let base = spec("t", &[("content", 1.0)], &["energy"]);

        let penalty = ProvenanceSpec { diversity_penalty_applied: Some(1.5), ..base.clone() };
        assert_eq!(validate_provenance(&penalty).unwrap_err().code(), "INVALID_DIVERSITY_PENALTY");

        let novelty = ProvenanceSpec { novelty_days_since_last_play: Some(-1.0), ..base.clone() };
        assert_eq!(validate_provenance(&novelty).unwrap_err().code(), "INVALID_NOVELTY_DAYS");

        let reference = ProvenanceSpec { explanation_ref: Some(" ".into()), ..base.clone() };
        assert_eq!(validate_provenance(&reference).unwrap_err().code(), "INVALID_EXPLANATION_REF");

        let fine = ProvenanceSpec { novelty_days_since_last_play: Some(0.0), ..base };
        assert!(validate_provenance(&fine).is_ok());
    }

    #[test]
    fn test_deserialization_validates() {
        let json = r#"{"trackId":"t1","strategies":["content"],"scoreComponents":{"content":0.4},"featuresUsed":["energy"]}"#;
        let err = serde_json::from_str::<Provenance>(json).unwrap_err();
        assert!(err.to_string().contains("INVALID_SCORE_SUM"));

        let json = r#"{"trackId":"t1","strategies":["content"],"scoreComponents":{"content":1.0},"featuresUsed":["tempo"]}"#;
        let provenance: Provenance = serde_json::from_str(json).unwrap();
        assert_eq!(provenance.features_used(), &[AudioFeature::Tempo]);
    }

    #[test]
    fn test_single_strategy() {
        let provenance =
            Provenance::single_strategy("t9", StrategyKind::Semantic, &[AudioFeature::Valence]).unwrap();
        assert_eq!(provenance.score_components().get(&StrategyKind::Semantic), Some(&1.0));
        assert!(Provenance::single_strategy("t9", StrategyKind::Semantic, &[]).is_err());
    }

    #[test]
    fn test_merge_unions_and_averages() {
        let a = build_provenance(&spec("t", &[("collaborative", 1.0)], &["energy"])).unwrap();
        let b = build_provenance(&spec("t", &[("content", 1.0)], &["tempo", "energy"])).unwrap();
        let merged = merge_provenance(&[a, b]).unwrap();

        assert_eq!(merged.strategies(), &[StrategyKind::Collaborative, StrategyKind::Content]);
        assert_eq!(merged.features_used(), &[AudioFeature::Energy, AudioFeature::Tempo]);
        assert_relative_eq!(merged.score_components()[&StrategyKind::Collaborative], 0.5);
        assert!(merged.explanation_ref().unwrap().starts_with("merged_collaborative_content_"));
    }

    #[test]
    fn test_merge_is_associative() {
        let a = build_provenance(&spec("t", &[("collaborative", 1.0)], &["energy"])).unwrap();
        let b = build_provenance(&spec("t", &[("content", 0.5), ("semantic", 0.5)], &["tempo"])).unwrap();
        let c = build_provenance(&ProvenanceSpec {
            novelty_days_since_last_play: Some(9.0),
            ..spec("t", &[("semantic", 1.0)], &["valence"])
        })
        .unwrap();

        let flat = merge_provenance(&[a.clone(), b.clone(), c.clone()]).unwrap();
        let nested = merge_provenance(&[merge_provenance(&[a, b]).unwrap(), c]).unwrap();

        for (strategy, value) in flat.score_components() {
            assert_relative_eq!(*value, nested.score_components()[strategy], epsilon = 1e-9);
        }
        assert_eq!(flat.novelty_days_since_last_play(), nested.novelty_days_since_last_play());
        assert_relative_eq!(flat.score_components()[&StrategyKind::Collaborative], 1.0 / 3.0, epsilon = 1e-9);
    }

    #[test]
    fn test_merge_rejects_empty_and_mixed_tracks() {
        assert_eq!(merge_provenance(&[]).unwrap_err().code(), "EMPTY_MERGE");
        let a = build_provenance(&spec("a", &[("content", 1.0)], &["energy"])).unwrap();
        let b = build_provenance(&spec("b", &[("content", 1.0)], &["energy"])).unwrap();
        assert_eq!(merge_provenance(&[a, b]).unwrap_err().code(), "MERGE_TRACK_MISMATCH");
    }
}
