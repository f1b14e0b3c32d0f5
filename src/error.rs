//! Coded error types.
//!
//! Structural errors carry a stable, upper-case code (`INVALID_SCORE_SUM`,
//! `FEATURE_MISSING`, ...) so API consumers can render targeted messages.
//! Missing data is never an error here; strategies report it through
//! [`crate::strategy::Degradation`] instead.

use thiserror::Error;

/// Violations of the provenance invariants.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProvenanceError {
    #[error("INVALID_TRACK_ID: trackId must be a non-empty string")]
    InvalidTrackId,

    #[error("INVALID_STRATEGIES: strategies must be a non-empty list")]
    InvalidStrategies,

    #[error("INVALID_STRATEGY: {0} is not a valid strategy. Valid: collaborative, content, semantic, hybrid")]
    InvalidStrategy(String),

    #[error("INVALID_SCORE_COMPONENTS: scoreComponents must contain at least one strategy weight")]
    InvalidScoreComponents,

    #[error("INVALID_SCORE_VALUE: score values must be numbers between 0 and 1, got {0}")]
    InvalidScoreValue(f64),

    #[error("INVALID_SCORE_SUM: score components must sum to ~1.0, got {0}")]
    InvalidScoreSum(f64),

    #[error("INVALID_FEATURES_USED: featuresUsed must be a non-empty list")]
    InvalidFeaturesUsed,

    #[error("INVALID_FEATURE: {0} is not a valid audio feature")]
    InvalidFeature(String),

    #[error("INVALID_DIVERSITY_PENALTY: diversityPenaltyApplied must be between 0 and 1, got {0}")]
    InvalidDiversityPenalty(f64),

    #[error("INVALID_NOVELTY_DAYS: noveltyDaysSinceLastPlay must be null or non-negative, got {0}")]
    InvalidNoveltyDays(f64),

    #[error("INVALID_EXPLANATION_REF: explanationRef must be a non-empty string")]
    InvalidExplanationRef,

    #[error("EMPTY_MERGE: at least one provenance record is required")]
    EmptyMerge,

    #[error("MERGE_TRACK_MISMATCH: cannot merge provenance of {found} into {expected}")]
    MergeTrackMismatch { expected: String, found: String },
}

impl ProvenanceError {
    /// Stable machine-readable code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidTrackId => "INVALID_TRACK_ID",
            Self::InvalidStrategies => "INVALID_STRATEGIES",
            Self::InvalidStrategy(_) => "INVALID_STRATEGY",
            Self::InvalidScoreComponents => "INVALID_SCORE_COMPONENTS",
            Self::InvalidScoreValue(_) => "INVALID_SCORE_VALUE",
            Self::InvalidScoreSum(_) => "INVALID_SCORE_SUM",
            Self::InvalidFeaturesUsed => "INVALID_FEATURES_USED",
            Self::InvalidFeature(_) => "INVALID_FEATURE",
            Self::InvalidDiversityPenalty(_) => "INVALID_DIVERSITY_PENALTY",
            Self::InvalidNoveltyDays(_) => "INVALID_NOVELTY_DAYS",
            Self::InvalidExplanationRef => "INVALID_EXPLANATION_REF",
            Self::EmptyMerge => "EMPTY_MERGE",
            Self::MergeTrackMismatch { .. } => "MERGE_TRACK_MISMATCH",
        }
    }
}

/// Refusals of the explanation generator.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExplanationError {
    #[error("MISSING_INPUT: {0}")]
    MissingInput(String),

    #[error("FEATURE_MISSING: feature '{feature}' referenced in provenance but not found in track audio features. Available features: {available}")]
    FeatureMissing { feature: String, available: String },

    #[error("INVALID_FEATURE: feature '{0}' is not a valid audio feature")]
    InvalidFeature(String),

    #[error(transparent)]
    Provenance(#[from] ProvenanceError),
}

impl ExplanationError {
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::MissingInput(_) => "MISSING_INPUT",
            Self::FeatureMissing { .. } => "FEATURE_MISSING",
            Self::InvalidFeature(_) => "INVALID_FEATURE",
            Self::Provenance(inner) => inner.code(),
        }
    }
}

/// Contract violations raised while running a strategy.
#[derive(Error, Debug)]
pub enum StrategyError {
    #[error("DIMENSION_MISMATCH: embeddings must have the same dimension ({expected} != {found})")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("INITIALIZATION_FAILED: {0:#}")]
    Initialization(anyhow::Error),

    #[error("DATA_SOURCE: {0:#}")]
    DataSource(anyhow::Error),

    #[error("EMBEDDING_FAILED: {0:#}")]
    Embedding(anyhow::Error),

    #[error("STRATEGY_PANICKED: {0}")]
    Panicked(String),
}

impl StrategyError {
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::DimensionMismatch { .. } => "DIMENSION_MISMATCH",
            Self::Initialization(_) => "INITIALIZATION_FAILED",
            Self::DataSource(_) => "DATA_SOURCE",
            Self::Embedding(_) => "EMBEDDING_FAILED",
            Self::Panicked(_) => "STRATEGY_PANICKED",
        }
    }

    /// Builds a [`StrategyError::Panicked`] from a caught panic payload.
    #[must_use]
    pub fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        Self::Panicked(message)
    }
}

/// Strategy lookup failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("UNKNOWN_STRATEGY: '{0}' is not a known strategy name")]
    UnknownStrategy(String),

    #[error("STRATEGY_NOT_REGISTERED: no '{0}' strategy is registered")]
    NotRegistered(String),
}

impl RegistryError {
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::UnknownStrategy(_) => "UNKNOWN_STRATEGY",
            Self::NotRegistered(_) => "STRATEGY_NOT_REGISTERED",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_starts_with_code() {
        let errors = vec![
            ProvenanceError::InvalidScoreSum(0.5),
            ProvenanceError::InvalidFeature("mood".to_string()),
            ProvenanceError::EmptyMerge,
        ];
        for error in errors {
            assert!(error.to_string().starts_with(error.code()), "{error}");
        }
    }

    #[test]
    fn test_explanation_error_forwards_provenance_code() {
        let error = ExplanationError::from(ProvenanceError::InvalidStrategies);
        assert_eq!(error.code(), "INVALID_STRATEGIES");
    }

    #[test]
    fn test_panic_payload_message() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        let error = StrategyError::from_panic(payload.as_ref());
        assert_eq!(error.code(), "STRATEGY_PANICKED");
        assert!(error.to_string().contains("boom"));
    }
}
