//! # Integration Tests for Resonance
//!
//! End-to-end tests through the public API: engine runs over in-memory and
//! SQLite stores, feedback ingestion, evaluation, and the CLI binary.

use anyhow::Result;
use chrono::{Duration, Utc};
use resonance::config::EngineConfig;
use resonance::embedding::{HashingEmbedder, TrackEmbedding};
use resonance::engine::{RecommendationEngine, RecommendationRequest};
use resonance::model::{
    AudioFeature, AudioFeatureVector, Feedback, HistoryEntry, Interaction, RunParams, Signal, StrategyKind,
    TrackRecord, UserContext,
};
use resonance::provenance::{build_provenance, SCORE_SUM_TOLERANCE};
use resonance::store::{DataSource, MemoryStore, SqliteStore};
use resonance::strategy::Degradation;
use std::sync::Arc;
use tempfile::TempDir;

const DIMENSION: usize = 8;

fn events(user: &str, tracks: &[(&str, Signal)]) -> Vec<Interaction> {
    let now = Utc::now();
    tracks
        .iter()
        .enumerate()
        .map(|(i, (track, signal))| Interaction::new(user, track, *signal, now - Duration::minutes(i as i64)))
        .collect()
}

fn features(energy: f64, valence: f64, danceability: f64, tempo: f64) -> AudioFeatureVector {
    AudioFeatureVector::new()
        .with(AudioFeature::Energy, energy)
        .with(AudioFeature::Valence, valence)
        .with(AudioFeature::Danceability, danceability)
        .with(AudioFeature::Tempo, tempo)
}

fn embedding(track_id: &str, hot: usize) -> TrackEmbedding {
    let mut vector = vec![0.05_f32; DIMENSION];
    vector[hot] = 1.0;
    TrackEmbedding {
        track_id: track_id.to_string(),
        embedding: vector,
        model: Some("test".to_string()),
        genre: None,
    }
}

/// u1 plays a-d ten times; u2 shares c and d and loves e; u4 has two plays.
fn catalogue() -> MemoryStore {
    use Signal::*;
    MemoryStore::new()
        .with_interactions(events(
            "u1",
            &[
                ("a", Play), ("a", Like), ("b", Play), ("b", Replay), ("c", Play),
                ("c", Love), ("d", Play), ("d", Play), ("a", Replay), ("b", Like),
            ],
        ))
        .with_interactions(events("u2", &[("c", Play), ("d", Like), ("e", Love)]))
        .with_interactions(events("u4", &[("a", Play), ("e", Play)]))
        .with_track(TrackRecord::new("a").with_artist("Alpha").with_genre("house").with_features(features(0.8, 0.6, 0.7, 124.0)))
        .with_track(TrackRecord::new("b").with_artist("Alpha").with_genre("house").with_features(features(0.78, 0.62, 0.72, 126.0)))
        .with_track(TrackRecord::new("c").with_artist("Beta").with_genre("house").with_features(features(0.75, 0.55, 0.68, 122.0)))
        .with_track(TrackRecord::new("d").with_artist("Gamma").with_genre("techno").with_features(features(0.85, 0.5, 0.74, 128.0)))
        .with_track(TrackRecord::new("e").with_artist("Delta").with_genre("jazz").with_features(features(0.35, 0.45, 0.4, 96.0)))
        .with_track(TrackRecord::new("f").with_artist("Epsilon").with_genre("house").with_features(features(0.79, 0.6, 0.7, 125.0)))
        .with_track(TrackRecord::new("bare").with_artist("Zeta"))
        .with_embedding(embedding("a", 0))
        .with_embedding(embedding("e", 1))
        .with_embedding(embedding("f", 0))
}

fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.semantic.common_queries = Vec::new();
    config
}

fn engine_over(source: Arc<dyn DataSource>, config: EngineConfig, dimension: usize) -> RecommendationEngine {
    RecommendationEngine::new(config, source, Arc::new(HashingEmbedder::new(dimension)))
}

fn engine() -> RecommendationEngine {
    engine_over(Arc::new(catalogue()), test_config(), DIMENSION)
}

fn request(user: &str, strategy: StrategyKind) -> RecommendationRequest {
    RecommendationRequest {
        strategy: Some(strategy),
        ..RecommendationRequest::for_user(user)
    }
}

#[cfg(test)]
mod engine_tests {
    use super::*;

    #[test]
    fn test_collaborative_recommendation_with_provenance() {
        let engine = engine();
        let envelope = engine.generate(&request("u1", StrategyKind::Collaborative));

        assert!(!envelope.is_fallback());
        assert_eq!(envelope.strategy, "collaborative");
        assert_eq!(envelope.candidates.len(), 1);

        let candidate = &envelope.candidates[0];
        assert_eq!(candidate.track_id, "e");
        assert_eq!(candidate.artist.as_deref(), Some("Delta"));
        assert!(candidate.reasons.iter().any(|r| r.contains("similar users")));

        let provenance = candidate.provenance.as_ref().expect("served candidate has provenance");
        assert_eq!(provenance.strategies(), &[StrategyKind::Collaborative]);
        let sum: f64 = provenance.score_components().values().sum();
        assert!((sum - 1.0).abs() <= SCORE_SUM_TOLERANCE);
        assert!(!provenance.features_used().is_empty());

        // Provenance survives a round trip through its raw form.
        assert!(build_provenance(&provenance.to_spec()).is_ok());

        let explanation = engine.explain(candidate).unwrap();
        assert!(!explanation.text.is_empty());
        assert!(explanation.confidence > 0.5);
    }

    #[test]
    fn test_unknown_user_degrades_to_cold_start() {
        let envelope = engine().generate(&request("stranger", StrategyKind::Collaborative));
        assert!(!envelope.is_fallback());
        assert!(envelope.candidates.is_empty());
        let diagnostics = envelope.metadata.diagnostics.unwrap();
        assert_eq!(diagnostics.degradation, Some(Degradation::ColdStart));
    }

    #[test]
    fn test_dimension_mismatch_yields_fallback_envelope() {
        let engine = engine_over(Arc::new(catalogue()), test_config(), 16);
        let mut req = request("u1", StrategyKind::Semantic);
        req.user_context.semantic_query = Some("late night jazz".to_string());

        let envelope = engine.generate(&req);
        assert!(envelope.is_fallback());
        assert_eq!(envelope.strategy, "fallback");
        assert!(envelope.candidates.is_empty());
        assert!(envelope.metadata.error.unwrap().starts_with("DIMENSION_MISMATCH"));
    }

    #[test]
    fn test_hybrid_fuses_three_strategies() {
        let mut config = test_config();
        config.confidence_threshold = 0.0;
        let engine = engine_over(Arc::new(catalogue()), config, DIMENSION);

        let mut req = request("u1", StrategyKind::Hybrid);
        req.seeds = vec!["a".to_string()];
        req.user_context = UserContext::default().with_history(["a", "b", "c", "d", "x", "y"]);
        req.user_context.user_message = Some("more of this".to_string());

        let envelope = engine.generate(&req);
        assert!(!envelope.is_fallback());
        assert_eq!(envelope.strategy, "hybrid");
        assert!(!envelope.candidates.is_empty());

        let diagnostics = envelope.metadata.diagnostics.unwrap();
        assert_eq!(diagnostics.sub_results.len(), 3);
        assert!(diagnostics.sub_results.iter().all(|r| r.error.is_none()));

        for candidate in &envelope.candidates {
            assert!(candidate.final_score.is_some());
            if let Some(provenance) = &candidate.provenance {
                assert_eq!(provenance.strategies()[0], StrategyKind::Hybrid);
            }
        }
    }

    #[test]
    fn test_content_candidates_respect_confidence_threshold() {
        let engine = engine();
        let mut req = request("u1", StrategyKind::Content);
        req.seeds = vec!["a".to_string()];

        let envelope = engine.generate(&req);
        assert!(!envelope.is_fallback());
        assert!(envelope.candidates.iter().all(|c| c.effective_score() >= 0.5));
        assert!(envelope.candidates.iter().all(|c| c.track_id != "a"));
        assert!(envelope.metadata.filtered_count <= envelope.metadata.original_count);
    }

    #[test]
    fn test_feedback_lifts_cold_start() {
        let engine = engine();
        assert_eq!(
            engine
                .generate(&request("newbie", StrategyKind::Collaborative))
                .metadata
                .diagnostics
                .unwrap()
                .degradation,
            Some(Degradation::ColdStart)
        );

        for track in ["a", "c", "d"] {
            let feedback = Feedback {
                track_id: track.to_string(),
                signal: Signal::Love,
                timestamp: Utc::now(),
                session_id: None,
            };
            engine.update_user_model("newbie", &feedback);
        }

        let envelope = engine.generate(&request("newbie", StrategyKind::Collaborative));
        let diagnostics = envelope.metadata.diagnostics.unwrap();
        assert_ne!(diagnostics.degradation, Some(Degradation::ColdStart));
        assert_eq!(diagnostics.counter("userHistorySize"), Some(3.0));
    }

    #[test]
    fn test_feedback_extends_short_stored_history() {
        let engine = engine();
        let before = engine.generate(&request("u4", StrategyKind::Collaborative));
        let diagnostics = before.metadata.diagnostics.unwrap();
        assert_eq!(diagnostics.degradation, Some(Degradation::ColdStart));
        assert_eq!(diagnostics.counter("userHistorySize"), Some(2.0));

        let feedback = Feedback {
            track_id: "c".to_string(),
            signal: Signal::Love,
            timestamp: Utc::now(),
            session_id: None,
        };
        engine.update_user_model("u4", &feedback);

        let after = engine.generate(&request("u4", StrategyKind::Collaborative));
        let diagnostics = after.metadata.diagnostics.unwrap();
        assert_eq!(diagnostics.degradation, None);
        assert_eq!(diagnostics.counter("userHistorySize"), Some(3.0));
    }

    #[test]
    fn test_evaluate_strategy_reports_metrics() {
        let engine = engine();
        let mut params = RunParams::for_user("u1");
        params.seeds = vec!["a".to_string()];

        let evaluation = engine.evaluate_strategy("content-based", &params);
        assert!(evaluation.error.is_none());
        assert!(evaluation.candidate_count > 0);
        assert!(evaluation.avg_score > 0.0);
        assert!(evaluation.diversity.is_some());

        let unknown = engine.evaluate_strategy("popularity", &params);
        assert!(unknown.error.unwrap().starts_with("UNKNOWN_STRATEGY"));
        assert_eq!(unknown.candidate_count, 0);
    }

    #[test]
    fn test_available_strategies() {
        assert_eq!(
            engine().available_strategies(),
            vec!["collaborative", "content", "semantic", "hybrid"]
        );
    }

    #[test]
    fn test_novelty_reaches_provenance() {
        let engine = engine();
        let mut req = request("u1", StrategyKind::Content);
        req.seeds = vec!["a".to_string()];
        req.user_context.listening_history = vec![HistoryEntry {
            track_id: "f".to_string(),
            played_at: Some(Utc::now() - Duration::days(10)),
        }];

        let envelope = engine.generate(&req);
        let candidate = envelope.candidates.iter().find(|c| c.track_id == "f").unwrap();
        let days = candidate.provenance.as_ref().unwrap().novelty_days_since_last_play().unwrap();
        assert!((9.9..=10.1).contains(&days));
    }
}

#[cfg(test)]
mod sqlite_integration_tests {
    use super::*;

    #[test]
    fn test_sqlite_store_serves_the_same_recommendations() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let db_path = temp_dir.path().join("resonance.db");
        let store = SqliteStore::open(&db_path)?;
        store.import_dataset(catalogue().dataset())?;
        drop(store);

        let reopened = SqliteStore::open(&db_path)?;
        assert_eq!(reopened.tracks()?.len(), 7);
        assert_eq!(reopened.user_interactions("u2")?.len(), 3);

        let engine = engine_over(Arc::new(reopened), test_config(), DIMENSION);
        let envelope = engine.generate(&request("u1", StrategyKind::Collaborative));
        assert_eq!(envelope.candidates.len(), 1);
        assert_eq!(envelope.candidates[0].track_id, "e");
        Ok(())
    }
}

#[cfg(test)]
mod cli_tests {
    use super::*;
    use std::process::Command;

    fn resonance(temp_dir: &TempDir) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_resonance"));
        cmd.arg("--config").arg(temp_dir.path().join("absent.json"));
        cmd
    }

    fn write_dataset(temp_dir: &TempDir) -> Result<std::path::PathBuf> {
        let path = temp_dir.path().join("catalogue.json");
        std::fs::write(&path, serde_json::to_string(catalogue().dataset())?)?;
        Ok(path)
    }

    #[test]
    fn test_cli_help_displays_correctly() {
        let output = Command::new(env!("CARGO_BIN_EXE_resonance"))
            .arg("--help")
            .output()
            .expect("Failed to run help command");

        let stdout = String::from_utf8_lossy(&output.stdout);
        assert!(stdout.contains("resonance"));
        assert!(stdout.contains("recommend"));
        assert!(stdout.contains("init-db"));
    }

    #[test]
    fn test_completion_generation() {
        let output = Command::new(env!("CARGO_BIN_EXE_resonance"))
            .args(["completion", "bash"])
            .output()
            .expect("Failed to run completion command");

        assert!(output.status.success());
        let stdout = String::from_utf8_lossy(&output.stdout);
        assert!(stdout.contains("_resonance"));
        assert!(stdout.contains("complete"));
    }

    #[test]
    fn test_recommend_from_dataset_file() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let data = write_dataset(&temp_dir)?;

        let output = resonance(&temp_dir)
            .arg("--data")
            .arg(&data)
            .args(["recommend", "u1", "--strategy", "collaborative", "--explain"])
            .output()?;
        assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

        let json: serde_json::Value = serde_json::from_slice(&output.stdout)?;
        assert_eq!(json["recommendations"]["strategy"], "collaborative");
        assert_eq!(json["recommendations"]["candidates"][0]["trackId"], "e");
        assert!(json["explanations"][0]["explanation"]["text"].is_string());
        Ok(())
    }

    #[test]
    fn test_init_db_then_strategies() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let data = write_dataset(&temp_dir)?;
        let db = temp_dir.path().join("store.db");

        let output = resonance(&temp_dir).arg("--db").arg(&db).arg("init-db").arg(&data).output()?;
        assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
        let summary: serde_json::Value = serde_json::from_slice(&output.stdout)?;
        assert_eq!(summary["tracks"], 7);

        let output = resonance(&temp_dir).arg("--db").arg(&db).arg("strategies").output()?;
        let strategies: serde_json::Value = serde_json::from_slice(&output.stdout)?;
        assert_eq!(strategies.as_array().map(Vec::len), Some(4));
        assert_eq!(strategies[0]["mock"], false);
        Ok(())
    }

    #[test]
    fn test_explain_refuses_ungrounded_features() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let input = temp_dir.path().join("explain.json");
        std::fs::write(
            &input,
            r#"[{
                "track": {"id": "t1", "audio_features": {"energy": 0.9}},
                "provenance": {
                    "trackId": "t1",
                    "strategies": ["content"],
                    "scoreComponents": {"content": 1.0},
                    "featuresUsed": ["energy", "valence"]
                }
            }]"#,
        )?;

        let output = resonance(&temp_dir).arg("explain").arg(&input).output()?;
        assert!(output.status.success());
        let explanations: serde_json::Value = serde_json::from_slice(&output.stdout)?;
        assert!(explanations[0]["error"].as_str().unwrap().starts_with("FEATURE_MISSING"));
        assert_eq!(explanations[0]["confidence"], 0.3);
        Ok(())
    }
}
