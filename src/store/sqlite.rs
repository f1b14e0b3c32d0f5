//! SQLite-backed data source.
//!
//! Schema:
//!
//! ```sql
//! interactions(user_id, track_id, signal, weight, timestamp, session_id)
//! tracks(id PRIMARY KEY, name, artist, genre, audio_features)
//! track_embeddings(track_id PRIMARY KEY, model, embedding)
//! ```
//!
//! Timestamps are RFC 3339 text; audio features and embeddings are JSON
//! text. Imports run in a single transaction.

use super::{DataSource, Dataset};
use crate::embedding::TrackEmbedding;
use crate::model::{AudioFeatureVector, Interaction, Signal, TrackRecord};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, info};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Mutex, PoisonError};

pub struct SqliteStore {
    conn: Mutex<Connection>,
    location: String,
}

impl SqliteStore {
    /// Opens (or creates) the database and makes sure the schema exists.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("SQLite connection refused. DB location: {}", path.display()))?;
        let store = Self {
            conn: Mutex::new(conn),
            location: path.display().to_string(),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let store = Self {
            conn: Mutex::new(conn),
            location: ":memory:".to_string(),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn connection(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn init_schema(&self) -> Result<()> {
        self.connection()
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS interactions (
                    id         INTEGER PRIMARY KEY,
                    user_id    TEXT    NOT NULL,
                    track_id   TEXT    NOT NULL,
                    signal     TEXT    NOT NULL,
                    weight     REAL    NOT NULL,
                    timestamp  TEXT    NOT NULL,
                    session_id TEXT
                );
                CREATE INDEX IF NOT EXISTS idx_interactions_user ON interactions(user_id);
                CREATE TABLE IF NOT EXISTS tracks (
                    id             TEXT PRIMARY KEY,
                    name           TEXT,
                    artist         TEXT,
                    genre          TEXT,
                    audio_features TEXT
                );
                CREATE TABLE IF NOT EXISTS track_embeddings (
                    track_id  TEXT PRIMARY KEY,
                    model     TEXT,
                    embedding TEXT NOT NULL
                );",
            )
            .with_context(|| format!("Failed to create schema in `{}`", self.location))
    }

    /// Imports a whole dataset in one transaction. Tracks and embeddings are
    /// upserted by id; interactions are appended.
    pub fn import_dataset(&self, dataset: &Dataset) -> Result<()> {
        let mut conn = self.connection();
        let tx = conn.transaction()?;

        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO tracks (id, name, artist, genre, audio_features)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for track in &dataset.tracks {
                let features = track
                    .audio_features
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?;
                stmt.execute(params![track.id, track.name, track.artist, track.genre, features])
                    .with_context(|| format!("Failed to insert track `{}`", track.id))?;
            }
        }

        {
            let mut stmt = tx.prepare(
                "INSERT INTO interactions (user_id, track_id, signal, weight, timestamp, session_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for interaction in &dataset.interactions {
                stmt.execute(params![
                    interaction.user_id,
                    interaction.track_id,
                    interaction.signal.as_str(),
                    interaction.weight,
                    interaction.timestamp.to_rfc3339(),
                    interaction.session_id,
                ])
                .with_context(|| {
                    format!(
                        "Failed to insert interaction {}/{}",
                        interaction.user_id, interaction.track_id
                    )
                })?;
            }
        }

        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO track_embeddings (track_id, model, embedding) VALUES (?1, ?2, ?3)",
            )?;
            for embedding in &dataset.embeddings {
                let vector = serde_json::to_string(&embedding.embedding)?;
                stmt.execute(params![embedding.track_id, embedding.model, vector])
                    .with_context(|| format!("Failed to insert embedding for `{}`", embedding.track_id))?;
            }
        }

        tx.commit().context("Committing SQL transaction failed.")?;
        info!(
            "Imported {} tracks, {} interactions, {} embeddings into {}",
            dataset.tracks.len(),
            dataset.interactions.len(),
            dataset.embeddings.len(),
            self.location
        );
        Ok(())
    }

    fn query_interactions(&self, user_id: Option<&str>) -> Result<Vec<Interaction>> {
        let conn = self.connection();
        let sql = "SELECT user_id, track_id, signal, weight, timestamp, session_id
                   FROM interactions WHERE (?1 IS NULL OR user_id = ?1) ORDER BY timestamp DESC";
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(params![user_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, f64>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read interactions")?;

        rows.into_iter()
            .map(|(user_id, track_id, signal, weight, timestamp, session_id)| {
                Ok(Interaction {
                    signal: signal.parse::<Signal>()?,
                    timestamp: parse_timestamp(&timestamp)?,
                    user_id,
                    track_id,
                    weight,
                    session_id,
                })
            })
            .collect()
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("Invalid interaction timestamp `{}`", raw))?
        .with_timezone(&Utc))
}

impl DataSource for SqliteStore {
    fn interactions(&self) -> Result<Vec<Interaction>> {
        self.query_interactions(None)
    }

    fn user_interactions(&self, user_id: &str) -> Result<Vec<Interaction>> {
        self.query_interactions(Some(user_id))
    }

    fn tracks(&self) -> Result<Vec<TrackRecord>> {
        let conn = self.connection();
        let mut stmt = conn.prepare("SELECT id, name, artist, genre, audio_features FROM tracks ORDER BY id")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read tracks")?;

        let tracks = rows
            .into_iter()
            .map(|(id, name, artist, genre, features)| {
                let audio_features = features
                    .map(|json| serde_json::from_str::<AudioFeatureVector>(&json))
                    .transpose()
                    .with_context(|| format!("Invalid audio features for track `{}`", id))?;
                Ok(TrackRecord {
                    id,
                    name,
                    artist,
                    genre,
                    audio_features,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        debug!("Loaded {} tracks from {}", tracks.len(), self.location);
        Ok(tracks)
    }

    fn track_embeddings(&self) -> Result<Vec<TrackEmbedding>> {
        let conn = self.connection();
        let mut stmt = conn.prepare(
            "SELECT e.track_id, e.model, e.embedding, t.genre
             FROM track_embeddings e LEFT JOIN tracks t ON t.id = e.track_id
             ORDER BY e.track_id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read track embeddings")?;

        rows.into_iter()
            .map(|(track_id, model, embedding, genre)| {
                let embedding = serde_json::from_str(&embedding)
                    .with_context(|| format!("Invalid embedding for track `{}`", track_id))?;
                Ok(TrackEmbedding {
                    track_id,
                    embedding,
                    model,
                    genre,
                })
            })
            .collect()
    }

    fn describe(&self) -> String {
        format!("sqlite ({})", self.location)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AudioFeature;
    use chrono::TimeZone;

    fn dataset() -> Dataset {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        Dataset {
            tracks: vec![TrackRecord::new("t1")
                .with_artist("Artist")
                .with_genre("rock")
                .with_features(AudioFeatureVector::new().with(AudioFeature::Energy, 0.9))],
            interactions: vec![
                Interaction::new("u1", "t1", Signal::Love, at),
                Interaction::new("u2", "t1", Signal::Skip, at),
            ],
            embeddings: vec![TrackEmbedding {
                track_id: "t1".into(),
                embedding: vec![0.1, 0.2, 0.3],
                model: Some("test".into()),
                genre: None,
            }],
        }
    }

    #[test]
    fn test_import_and_read_back() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.import_dataset(&dataset()).unwrap();

        let tracks = store.tracks().unwrap();
        assert_eq!(tracks.len(), 1);
        assert_eq!(
            tracks[0].audio_features.as_ref().unwrap().get(AudioFeature::Energy),
            Some(0.9)
        );

        let u1 = store.user_interactions("u1").unwrap();
        assert_eq!(u1.len(), 1);
        assert_eq!(u1[0].signal, Signal::Love);
        assert_eq!(u1[0].timestamp, Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap());
        assert_eq!(store.interactions().unwrap().len(), 2);

        let embeddings = store.track_embeddings().unwrap();
        assert_eq!(embeddings[0].embedding, vec![0.1, 0.2, 0.3]);
        assert_eq!(embeddings[0].genre.as_deref(), Some("rock"));
    }

    #[test]
    fn test_reimport_replaces_tracks() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.import_dataset(&dataset()).unwrap();
        store.import_dataset(&dataset()).unwrap();
        assert_eq!(store.tracks().unwrap().len(), 1);
        assert_eq!(store.track_embeddings().unwrap().len(), 1);
    }
}
