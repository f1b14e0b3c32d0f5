//! Read-only data sources.
//!
//! Strategies read interaction history, the track catalogue and track
//! embeddings through [`DataSource`], once, at initialization. Two adapters
//! ship with the crate: [`MemoryStore`] (JSON datasets, tests) and
//! [`sqlite::SqliteStore`].

pub mod sqlite;

use crate::embedding::TrackEmbedding;
use crate::model::{Interaction, TrackRecord};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub use sqlite::SqliteStore;

pub trait DataSource: Send + Sync {
    /// Every stored interaction, all users.
    fn interactions(&self) -> Result<Vec<Interaction>>;

    fn user_interactions(&self, user_id: &str) -> Result<Vec<Interaction>> {
        Ok(self
            .interactions()?
            .into_iter()
            .filter(|interaction| interaction.user_id == user_id)
            .collect())
    }

    fn tracks(&self) -> Result<Vec<TrackRecord>>;

    fn track_embeddings(&self) -> Result<Vec<TrackEmbedding>>;

    /// Short human-readable label for logs.
    fn describe(&self) -> String;
}

/// Serializable bundle of everything a data source serves.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Dataset {
    pub tracks: Vec<TrackRecord>,
    pub interactions: Vec<Interaction>,
    pub embeddings: Vec<TrackEmbedding>,
}

impl Dataset {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read dataset file: {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse dataset file: {}", path.display()))
    }
}

/// In-memory data source.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    dataset: Dataset,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_dataset(dataset: Dataset) -> Self {
        Self { dataset }
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        Ok(Self::from_dataset(Dataset::from_json_file(path)?))
    }

    #[must_use]
    pub fn with_track(mut self, track: TrackRecord) -> Self {
        self.dataset.tracks.push(track);
        self
    }

    #[must_use]
    pub fn with_interaction(mut self, interaction: Interaction) -> Self {
        self.dataset.interactions.push(interaction);
        self
    }

    #[must_use]
    pub fn with_interactions(mut self, interactions: impl IntoIterator<Item = Interaction>) -> Self {
        self.dataset.interactions.extend(interactions);
        self
    }

    #[must_use]
    pub fn with_embedding(mut self, embedding: TrackEmbedding) -> Self {
        self.dataset.embeddings.push(embedding);
        self
    }

    #[must_use]
    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }
}

impl DataSource for MemoryStore {
    fn interactions(&self) -> Result<Vec<Interaction>> {
        Ok(self.dataset.interactions.clone())
    }

    fn tracks(&self) -> Result<Vec<TrackRecord>> {
        Ok(self.dataset.tracks.clone())
    }

    fn track_embeddings(&self) -> Result<Vec<TrackEmbedding>> {
        Ok(self.dataset.embeddings.clone())
    }

    fn describe(&self) -> String {
        format!(
            "memory ({} tracks, {} interactions, {} embeddings)",
            self.dataset.tracks.len(),
            self.dataset.interactions.len(),
            self.dataset.embeddings.len()
        )
    }
}
