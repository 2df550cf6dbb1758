//! Evidence index: nearest-neighbour search over the learner-history and
//! academic collections.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

pub mod embed;
pub mod sqlite;

pub use embed::{Embedder, HashingEmbedder};
pub use sqlite::SqliteEvidenceIndex;

pub type Metadata = BTreeMap<String, String>;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("index store error: {0}")]
    Store(#[from] rusqlite::Error),
    #[error("embedding failed: {0}")]
    Embedding(String),
    #[error("index unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    LearnerHistory,
    Academic,
}

impl Collection {
    pub const ALL: [Collection; 2] = [Collection::LearnerHistory, Collection::Academic];

    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::LearnerHistory => "learner_history",
            Collection::Academic => "academic",
        }
    }
}

/// One ranked match. `score` is a similarity: higher is better.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub id: String,
    pub text: String,
    pub metadata: Metadata,
    pub score: f64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct IndexStats {
    pub learner_history: usize,
    pub academic: usize,
}

#[async_trait]
pub trait EvidenceIndex: Send + Sync {
    /// Stores `text` under a fresh `id` and returns the index's own reference.
    async fn index(
        &self,
        collection: Collection,
        id: &str,
        text: &str,
        metadata: &Metadata,
    ) -> Result<String, IndexError>;

    /// Top-`k` hits in descending score order. `filter` is an exact-match
    /// conjunction over metadata keys.
    async fn search(
        &self,
        collection: Collection,
        query: &str,
        k: usize,
        filter: &Metadata,
    ) -> Result<Vec<SearchHit>, IndexError>;

    async fn delete(&self, collection: Collection, id: &str) -> Result<bool, IndexError>;

    async fn stats(&self, collection: Collection) -> Result<usize, IndexError>;
}

/// Converts a cosine distance into the surfaced similarity score.
pub fn similarity_from_distance(distance: f64) -> f64 {
    1.0 - distance
}

pub fn matches_filter(metadata: &Metadata, filter: &Metadata) -> bool {
    filter
        .iter()
        .all(|(key, value)| metadata.get(key).is_some_and(|v| v == value))
}
