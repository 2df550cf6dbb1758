use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use tracing::debug;

use super::embed::cosine_similarity;
use super::{matches_filter, similarity_from_distance, Collection, Embedder, EvidenceIndex, IndexError, Metadata, SearchHit};

/// Evidence index persisted in its own SQLite file. Embeddings are stored as
/// little-endian f32 blobs and searched by brute-force cosine distance.
pub struct SqliteEvidenceIndex {
    conn: Mutex<Connection>,
    embedder: Arc<dyn Embedder>,
}

impl SqliteEvidenceIndex {
    pub fn open<P: AsRef<Path>>(path: P, embedder: Arc<dyn Embedder>) -> Result<Self, IndexError> {
        let conn = Connection::open(path)?;
        let index = Self {
            conn: Mutex::new(conn),
            embedder,
        };
        index.init()?;
        Ok(index)
    }

    fn init(&self) -> Result<(), IndexError> {
        let conn = self.conn.lock();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS index_entries (
                collection TEXT NOT NULL,
                id TEXT NOT NULL,
                text TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}',
                embedding BLOB NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (collection, id)
            );

            CREATE INDEX IF NOT EXISTS idx_index_entries_collection ON index_entries(collection);
            "#,
        )?;
        Ok(())
    }
}

fn encode_embedding(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|x| x.to_le_bytes()).collect()
}

fn decode_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

#[async_trait]
impl EvidenceIndex for SqliteEvidenceIndex {
    async fn index(
        &self,
        collection: Collection,
        id: &str,
        text: &str,
        metadata: &Metadata,
    ) -> Result<String, IndexError> {
        let embedding = self.embedder.embed(text).await?;
        let metadata_json =
            serde_json::to_string(metadata).map_err(|e| IndexError::Embedding(e.to_string()))?;

        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO index_entries (collection, id, text, metadata, embedding, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                collection.as_str(),
                id,
                text,
                metadata_json,
                encode_embedding(&embedding),
                Utc::now(),
            ],
        )?;

        debug!(collection = collection.as_str(), id = %id, "indexed evidence");
        Ok(format!("{}:{}", collection.as_str(), id))
    }

    async fn search(
        &self,
        collection: Collection,
        query: &str,
        k: usize,
        filter: &Metadata,
    ) -> Result<Vec<SearchHit>, IndexError> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let query_embedding = self.embedder.embed(query).await?;

        let rows: Vec<(String, String, String, Vec<u8>)> = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare(
                r#"
                SELECT id, text, metadata, embedding
                FROM index_entries
                WHERE collection = ?1
                ORDER BY rowid
                "#,
            )?;
            let rows = stmt.query_map(params![collection.as_str()], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        let mut scored: Vec<(f64, SearchHit)> = rows
            .into_iter()
            .filter_map(|(id, text, metadata_json, blob)| {
                let metadata: Metadata = serde_json::from_str(&metadata_json).unwrap_or_default();
                if !matches_filter(&metadata, filter) {
                    return None;
                }
                let distance = 1.0 - cosine_similarity(&query_embedding, &decode_embedding(&blob)) as f64;
                Some((
                    distance,
                    SearchHit {
                        id,
                        text,
                        metadata,
                        score: similarity_from_distance(distance),
                    },
                ))
            })
            .collect();

        // Stable sort keeps insertion order among equal distances
        scored.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        Ok(scored.into_iter().take(k).map(|(_, hit)| hit).collect())
    }

    async fn delete(&self, collection: Collection, id: &str) -> Result<bool, IndexError> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "DELETE FROM index_entries WHERE collection = ?1 AND id = ?2",
            params![collection.as_str(), id],
        )?;
        Ok(rows > 0)
    }

    async fn stats(&self, collection: Collection) -> Result<usize, IndexError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM index_entries WHERE collection = ?1",
            params![collection.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}
