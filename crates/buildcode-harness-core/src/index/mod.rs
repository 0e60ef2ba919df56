//! Vector index capability.
//!
//! The [`VectorIndex`] trait stores `(chunk, vector)` pairs and answers
//! nearest-neighbour queries, enabling pluggable backends (SQLite,
//! in-memory). Implementations must be `Send + Sync`: the index is the one
//! resource shared between concurrent queries and ingestion.
//!
//! # Contract
//!
//! | Method | Guarantee |
//! |--------|-----------|
//! | [`upsert`](VectorIndex::upsert) | Chunk and vector become visible together; re-upserting an id overwrites it |
//! | [`replace_document`](VectorIndex::replace_document) | Removal and reinsertion of a document is one critical section |
//! | [`query`](VectorIndex::query) | Descending score, ties by insertion order; only vectors of the requested model |
//! | [`remove`](VectorIndex::remove) | Deletes every chunk and vector of a document |

pub mod memory;

use async_trait::async_trait;
use serde::Serialize;

use crate::embedding::Similarity;
use crate::error::{Error, Result};
use crate::models::{Chunk, EmbeddingVector};

/// A scored index entry returned from [`VectorIndex::query`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexMatch {
    pub chunk_id: String,
    pub score: f32,
}

/// Index contents, grouped by embedding model.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IndexStats {
    pub documents: usize,
    pub chunks: usize,
    pub vectors_by_model: Vec<ModelCount>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelCount {
    pub model: String,
    pub dims: usize,
    pub vectors: usize,
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// The metric chosen when the index was constructed.
    fn similarity(&self) -> Similarity;

    /// Insert or overwrite one chunk together with its vector.
    async fn upsert(&self, chunk: &Chunk, vector: &EmbeddingVector) -> Result<()>;

    /// Atomically replace every entry of `document_id` with `entries`.
    ///
    /// Readers observe either the old document or the new one, never a mix
    /// and never a chunk without its vector.
    async fn replace_document(
        &self,
        document_id: &str,
        entries: &[(Chunk, EmbeddingVector)],
    ) -> Result<()>;

    /// Return up to `k` matches for `vector` among vectors produced by
    /// `model_id`, sorted by descending score with ties broken by
    /// insertion order.
    ///
    /// Fails with [`Error::IndexNotReady`] when no vectors exist for
    /// `model_id`.
    async fn query(&self, vector: &[f32], k: usize, model_id: &str) -> Result<Vec<IndexMatch>>;

    /// Remove every chunk and vector of a document. Returns the number of
    /// chunks removed.
    async fn remove(&self, document_id: &str) -> Result<usize>;

    /// Fetch chunks by id. Unknown ids are skipped; order follows `ids`.
    async fn get_chunks(&self, ids: &[String]) -> Result<Vec<Chunk>>;

    async fn stats(&self) -> Result<IndexStats>;
}

/// A candidate with its insertion sequence, used for deterministic ranking.
#[derive(Debug, Clone)]
pub struct ScoredEntry {
    pub seq: u64,
    pub chunk_id: String,
    pub score: f32,
}

/// Sort candidates by descending score, then ascending insertion sequence,
/// and keep the first `k`.
pub fn rank_entries(mut entries: Vec<ScoredEntry>, k: usize) -> Vec<IndexMatch> {
    entries.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.seq.cmp(&b.seq))
    });
    entries.truncate(k);
    entries
        .into_iter()
        .map(|e| IndexMatch {
            chunk_id: e.chunk_id,
            score: e.score,
        })
        .collect()
}

/// Check that a vector can be stored for `chunk`.
pub fn validate_entry(chunk: &Chunk, vector: &EmbeddingVector) -> Result<()> {
    if vector.chunk_id != chunk.id {
        return Err(Error::Storage(format!(
            "vector for chunk '{}' paired with chunk '{}'",
            vector.chunk_id, chunk.id
        )));
    }
    if vector.values.is_empty() {
        return Err(Error::DimensionMismatch {
            expected: 1,
            actual: 0,
        });
    }
    Ok(())
}
