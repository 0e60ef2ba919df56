//! In-memory [`VectorIndex`] for tests and embedded use.
//!
//! All state sits behind one `std::sync::RwLock`, so every write
//! (including a whole-document replacement) is a single critical section
//! and readers never see partial updates. Queries are brute-force scans
//! over the vectors of the requested model.

use std::collections::{HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use crate::embedding::Similarity;
use crate::error::{Error, Result};
use crate::models::{Chunk, EmbeddingVector};

use super::{
    rank_entries, validate_entry, IndexMatch, IndexStats, ModelCount, ScoredEntry, VectorIndex,
};

struct Entry {
    seq: u64,
    chunk: Chunk,
    vector: EmbeddingVector,
}

#[derive(Default)]
struct State {
    entries: HashMap<String, Entry>,
    next_seq: u64,
}

impl State {
    fn model_dims(&self, model: &str) -> Option<usize> {
        self.entries
            .values()
            .find(|e| e.vector.model == model)
            .map(|e| e.vector.dims())
    }

    fn insert(&mut self, chunk: &Chunk, vector: &EmbeddingVector) -> Result<()> {
        validate_entry(chunk, vector)?;
        if let Some(dims) = self.model_dims(&vector.model) {
            if dims != vector.dims() {
                return Err(Error::DimensionMismatch {
                    expected: dims,
                    actual: vector.dims(),
                });
            }
        }
        let seq = match self.entries.get(&chunk.id) {
            Some(existing) => existing.seq,
            None => {
                self.next_seq += 1;
                self.next_seq
            }
        };
        self.entries.insert(
            chunk.id.clone(),
            Entry {
                seq,
                chunk: chunk.clone(),
                vector: vector.clone(),
            },
        );
        Ok(())
    }

    fn remove_document(&mut self, document_id: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.chunk.document_id != document_id);
        before - self.entries.len()
    }
}

/// In-memory vector index.
pub struct InMemoryIndex {
    similarity: Similarity,
    state: RwLock<State>,
}

impl InMemoryIndex {
    pub fn new(similarity: Similarity) -> Self {
        Self {
            similarity,
            state: RwLock::new(State::default()),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>> {
        self.state
            .read()
            .map_err(|_| Error::Storage("index lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>> {
        self.state
            .write()
            .map_err(|_| Error::Storage("index lock poisoned".into()))
    }
}

impl Default for InMemoryIndex {
    fn default() -> Self {
        Self::new(Similarity::Cosine)
    }
}

#[async_trait]
impl VectorIndex for InMemoryIndex {
    fn similarity(&self) -> Similarity {
        self.similarity
    }

    async fn upsert(&self, chunk: &Chunk, vector: &EmbeddingVector) -> Result<()> {
        self.write()?.insert(chunk, vector)
    }

    async fn replace_document(
        &self,
        document_id: &str,
        entries: &[(Chunk, EmbeddingVector)],
    ) -> Result<()> {
        if let Some((chunk, _)) = entries.iter().find(|(c, _)| c.document_id != document_id) {
            return Err(Error::Storage(format!(
                "chunk '{}' belongs to document '{}', not '{}'",
                chunk.id, chunk.document_id, document_id
            )));
        }
        for (chunk, vector) in entries {
            validate_entry(chunk, vector)?;
        }

        let mut state = self.write()?;
        let removed: Vec<Entry> = {
            let ids: Vec<String> = state
                .entries
                .values()
                .filter(|e| e.chunk.document_id == document_id)
                .map(|e| e.chunk.id.clone())
                .collect();
            ids.iter()
                .filter_map(|id| state.entries.remove(id))
                .collect()
        };
        for (chunk, vector) in entries {
            if let Err(e) = state.insert(chunk, vector) {
                // Roll back to the previous version of the document.
                state.remove_document(document_id);
                for old in removed {
                    state.entries.insert(old.chunk.id.clone(), old);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    async fn query(&self, vector: &[f32], k: usize, model_id: &str) -> Result<Vec<IndexMatch>> {
        let state = self.read()?;
        let dims = state
            .model_dims(model_id)
            .ok_or_else(|| Error::IndexNotReady {
                model: model_id.to_string(),
            })?;
        if dims != vector.len() {
            return Err(Error::DimensionMismatch {
                expected: dims,
                actual: vector.len(),
            });
        }

        let scored: Vec<ScoredEntry> = state
            .entries
            .values()
            .filter(|e| e.vector.model == model_id)
            .map(|e| ScoredEntry {
                seq: e.seq,
                chunk_id: e.chunk.id.clone(),
                score: self.similarity.score(vector, &e.vector.values),
            })
            .collect();
        Ok(rank_entries(scored, k))
    }

    async fn remove(&self, document_id: &str) -> Result<usize> {
        Ok(self.write()?.remove_document(document_id))
    }

    async fn get_chunks(&self, ids: &[String]) -> Result<Vec<Chunk>> {
        let state = self.read()?;
        Ok(ids
            .iter()
            .filter_map(|id| state.entries.get(id).map(|e| e.chunk.clone()))
            .collect())
    }

    async fn stats(&self) -> Result<IndexStats> {
        let state = self.read()?;
        let documents: HashSet<&str> = state
            .entries
            .values()
            .map(|e| e.chunk.document_id.as_str())
            .collect();
        let mut by_model: HashMap<&str, (usize, usize)> = HashMap::new();
        for e in state.entries.values() {
            let slot = by_model
                .entry(e.vector.model.as_str())
                .or_insert((e.vector.dims(), 0));
            slot.1 += 1;
        }
        let mut vectors_by_model: Vec<ModelCount> = by_model
            .into_iter()
            .map(|(model, (dims, vectors))| ModelCount {
                model: model.to_string(),
                dims,
                vectors,
            })
            .collect();
        vectors_by_model.sort_by(|a, b| a.model.cmp(&b.model));
        Ok(IndexStats {
            documents: documents.len(),
            chunks: state.entries.len(),
            vectors_by_model,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::chunk_page;
    use crate::models::Page;

    fn vector(chunk: &Chunk, model: &str, values: Vec<f32>) -> EmbeddingVector {
        EmbeddingVector {
            chunk_id: chunk.id.clone(),
            model: model.to_string(),
            values,
        }
    }

    fn chunks(doc: &str, text: &str) -> Vec<Chunk> {
        chunk_page(&Page::new(doc, 1, text), 10, 0).unwrap()
    }

    #[tokio::test]
    async fn test_query_empty_index_not_ready() {
        let index = InMemoryIndex::default();
        let err = index.query(&[1.0, 0.0], 3, "m").await.unwrap_err();
        assert!(matches!(err, Error::IndexNotReady { .. }));
    }

    #[tokio::test]
    async fn test_exact_vector_is_top_hit() {
        let index = InMemoryIndex::default();
        let cs = chunks("d", &"abcdefghij".repeat(3));
        let vals = [vec![1.0, 0.0, 0.0], vec![0.0, 1.0, 0.0], vec![0.6, 0.8, 0.0]];
        for (c, v) in cs.iter().zip(vals.iter()) {
            index.upsert(c, &vector(c, "m", v.clone())).await.unwrap();
        }
        let hits = index.query(&[0.6, 0.8, 0.0], 3, "m").await.unwrap();
        assert_eq!(hits[0].chunk_id, cs[2].id);
        assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[tokio::test]
    async fn test_upsert_same_id_overwrites() {
        let index = InMemoryIndex::default();
        let cs = chunks("d", "short text");
        index
            .upsert(&cs[0], &vector(&cs[0], "m", vec![1.0, 0.0]))
            .await
            .unwrap();
        index
            .upsert(&cs[0], &vector(&cs[0], "m", vec![0.0, 1.0]))
            .await
            .unwrap();
        let stats = index.stats().await.unwrap();
        assert_eq!(stats.chunks, 1);
        let hits = index.query(&[0.0, 1.0], 5, "m").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!((hits[0].score - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_ties_broken_by_insertion_order() {
        let index = InMemoryIndex::default();
        let cs = chunks("d", &"0123456789".repeat(3));
        for c in cs.iter().rev() {
            index
                .upsert(c, &vector(c, "m", vec![1.0, 1.0]))
                .await
                .unwrap();
        }
        let hits = index.query(&[1.0, 1.0], 3, "m").await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.chunk_id.as_str()).collect();
        let expected: Vec<&str> = cs.iter().rev().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn test_model_isolation() {
        let index = InMemoryIndex::default();
        let cs = chunks("d", "text");
        index
            .upsert(&cs[0], &vector(&cs[0], "model-a", vec![1.0, 0.0]))
            .await
            .unwrap();
        let err = index.query(&[1.0, 0.0], 1, "model-b").await.unwrap_err();
        assert!(matches!(err, Error::IndexNotReady { .. }));
    }

    #[tokio::test]
    async fn test_query_dimension_mismatch() {
        let index = InMemoryIndex::default();
        let cs = chunks("d", "text");
        index
            .upsert(&cs[0], &vector(&cs[0], "m", vec![1.0, 0.0]))
            .await
            .unwrap();
        let err = index.query(&[1.0, 0.0, 0.0], 1, "m").await.unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { .. }));
    }

    #[tokio::test]
    async fn test_remove_document() {
        let index = InMemoryIndex::default();
        for doc in ["a", "b"] {
            for c in chunks(doc, &"x".repeat(25)) {
                index
                    .upsert(&c, &vector(&c, "m", vec![1.0, 0.0]))
                    .await
                    .unwrap();
            }
        }
        assert_eq!(index.remove("a").await.unwrap(), 3);
        let stats = index.stats().await.unwrap();
        assert_eq!(stats.documents, 1);
        assert_eq!(stats.chunks, 3);
    }

    #[tokio::test]
    async fn test_replace_document_drops_old_chunks() {
        let index = InMemoryIndex::default();
        let old = chunks("d", "old text here");
        for c in &old {
            index
                .upsert(c, &vector(c, "m", vec![1.0, 0.0]))
                .await
                .unwrap();
        }
        let new = chunks("d", "new text");
        let entries: Vec<(Chunk, EmbeddingVector)> = new
            .iter()
            .map(|c| (c.clone(), vector(c, "m", vec![0.0, 1.0])))
            .collect();
        index.replace_document("d", &entries).await.unwrap();

        let hits = index.query(&[1.0, 1.0], 10, "m").await.unwrap();
        let ids: Vec<String> = hits.into_iter().map(|h| h.chunk_id).collect();
        assert_eq!(ids.len(), new.len());
        for c in &old {
            assert!(!ids.contains(&c.id));
        }
    }

    #[tokio::test]
    async fn test_replace_document_rolls_back_on_error() {
        let index = InMemoryIndex::default();
        let old = chunks("d", "old");
        index
            .upsert(&old[0], &vector(&old[0], "m", vec![1.0, 0.0]))
            .await
            .unwrap();
        let other = chunks("e", "other");
        index
            .upsert(&other[0], &vector(&other[0], "m", vec![1.0, 0.0]))
            .await
            .unwrap();

        let new = chunks("d", "new");
        let bad = vec![(new[0].clone(), vector(&new[0], "m", vec![1.0, 0.0, 0.0]))];
        assert!(index.replace_document("d", &bad).await.is_err());
        let got = index.get_chunks(&[old[0].id.clone()]).await.unwrap();
        assert_eq!(got.len(), 1);
    }

    #[tokio::test]
    async fn test_get_chunks_skips_unknown() {
        let index = InMemoryIndex::default();
        let cs = chunks("d", "text");
        index
            .upsert(&cs[0], &vector(&cs[0], "m", vec![1.0]))
            .await
            .unwrap();
        let got = index
            .get_chunks(&["missing".to_string(), cs[0].id.clone()])
            .await
            .unwrap();
        assert_eq!(got, vec![cs[0].clone()]);
    }
}
