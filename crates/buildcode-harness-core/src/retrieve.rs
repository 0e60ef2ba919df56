//! Similarity retrieval with overfetch, deduplication, and citations.
//!
//! # Algorithm
//!
//! 1. Embed the query, optionally prefixed with the last few conversation
//!    turns (`fold_history`) so follow-up questions keep their referents.
//! 2. Query the index for `k × overfetch_factor` candidates.
//! 3. Drop candidates below `min_similarity`, if a floor is configured.
//! 4. Walk candidates in rank order and drop any whose chunk span overlaps
//!    an already-kept chunk on the same page (overlap between neighbouring
//!    chunks makes such near-duplicates common).
//! 5. Keep the first `k` survivors. Fewer than `k` is fine; the result is
//!    never padded.
//! 6. Resolve each survivor's chunk into a [`Citation`](crate::models::Citation).
//!
//! An index with no vectors for the embedder's model yields an empty
//! result rather than an error, so the answer path can degrade honestly.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::embedding::{embed_query, Embedder};
use crate::error::{Error, Result};
use crate::index::VectorIndex;
use crate::models::{Chunk, ConversationTurn, RetrievalHit};

/// Retrieval tuning, decoupled from application config.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalParams {
    /// Default number of hits when the caller does not pass `k`.
    pub top_k: usize,
    /// Candidates fetched per requested hit, as headroom for deduplication.
    pub overfetch_factor: usize,
    /// Candidates scoring below this are discarded.
    pub min_similarity: Option<f32>,
    /// Prefix the query with recent conversation turns before embedding.
    pub fold_history: bool,
    /// Number of most recent turns folded in when `fold_history` is set.
    pub history_window: usize,
}

impl Default for RetrievalParams {
    fn default() -> Self {
        Self {
            top_k: 5,
            overfetch_factor: 2,
            min_similarity: None,
            fold_history: false,
            history_window: 2,
        }
    }
}

impl RetrievalParams {
    pub fn validate(&self) -> Result<()> {
        if self.top_k == 0 {
            return Err(Error::Configuration("retrieval.top_k must be >= 1".into()));
        }
        if self.overfetch_factor == 0 {
            return Err(Error::Configuration(
                "retrieval.overfetch_factor must be >= 1".into(),
            ));
        }
        if let Some(floor) = self.min_similarity {
            if !floor.is_finite() {
                return Err(Error::Configuration(
                    "retrieval.min_similarity must be a finite number".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Query-time orchestrator over an [`Embedder`] and a [`VectorIndex`].
///
/// Holds no per-query state; one retriever may serve concurrent queries.
#[derive(Clone)]
pub struct Retriever {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    params: RetrievalParams,
}

impl Retriever {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        params: RetrievalParams,
    ) -> Result<Self> {
        params.validate()?;
        Ok(Self {
            embedder,
            index,
            params,
        })
    }

    pub fn params(&self) -> &RetrievalParams {
        &self.params
    }

    pub fn index(&self) -> &Arc<dyn VectorIndex> {
        &self.index
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    /// Retrieve up to `k` cited hits for `query` (default `top_k`).
    pub async fn retrieve(
        &self,
        query: &str,
        k: Option<usize>,
        history: Option<&[ConversationTurn]>,
    ) -> Result<Vec<RetrievalHit>> {
        let k = k.unwrap_or(self.params.top_k);
        if query.trim().is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        let text = self.query_text(query, history);
        let query_vec = embed_query(self.embedder.as_ref(), &text).await?;

        let fetch = k.saturating_mul(self.params.overfetch_factor);
        let model = self.embedder.model_id();
        let matches = match self.index.query(&query_vec, fetch, model).await {
            Ok(m) => m,
            Err(Error::IndexNotReady { model }) => {
                debug!(%model, "index has no vectors for model; returning no hits");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        let matches: Vec<_> = match self.params.min_similarity {
            Some(floor) => matches.into_iter().filter(|m| m.score >= floor).collect(),
            None => matches,
        };
        if matches.is_empty() {
            debug!("no candidates above the similarity floor");
            return Ok(Vec::new());
        }

        let ids: Vec<String> = matches.iter().map(|m| m.chunk_id.clone()).collect();
        let mut chunks: HashMap<String, Chunk> = self
            .index
            .get_chunks(&ids)
            .await?
            .into_iter()
            .map(|c| (c.id.clone(), c))
            .collect();

        // A chunk removed between query and fetch simply drops out.
        let candidates: Vec<(Chunk, f32)> = matches
            .into_iter()
            .filter_map(|m| chunks.remove(&m.chunk_id).map(|c| (c, m.score)))
            .collect();

        let candidate_count = candidates.len();
        let hits = dedup_and_rank(candidates, k);
        debug!(
            candidates = candidate_count,
            hits = hits.len(),
            k,
            "retrieval complete"
        );
        Ok(hits)
    }

    /// The text actually embedded for a query.
    pub fn query_text(&self, query: &str, history: Option<&[ConversationTurn]>) -> String {
        let history = match history {
            Some(h) if self.params.fold_history && self.params.history_window > 0 => h,
            _ => return query.to_string(),
        };
        let skip = history.len().saturating_sub(self.params.history_window);
        let mut text: String = history[skip..]
            .iter()
            .map(|turn| turn.text.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str(query);
        text
    }
}

/// Keep the best-scoring chunk of every group of overlapping chunks, in
/// score order, up to `k`. Input must already be sorted by descending score.
pub fn dedup_and_rank(candidates: Vec<(Chunk, f32)>, k: usize) -> Vec<RetrievalHit> {
    let mut kept: Vec<RetrievalHit> = Vec::with_capacity(k);
    for (chunk, score) in candidates {
        if kept.len() >= k {
            break;
        }
        if kept.iter().any(|h| h.chunk.overlaps(&chunk)) {
            continue;
        }
        let citation = chunk.citation();
        kept.push(RetrievalHit {
            rank: kept.len() + 1,
            chunk,
            score,
            citation,
        });
    }
    kept
}
