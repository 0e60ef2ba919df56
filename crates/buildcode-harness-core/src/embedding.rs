//! Embedding capability and vector utilities.
//!
//! Defines the [`Embedder`] trait that every embedding backend implements,
//! [`embed_chunks`] which turns chunks into model-tagged
//! [`EmbeddingVector`]s, and pure helpers for similarity and BLOB
//! encoding.
//!
//! Concrete backends (OpenAI, Ollama, fastembed) live in the
//! `buildcode-harness` app crate.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::{Chunk, EmbeddingVector};

/// A text embedding backend with a fixed model per deployment.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Model identifier (e.g. `"nomic-embed-text"`). Vectors are tagged with it.
    fn model_id(&self) -> &str;

    /// Dimensionality of every vector this model produces.
    fn dims(&self) -> usize;

    /// Embed a batch of texts. Output index `i` corresponds to input index `i`.
    ///
    /// Fails with [`Error::EmbeddingBackend`] on backend failure; retry
    /// policy is up to the implementation or caller.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Embed a batch and check the response shape against the model contract.
pub async fn embed_checked<E: Embedder + ?Sized>(
    embedder: &E,
    texts: &[String],
) -> Result<Vec<Vec<f32>>> {
    if texts.is_empty() {
        return Ok(Vec::new());
    }
    let vectors = embedder.embed(texts).await?;
    if vectors.len() != texts.len() {
        return Err(Error::EmbeddingBackend(format!(
            "backend returned {} vectors for {} inputs",
            vectors.len(),
            texts.len()
        )));
    }
    let dims = embedder.dims();
    if let Some(bad) = vectors.iter().find(|v| v.len() != dims) {
        return Err(Error::DimensionMismatch {
            expected: dims,
            actual: bad.len(),
        });
    }
    Ok(vectors)
}

/// Embed a single query string.
pub async fn embed_query<E: Embedder + ?Sized>(embedder: &E, text: &str) -> Result<Vec<f32>> {
    embed_checked(embedder, &[text.to_string()])
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| Error::EmbeddingBackend("empty embedding response".into()))
}

/// Embed chunks in batches of `batch_size`, preserving order.
pub async fn embed_chunks<E: Embedder + ?Sized>(
    embedder: &E,
    chunks: &[Chunk],
    batch_size: usize,
) -> Result<Vec<EmbeddingVector>> {
    let batch_size = batch_size.max(1);
    let mut out = Vec::with_capacity(chunks.len());
    for batch in chunks.chunks(batch_size) {
        let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
        let vectors = embed_checked(embedder, &texts).await?;
        for (chunk, values) in batch.iter().zip(vectors) {
            out.push(EmbeddingVector {
                chunk_id: chunk.id.clone(),
                model: embedder.model_id().to_string(),
                values,
            });
        }
    }
    Ok(out)
}

/// Similarity metric, fixed when an index is constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Similarity {
    #[default]
    Cosine,
    InnerProduct,
}

impl Similarity {
    pub fn score(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Similarity::Cosine => cosine_similarity(a, b),
            Similarity::InnerProduct => inner_product(a, b),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Similarity::Cosine => "cosine",
            Similarity::InnerProduct => "inner_product",
        }
    }
}

impl std::str::FromStr for Similarity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cosine" => Ok(Similarity::Cosine),
            "inner_product" | "dot" => Ok(Similarity::InnerProduct),
            other => Err(Error::Configuration(format!(
                "unknown similarity metric '{}'; use cosine or inner_product",
                other
            ))),
        }
    }
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// # Example
///
/// ```rust
/// use buildcode_harness_core::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12);
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB produced by [`vec_to_blob`].
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1.0, 1.0]`.
///
/// Returns `0.0` for empty vectors, vectors of different lengths, or
/// zero-magnitude vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

/// Dot product; `0.0` for mismatched lengths.
pub fn inner_product(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}
