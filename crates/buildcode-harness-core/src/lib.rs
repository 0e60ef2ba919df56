//! # Building Code Harness Core
//!
//! The retrieval-augmented generation core for Building Code Harness:
//! page chunking with provenance, the embedding and vector index
//! capabilities, similarity retrieval with deduplication, and
//! citation-accurate prompt assembly and answer streaming.
//!
//! This crate contains no tokio, sqlx, filesystem I/O, or network code.
//! Embedding models, vector storage, and generation backends are reached
//! only through the [`Embedder`](embedding::Embedder),
//! [`VectorIndex`](index::VectorIndex), and
//! [`GenerationBackend`](compose::GenerationBackend) traits.
//!
//! ## Data flow
//!
//! ```text
//! build time:  Page ──▶ Chunker ──▶ Embedder ──▶ VectorIndex
//! query time:  query ──▶ Embedder ──▶ VectorIndex::query ──▶ Retriever ──▶ AnswerComposer
//!                                                                     └──▶ tokens + citations
//! ```

pub mod chunk;
pub mod compose;
pub mod embedding;
pub mod error;
pub mod index;
pub mod models;
pub mod retrieve;
pub mod section;
pub mod session;

pub use error::{Error, Result};
