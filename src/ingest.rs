//! Ingestion: page sources → chunks → embeddings → index.
//!
//! A document is always replaced as a whole. Re-ingesting the same pages
//! reproduces the same chunk ids, so the operation is idempotent, and a
//! failed embedding call leaves the previously indexed version untouched.

use std::path::Path;

use anyhow::Result;
use tracing::{info, warn};

use buildcode_harness_core::chunk::Chunker;
use buildcode_harness_core::embedding::{embed_chunks, Embedder};
use buildcode_harness_core::index::VectorIndex;
use buildcode_harness_core::models::{Chunk, EmbeddingVector, SourceDocument};

use crate::config::Config;
use crate::harness::Harness;
use crate::pages;
use crate::sqlite_index::{DocumentRecord, SqliteIndex};

/// Outcome of ingesting one document.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct IngestReport {
    pub document_id: String,
    pub pages: usize,
    pub chunks: usize,
    /// Whitespace-only chunks that were not embedded.
    pub skipped_blank: usize,
}

/// Chunk every page of `doc`, dropping chunks with no visible text.
///
/// Returns the kept chunks and the number skipped.
pub fn chunk_document(chunker: &Chunker, doc: &SourceDocument) -> (Vec<Chunk>, usize) {
    let mut kept = Vec::new();
    let mut skipped = 0;
    for page in &doc.pages {
        for chunk in chunker.chunk(page) {
            if chunk.text.trim().is_empty() {
                skipped += 1;
            } else {
                kept.push(chunk);
            }
        }
    }
    if skipped > 0 {
        warn!(document = %doc.id, skipped, "skipped blank chunks");
    }
    (kept, skipped)
}

async fn prepare_entries(
    doc: &SourceDocument,
    chunker: &Chunker,
    embedder: &dyn Embedder,
    batch_size: usize,
) -> buildcode_harness_core::Result<(Vec<(Chunk, EmbeddingVector)>, IngestReport)> {
    let (chunks, skipped_blank) = chunk_document(chunker, doc);
    let vectors = embed_chunks(embedder, &chunks, batch_size).await?;
    let report = IngestReport {
        document_id: doc.id.clone(),
        pages: doc.pages.len(),
        chunks: chunks.len(),
        skipped_blank,
    };
    Ok((chunks.into_iter().zip(vectors).collect(), report))
}

/// Chunk, embed, and atomically replace `doc` in any [`VectorIndex`].
pub async fn ingest_document(
    index: &dyn VectorIndex,
    embedder: &dyn Embedder,
    chunker: &Chunker,
    batch_size: usize,
    doc: &SourceDocument,
) -> buildcode_harness_core::Result<IngestReport> {
    let (entries, report) = prepare_entries(doc, chunker, embedder, batch_size).await?;
    index.replace_document(&doc.id, &entries).await?;
    Ok(report)
}

/// Like [`ingest_document`], also storing the document's source and page
/// metadata.
pub async fn ingest_into_sqlite(
    index: &SqliteIndex,
    embedder: &dyn Embedder,
    chunker: &Chunker,
    batch_size: usize,
    doc: &SourceDocument,
) -> buildcode_harness_core::Result<IngestReport> {
    let (entries, report) = prepare_entries(doc, chunker, embedder, batch_size).await?;
    index
        .replace_document_with_record(&DocumentRecord::from_document(doc), &entries)
        .await?;
    info!(
        document = %report.document_id,
        pages = report.pages,
        chunks = report.chunks,
        "document indexed"
    );
    Ok(report)
}

/// `bch ingest <path>`.
pub async fn run_ingest(
    config: &Config,
    path: &Path,
    document_id: Option<&str>,
    dry_run: bool,
) -> Result<()> {
    let docs = pages::load_documents(path, document_id)?;
    let chunker = config.chunker()?;

    if dry_run {
        let total_pages: usize = docs.iter().map(|d| d.pages.len()).sum();
        let total_chunks: usize = docs.iter().map(|d| chunk_document(&chunker, d).0.len()).sum();
        println!("ingest {} (dry-run)", path.display());
        println!("  documents found: {}", docs.len());
        println!("  pages found: {}", total_pages);
        println!("  estimated chunks: {}", total_chunks);
        return Ok(());
    }

    let harness = Harness::open(config).await?;
    let batch_size = config.embedding.batch_size;

    let mut pages_read = 0usize;
    let mut chunks_written = 0usize;
    let mut skipped = 0usize;
    for doc in &docs {
        let report = ingest_into_sqlite(
            &harness.index,
            harness.embedder.as_ref(),
            &chunker,
            batch_size,
            doc,
        )
        .await?;
        pages_read += report.pages;
        chunks_written += report.chunks;
        skipped += report.skipped_blank;
    }

    println!("ingest {}", path.display());
    println!("  documents: {}", docs.len());
    println!("  pages read: {}", pages_read);
    println!("  chunks written: {}", chunks_written);
    if skipped > 0 {
        println!("  blank chunks skipped: {}", skipped);
    }
    println!("  model: {}", harness.embedder.model_id());
    println!("ok");

    harness.close().await;
    Ok(())
}

/// `bch remove <document-id>`.
pub async fn run_remove(config: &Config, document_id: &str) -> Result<()> {
    let harness = Harness::open(config).await?;
    let removed = harness.index.remove(document_id).await?;
    if removed == 0 {
        println!("Document '{}' not found.", document_id);
    } else {
        println!("removed {} ({} chunks)", document_id, removed);
    }
    harness.close().await;
    Ok(())
}
