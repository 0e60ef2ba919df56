//! SQLite-backed [`VectorIndex`] implementation.
//!
//! Chunks, their vectors, and a per-document record live in three tables
//! (see [`migrate`](crate::migrate)). Every write runs in one transaction,
//! so a chunk row is never visible without its vector and a document
//! replacement is never observed half done.
//!
//! Queries are brute-force: all vectors of the requested model are loaded,
//! scored with the configured metric, and ranked by descending score, then
//! by insertion sequence. The metric is recorded in `index_meta`; reopening
//! a populated index with a different metric is refused.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

use buildcode_harness_core::embedding::{blob_to_vec, vec_to_blob, Similarity};
use buildcode_harness_core::index::{
    rank_entries, validate_entry, IndexMatch, IndexStats, ModelCount, ScoredEntry, VectorIndex,
};
use buildcode_harness_core::models::{Chunk, EmbeddingVector, SourceDocument};
use buildcode_harness_core::{Error, Result};

/// Stored metadata for one ingested document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentRecord {
    pub id: String,
    pub source: Option<String>,
    pub page_count: u32,
    pub mean_confidence: Option<f32>,
    /// Unix timestamp of the last ingestion.
    pub ingested_at: i64,
}

impl DocumentRecord {
    pub fn from_document(doc: &SourceDocument) -> Self {
        let confidences: Vec<f32> = doc.pages.iter().filter_map(|p| p.confidence).collect();
        let mean_confidence = if confidences.is_empty() {
            None
        } else {
            Some(confidences.iter().sum::<f32>() / confidences.len() as f32)
        };
        Self {
            id: doc.id.clone(),
            source: doc.source().map(str::to_string),
            page_count: doc.pages.len() as u32,
            mean_confidence,
            ingested_at: chrono::Utc::now().timestamp(),
        }
    }

    fn bare(id: &str) -> Self {
        Self {
            id: id.to_string(),
            source: None,
            page_count: 0,
            mean_confidence: None,
            ingested_at: chrono::Utc::now().timestamp(),
        }
    }
}

pub struct SqliteIndex {
    pool: SqlitePool,
    similarity: Similarity,
}

fn db_err(e: sqlx::Error) -> Error {
    Error::storage(e)
}

const SIMILARITY_KEY: &str = "similarity";

impl SqliteIndex {
    pub fn new(pool: SqlitePool, similarity: Similarity) -> Self {
        Self { pool, similarity }
    }

    /// Open the index with `similarity`, checking it against the metric the
    /// stored vectors were scored with.
    ///
    /// An index without vectors adopts the requested metric.
    pub async fn open(pool: SqlitePool, similarity: Similarity) -> Result<Self> {
        let stored: Option<String> =
            sqlx::query_scalar("SELECT value FROM index_meta WHERE key = ?")
                .bind(SIMILARITY_KEY)
                .fetch_optional(&pool)
                .await
                .map_err(db_err)?;

        if let Some(stored) = stored {
            let stored: Similarity = stored.parse()?;
            if stored != similarity {
                let vectors: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunk_vectors")
                    .fetch_one(&pool)
                    .await
                    .map_err(db_err)?;
                if vectors > 0 {
                    return Err(Error::Configuration(format!(
                        "index was built with {} similarity but [retrieval].similarity is {}; \
                         restore the setting or re-create the index",
                        stored.as_str(),
                        similarity.as_str()
                    )));
                }
            }
        }

        sqlx::query(
            r#"
            INSERT INTO index_meta (key, value) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(SIMILARITY_KEY)
        .bind(similarity.as_str())
        .execute(&pool)
        .await
        .map_err(db_err)?;

        Ok(Self::new(pool, similarity))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Replace a document's chunks and vectors and store its metadata, in
    /// one transaction.
    pub async fn replace_document_with_record(
        &self,
        record: &DocumentRecord,
        entries: &[(Chunk, EmbeddingVector)],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        write_document(&mut tx, record, true).await?;
        delete_document_rows(&mut tx, &record.id).await?;
        insert_entries(&mut tx, &record.id, entries).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    pub async fn list_documents(&self) -> Result<Vec<DocumentRecord>> {
        let rows = sqlx::query(
            "SELECT id, source, page_count, mean_confidence, ingested_at FROM documents ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows
            .iter()
            .map(|row| DocumentRecord {
                id: row.get("id"),
                source: row.get("source"),
                page_count: row.get::<i64, _>("page_count") as u32,
                mean_confidence: row.get::<Option<f64>, _>("mean_confidence").map(|c| c as f32),
                ingested_at: row.get("ingested_at"),
            })
            .collect())
    }

    pub async fn chunk_count(&self, document_id: &str) -> Result<usize> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(n as usize)
    }
}

/// Insert or refresh the document row. With `overwrite_metadata` unset an
/// existing row keeps its source and page metadata.
async fn write_document(
    tx: &mut Transaction<'_, Sqlite>,
    record: &DocumentRecord,
    overwrite_metadata: bool,
) -> Result<()> {
    let sql = if overwrite_metadata {
        r#"
        INSERT INTO documents (id, source, page_count, mean_confidence, ingested_at)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            source = excluded.source,
            page_count = excluded.page_count,
            mean_confidence = excluded.mean_confidence,
            ingested_at = excluded.ingested_at
        "#
    } else {
        r#"
        INSERT INTO documents (id, source, page_count, mean_confidence, ingested_at)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET ingested_at = excluded.ingested_at
        "#
    };
    sqlx::query(sql)
        .bind(&record.id)
        .bind(&record.source)
        .bind(record.page_count as i64)
        .bind(record.mean_confidence.map(|c| c as f64))
        .bind(record.ingested_at)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
    Ok(())
}

async fn delete_document_rows(tx: &mut Transaction<'_, Sqlite>, document_id: &str) -> Result<usize> {
    sqlx::query("DELETE FROM chunk_vectors WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;

    let removed = sqlx::query("DELETE FROM chunks WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?
        .rows_affected();

    Ok(removed as usize)
}

async fn model_dims(tx: &mut Transaction<'_, Sqlite>, model: &str) -> Result<Option<usize>> {
    let dims: Option<i64> =
        sqlx::query_scalar("SELECT dims FROM chunk_vectors WHERE model = ? LIMIT 1")
            .bind(model)
            .fetch_optional(&mut **tx)
            .await
            .map_err(db_err)?;
    Ok(dims.map(|d| d as usize))
}

async fn insert_entries(
    tx: &mut Transaction<'_, Sqlite>,
    document_id: &str,
    entries: &[(Chunk, EmbeddingVector)],
) -> Result<()> {
    let mut known_dims: HashMap<String, usize> = HashMap::new();

    for (chunk, vector) in entries {
        if chunk.document_id != document_id {
            return Err(Error::Storage(format!(
                "chunk '{}' belongs to document '{}', not '{}'",
                chunk.id, chunk.document_id, document_id
            )));
        }
        validate_entry(chunk, vector)?;

        let expected = match known_dims.get(&vector.model) {
            Some(d) => Some(*d),
            None => model_dims(tx, &vector.model).await?,
        };
        if let Some(expected) = expected {
            if expected != vector.dims() {
                return Err(Error::DimensionMismatch {
                    expected,
                    actual: vector.dims(),
                });
            }
        }
        known_dims.insert(vector.model.clone(), vector.dims());

        upsert_row(tx, chunk, vector).await?;
    }
    Ok(())
}

async fn upsert_row(
    tx: &mut Transaction<'_, Sqlite>,
    chunk: &Chunk,
    vector: &EmbeddingVector,
) -> Result<()> {
    // ON CONFLICT keeps the row, so an overwrite keeps its original seq
    sqlx::query(
        r#"
        INSERT INTO chunks (id, document_id, page_number, section, paragraph_index,
                            start_offset, end_offset, text, hash, prev_id, next_id)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            document_id = excluded.document_id,
            page_number = excluded.page_number,
            section = excluded.section,
            paragraph_index = excluded.paragraph_index,
            start_offset = excluded.start_offset,
            end_offset = excluded.end_offset,
            text = excluded.text,
            hash = excluded.hash,
            prev_id = excluded.prev_id,
            next_id = excluded.next_id
        "#,
    )
    .bind(&chunk.id)
    .bind(&chunk.document_id)
    .bind(chunk.page_number as i64)
    .bind(&chunk.section)
    .bind(chunk.paragraph_index as i64)
    .bind(chunk.start as i64)
    .bind(chunk.end as i64)
    .bind(&chunk.text)
    .bind(&chunk.hash)
    .bind(&chunk.prev_id)
    .bind(&chunk.next_id)
    .execute(&mut **tx)
    .await
    .map_err(db_err)?;

    sqlx::query(
        r#"
        INSERT INTO chunk_vectors (chunk_id, document_id, model, dims, embedding)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(chunk_id) DO UPDATE SET
            document_id = excluded.document_id,
            model = excluded.model,
            dims = excluded.dims,
            embedding = excluded.embedding
        "#,
    )
    .bind(&chunk.id)
    .bind(&chunk.document_id)
    .bind(&vector.model)
    .bind(vector.dims() as i64)
    .bind(vec_to_blob(&vector.values))
    .execute(&mut **tx)
    .await
    .map_err(db_err)?;

    Ok(())
}

fn chunk_from_row(row: &SqliteRow) -> Chunk {
    Chunk {
        id: row.get("id"),
        document_id: row.get("document_id"),
        page_number: row.get::<i64, _>("page_number") as u32,
        section: row.get("section"),
        paragraph_index: row.get::<i64, _>("paragraph_index") as u32,
        text: row.get("text"),
        start: row.get::<i64, _>("start_offset") as usize,
        end: row.get::<i64, _>("end_offset") as usize,
        hash: row.get("hash"),
        prev_id: row.get("prev_id"),
        next_id: row.get("next_id"),
    }
}

#[async_trait]
impl VectorIndex for SqliteIndex {
    fn similarity(&self) -> Similarity {
        self.similarity
    }

    async fn upsert(&self, chunk: &Chunk, vector: &EmbeddingVector) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        write_document(&mut tx, &DocumentRecord::bare(&chunk.document_id), false).await?;
        let entry = (chunk.clone(), vector.clone());
        insert_entries(&mut tx, &chunk.document_id, std::slice::from_ref(&entry)).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn replace_document(
        &self,
        document_id: &str,
        entries: &[(Chunk, EmbeddingVector)],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        write_document(&mut tx, &DocumentRecord::bare(document_id), false).await?;
        delete_document_rows(&mut tx, document_id).await?;
        insert_entries(&mut tx, document_id, entries).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn query(&self, vector: &[f32], k: usize, model_id: &str) -> Result<Vec<IndexMatch>> {
        let dims: Option<i64> =
            sqlx::query_scalar("SELECT dims FROM chunk_vectors WHERE model = ? LIMIT 1")
                .bind(model_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;
        let dims = match dims {
            Some(d) => d as usize,
            None => {
                return Err(Error::IndexNotReady {
                    model: model_id.to_string(),
                })
            }
        };
        if dims != vector.len() {
            return Err(Error::DimensionMismatch {
                expected: dims,
                actual: vector.len(),
            });
        }

        let rows = sqlx::query(
            r#"
            SELECT cv.chunk_id, cv.embedding, c.seq
            FROM chunk_vectors cv
            JOIN chunks c ON c.id = cv.chunk_id
            WHERE cv.model = ?
            "#,
        )
        .bind(model_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let entries: Vec<ScoredEntry> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                ScoredEntry {
                    seq: row.get::<i64, _>("seq") as u64,
                    chunk_id: row.get("chunk_id"),
                    score: self.similarity.score(vector, &blob_to_vec(&blob)),
                }
            })
            .collect();

        Ok(rank_entries(entries, k))
    }

    async fn remove(&self, document_id: &str) -> Result<usize> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let removed = delete_document_rows(&mut tx, document_id).await?;
        sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(removed)
    }

    async fn get_chunks(&self, ids: &[String]) -> Result<Vec<Chunk>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            r#"
            SELECT c.id, c.document_id, c.page_number, c.section, c.paragraph_index,
                   c.start_offset, c.end_offset, c.text, c.hash, c.prev_id, c.next_id
            FROM chunks c
            JOIN chunk_vectors cv ON cv.chunk_id = c.id
            WHERE c.id IN ({})
            "#,
            placeholders
        );
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id);
        }
        let rows = query.fetch_all(&self.pool).await.map_err(db_err)?;

        let mut by_id: HashMap<String, Chunk> = rows
            .iter()
            .map(chunk_from_row)
            .map(|c| (c.id.clone(), c))
            .collect();
        Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    async fn stats(&self) -> Result<IndexStats> {
        let documents: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        let chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;

        let rows = sqlx::query(
            r#"
            SELECT model, dims, COUNT(*) AS vectors
            FROM chunk_vectors
            GROUP BY model, dims
            ORDER BY model
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let vectors_by_model = rows
            .iter()
            .map(|row| ModelCount {
                model: row.get("model"),
                dims: row.get::<i64, _>("dims") as usize,
                vectors: row.get::<i64, _>("vectors") as usize,
            })
            .collect();

        Ok(IndexStats {
            documents: documents as usize,
            chunks: chunks as usize,
            vectors_by_model,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildcode_harness_core::chunk::chunk_page;
    use buildcode_harness_core::models::Page;
    use tempfile::TempDir;

    async fn open(tmp: &TempDir) -> SqliteIndex {
        let pool = crate::db::connect_path(&tmp.path().join("bch.sqlite"))
            .await
            .unwrap();
        crate::migrate::apply(&pool).await.unwrap();
        SqliteIndex::new(pool, Similarity::Cosine)
    }

    fn entries(doc: &str, text: &str, model: &str) -> Vec<(Chunk, EmbeddingVector)> {
        let page = Page::new(doc, 1, text);
        chunk_page(&page, 10, 2)
            .unwrap()
            .into_iter()
            .enumerate()
            .map(|(i, c)| {
                let v = EmbeddingVector {
                    chunk_id: c.id.clone(),
                    model: model.to_string(),
                    values: vec![1.0, i as f32],
                };
                (c, v)
            })
            .collect()
    }

    #[tokio::test]
    async fn test_query_before_ingest_is_not_ready() {
        let tmp = TempDir::new().unwrap();
        let index = open(&tmp).await;
        let err = index.query(&[1.0, 0.0], 3, "m").await.unwrap_err();
        assert!(matches!(err, Error::IndexNotReady { .. }));
    }

    #[tokio::test]
    async fn test_replace_and_query_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let index = open(&tmp).await;
        let e = entries("ibc", "abcdefghijklmnopqrstuvwxyz", "m");
        index.replace_document("ibc", &e).await.unwrap();

        let target = &e[2];
        let hits = index.query(&target.1.values, 1, "m").await.unwrap();
        assert_eq!(hits[0].chunk_id, target.0.id);

        let chunks = index.get_chunks(&[target.0.id.clone()]).await.unwrap();
        assert_eq!(chunks[0], target.0);
    }

    #[tokio::test]
    async fn test_reingest_changed_text_drops_old_ids() {
        let tmp = TempDir::new().unwrap();
        let index = open(&tmp).await;
        let old = entries("ibc", "abcdefghijklmnopqrstuvwxyz", "m");
        index.replace_document("ibc", &old).await.unwrap();
        let new = entries("ibc", "ABCDEFGHIJKLMNOPQRSTUVWXYZ", "m");
        index.replace_document("ibc", &new).await.unwrap();

        let hits = index.query(&[1.0, 0.0], 100, "m").await.unwrap();
        assert_eq!(hits.len(), new.len());
        let old_ids: Vec<&str> = old.iter().map(|(c, _)| c.id.as_str()).collect();
        assert!(hits.iter().all(|h| !old_ids.contains(&h.chunk_id.as_str())));
        assert_eq!(index.chunk_count("ibc").await.unwrap(), new.len());
    }

    #[tokio::test]
    async fn test_failed_replace_rolls_back() {
        let tmp = TempDir::new().unwrap();
        let index = open(&tmp).await;
        let good = entries("ibc", "abcdefghijklmnopqrstuvwxyz", "m");
        index.replace_document("ibc", &good).await.unwrap();

        let mut bad = entries("ibc", "zyxwvutsrqponmlkjihgfedcba", "m");
        bad[1].1.values = vec![1.0, 2.0, 3.0];
        let err = index.replace_document("ibc", &bad).await.unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { .. }));

        assert_eq!(index.chunk_count("ibc").await.unwrap(), good.len());
    }

    #[tokio::test]
    async fn test_upsert_overwrites_and_keeps_order() {
        let tmp = TempDir::new().unwrap();
        let index = open(&tmp).await;
        let e = entries("ibc", "abcdefghijklmnopqrst", "m");
        for (c, v) in &e {
            index.upsert(c, v).await.unwrap();
        }
        // Same vector for every chunk: ties resolve by insertion order.
        for (c, v) in &e {
            let mut v = v.clone();
            v.values = vec![0.0, 1.0];
            index.upsert(c, &v).await.unwrap();
        }
        let hits = index.query(&[0.0, 1.0], 10, "m").await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.chunk_id.as_str()).collect();
        let expected: Vec<&str> = e.iter().map(|(c, _)| c.id.as_str()).collect();
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn test_remove_and_stats() {
        let tmp = TempDir::new().unwrap();
        let index = open(&tmp).await;
        let a = entries("ibc", "abcdefghijklmnopqrstuvwxyz", "m");
        let b = entries("nfpa", "abcdefghijklmnop", "m");
        index.replace_document("ibc", &a).await.unwrap();
        index.replace_document("nfpa", &b).await.unwrap();

        let stats = index.stats().await.unwrap();
        assert_eq!(stats.documents, 2);
        assert_eq!(stats.chunks, a.len() + b.len());
        assert_eq!(stats.vectors_by_model[0].dims, 2);

        assert_eq!(index.remove("ibc").await.unwrap(), a.len());
        let stats = index.stats().await.unwrap();
        assert_eq!(stats.documents, 1);
        assert_eq!(stats.chunks, b.len());
    }

    #[tokio::test]
    async fn test_models_are_isolated() {
        let tmp = TempDir::new().unwrap();
        let index = open(&tmp).await;
        index
            .replace_document("ibc", &entries("ibc", "abcdefghijklmnop", "m1"))
            .await
            .unwrap();
        let err = index.query(&[1.0, 0.0], 3, "m2").await.unwrap_err();
        assert!(matches!(err, Error::IndexNotReady { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_readers_never_see_half_replaced_document() {
        use std::collections::HashSet;
        use std::sync::Arc;

        let tmp = TempDir::new().unwrap();
        let index = Arc::new(open(&tmp).await);
        let v1 = entries("ibc", "abcdefghijklmnopqrstuvwxyz", "m");
        let v2 = entries("ibc", "ABCDEFGHIJKLMNOPQRSTUVWXYZ0123", "m");
        let ids = |e: &[(Chunk, EmbeddingVector)]| -> HashSet<String> {
            e.iter().map(|(c, _)| c.id.clone()).collect()
        };
        let (v1_ids, v2_ids) = (ids(&v1), ids(&v2));
        assert!(v1_ids.is_disjoint(&v2_ids));
        index.replace_document("ibc", &v1).await.unwrap();

        let writer = {
            let index = index.clone();
            tokio::spawn(async move {
                for round in 0..40 {
                    let next = if round % 2 == 0 { &v2 } else { &v1 };
                    index.replace_document("ibc", next).await.unwrap();
                }
            })
        };

        let mut observed = 0;
        loop {
            let hits = index.query(&[1.0, 0.0], 100, "m").await.unwrap();
            let seen: HashSet<String> = hits.into_iter().map(|h| h.chunk_id).collect();
            let version = if seen == v1_ids {
                &v1_ids
            } else if seen == v2_ids {
                &v2_ids
            } else {
                panic!("query saw a mix of versions: {:?}", seen);
            };

            let wanted: Vec<String> = seen.into_iter().collect();
            let chunks = index.get_chunks(&wanted).await.unwrap();
            assert!(chunks.iter().all(|c| version.contains(&c.id)));
            observed += 1;
            if writer.is_finished() {
                break;
            }
        }
        writer.await.unwrap();
        assert!(observed > 0);
    }

    #[tokio::test]
    async fn test_reopen_with_other_similarity_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let pool = crate::db::connect_path(&tmp.path().join("bch.sqlite"))
            .await
            .unwrap();
        crate::migrate::apply(&pool).await.unwrap();

        // An empty index may switch metrics.
        SqliteIndex::open(pool.clone(), Similarity::InnerProduct)
            .await
            .unwrap();
        let index = SqliteIndex::open(pool.clone(), Similarity::Cosine)
            .await
            .unwrap();
        index
            .replace_document("ibc", &entries("ibc", "abcdefghijklmnop", "m"))
            .await
            .unwrap();

        let err = SqliteIndex::open(pool.clone(), Similarity::InnerProduct)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(err.to_string().contains("cosine"));

        let reopened = SqliteIndex::open(pool, Similarity::Cosine).await.unwrap();
        assert_eq!(reopened.similarity(), Similarity::Cosine);
    }

    #[tokio::test]
    async fn test_record_metadata() {
        let tmp = TempDir::new().unwrap();
        let index = open(&tmp).await;
        let mut p1 = Page::new("ibc", 1, "a");
        p1.confidence = Some(0.8);
        p1.source = Some("ibc.pdf".into());
        let mut p2 = Page::new("ibc", 2, "b");
        p2.confidence = Some(0.6);
        let doc = SourceDocument::new("ibc", vec![p1, p2]).unwrap();
        let record = DocumentRecord::from_document(&doc);
        index
            .replace_document_with_record(&record, &entries("ibc", "abcdefghijkl", "m"))
            .await
            .unwrap();

        let docs = index.list_documents().await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].source.as_deref(), Some("ibc.pdf"));
        assert_eq!(docs[0].page_count, 2);
        assert!((docs[0].mean_confidence.unwrap() - 0.7).abs() < 1e-5);
    }
}
