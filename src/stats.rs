//! Index statistics: what is indexed, under which embedding models.
//!
//! Used by `bch stats` to confirm that ingestion worked and that the
//! configured embedding model matches the stored vectors. A model mismatch
//! is the usual reason for empty search results after changing
//! `[embedding].model`.

use anyhow::Result;

use buildcode_harness_core::index::VectorIndex;

use crate::config::Config;
use crate::harness::Harness;

/// `bch stats`.
pub async fn run_stats(config: &Config) -> Result<()> {
    let harness = Harness::open(config).await?;
    let stats = harness.index.stats().await?;
    let documents = harness.index.list_documents().await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Building Code Harness: Index Stats");
    println!("==================================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!("  Similarity:  {}", harness.index.similarity().as_str());
    println!();
    println!("  Documents:   {}", stats.documents);
    println!("  Chunks:      {}", stats.chunks);

    let active_model = harness.embedder.model_id().to_string();
    if !stats.vectors_by_model.is_empty() {
        println!();
        println!("  Vectors by model:");
        for m in &stats.vectors_by_model {
            let marker = if m.model == active_model { " (active)" } else { "" };
            println!("    {:<32} {:>5} dims {:>8}{}", m.model, m.dims, m.vectors, marker);
        }
    }
    if stats.chunks > 0 && !stats.vectors_by_model.iter().any(|m| m.model == active_model) {
        println!();
        println!(
            "  warning: no vectors for the configured model '{}'; re-ingest to search",
            active_model
        );
    }

    if !documents.is_empty() {
        println!();
        println!("  Documents:");
        println!(
            "    {:<28} {:>6} {:>7} {:>6}  {}",
            "ID", "PAGES", "CHUNKS", "OCR", "INGESTED"
        );
        println!("    {}", "-".repeat(72));
        for doc in &documents {
            let chunks = harness.index.chunk_count(&doc.id).await?;
            let confidence = doc
                .mean_confidence
                .map(|c| format!("{:.2}", c))
                .unwrap_or_else(|| "-".to_string());
            println!(
                "    {:<28} {:>6} {:>7} {:>6}  {}",
                doc.id,
                doc.page_count,
                chunks,
                confidence,
                format_ts_relative(doc.ingested_at)
            );
        }
    }
    println!();

    harness.close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp relative to now (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;
    if delta < 0 {
        return format_ts_iso(ts);
    }
    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes_units() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn test_relative_time() {
        let now = chrono::Utc::now().timestamp();
        assert_eq!(format_ts_relative(now), "just now");
        assert_eq!(format_ts_relative(now - 2 * 3600), "2 hours ago");
        assert_eq!(format_ts_relative(now - 86400), "1 day ago");
    }
}
