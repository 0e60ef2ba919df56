//! `bch search`: retrieval without generation.
//!
//! Prints the ranked, deduplicated hits the answer composer would see,
//! each with its citation and an excerpt.

use anyhow::Result;
use serde::Serialize;

use buildcode_harness_core::index::VectorIndex;
use buildcode_harness_core::models::RetrievalHit;

use crate::config::Config;
use crate::harness::{user_error, Harness};

const EXCERPT_CHARS: usize = 240;

#[derive(Serialize)]
struct SearchOutput<'a> {
    query: &'a str,
    hits: &'a [RetrievalHit],
}

pub async fn run_search(config: &Config, query: &str, k: Option<usize>, json: bool) -> Result<()> {
    if query.trim().is_empty() {
        anyhow::bail!("query must not be empty");
    }

    let harness = Harness::open(config).await?;

    if harness.index.stats().await.map_err(user_error)?.chunks == 0 {
        if json {
            println!("{}", serde_json::to_string_pretty(&SearchOutput { query, hits: &[] })?);
        } else {
            println!("No codes indexed yet. Run `bch ingest <path>` first.");
        }
        harness.close().await;
        return Ok(());
    }

    let hits = match harness.retriever.retrieve(query, k, None).await {
        Ok(hits) => hits,
        Err(e) => {
            harness.close().await;
            return Err(user_error(e));
        }
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&SearchOutput {
                query,
                hits: &hits
            })?
        );
    } else if hits.is_empty() {
        println!("No results.");
    } else {
        for hit in &hits {
            print_hit(hit);
        }
    }

    harness.close().await;
    Ok(())
}

fn print_hit(hit: &RetrievalHit) {
    println!("{}", format_hit(hit));
}

/// One hit as printed by `bch search`: rank, score, citation, excerpt, id.
pub fn format_hit(hit: &RetrievalHit) -> String {
    format!(
        "{}. [{:.3}] {}\n    excerpt: \"{}\"\n    id: {}\n",
        hit.rank,
        hit.score,
        hit.citation,
        excerpt(&hit.chunk.text),
        hit.chunk.id
    )
}

/// First [`EXCERPT_CHARS`] characters of `text` on one line.
fn excerpt(text: &str) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= EXCERPT_CHARS {
        flat
    } else {
        let cut: String = flat.chars().take(EXCERPT_CHARS).collect();
        format!("{}…", cut.trim_end())
    }
}
