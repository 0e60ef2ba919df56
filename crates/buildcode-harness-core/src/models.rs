//! Core data models for the retrieval pipeline.
//!
//! Pages arrive from the text extraction stage, chunks and vectors are
//! produced at ingestion time, and hits and citations are produced per query.
//! None of these are mutated after construction.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One page of extracted text, tagged with its position in a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub document_id: String,
    /// 1-based page number.
    pub page_number: u32,
    pub text: String,
    /// Section or chapter label detected by the extraction stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section_label: Option<String>,
    /// Original file name the page was extracted from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Mean OCR confidence for the page, if reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

impl Page {
    pub fn new(document_id: impl Into<String>, page_number: u32, text: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            page_number,
            text: text.into(),
            section_label: None,
            source: None,
            confidence: None,
        }
    }

    pub fn with_section(mut self, label: impl Into<String>) -> Self {
        self.section_label = Some(label.into());
        self
    }
}

/// A document as an ordered sequence of pages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceDocument {
    pub id: String,
    pub pages: Vec<Page>,
}

impl SourceDocument {
    /// Build a document, checking that every page belongs to it and that
    /// page numbers are 1-based and strictly increasing.
    pub fn new(id: impl Into<String>, pages: Vec<Page>) -> Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(Error::InvalidPage("document id must not be empty".into()));
        }
        let mut last = 0u32;
        for page in &pages {
            if page.document_id != id {
                return Err(Error::InvalidPage(format!(
                    "page {} belongs to document '{}', not '{}'",
                    page.page_number, page.document_id, id
                )));
            }
            if page.page_number == 0 {
                return Err(Error::InvalidPage(format!(
                    "document '{}' has a page numbered 0; pages are 1-based",
                    id
                )));
            }
            if page.page_number <= last {
                return Err(Error::InvalidPage(format!(
                    "document '{}' pages out of order: {} after {}",
                    id, page.page_number, last
                )));
            }
            last = page.page_number;
        }
        Ok(Self { id, pages })
    }

    /// First non-empty `source` reported by any page.
    pub fn source(&self) -> Option<&str> {
        self.pages.iter().find_map(|p| p.source.as_deref())
    }
}

/// A bounded span of one page's text plus its provenance.
///
/// Offsets are character (Unicode scalar) positions into the page text,
/// half-open: `[start, end)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub page_number: u32,
    pub section: Option<String>,
    /// Number of blank-line paragraph boundaries before `start`.
    pub paragraph_index: u32,
    pub text: String,
    pub start: usize,
    pub end: usize,
    /// SHA-256 of `text`, hex encoded.
    pub hash: String,
    pub prev_id: Option<String>,
    pub next_id: Option<String>,
}

impl Chunk {
    /// True if both chunks sit on the same page of the same document and
    /// their character spans intersect.
    pub fn overlaps(&self, other: &Chunk) -> bool {
        self.same_page(other) && self.start < other.end && other.start < self.end
    }

    pub fn same_page(&self, other: &Chunk) -> bool {
        self.document_id == other.document_id && self.page_number == other.page_number
    }

    pub fn citation(&self) -> Citation {
        Citation {
            chunk_id: self.id.clone(),
            document_id: self.document_id.clone(),
            page_number: self.page_number,
            section: self.section.clone(),
            paragraph_index: self.paragraph_index,
        }
    }
}

/// A chunk's embedding, tagged with the model that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingVector {
    pub chunk_id: String,
    pub model: String,
    pub values: Vec<f32>,
}

impl EmbeddingVector {
    pub fn dims(&self) -> usize {
        self.values.len()
    }
}

/// Provenance of a piece of supporting text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Citation {
    pub chunk_id: String,
    pub document_id: String,
    pub page_number: u32,
    pub section: Option<String>,
    pub paragraph_index: u32,
}

impl std::fmt::Display for Citation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}, Section {}, Page {}, Paragraph {}",
            self.document_id,
            self.section.as_deref().unwrap_or("unknown"),
            self.page_number,
            self.paragraph_index
        )
    }
}

/// One retrieved chunk for a query. Produced per query, never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievalHit {
    pub chunk: Chunk,
    /// Similarity to the query; higher is more relevant.
    pub score: f32,
    /// 1-based position after ranking and deduplication.
    pub rank: usize,
    pub citation: Citation,
}

impl RetrievalHit {
    pub fn chunk_id(&self) -> &str {
        &self.chunk.id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One message in a conversation. Assistant turns carry the citations
/// emitted with their answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub text: String,
    #[serde(default)]
    pub citations: Vec<Citation>,
}

impl ConversationTurn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
            citations: Vec::new(),
        }
    }

    pub fn assistant(text: impl Into<String>, citations: Vec<Citation>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
            citations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(doc: &str, page: u32, start: usize, end: usize) -> Chunk {
        Chunk {
            id: format!("{}-{}-{}", doc, page, start),
            document_id: doc.to_string(),
            page_number: page,
            section: None,
            paragraph_index: 0,
            text: String::new(),
            start,
            end,
            hash: String::new(),
            prev_id: None,
            next_id: None,
        }
    }

    #[test]
    fn test_document_accepts_ordered_pages() {
        let doc = SourceDocument::new(
            "ibc",
            vec![Page::new("ibc", 1, "a"), Page::new("ibc", 3, "b")],
        )
        .unwrap();
        assert_eq!(doc.pages.len(), 2);
    }

    #[test]
    fn test_document_rejects_zero_page() {
        let err = SourceDocument::new("ibc", vec![Page::new("ibc", 0, "a")]).unwrap_err();
        assert!(matches!(err, Error::InvalidPage(_)));
    }

    #[test]
    fn test_document_rejects_out_of_order_pages() {
        let err = SourceDocument::new(
            "ibc",
            vec![Page::new("ibc", 2, "a"), Page::new("ibc", 2, "b")],
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidPage(_)));
    }

    #[test]
    fn test_document_rejects_foreign_page() {
        let err = SourceDocument::new("ibc", vec![Page::new("nfpa", 1, "a")]).unwrap_err();
        assert!(matches!(err, Error::InvalidPage(_)));
    }

    #[test]
    fn test_overlap_requires_same_page() {
        let a = chunk("d", 1, 0, 500);
        let b = chunk("d", 1, 450, 950);
        let c = chunk("d", 2, 450, 950);
        let d = chunk("d", 1, 500, 900);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
        assert!(!a.overlaps(&d));
    }

    #[test]
    fn test_citation_display() {
        let mut c = chunk("ibc-2021", 12, 0, 10);
        c.section = Some("1004.5".into());
        c.paragraph_index = 3;
        assert_eq!(
            c.citation().to_string(),
            "ibc-2021, Section 1004.5, Page 12, Paragraph 3"
        );
    }
}
