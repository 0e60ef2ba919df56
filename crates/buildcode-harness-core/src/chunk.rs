//! Fixed-size overlapping page chunker.
//!
//! Splits one [`Page`] into [`Chunk`]s of at most `size` characters. Chunks
//! are produced greedily left to right: chunk `i` starts at
//! `end[i-1] - overlap`, so consecutive chunks share exactly `overlap`
//! characters. The last chunk may be shorter than `size`.
//!
//! A chunk never spans two pages. Each chunk carries its page's provenance
//! (document, page, section label) plus the index of the blank-line
//! delimited paragraph it starts in.
//!
//! Chunk ids are UUIDv5 values derived from the document id, page number,
//! character span, and SHA-256 of the chunk text, so chunking the same page
//! with the same parameters always yields the same ids, and changed text
//! yields new ones.
//!
//! # Example
//!
//! ```rust
//! use buildcode_harness_core::chunk::Chunker;
//! use buildcode_harness_core::models::Page;
//!
//! let page = Page::new("ibc-2021", 1, "x".repeat(1200));
//! let chunker = Chunker::new(500, 50).unwrap();
//! let spans: Vec<(usize, usize)> = chunker.chunk(&page).map(|c| (c.start, c.end)).collect();
//! assert_eq!(spans, vec![(0, 500), (450, 950), (900, 1200)]);
//! ```

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{Chunk, Page};
use crate::section::detect_section;

/// Chunk sizing parameters, validated once at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunker {
    size: usize,
    overlap: usize,
}

impl Chunker {
    /// Create a chunker producing chunks of `size` characters that overlap
    /// by `overlap` characters.
    ///
    /// Fails with [`Error::Configuration`] unless `0 <= overlap < size`.
    pub fn new(size: usize, overlap: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::Configuration("chunk size must be > 0".into()));
        }
        if overlap >= size {
            return Err(Error::Configuration(format!(
                "chunk overlap ({}) must be smaller than chunk size ({})",
                overlap, size
            )));
        }
        Ok(Self { size, overlap })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }

    /// Lazily chunk one page.
    ///
    /// The returned iterator is finite and `Clone`; cloning it or calling
    /// `chunk` again restarts from the same position with identical output.
    pub fn chunk<'a>(&self, page: &'a Page) -> Chunks<'a> {
        Chunks::new(*self, page)
    }
}

/// Chunk one page eagerly. Convenience wrapper over [`Chunker`].
pub fn chunk_page(page: &Page, size: usize, overlap: usize) -> Result<Vec<Chunk>> {
    Ok(Chunker::new(size, overlap)?.chunk(page).collect())
}

/// Character layout of a page: byte position of every char boundary and
/// the char offsets at which new paragraphs begin.
#[derive(Debug, Clone)]
struct PageLayout {
    /// `char_bytes[i]` is the byte index of char `i`; the final entry is
    /// `text.len()`.
    char_bytes: Vec<usize>,
    paragraph_starts: Vec<usize>,
}

impl PageLayout {
    fn new(text: &str) -> Self {
        let mut char_bytes: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
        char_bytes.push(text.len());

        let mut paragraph_starts = Vec::new();
        let mut seen_text = false;
        let mut newlines_in_run = 0usize;
        for (ci, ch) in text.chars().enumerate() {
            if ch.is_whitespace() {
                if ch == '\n' {
                    newlines_in_run += 1;
                }
                continue;
            }
            if seen_text && newlines_in_run >= 2 {
                paragraph_starts.push(ci);
            }
            seen_text = true;
            newlines_in_run = 0;
        }

        Self {
            char_bytes,
            paragraph_starts,
        }
    }

    fn char_len(&self) -> usize {
        self.char_bytes.len() - 1
    }

    fn slice<'t>(&self, text: &'t str, start: usize, end: usize) -> &'t str {
        &text[self.char_bytes[start]..self.char_bytes[end]]
    }

    /// Paragraph boundaries crossed before `offset`.
    fn paragraph_index(&self, offset: usize) -> u32 {
        self.paragraph_starts.partition_point(|&s| s <= offset) as u32
    }
}

/// Lazy iterator over the chunks of one page. See [`Chunker::chunk`].
#[derive(Debug, Clone)]
pub struct Chunks<'a> {
    chunker: Chunker,
    page: &'a Page,
    layout: PageLayout,
    next_start: Option<usize>,
    prev_id: Option<String>,
    /// Id of the chunk at `next_start`, computed when its predecessor was
    /// emitted.
    pending_id: Option<String>,
}

impl<'a> Chunks<'a> {
    fn new(chunker: Chunker, page: &'a Page) -> Self {
        Self {
            chunker,
            page,
            layout: PageLayout::new(&page.text),
            next_start: Some(0),
            prev_id: None,
            pending_id: None,
        }
    }

    fn span_from(&self, start: usize) -> (usize, usize) {
        let end = (start + self.chunker.size).min(self.layout.char_len());
        (start, end)
    }

    fn successor_start(&self, end: usize) -> Option<usize> {
        if end >= self.layout.char_len() {
            None
        } else {
            Some(end - self.chunker.overlap)
        }
    }

    fn chunk_id(&self, start: usize, end: usize, hash: &str) -> String {
        let name = format!(
            "{}\u{1f}{}\u{1f}{}\u{1f}{}\u{1f}{}",
            self.page.document_id, self.page.page_number, start, end, hash
        );
        Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string()
    }

    fn id_for_span(&self, start: usize, end: usize) -> String {
        let text = self.layout.slice(&self.page.text, start, end);
        self.chunk_id(start, end, &content_hash(text))
    }
}

impl Iterator for Chunks<'_> {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        let start = self.next_start?;
        let (start, end) = self.span_from(start);
        let text = self.layout.slice(&self.page.text, start, end);
        let hash = content_hash(text);
        let id = match self.pending_id.take() {
            Some(id) => id,
            None => self.chunk_id(start, end, &hash),
        };

        let next_start = self.successor_start(end);
        let next_id = next_start.map(|s| {
            let (s, e) = self.span_from(s);
            self.id_for_span(s, e)
        });

        let section = self
            .page
            .section_label
            .clone()
            .or_else(|| detect_section(text));

        let chunk = Chunk {
            id: id.clone(),
            document_id: self.page.document_id.clone(),
            page_number: self.page.page_number,
            section,
            paragraph_index: self.layout.paragraph_index(start),
            text: text.to_string(),
            start,
            end,
            hash,
            prev_id: self.prev_id.take(),
            next_id: next_id.clone(),
        };

        self.next_start = next_start;
        self.pending_id = next_id;
        self.prev_id = Some(id);
        Some(chunk)
    }
}

impl std::iter::FusedIterator for Chunks<'_> {}

/// SHA-256 of `text`, lowercase hex.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}
