//! Page sources: turning extracted text on disk into [`SourceDocument`]s.
//!
//! Text extraction (OCR, layout analysis) happens upstream. This module
//! reads its output in one of several formats:
//!
//! | Extension | Layout |
//! |-----------|--------|
//! | `.json` | an array of page objects, or `{ "document_id", "pages": [...] }` |
//! | `.jsonl` | one page object per line |
//! | `.pdf` | the PDF text layer, one page per PDF page (no OCR) |
//! | `.txt` | pages separated by form feed (`\x0c`) |
//!
//! A page object is `{ "page_number", "text", "document_id"?, "section_label"?,
//! "source"?, "confidence"? }`. Pages without a `document_id` belong to the
//! file's document, whose id defaults to the file stem.
//!
//! A directory is walked recursively and every supported file becomes one
//! or more documents. Two files yielding the same document id are rejected.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::{debug, warn};
use walkdir::WalkDir;

use buildcode_harness_core::models::{Page, SourceDocument};

const SUPPORTED_EXTENSIONS: &[&str] = &["json", "jsonl", "pdf", "txt"];

/// One page as written by the extraction stage.
#[derive(Debug, Clone, Deserialize)]
pub struct PageRecord {
    #[serde(default)]
    pub document_id: Option<String>,
    pub page_number: u32,
    pub text: String,
    #[serde(default, alias = "section")]
    pub section_label: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub confidence: Option<f32>,
}

/// A whole document with its pages, as accepted by `POST /documents`.
#[derive(Debug, Clone, Deserialize)]
pub struct DocumentUpload {
    pub document_id: String,
    pub pages: Vec<PageRecord>,
}

impl DocumentUpload {
    pub fn into_document(self) -> Result<SourceDocument> {
        let mut docs = group_pages(self.pages, &self.document_id, true, None)?;
        match docs.pop() {
            Some(doc) => Ok(doc),
            None => Ok(SourceDocument::new(self.document_id, Vec::new())?),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum JsonLayout {
    Pages(Vec<PageRecord>),
    Document {
        #[serde(default)]
        document_id: Option<String>,
        pages: Vec<PageRecord>,
    },
}

/// Load every document found at `path` (a file or a directory).
///
/// `document_id` overrides the id of every page and is only accepted for a
/// single file.
pub fn load_documents(path: &Path, document_id: Option<&str>) -> Result<Vec<SourceDocument>> {
    if path.is_dir() {
        if document_id.is_some() {
            bail!("--document-id cannot be used with a directory");
        }
        let mut docs = Vec::new();
        let mut origins: HashMap<String, PathBuf> = HashMap::new();
        for file in supported_files(path)? {
            for doc in load_file(&file, None)? {
                if let Some(first) = origins.get(&doc.id) {
                    bail!(
                        "document id '{}' is used by both {} and {}",
                        doc.id,
                        first.display(),
                        file.display()
                    );
                }
                origins.insert(doc.id.clone(), file.clone());
                docs.push(doc);
            }
        }
        return Ok(docs);
    }
    if !path.exists() {
        bail!("No such file or directory: {}", path.display());
    }
    load_file(path, document_id)
}

fn supported_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if extension(path).is_some_and(|ext| SUPPORTED_EXTENSIONS.contains(&ext.as_str())) {
            files.push(path.to_path_buf());
        } else {
            debug!(path = %path.display(), "skipping unsupported file");
        }
    }
    files.sort();
    Ok(files)
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

/// Load the documents in one file.
pub fn load_file(path: &Path, document_id: Option<&str>) -> Result<Vec<SourceDocument>> {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| anyhow::anyhow!("Invalid file name: {}", path.display()))?;
    let file_name = path.file_name().and_then(|s| s.to_str()).map(str::to_string);
    let default_id = document_id.unwrap_or(stem);
    let force = document_id.is_some();

    let ext = extension(path).unwrap_or_default();
    let docs = match ext.as_str() {
        "json" => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            match serde_json::from_str::<JsonLayout>(&content)
                .with_context(|| format!("Invalid page JSON in {}", path.display()))?
            {
                JsonLayout::Pages(pages) => group_pages(pages, default_id, force, file_name)?,
                JsonLayout::Document {
                    document_id: doc_id,
                    pages,
                } => {
                    let id = match (document_id, doc_id.as_deref()) {
                        (Some(forced), _) => forced,
                        (None, Some(id)) => id,
                        (None, None) => stem,
                    };
                    group_pages(pages, id, true, file_name)?
                }
            }
        }
        "jsonl" => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let mut pages = Vec::new();
            for (i, line) in content.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                let page: PageRecord = serde_json::from_str(line).with_context(|| {
                    format!("Invalid page JSON at {}:{}", path.display(), i + 1)
                })?;
                pages.push(page);
            }
            group_pages(pages, default_id, force, file_name)?
        }
        "txt" => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            vec![document_from_texts(
                default_id,
                split_form_feeds(&content),
                file_name,
            )?]
        }
        "pdf" => {
            let bytes =
                std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
            let texts = pdf_extract::extract_text_from_mem_by_pages(&bytes)
                .map_err(|e| anyhow::anyhow!("PDF extraction failed for {}: {}", path.display(), e))?;
            if texts.iter().all(|t| t.trim().is_empty()) {
                warn!(path = %path.display(), "PDF has no text layer; run OCR first");
            }
            vec![document_from_texts(default_id, texts, file_name)?]
        }
        other => bail!(
            "Unsupported page source '{}' (extension '{}'). Supported: {}",
            path.display(),
            other,
            SUPPORTED_EXTENSIONS.join(", ")
        ),
    };
    Ok(docs)
}

/// Split text into pages on form feed characters. A trailing form feed does
/// not start an extra page.
pub fn split_form_feeds(content: &str) -> Vec<String> {
    let mut pages: Vec<String> = content.split('\x0c').map(str::to_string).collect();
    if pages.len() > 1 && pages.last().is_some_and(|p| p.trim().is_empty()) {
        pages.pop();
    }
    pages
}

fn document_from_texts(
    document_id: &str,
    texts: Vec<String>,
    source: Option<String>,
) -> Result<SourceDocument> {
    let pages = texts
        .into_iter()
        .enumerate()
        .map(|(i, text)| {
            let mut page = Page::new(document_id, i as u32 + 1, text);
            page.source = source.clone();
            page
        })
        .collect();
    Ok(SourceDocument::new(document_id, pages)?)
}

/// Group page records by document id, in order of first appearance.
///
/// With `force` set, every page is assigned `default_id`.
fn group_pages(
    records: Vec<PageRecord>,
    default_id: &str,
    force: bool,
    source: Option<String>,
) -> Result<Vec<SourceDocument>> {
    let mut groups: Vec<(String, Vec<Page>)> = Vec::new();
    for record in records {
        let id = match (&record.document_id, force) {
            (Some(id), false) => id.clone(),
            _ => default_id.to_string(),
        };
        let page = Page {
            document_id: id.clone(),
            page_number: record.page_number,
            text: record.text,
            section_label: record.section_label.filter(|s| !s.trim().is_empty()),
            source: record.source.or_else(|| source.clone()),
            confidence: record.confidence,
        };
        match groups.iter_mut().find(|(gid, _)| *gid == id) {
            Some((_, pages)) => pages.push(page),
            None => groups.push((id, vec![page])),
        }
    }

    let mut docs = Vec::with_capacity(groups.len());
    for (id, pages) in groups {
        docs.push(SourceDocument::new(id, pages)?);
    }
    Ok(docs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_txt_pages_split_on_form_feed() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("ibc-2021.txt");
        fs::write(&path, "Chapter 10 Means of Egress\x0cSection 1005.1 width\x0c").unwrap();

        let docs = load_documents(&path, None).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].id, "ibc-2021");
        assert_eq!(docs[0].pages.len(), 2);
        assert_eq!(docs[0].pages[1].page_number, 2);
        assert_eq!(docs[0].pages[0].source.as_deref(), Some("ibc-2021.txt"));
    }

    #[test]
    fn test_json_document_layout() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("out.json");
        fs::write(
            &path,
            r#"{"document_id":"nfpa-101","pages":[
                {"page_number":1,"text":"a","confidence":0.91},
                {"page_number":2,"text":"b","section_label":"7.2"}
            ]}"#,
        )
        .unwrap();

        let docs = load_documents(&path, None).unwrap();
        assert_eq!(docs[0].id, "nfpa-101");
        assert_eq!(docs[0].pages[0].confidence, Some(0.91));
        assert_eq!(docs[0].pages[1].section_label.as_deref(), Some("7.2"));
    }

    #[test]
    fn test_json_array_groups_by_document() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("batch.json");
        fs::write(
            &path,
            r#"[
                {"document_id":"a","page_number":1,"text":"x"},
                {"document_id":"b","page_number":1,"text":"y"},
                {"document_id":"a","page_number":2,"text":"z"}
            ]"#,
        )
        .unwrap();

        let docs = load_documents(&path, None).unwrap();
        let ids: Vec<&str> = docs.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(docs[0].pages.len(), 2);
    }

    #[test]
    fn test_jsonl_with_override_id() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("pages.jsonl");
        fs::write(
            &path,
            "{\"page_number\":1,\"text\":\"x\"}\n\n{\"page_number\":2,\"text\":\"y\"}\n",
        )
        .unwrap();

        let docs = load_documents(&path, Some("ibc")).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].id, "ibc");
        assert_eq!(docs[0].pages.len(), 2);
    }

    #[test]
    fn test_out_of_order_pages_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bad.jsonl");
        fs::write(
            &path,
            "{\"page_number\":2,\"text\":\"x\"}\n{\"page_number\":1,\"text\":\"y\"}\n",
        )
        .unwrap();
        assert!(load_documents(&path, None).is_err());
    }

    #[test]
    fn test_directory_walk_skips_unsupported() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("nested")).unwrap();
        fs::write(tmp.path().join("a.txt"), "page one").unwrap();
        fs::write(tmp.path().join("nested/b.txt"), "page one\x0cpage two").unwrap();
        fs::write(tmp.path().join("notes.md"), "# ignored").unwrap();

        let docs = load_documents(tmp.path(), None).unwrap();
        let ids: Vec<&str> = docs.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(load_documents(tmp.path(), Some("x")).is_err());
    }

    #[test]
    fn test_directory_with_duplicate_document_ids_rejected() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("a")).unwrap();
        fs::create_dir_all(tmp.path().join("b")).unwrap();
        fs::write(tmp.path().join("a/ibc.txt"), "2018 edition").unwrap();
        fs::write(tmp.path().join("b/ibc.txt"), "2021 edition").unwrap();

        let err = load_documents(tmp.path(), None).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("document id 'ibc'"));
        assert!(message.contains("a/ibc.txt"));
        assert!(message.contains("b/ibc.txt"));
    }

    #[test]
    fn test_upload_into_document() {
        let upload: DocumentUpload = serde_json::from_str(
            r#"{"document_id":"ibc","pages":[{"page_number":1,"text":"Section 1004.1"}]}"#,
        )
        .unwrap();
        let doc = upload.into_document().unwrap();
        assert_eq!(doc.pages[0].document_id, "ibc");
    }
}
