//! # Building Code Harness
//!
//! A local-first retrieval and question answering harness for building code
//! documents.
//!
//! OCR'd pages are chunked with page, section, and paragraph provenance,
//! embedded, and stored in SQLite. Questions are answered by a chat model
//! from the retrieved excerpts only, and every answer ends with the exact
//! citations of the excerpts it was given.
//!
//! The retrieval core (chunking, retrieval, prompt assembly, answer
//! streaming) lives in `buildcode-harness-core`. This crate provides the
//! concrete backends and the `bch` CLI and HTTP surfaces.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌─────────────┐   ┌──────────┐
//! │ Page files  │──▶│  Pipeline   │──▶│  SQLite  │
//! │ json/txt/pdf│   │ Chunk+Embed │   │ vectors  │
//! └─────────────┘   └─────────────┘   └────┬─────┘
//!                                          │
//!                      ┌───────────────────┤
//!                      ▼                   ▼
//!                 ┌──────────┐       ┌──────────┐
//!                 │   CLI    │       │   HTTP   │
//!                 │  (bch)   │       │  (SSE)   │
//!                 └──────────┘       └──────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`pages`] | Page sources (JSON, JSONL, text, PDF) |
//! | [`ingest`] | Chunk, embed, and index documents |
//! | [`embedding`] | Embedding providers |
//! | [`generation`] | Streaming chat providers |
//! | [`sqlite_index`] | SQLite vector index |
//! | [`harness`] | Backend wiring shared by commands and handlers |
//! | [`search`] / [`ask`] | Retrieval and answering commands |
//! | [`server`] | HTTP API |
//! | [`mcp`] | MCP tools mounted on the HTTP server |
//! | [`db`] / [`migrate`] | Database connection and schema |

pub mod ask;
pub mod config;
pub mod db;
pub mod embedding;
pub mod generation;
pub mod harness;
pub mod ingest;
pub mod logging;
pub mod mcp;
pub mod migrate;
pub mod pages;
pub mod search;
pub mod server;
pub mod sqlite_index;
pub mod stats;
