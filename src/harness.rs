//! Wiring of the configured backends around one SQLite index.

use std::sync::Arc;

use anyhow::Result;
use tracing::debug;

use buildcode_harness_core::compose::GenerationBackend;
use buildcode_harness_core::embedding::Embedder;
use buildcode_harness_core::index::VectorIndex;
use buildcode_harness_core::retrieve::Retriever;
use buildcode_harness_core::Error;

use crate::config::Config;
use crate::db;
use crate::embedding::create_embedder;
use crate::generation::create_generator;
use crate::migrate;
use crate::sqlite_index::SqliteIndex;

/// Everything a command or request handler needs: the index, the embedding
/// and generation backends, and a retriever over them.
#[derive(Clone)]
pub struct Harness {
    pub config: Arc<Config>,
    pub index: Arc<SqliteIndex>,
    pub embedder: Arc<dyn Embedder>,
    pub generator: Arc<dyn GenerationBackend>,
    pub retriever: Retriever,
}

impl Harness {
    /// Open the database (applying migrations) and build the configured
    /// backends. Backends are not contacted until first use.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::apply(&pool).await?;
        let index = SqliteIndex::open(pool, config.retrieval.similarity).await?;
        let embedder = create_embedder(&config.embedding)?;
        let generator = create_generator(&config.generation)?;
        Self::from_parts(config, Arc::new(index), embedder, generator)
    }

    /// Assemble a harness from already built backends.
    pub fn from_parts(
        config: &Config,
        index: Arc<SqliteIndex>,
        embedder: Arc<dyn Embedder>,
        generator: Arc<dyn GenerationBackend>,
    ) -> Result<Self> {
        let retriever = Retriever::new(
            embedder.clone(),
            index.clone() as Arc<dyn VectorIndex>,
            config.retrieval_params(),
        )?;
        Ok(Self {
            config: Arc::new(config.clone()),
            index,
            embedder,
            generator,
            retriever,
        })
    }

    pub async fn close(&self) {
        self.index.pool().close().await;
    }
}

/// The terminal form of a pipeline error: its user-facing message. The
/// backend detail goes to the debug log.
pub fn user_error(err: Error) -> anyhow::Error {
    debug!(error = %err, "command failed");
    anyhow::anyhow!(err.user_message())
}
