//! MCP tool server over the building code index.
//!
//! [`server::router`](crate::server::router) mounts [`McpBridge`] at `/mcp`
//! as a Streamable HTTP endpoint, so MCP clients (editors, agents, BIM
//! tooling) can query the indexed codes with the standard JSON-RPC protocol.
//!
//! * `search_building_codes`: ranked, cited excerpts for `{ query, k? }`.
//! * `ask_building_codes`: a complete cited answer for `{ question, k? }`.
//!
//! Both tools are read-only. Pipeline failures come back as tool error
//! results carrying the user-facing message; unknown tools and malformed
//! arguments are protocol errors.

use std::borrow::Cow;
use std::sync::Arc;

use rmcp::model::*;
use rmcp::{ErrorData as McpError, ServerHandler};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use buildcode_harness_core::compose::compose;
use buildcode_harness_core::index::VectorIndex;
use buildcode_harness_core::models::RetrievalHit;
use buildcode_harness_core::Error;

use crate::ask::render_answer;
use crate::harness::Harness;
use crate::search::format_hit;

const SEARCH_TOOL: &str = "search_building_codes";
const ASK_TOOL: &str = "ask_building_codes";
const EMPTY_INDEX: &str = "No codes indexed yet. Run `bch ingest <path>` first.";

#[derive(Deserialize)]
struct SearchArgs {
    query: String,
    #[serde(default)]
    k: Option<usize>,
}

#[derive(Deserialize)]
struct AskArgs {
    question: String,
    #[serde(default)]
    k: Option<usize>,
}

/// Why a tool call produced no text.
#[derive(Debug)]
pub enum ToolError {
    /// Unknown tool or malformed arguments.
    Protocol(McpError),
    /// The retrieval or generation pipeline failed.
    Pipeline(Error),
}

impl From<Error> for ToolError {
    fn from(err: Error) -> Self {
        ToolError::Pipeline(err)
    }
}

fn invalid_params(message: String) -> ToolError {
    ToolError::Protocol(McpError::new(ErrorCode::INVALID_PARAMS, message, None))
}

/// Serves the retrieval pipeline as MCP tools. Each session gets a clone.
#[derive(Clone)]
pub struct McpBridge {
    harness: Harness,
}

impl McpBridge {
    pub fn new(harness: Harness) -> Self {
        Self { harness }
    }

    fn tool(name: &'static str, description: &'static str, schema: Value) -> Tool {
        let input_schema = match schema {
            Value::Object(map) => Arc::new(map),
            _ => Arc::new(serde_json::Map::new()),
        };
        Tool {
            name: Cow::Borrowed(name),
            title: None,
            description: Some(Cow::Borrowed(description)),
            input_schema,
            output_schema: None,
            annotations: Some(ToolAnnotations::new().read_only(true)),
            execution: None,
            icons: None,
            meta: None,
        }
    }

    fn tools() -> Vec<Tool> {
        vec![
            Self::tool(
                SEARCH_TOOL,
                "Search the indexed building codes and return cited excerpts",
                json!({
                    "type": "object",
                    "properties": {
                        "query": {
                            "type": "string",
                            "description": "Natural language query about building codes"
                        },
                        "k": {
                            "type": "integer",
                            "description": "Number of excerpts to return"
                        }
                    },
                    "required": ["query"]
                }),
            ),
            Self::tool(
                ASK_TOOL,
                "Answer a question from the indexed building codes, with sources",
                json!({
                    "type": "object",
                    "properties": {
                        "question": {
                            "type": "string",
                            "description": "Question about building code requirements"
                        },
                        "k": {
                            "type": "integer",
                            "description": "Number of excerpts to answer from"
                        }
                    },
                    "required": ["question"]
                }),
            ),
        ]
    }

    /// Run tool `name` with JSON `args` and return its text output.
    pub async fn execute(&self, name: &str, args: Value) -> Result<String, ToolError> {
        match name {
            SEARCH_TOOL => {
                let args: SearchArgs = serde_json::from_value(args)
                    .map_err(|e| invalid_params(format!("{}: {}", SEARCH_TOOL, e)))?;
                self.search(&args.query, args.k).await
            }
            ASK_TOOL => {
                let args: AskArgs = serde_json::from_value(args)
                    .map_err(|e| invalid_params(format!("{}: {}", ASK_TOOL, e)))?;
                self.ask(&args.question, args.k).await
            }
            other => Err(ToolError::Protocol(McpError::new(
                ErrorCode::METHOD_NOT_FOUND,
                format!("no tool registered with name: {}", other),
                None,
            ))),
        }
    }

    async fn is_empty(&self) -> Result<bool, ToolError> {
        Ok(self.harness.index.stats().await?.chunks == 0)
    }

    async fn retrieve(&self, query: &str, k: Option<usize>) -> Result<Vec<RetrievalHit>, ToolError> {
        if query.trim().is_empty() {
            return Err(invalid_params("query must not be empty".to_string()));
        }
        Ok(self.harness.retriever.retrieve(query, k, None).await?)
    }

    async fn search(&self, query: &str, k: Option<usize>) -> Result<String, ToolError> {
        if self.is_empty().await? {
            return Ok(EMPTY_INDEX.to_string());
        }
        let hits = self.retrieve(query, k).await?;
        if hits.is_empty() {
            return Ok("No results.".to_string());
        }
        let mut text = format!("Found {} relevant building code sections:\n\n", hits.len());
        for hit in &hits {
            text.push_str(&format_hit(hit));
            text.push('\n');
        }
        Ok(text)
    }

    async fn ask(&self, question: &str, k: Option<usize>) -> Result<String, ToolError> {
        if self.is_empty().await? {
            return Ok(EMPTY_INDEX.to_string());
        }
        let hits = self.retrieve(question, k).await?;
        let answer = compose(
            self.harness.generator.as_ref(),
            question,
            &hits,
            &[],
            &self.harness.config.composer_params(),
        )
        .await?;

        let mut out = Vec::new();
        render_answer(answer, &mut out)
            .await
            .map_err(|e| ToolError::Pipeline(Error::GenerationBackend(e.to_string())))?;
        Ok(String::from_utf8_lossy(&out).trim_end().to_string())
    }
}

impl ServerHandler for McpBridge {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::LATEST,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "buildcode-harness".to_string(),
                title: Some("Building Code Harness".to_string()),
                version: env!("CARGO_PKG_VERSION").to_string(),
                description: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "Building Code Harness: cited answers from indexed building codes. Use \
                 search_building_codes for excerpts and ask_building_codes for an answer \
                 with its sources."
                    .to_string(),
            ),
        }
    }

    fn list_tools(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: rmcp::service::RequestContext<rmcp::RoleServer>,
    ) -> impl std::future::Future<Output = Result<ListToolsResult, McpError>> + Send + '_ {
        std::future::ready(Ok(ListToolsResult::with_all_items(Self::tools())))
    }

    fn get_tool(&self, name: &str) -> Option<Tool> {
        Self::tools().into_iter().find(|t| t.name == name)
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParams,
        _context: rmcp::service::RequestContext<rmcp::RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let args = request
            .arguments
            .map(Value::Object)
            .unwrap_or(Value::Object(serde_json::Map::new()));

        match self.execute(&request.name, args).await {
            Ok(text) => Ok(CallToolResult::success(vec![Content::text(text)])),
            Err(ToolError::Pipeline(err)) => {
                warn!(tool = %request.name, error = %err, "tool call failed");
                Ok(CallToolResult::error(vec![Content::text(err.user_message())]))
            }
            Err(ToolError::Protocol(err)) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use crate::generation::DisabledGenerator;
    use crate::ingest::ingest_into_sqlite;
    use crate::sqlite_index::SqliteIndex;
    use async_trait::async_trait;
    use buildcode_harness_core::compose::{ChatMessage, GenerationBackend, TokenStream};
    use buildcode_harness_core::embedding::{Embedder, Similarity};
    use buildcode_harness_core::models::{Page, SourceDocument};
    use futures_util::stream;
    use tempfile::TempDir;

    /// One dimension per keyword.
    struct KeywordEmbedder;

    #[async_trait]
    impl Embedder for KeywordEmbedder {
        fn model_id(&self) -> &str {
            "keywords"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed(&self, texts: &[String]) -> buildcode_harness_core::Result<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|t| {
                    let t = t.to_lowercase();
                    vec![t.matches("riser").count() as f32, t.matches("corridor").count() as f32]
                })
                .collect())
        }
    }

    struct FixedBackend;

    #[async_trait]
    impl GenerationBackend for FixedBackend {
        fn model_id(&self) -> &str {
            "fixed"
        }
        async fn generate(
            &self,
            _messages: &[ChatMessage],
        ) -> buildcode_harness_core::Result<TokenStream> {
            let tokens: Vec<buildcode_harness_core::Result<String>> = vec![
                Ok("Risers shall not exceed ".to_string()),
                Ok("7 inches.".to_string()),
            ];
            Ok(Box::pin(stream::iter(tokens)))
        }
    }

    async fn bridge(
        tmp: &TempDir,
        generator: Arc<dyn GenerationBackend>,
        ingest: bool,
    ) -> McpBridge {
        let config = parse_config(&format!(
            "[db]\npath = \"{}\"\n\n[chunking]\nsize = 200\noverlap = 20\n",
            tmp.path().join("bch.sqlite").display()
        ))
        .unwrap();
        let pool = crate::db::connect_path(&config.db.path).await.unwrap();
        crate::migrate::apply(&pool).await.unwrap();
        let index = Arc::new(SqliteIndex::open(pool, Similarity::Cosine).await.unwrap());
        let embedder: Arc<dyn Embedder> = Arc::new(KeywordEmbedder);

        if ingest {
            let doc = SourceDocument::new(
                "IBC-2021",
                vec![
                    Page::new("IBC-2021", 1, "Section 1011.5.2 Riser height. 7 inches maximum.")
                        .with_section("1011.5.2"),
                    Page::new("IBC-2021", 2, "Section 1020.2 Corridor width. 44 inches minimum.")
                        .with_section("1020.2"),
                ],
            )
            .unwrap();
            ingest_into_sqlite(&index, embedder.as_ref(), &config.chunker().unwrap(), 8, &doc)
                .await
                .unwrap();
        }

        let harness = Harness::from_parts(&config, index, embedder, generator).unwrap();
        McpBridge::new(harness)
    }

    #[tokio::test]
    async fn test_search_tool_returns_cited_excerpts() {
        let tmp = TempDir::new().unwrap();
        let bridge = bridge(&tmp, Arc::new(DisabledGenerator), true).await;
        let text = bridge
            .execute(SEARCH_TOOL, json!({ "query": "riser height", "k": 1 }))
            .await
            .unwrap();
        assert!(text.starts_with("Found 1 relevant building code sections"));
        assert!(text.contains("1. ["));
        assert!(text.contains("IBC-2021, Section 1011.5.2, Page 1"));
    }

    #[tokio::test]
    async fn test_ask_tool_returns_answer_with_sources() {
        let tmp = TempDir::new().unwrap();
        let bridge = bridge(&tmp, Arc::new(FixedBackend), true).await;
        let text = bridge
            .execute(ASK_TOOL, json!({ "question": "maximum riser height?", "k": 1 }))
            .await
            .unwrap();
        assert!(text.starts_with("Risers shall not exceed 7 inches."));
        assert!(text.contains("Sources:"));
        assert!(text.contains("[1] IBC-2021, Section 1011.5.2, Page 1"));
    }

    #[tokio::test]
    async fn test_tools_on_empty_index() {
        let tmp = TempDir::new().unwrap();
        let bridge = bridge(&tmp, Arc::new(DisabledGenerator), false).await;
        let text = bridge
            .execute(ASK_TOOL, json!({ "question": "corridor width" }))
            .await
            .unwrap();
        assert_eq!(text, EMPTY_INDEX);
    }

    #[tokio::test]
    async fn test_generation_failure_is_pipeline_error() {
        let tmp = TempDir::new().unwrap();
        let bridge = bridge(&tmp, Arc::new(DisabledGenerator), true).await;
        let err = bridge
            .execute(ASK_TOOL, json!({ "question": "corridor width" }))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Pipeline(Error::GenerationBackend(_))));
    }

    #[tokio::test]
    async fn test_bad_arguments_and_unknown_tool_are_protocol_errors() {
        let tmp = TempDir::new().unwrap();
        let bridge = bridge(&tmp, Arc::new(DisabledGenerator), true).await;

        let err = bridge.execute(SEARCH_TOOL, json!({ "k": 3 })).await.unwrap_err();
        assert!(matches!(err, ToolError::Protocol(_)));
        let err = bridge
            .execute(SEARCH_TOOL, json!({ "query": "   " }))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Protocol(_)));
        let err = bridge
            .execute("apply_height_restrictions", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Protocol(_)));
    }

    #[test]
    fn test_tool_descriptors() {
        let tools = McpBridge::tools();
        let names: Vec<&str> = tools.iter().map(|t| t.name.as_ref()).collect();
        assert_eq!(names, vec![SEARCH_TOOL, ASK_TOOL]);
        assert!(tools.iter().all(|t| t.input_schema.contains_key("required")));
    }
}
