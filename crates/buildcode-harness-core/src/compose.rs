//! Prompt assembly and cited answer streaming.
//!
//! [`assemble_prompt`] turns ranked hits and conversation history into chat
//! messages under a character budget. [`compose`] sends that prompt to a
//! [`GenerationBackend`] and returns an [`Answer`]: a stream of
//! [`AnswerEvent`]s that forwards tokens as they arrive and ends with exactly
//! one terminal event.
//!
//! # Budget
//!
//! The system prompt and the question are always sent. Hits are added in
//! rank order; the first hit whose block does not fit is dropped together
//! with every lower-ranked hit, so the included set is always a rank prefix
//! and no chunk is ever cut. History fills whatever budget remains, newest
//! turn first.
//!
//! # Citations
//!
//! Citations are derived from the hits included in the prompt, and are only
//! emitted after the token stream completes normally. A backend failure
//! mid-stream yields [`AnswerEvent::Truncated`] and no citations; so does
//! cancellation.

use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures_util::stream::{AbortHandle, Abortable, Stream};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::models::{Citation, ConversationTurn, RetrievalHit, Role};

/// Instructions sent as the system message of every prompt.
pub const SYSTEM_PROMPT: &str = "You are an expert building code assistant. \
Answer questions using only the building code excerpts provided in the context. \
Always cite the specific section and page number that supports each statement. \
If the excerpts do not fully answer the question, say so and state what is uncertain. \
Use clear, professional language. \
Format citations as [Source: <document>, Section X.X, Page Y].";

/// Sent in place of context when nothing relevant was retrieved.
pub const NO_CONTEXT_INSTRUCTION: &str = "No relevant building code sections were found \
for this question. Tell the user that no relevant code section was found in the indexed \
documents. Do not guess at code requirements and do not cite any source.";

/// Composer tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct ComposerParams {
    /// Upper bound on the characters of all prompt messages combined.
    pub max_context_chars: usize,
    /// Most recent conversation turns considered for the prompt.
    pub history_turns: usize,
}

impl Default for ComposerParams {
    fn default() -> Self {
        Self {
            max_context_chars: 12_000,
            history_turns: 6,
        }
    }
}

impl ComposerParams {
    pub fn validate(&self) -> Result<()> {
        if self.max_context_chars == 0 {
            return Err(Error::Configuration(
                "composer.max_context_chars must be > 0".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl From<Role> for MessageRole {
    fn from(role: Role) -> Self {
        match role {
            Role::User => MessageRole::User,
            Role::Assistant => MessageRole::Assistant,
        }
    }
}

/// One message in the chat-style prompt sent to a generation backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    fn chars(&self) -> usize {
        self.content.chars().count()
    }
}

/// An assembled prompt and the hits it actually contains.
#[derive(Debug, Clone)]
pub struct Prompt {
    pub messages: Vec<ChatMessage>,
    /// Hits whose text is in the prompt, in rank order.
    pub included: Vec<RetrievalHit>,
    /// Hits left out because the budget ran out.
    pub dropped: usize,
    /// Conversation turns carried as prior messages.
    pub history_included: usize,
}

impl Prompt {
    pub fn citations(&self) -> Vec<Citation> {
        self.included.iter().map(|h| h.citation.clone()).collect()
    }

    pub fn total_chars(&self) -> usize {
        self.messages.iter().map(ChatMessage::chars).sum()
    }
}

/// Render one hit as a numbered, provenance-tagged context block.
pub fn format_context_block(n: usize, hit: &RetrievalHit) -> String {
    let c = &hit.citation;
    format!(
        "[{}] Document: {} | Page {} | Section {} | Paragraph {}\n{}\n\n",
        n,
        c.document_id,
        c.page_number,
        c.section.as_deref().unwrap_or("unknown"),
        c.paragraph_index,
        hit.chunk.text.trim_end()
    )
}

const CONTEXT_HEADER: &str = "Building code excerpts:\n\n";

fn question_message(context: &str, query: &str) -> String {
    if context.is_empty() {
        format!("{}\n\nQuestion: {}", NO_CONTEXT_INSTRUCTION, query)
    } else {
        format!("{}{}Question: {}", CONTEXT_HEADER, context, query)
    }
}

/// Build the chat messages for `query` within `params.max_context_chars`.
pub fn assemble_prompt(
    query: &str,
    hits: &[RetrievalHit],
    history: &[ConversationTurn],
    params: &ComposerParams,
) -> Prompt {
    let mut ranked: Vec<&RetrievalHit> = hits.iter().collect();
    ranked.sort_by_key(|h| h.rank);

    let system = ChatMessage::new(MessageRole::System, SYSTEM_PROMPT);
    let mut used = system.chars()
        + CONTEXT_HEADER.chars().count()
        + "Question: ".len()
        + query.chars().count();

    let mut context = String::new();
    let mut included = Vec::new();
    for hit in &ranked {
        let block = format_context_block(included.len() + 1, hit);
        let cost = block.chars().count();
        if used + cost > params.max_context_chars {
            break;
        }
        used += cost;
        context.push_str(&block);
        included.push((*hit).clone());
    }
    let dropped = ranked.len() - included.len();
    if dropped > 0 {
        debug!(
            included = included.len(),
            dropped, "context budget exhausted; dropping lowest-ranked hits"
        );
    }

    let user = ChatMessage::new(MessageRole::User, question_message(&context, query));
    // The degraded message differs in length from the context one.
    let mut used = system.chars() + user.chars();

    let skip = history.len().saturating_sub(params.history_turns);
    let mut prior = Vec::new();
    for turn in history[skip..].iter().rev() {
        let cost = turn.text.chars().count();
        if used + cost > params.max_context_chars {
            break;
        }
        used += cost;
        prior.push(ChatMessage::new(turn.role.into(), turn.text.clone()));
    }
    prior.reverse();
    let history_included = prior.len();

    let mut messages = Vec::with_capacity(prior.len() + 2);
    messages.push(system);
    messages.extend(prior);
    messages.push(user);

    Prompt {
        messages,
        included,
        dropped,
        history_included,
    }
}

/// Tokens from a generation backend.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// A chat model that streams its answer token by token.
///
/// Dropping the returned stream must stop the backend from producing more
/// tokens.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    fn model_id(&self) -> &str;

    /// Start generating. Fails with [`Error::GenerationBackend`] if the
    /// backend cannot be reached; failures after the first token arrive as
    /// stream items.
    async fn generate(&self, messages: &[ChatMessage]) -> Result<TokenStream>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AnswerEvent {
    Token { text: String },
    /// Terminal. Sources of the completed answer.
    Citations { citations: Vec<Citation> },
    /// Terminal. The backend failed mid-stream; tokens already sent stand.
    Truncated { notice: String },
    /// Terminal. The caller cancelled generation.
    Cancelled,
}

/// A streamed answer. Yields tokens, then exactly one terminal event.
pub struct Answer {
    tokens: Abortable<TokenStream>,
    handle: AbortHandle,
    citations: Vec<Citation>,
    dropped: usize,
    finished: bool,
}

impl Answer {
    /// A handle that stops token consumption when aborted.
    pub fn cancel_handle(&self) -> AbortHandle {
        self.handle.clone()
    }

    pub fn cancel(&self) {
        self.handle.abort();
    }

    /// Number of hits in the prompt, i.e. the citations a completed answer
    /// will carry.
    pub fn included_hits(&self) -> usize {
        self.citations.len()
    }

    pub fn dropped_hits(&self) -> usize {
        self.dropped
    }
}

impl Stream for Answer {
    type Item = AnswerEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<AnswerEvent>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        match Pin::new(&mut this.tokens).poll_next(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Ok(text))) => Poll::Ready(Some(AnswerEvent::Token { text })),
            Poll::Ready(Some(Err(err))) => {
                this.finished = true;
                warn!(error = %err, "generation failed mid-stream; answer truncated");
                Poll::Ready(Some(AnswerEvent::Truncated {
                    notice: err.user_message(),
                }))
            }
            Poll::Ready(None) => {
                this.finished = true;
                if this.handle.is_aborted() {
                    debug!("answer cancelled");
                    Poll::Ready(Some(AnswerEvent::Cancelled))
                } else {
                    let citations = std::mem::take(&mut this.citations);
                    Poll::Ready(Some(AnswerEvent::Citations { citations }))
                }
            }
        }
    }
}

/// Assemble the prompt for `query` and start streaming the answer.
///
/// Empty `hits` is not an error: the prompt instructs the backend to say
/// that no relevant section was found, and the answer ends with an empty
/// citation list.
pub async fn compose<G: GenerationBackend + ?Sized>(
    backend: &G,
    query: &str,
    hits: &[RetrievalHit],
    history: &[ConversationTurn],
    params: &ComposerParams,
) -> Result<Answer> {
    let prompt = assemble_prompt(query, hits, history, params);
    debug!(
        model = backend.model_id(),
        hits = prompt.included.len(),
        history = prompt.history_included,
        chars = prompt.total_chars(),
        "sending prompt"
    );
    let tokens = backend.generate(&prompt.messages).await?;
    let (handle, registration) = AbortHandle::new_pair();
    Ok(Answer {
        tokens: Abortable::new(tokens, registration),
        handle,
        citations: prompt.citations(),
        dropped: prompt.dropped,
        finished: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Chunk;
    use futures_util::stream::{self, StreamExt};
    use std::sync::Mutex;

    struct ScriptedBackend {
        tokens: Vec<Result<String>>,
        seen: Mutex<Vec<ChatMessage>>,
    }

    impl ScriptedBackend {
        fn new(tokens: Vec<Result<String>>) -> Self {
            Self {
                tokens,
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl GenerationBackend for ScriptedBackend {
        fn model_id(&self) -> &str {
            "scripted"
        }
        async fn generate(&self, messages: &[ChatMessage]) -> Result<TokenStream> {
            *self.seen.lock().unwrap() = messages.to_vec();
            let items: Vec<Result<String>> = self
                .tokens
                .iter()
                .map(|t| match t {
                    Ok(s) => Ok(s.clone()),
                    Err(e) => Err(Error::GenerationBackend(e.to_string())),
                })
                .collect();
            Ok(Box::pin(stream::iter(items)))
        }
    }

    /// Emits one token, then never finishes.
    struct StallingBackend;

    #[async_trait]
    impl GenerationBackend for StallingBackend {
        fn model_id(&self) -> &str {
            "stalling"
        }
        async fn generate(&self, _messages: &[ChatMessage]) -> Result<TokenStream> {
            Ok(Box::pin(
                stream::iter(vec![Ok("Stairs".to_string())]).chain(stream::pending()),
            ))
        }
    }

    struct DownBackend;

    #[async_trait]
    impl GenerationBackend for DownBackend {
        fn model_id(&self) -> &str {
            "down"
        }
        async fn generate(&self, _messages: &[ChatMessage]) -> Result<TokenStream> {
            Err(Error::GenerationBackend("connection refused".into()))
        }
    }

    fn hit(rank: usize, page: u32, text: &str) -> RetrievalHit {
        let chunk = Chunk {
            id: format!("c{}", rank),
            document_id: "ibc".into(),
            page_number: page,
            section: Some(format!("10{}", rank)),
            paragraph_index: 0,
            text: text.to_string(),
            start: 0,
            end: text.chars().count(),
            hash: String::new(),
            prev_id: None,
            next_id: None,
        };
        RetrievalHit {
            citation: chunk.citation(),
            chunk,
            score: 1.0 / rank as f32,
            rank,
        }
    }

    async fn collect(answer: Answer) -> Vec<AnswerEvent> {
        answer.collect().await
    }

    #[test]
    fn test_prompt_includes_blocks_in_rank_order() {
        let hits = vec![hit(2, 8, "second"), hit(1, 4, "first")];
        let prompt = assemble_prompt("min width?", &hits, &[], &ComposerParams::default());
        let user = &prompt.messages.last().unwrap().content;
        let first = user.find("first").unwrap();
        let second = user.find("second").unwrap();
        assert!(first < second);
        assert!(user.contains("[1] Document: ibc | Page 4 | Section 101 | Paragraph 0"));
        assert!(user.ends_with("Question: min width?"));
        assert_eq!(prompt.messages[0].role, MessageRole::System);
    }

    #[test]
    fn test_budget_drops_lowest_ranked_whole_hits() {
        let hits = vec![
            hit(1, 1, &"a".repeat(100)),
            hit(2, 2, &"b".repeat(100)),
            hit(3, 3, &"c".repeat(100)),
        ];
        let one_block = format_context_block(1, &hits[0]).chars().count();
        let params = ComposerParams {
            max_context_chars: SYSTEM_PROMPT.len() + "Building code excerpts:\n\nQuestion: q".len()
                + one_block
                + one_block / 2,
            history_turns: 6,
        };
        let prompt = assemble_prompt("q", &hits, &[], &params);
        assert_eq!(prompt.included.len(), 1);
        assert_eq!(prompt.included[0].rank, 1);
        assert_eq!(prompt.dropped, 2);
        assert!(prompt.total_chars() <= params.max_context_chars);
        let user = &prompt.messages.last().unwrap().content;
        assert!(!user.contains(&"b".repeat(100)));
    }

    #[test]
    fn test_empty_hits_use_no_context_instruction() {
        let prompt = assemble_prompt("q", &[], &[], &ComposerParams::default());
        assert!(prompt.included.is_empty());
        assert!(prompt.messages[1].content.starts_with(NO_CONTEXT_INSTRUCTION));
    }

    #[test]
    fn test_history_newest_first_within_window() {
        let history = vec![
            ConversationTurn::user("old question"),
            ConversationTurn::assistant("old answer", vec![]),
            ConversationTurn::user("recent question"),
        ];
        let params = ComposerParams {
            history_turns: 2,
            ..Default::default()
        };
        let prompt = assemble_prompt("q", &[], &history, &params);
        assert_eq!(prompt.history_included, 2);
        assert_eq!(prompt.messages[1].content, "old answer");
        assert_eq!(prompt.messages[1].role, MessageRole::Assistant);
        assert_eq!(prompt.messages[2].content, "recent question");
    }

    #[tokio::test]
    async fn test_tokens_then_citations_of_included_hits() {
        let backend = ScriptedBackend::new(vec![Ok("Min ".into()), Ok("44 in.".into())]);
        let hits = vec![hit(1, 4, "Exit width 44 inches.")];
        let answer = compose(&backend, "exit width?", &hits, &[], &ComposerParams::default())
            .await
            .unwrap();
        assert_eq!(answer.included_hits(), 1);
        let events = collect(answer).await;
        assert_eq!(events.len(), 3);
        assert_eq!(
            events[0],
            AnswerEvent::Token {
                text: "Min ".into()
            }
        );
        match &events[2] {
            AnswerEvent::Citations { citations } => {
                assert_eq!(citations, &vec![hits[0].citation.clone()]);
            }
            other => panic!("expected citations, got {:?}", other),
        }
        let seen = backend.seen.lock().unwrap();
        assert!(seen[1].content.contains("Exit width 44 inches."));
    }

    #[tokio::test]
    async fn test_citations_exclude_dropped_hits() {
        let backend = ScriptedBackend::new(vec![Ok("ok".into())]);
        let hits = vec![hit(1, 1, &"a".repeat(50)), hit(2, 2, &"b".repeat(5000))];
        let params = ComposerParams {
            max_context_chars: 1500,
            history_turns: 0,
        };
        let events = collect(compose(&backend, "q", &hits, &[], &params).await.unwrap()).await;
        match events.last().unwrap() {
            AnswerEvent::Citations { citations } => {
                assert_eq!(citations.len(), 1);
                assert_eq!(citations[0].chunk_id, "c1");
            }
            other => panic!("expected citations, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_mid_stream_failure_truncates_without_citations() {
        let backend = ScriptedBackend::new(vec![
            Ok("Partial".into()),
            Err(Error::GenerationBackend("reset".into())),
            Ok("never".into()),
        ]);
        let hits = vec![hit(1, 1, "text")];
        let events =
            collect(compose(&backend, "q", &hits, &[], &ComposerParams::default()).await.unwrap())
                .await;
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], AnswerEvent::Truncated { .. }));
        assert!(!events
            .iter()
            .any(|e| matches!(e, AnswerEvent::Citations { .. })));
    }

    #[tokio::test]
    async fn test_backend_unreachable_is_error() {
        let err = compose(&DownBackend, "q", &[], &[], &ComposerParams::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::GenerationBackend(_)));
    }

    #[tokio::test]
    async fn test_cancel_stops_stream_without_citations() {
        let hits = vec![hit(1, 1, "text")];
        let mut answer = compose(&StallingBackend, "q", &hits, &[], &ComposerParams::default())
            .await
            .unwrap();
        let first = answer.next().await.unwrap();
        assert_eq!(
            first,
            AnswerEvent::Token {
                text: "Stairs".into()
            }
        );
        answer.cancel();
        assert_eq!(answer.next().await, Some(AnswerEvent::Cancelled));
        assert_eq!(answer.next().await, None);
    }

    #[tokio::test]
    async fn test_empty_hits_complete_with_empty_citations() {
        let backend = ScriptedBackend::new(vec![Ok("No relevant section.".into())]);
        let events =
            collect(compose(&backend, "q", &[], &[], &ComposerParams::default()).await.unwrap())
                .await;
        assert_eq!(
            events.last(),
            Some(&AnswerEvent::Citations { citations: vec![] })
        );
    }
}
