//! `bch ask` and `bch chat`: streamed, cited answers on the terminal.
//!
//! Tokens are printed as they arrive, followed by a numbered source list.
//! Ctrl-C stops generation without leaving the process; the partial answer
//! stays on screen and carries no sources. In `bch chat`, Ctrl-C at an idle
//! prompt ends the session.

use std::io::Write;

use anyhow::Result;
use futures_util::{Stream, StreamExt};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio::sync::mpsc;
use tracing::debug;

use buildcode_harness_core::compose::{compose, Answer, AnswerEvent};
use buildcode_harness_core::index::VectorIndex;
use buildcode_harness_core::models::{Citation, ConversationTurn};
use buildcode_harness_core::session::Conversation;

use crate::config::Config;
use crate::harness::{user_error, Harness};

/// How a rendered answer ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Completed(Vec<Citation>),
    Truncated(String),
    Cancelled,
}

/// Text and ending of one rendered answer.
#[derive(Debug, Clone, PartialEq)]
pub struct Rendered {
    pub text: String,
    pub outcome: Outcome,
}

impl Rendered {
    pub fn citations(&self) -> Vec<Citation> {
        match &self.outcome {
            Outcome::Completed(c) => c.clone(),
            _ => Vec::new(),
        }
    }
}

/// Write answer events to `out` as they arrive.
pub async fn render_answer<S, W>(mut events: S, out: &mut W) -> Result<Rendered>
where
    S: Stream<Item = AnswerEvent> + Unpin,
    W: Write,
{
    let mut text = String::new();
    let mut outcome = Outcome::Cancelled;
    while let Some(event) = events.next().await {
        match event {
            AnswerEvent::Token { text: token } => {
                write!(out, "{}", token)?;
                out.flush()?;
                text.push_str(&token);
            }
            AnswerEvent::Citations { citations } => {
                writeln!(out)?;
                if !citations.is_empty() {
                    writeln!(out)?;
                    writeln!(out, "Sources:")?;
                    for (i, citation) in citations.iter().enumerate() {
                        writeln!(out, "  [{}] {}", i + 1, citation)?;
                    }
                }
                outcome = Outcome::Completed(citations);
            }
            AnswerEvent::Truncated { notice } => {
                writeln!(out)?;
                writeln!(out, "[{}]", notice)?;
                outcome = Outcome::Truncated(notice);
            }
            AnswerEvent::Cancelled => {
                writeln!(out)?;
                writeln!(out, "[cancelled]")?;
                outcome = Outcome::Cancelled;
            }
        }
    }
    Ok(Rendered { text, outcome })
}

/// Ctrl-C presses for the lifetime of one command.
///
/// A single watcher owns the SIGINT handler, so every press is delivered
/// here whether an answer is streaming or the prompt is idle.
pub struct Interrupts {
    rx: mpsc::UnboundedReceiver<()>,
}

impl Interrupts {
    pub fn ctrl_c() -> Self {
        let (tx, interrupts) = Self::channel();
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                if tx.send(()).is_err() {
                    break;
                }
            }
        });
        interrupts
    }

    /// Interrupts fed by the returned sender instead of the terminal.
    pub fn channel() -> (mpsc::UnboundedSender<()>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }

    /// Resolves on the next press; pending forever once the source is gone.
    async fn next(&mut self) {
        if self.rx.recv().await.is_none() {
            std::future::pending::<()>().await;
        }
    }

    /// Forget presses that arrived while nothing was listening.
    fn drain(&mut self) {
        while self.rx.try_recv().is_ok() {}
    }
}

/// Render `answer`, cancelling it on the next interrupt.
pub async fn stream_answer<W: Write>(
    answer: Answer,
    interrupts: &mut Interrupts,
    out: &mut W,
) -> Result<Rendered> {
    let handle = answer.cancel_handle();
    let render = render_answer(answer, out);
    tokio::pin!(render);
    loop {
        tokio::select! {
            rendered = &mut render => return rendered,
            _ = interrupts.next() => handle.abort(),
        }
    }
}

/// Retrieve, compose, and render one answer on stdout.
async fn answer_once(
    harness: &Harness,
    query: &str,
    k: Option<usize>,
    history: &[ConversationTurn],
    interrupts: &mut Interrupts,
) -> Result<Rendered> {
    let hits = harness
        .retriever
        .retrieve(query, k, Some(history))
        .await
        .map_err(user_error)?;

    let answer = compose(
        harness.generator.as_ref(),
        query,
        &hits,
        history,
        &harness.config.composer_params(),
    )
    .await
    .map_err(user_error)?;
    debug!(
        retrieved = hits.len(),
        included = answer.included_hits(),
        dropped = answer.dropped_hits(),
        "prompt assembled"
    );

    interrupts.drain();
    let mut stdout = std::io::stdout();
    stream_answer(answer, interrupts, &mut stdout).await
}

async fn print_empty_notice(harness: &Harness) -> Result<bool> {
    if harness.index.stats().await.map_err(user_error)?.chunks == 0 {
        println!("No codes indexed yet. Run `bch ingest <path>` first.");
        return Ok(true);
    }
    Ok(false)
}

/// Read the next question. `None` on end of input or Ctrl-C.
pub async fn read_prompt<R>(
    lines: &mut Lines<R>,
    interrupts: &mut Interrupts,
) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    print!("> ");
    std::io::stdout().flush()?;
    tokio::select! {
        line = lines.next_line() => Ok(line?),
        _ = interrupts.next() => {
            println!();
            Ok(None)
        }
    }
}

/// `bch ask <question>`.
pub async fn run_ask(config: &Config, query: &str, k: Option<usize>) -> Result<()> {
    if query.trim().is_empty() {
        anyhow::bail!("question must not be empty");
    }
    let harness = Harness::open(config).await?;
    let result = match print_empty_notice(&harness).await {
        Ok(true) => Ok(()),
        Ok(false) => {
            let mut interrupts = Interrupts::ctrl_c();
            answer_once(&harness, query, k, &[], &mut interrupts)
                .await
                .map(|_| ())
        }
        Err(e) => Err(e),
    };
    harness.close().await;
    result
}

/// `bch chat`: a multi-turn session on stdin.
///
/// `/clear` forgets the conversation; `exit`, `quit`, or end of input ends it.
pub async fn run_chat(config: &Config, k: Option<usize>) -> Result<()> {
    let harness = Harness::open(config).await?;
    if print_empty_notice(&harness).await? {
        harness.close().await;
        return Ok(());
    }

    println!("Ask about the indexed building codes. Type /clear to start over, exit to quit.");
    let mut conversation = Conversation::new();
    let mut interrupts = Interrupts::ctrl_c();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = read_prompt(&mut lines, &mut interrupts).await? {
        let question = line.trim();
        match question {
            "" => continue,
            "exit" | "quit" => break,
            "/clear" => {
                conversation.clear();
                println!("(conversation cleared)");
                continue;
            }
            _ => {}
        }

        match answer_once(&harness, question, k, conversation.turns(), &mut interrupts).await {
            Ok(rendered) => {
                let citations = rendered.citations();
                conversation.record_user(question);
                conversation.record_assistant(rendered.text, citations);
            }
            // One failed question does not end the session.
            Err(e) => eprintln!("error: {}", e),
        }
        println!();
    }

    harness.close().await;
    Ok(())
}
