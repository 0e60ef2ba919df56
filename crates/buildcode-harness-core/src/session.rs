//! Conversation history for multi-turn question answering.

use crate::models::{Citation, ConversationTurn};

/// An append-only list of turns for one chat session.
///
/// The composer only ever sees a bounded window of recent turns, so the
/// conversation itself is not capped.
#[derive(Debug, Clone, Default)]
pub struct Conversation {
    turns: Vec<ConversationTurn>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_user(&mut self, text: impl Into<String>) {
        self.turns.push(ConversationTurn::user(text));
    }

    /// Record an answer. Interrupted answers are recorded too, so the next
    /// turn can refer back to what the user actually saw.
    pub fn record_assistant(&mut self, text: impl Into<String>, citations: Vec<Citation>) {
        self.turns.push(ConversationTurn::assistant(text, citations));
    }

    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }
}
