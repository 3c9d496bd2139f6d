//! Agent execution outcomes.
//!
//! Agents never use errors for control flow. Every execution produces
//! exactly one [`AgentOutcome`] (or, on the streaming path, one
//! [`StreamedOutcome`]); the dispatcher consumes recoverable failures by
//! moving on to the next candidate agent, while fatal ones surface to
//! the façade unchanged.

use crate::llm::DeltaStream;
use askgate_core::{AgentType, Error};
use futures::StreamExt;
use serde::Serialize;

/// Token usage accumulated over one agent execution.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }

    pub fn add(&mut self, other: TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
    }
}

/// A rendered answer ready for the chat envelope.
#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub text: String,
    pub agent: AgentType,
    /// Tables the SQL agent read from, empty for other agents.
    pub tables_used: Vec<String>,
    /// Rows the SQL agent returned, when applicable.
    pub rows_returned: Option<u64>,
    pub usage: TokenUsage,
}

impl Answer {
    pub fn new(agent: AgentType, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            agent,
            tables_used: Vec::new(),
            rows_returned: None,
            usage: TokenUsage::default(),
        }
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = usage;
        self
    }

    /// Post-hoc delta stream for agents whose answer only exists once
    /// execution and rendering are done (SQL, retrieval). Concatenating
    /// the deltas reproduces `text` exactly.
    pub fn into_stream(self, target: usize) -> AnswerStream {
        let agent = self.agent;
        let deltas = futures::stream::iter(split_text(&self.text, target).into_iter().map(Ok));
        AnswerStream {
            agent,
            deltas: Box::pin(deltas),
        }
    }
}

/// An answer being produced incrementally.
pub struct AnswerStream {
    pub agent: AgentType,
    pub deltas: DeltaStream,
}

impl AnswerStream {
    /// Drains the stream and rebuilds the full text. Test helper; the
    /// façade forwards deltas without collecting.
    pub async fn collect_text(mut self) -> askgate_core::Result<String> {
        let mut out = String::new();
        while let Some(delta) = self.deltas.next().await {
            out.push_str(&delta?);
        }
        Ok(out)
    }
}

/// Result of one streaming agent execution. The fallback chain can only
/// consume failures that happen before the first delta; once a stream
/// has started, errors travel inside it.
pub enum StreamedOutcome {
    Stream(AnswerStream),
    Recoverable(Error),
    Fatal(Error),
}

impl StreamedOutcome {
    pub fn from_error(err: Error) -> Self {
        if err.is_transient() {
            StreamedOutcome::Recoverable(err)
        } else {
            StreamedOutcome::Fatal(err)
        }
    }
}

/// Splits text into streamable pieces on word boundaries, each at least
/// `target` bytes. Concatenation is the identity.
pub fn split_text(text: &str, target: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    for word in text.split_inclusive(char::is_whitespace) {
        current.push_str(word);
        if current.len() >= target {
            out.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

/// Result of one agent execution.
#[derive(Debug)]
pub enum AgentOutcome {
    /// A complete answer.
    Success(Answer),
    /// A clarifying question for the user. Bypasses the error path and is
    /// delivered as normal assistant content.
    Clarification(Answer),
    /// Failed, but another agent may still answer.
    Recoverable(Error),
    /// Failed in a way no other agent can repair.
    Fatal(Error),
}

impl AgentOutcome {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AgentOutcome::Success(_) | AgentOutcome::Clarification(_) | AgentOutcome::Fatal(_)
        )
    }

    /// Classifies an error by its transience.
    pub fn from_error(err: Error) -> Self {
        if err.is_transient() {
            AgentOutcome::Recoverable(err)
        } else {
            AgentOutcome::Fatal(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_text_concatenation_is_identity() {
        let text = "The answer is **42** (count).\n\n_Source: tables employees · 1 rows_";
        let pieces = split_text(text, 8);
        assert!(pieces.len() > 1);
        assert_eq!(pieces.concat(), text);

        // languages without spaces stream as one piece, never corrupted
        let thai = "คำตอบคือ42";
        assert_eq!(split_text(thai, 8).concat(), thai);
    }

    #[tokio::test]
    async fn answer_stream_round_trips_the_text() {
        let answer = Answer::new(AgentType::Postgres, "one two three four five six");
        let text = answer.clone().into_stream(4).collect_text().await.unwrap();
        assert_eq!(text, answer.text);
    }
}
