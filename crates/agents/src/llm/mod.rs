//! LLM provider abstraction.
//!
//! One call surface over whichever completion service backs a tenant.
//! The concrete [`openai::OpenAiCompatProvider`] speaks the de-facto
//! OpenAI chat wire format; [`mock::MockProvider`] scripts completions
//! for tests. Retries, deadline propagation, and per-tenant token
//! accounting all live behind this trait so agents stay oblivious.

pub mod mock;
pub mod openai;

pub use mock::MockProvider;
pub use openai::OpenAiCompatProvider;

use crate::outcome::TokenUsage;
use askgate_core::{RequestContext, Result};
use async_trait::async_trait;
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

/// Message role on the provider wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One chat message sent to (or received from) the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

/// Generation parameters for one call.
#[derive(Debug, Clone)]
pub struct CompletionParams {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// A finished completion with its token usage.
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub usage: TokenUsage,
}

/// Streamed completion deltas, in model order.
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Unified completion surface.
///
/// Implementations must propagate the caller's deadline: a cancelled or
/// expired context returns before the next network IO. 5xx and connection
/// errors are transient; 4xx are permanent.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn complete(
        &self,
        ctx: &RequestContext,
        messages: &[ChatMessage],
        params: &CompletionParams,
    ) -> Result<Completion>;

    async fn stream(
        &self,
        ctx: &RequestContext,
        messages: &[ChatMessage],
        params: &CompletionParams,
    ) -> Result<DeltaStream>;
}
