//! The agent seam.

use crate::outcome::{AgentOutcome, StreamedOutcome};
use askgate_core::{AgentType, GlobalSettings, RequestContext, TenantRuntime};
use async_trait::async_trait;

/// Target size of one streamed delta for answers chunked after the fact.
pub const STREAM_DELTA_BYTES: usize = 48;

/// Inputs for one agent execution. Overrides are already clamped to the
/// tenant's policy by the façade.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub question: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// A specialized question-answerer.
#[async_trait]
pub trait Agent: Send + Sync {
    fn kind(&self) -> AgentType;

    async fn answer(
        &self,
        ctx: &RequestContext,
        runtime: &TenantRuntime,
        global: &GlobalSettings,
        request: &AgentRequest,
    ) -> AgentOutcome;

    /// Streaming execution. The default runs [`answer`](Agent::answer) to
    /// completion and chunks the rendered text — the only possible
    /// semantics for agents that must execute and render before any text
    /// exists. Agents whose answer is a raw model completion override
    /// this and forward provider deltas as they arrive.
    async fn answer_stream(
        &self,
        ctx: &RequestContext,
        runtime: &TenantRuntime,
        global: &GlobalSettings,
        request: &AgentRequest,
    ) -> StreamedOutcome {
        match self.answer(ctx, runtime, global, request).await {
            AgentOutcome::Success(answer) | AgentOutcome::Clarification(answer) => {
                StreamedOutcome::Stream(answer.into_stream(STREAM_DELTA_BYTES))
            }
            AgentOutcome::Recoverable(err) => StreamedOutcome::Recoverable(err),
            AgentOutcome::Fatal(err) => StreamedOutcome::Fatal(err),
        }
    }
}
