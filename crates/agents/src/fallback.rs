//! Generative fallback agent.
//!
//! Best-effort free-form answer with a disclaimer that no tenant data was
//! consulted. No IO beyond the single LLM call. Its output is a raw model
//! completion, so this is the one agent that streams provider deltas
//! directly instead of chunking a rendered answer.

use crate::agent::{Agent, AgentRequest};
use crate::llm::{ChatMessage, CompletionParams, LlmProvider};
use crate::outcome::{AgentOutcome, Answer, AnswerStream, StreamedOutcome};
use askgate_core::{AgentType, GlobalSettings, RequestContext, TenantRuntime};
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;

fn disclaimer(language: &str) -> &'static str {
    if language.eq_ignore_ascii_case("th") {
        "คำตอบนี้มาจากความรู้ทั่วไป ไม่ได้อ้างอิงข้อมูลภายในขององค์กร\n\n"
    } else {
        "This answer comes from general knowledge and does not reference your organization's data.\n\n"
    }
}

pub struct FallbackAgent {
    provider: Arc<dyn LlmProvider>,
}

impl FallbackAgent {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self { provider }
    }

    fn build_call(
        &self,
        runtime: &TenantRuntime,
        global: &GlobalSettings,
        request: &AgentRequest,
    ) -> (Vec<ChatMessage>, CompletionParams) {
        let language = &runtime.config.settings.response_language;
        let messages = vec![
            ChatMessage::system(format!(
                "You are a helpful assistant for {}. You have no access to company data; \
                 answer from general knowledge only, in '{language}'.",
                runtime.config.name
            )),
            ChatMessage::user(request.question.clone()),
        ];
        let params = CompletionParams {
            model: runtime.config.model(global).to_string(),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };
        (messages, params)
    }
}

#[async_trait]
impl Agent for FallbackAgent {
    fn kind(&self) -> AgentType {
        AgentType::Fallback
    }

    async fn answer(
        &self,
        ctx: &RequestContext,
        runtime: &TenantRuntime,
        global: &GlobalSettings,
        request: &AgentRequest,
    ) -> AgentOutcome {
        let language = &runtime.config.settings.response_language;
        let (messages, params) = self.build_call(runtime, global, request);

        match self.provider.complete(ctx, &messages, &params).await {
            Ok(completion) => {
                let text = format!("{}{}", disclaimer(language), completion.text);
                AgentOutcome::Success(
                    Answer::new(AgentType::Fallback, text).with_usage(completion.usage),
                )
            }
            Err(err) => AgentOutcome::from_error(err),
        }
    }

    async fn answer_stream(
        &self,
        ctx: &RequestContext,
        runtime: &TenantRuntime,
        global: &GlobalSettings,
        request: &AgentRequest,
    ) -> StreamedOutcome {
        let language = &runtime.config.settings.response_language;
        let (messages, params) = self.build_call(runtime, global, request);

        // provider.stream fails before the first delta, so the dispatcher
        // can still fall back when the provider is down
        match self.provider.stream(ctx, &messages, &params).await {
            Ok(deltas) => {
                let lead = disclaimer(language).to_string();
                let deltas = futures::stream::iter([Ok(lead)]).chain(deltas);
                StreamedOutcome::Stream(AnswerStream {
                    agent: AgentType::Fallback,
                    deltas: Box::pin(deltas),
                })
            }
            Err(err) => StreamedOutcome::from_error(err),
        }
    }
}
