//! # Dispatcher
//!
//! Chooses an agent for each question, executes it, and applies the
//! fallback chain.
//!
//! Per-execution state machine:
//!
//! ```text
//! Classifying ──▶ Selecting ──▶ Running ──▶ Rendering ──▶ Done
//!                     ▲            │
//!                     └─ Retrying ◀┘  (recoverable failure, budget left)
//! ```
//!
//! Selection precedence: an explicit `agent_type` in the request bypasses
//! classification entirely; then the keyword classifier; then the
//! tenant's `default_agent_type`; only a still-ambiguous question costs
//! one terse LLM routing call, cached by question hash for ten minutes.
//! Recoverable failures walk the chain `postgres → knowledge_base →
//! fallback` within the retry and deadline budgets; fatal failures
//! surface immediately.
//!
//! [`dispatch_stream`](Dispatcher::dispatch_stream) runs the same
//! machinery but hands back the winning agent's delta stream instead of
//! a finished answer.

use crate::agent::{Agent, AgentRequest};
use crate::intent::{self, Intent, RoutingCache};
use crate::llm::{ChatMessage, CompletionParams, LlmProvider};
use crate::outcome::{AgentOutcome, Answer, AnswerStream, StreamedOutcome};
use askgate_core::registry::Generation;
use askgate_core::{
    AgentType, Error, ErrorCode, MetricsHandle, RequestContext, Result, TenantRuntime,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Sub-deadline for the LLM routing call.
const ROUTING_TIMEOUT: Duration = Duration::from_secs(5);
/// Routing verdict cache TTL.
const ROUTING_CACHE_TTL: Duration = Duration::from_secs(600);

/// Execution states, logged on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DispatchState {
    Classifying,
    Selecting,
    Running,
    Rendering,
    Retrying,
    Done,
}

pub struct Dispatcher {
    provider: Arc<dyn LlmProvider>,
    postgres: Arc<dyn Agent>,
    knowledge_base: Arc<dyn Agent>,
    fallback: Arc<dyn Agent>,
    routing_cache: RoutingCache,
    metrics: MetricsHandle,
}

impl Dispatcher {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        postgres: Arc<dyn Agent>,
        knowledge_base: Arc<dyn Agent>,
        fallback: Arc<dyn Agent>,
        metrics: MetricsHandle,
    ) -> Self {
        Self {
            provider,
            postgres,
            knowledge_base,
            fallback,
            routing_cache: RoutingCache::new(ROUTING_CACHE_TTL),
            metrics,
        }
    }

    fn agent_for(&self, kind: AgentType) -> &Arc<dyn Agent> {
        match kind {
            AgentType::KnowledgeBase => &self.knowledge_base,
            AgentType::Fallback => &self.fallback,
            _ => &self.postgres,
        }
    }

    /// Runs one chat question to completion.
    pub async fn dispatch(
        &self,
        ctx: &RequestContext,
        generation: &Generation,
        runtime: &TenantRuntime,
        requested: AgentType,
        request: &AgentRequest,
    ) -> Result<Answer> {
        let tenant_id = &runtime.config.id;
        let policy = generation.policy();
        let mut state = DispatchState::Classifying;
        debug!(tenant = %tenant_id, ?state, "dispatch started");

        let initial = self
            .select_initial(ctx, runtime, generation, requested, &request.question)
            .await?;
        state = DispatchState::Selecting;
        debug!(tenant = %tenant_id, ?state, agent = %initial, "agent selected");

        let chain = candidate_chain(initial, runtime);
        if chain.is_empty() {
            return Err(Error::new(
                ErrorCode::AgentDisabled,
                format!("no agent is enabled for tenant '{tenant_id}'"),
            ));
        }

        let mut attempts = 0u32;
        let mut last_error: Option<Error> = None;
        let mut remaining = chain.into_iter().peekable();

        while let Some(kind) = remaining.next() {
            if attempts >= policy.retry_count {
                break;
            }
            if ctx.expired() {
                return Err(Error::timeout("deadline exhausted during dispatch"));
            }
            attempts += 1;

            state = DispatchState::Running;
            debug!(tenant = %tenant_id, ?state, agent = %kind, attempt = attempts, "agent attempt");
            self.metrics
                .gateway
                .agent_attempts_total
                .with_label_values(&[tenant_id, kind.as_str()])
                .inc();

            let agent = self.agent_for(kind);
            let outcome = agent.answer(ctx, runtime, policy, request).await;

            match outcome {
                AgentOutcome::Success(answer) | AgentOutcome::Clarification(answer) => {
                    state = DispatchState::Rendering;
                    debug!(tenant = %tenant_id, ?state, agent = %kind, "answer ready");
                    self.metrics
                        .gateway
                        .requests_total
                        .with_label_values(&[tenant_id, kind.as_str(), "success"])
                        .inc();
                    state = DispatchState::Done;
                    debug!(tenant = %tenant_id, ?state, "dispatch finished");
                    return Ok(answer);
                }
                AgentOutcome::Recoverable(err) => {
                    warn!(
                        tenant = %tenant_id,
                        agent = %kind,
                        code = %err.code,
                        "recoverable agent failure: {}",
                        err.message
                    );
                    if let Some(next) = remaining.peek() {
                        state = DispatchState::Retrying;
                        debug!(tenant = %tenant_id, ?state, from = %kind, to = %next, "falling back");
                        self.metrics
                            .gateway
                            .agent_fallback_total
                            .with_label_values(&[tenant_id, kind.as_str(), next.as_str()])
                            .inc();
                    }
                    last_error = Some(err);
                }
                AgentOutcome::Fatal(err) => {
                    self.metrics
                        .gateway
                        .requests_total
                        .with_label_values(&[tenant_id, kind.as_str(), "fatal"])
                        .inc();
                    return Err(err);
                }
            }
        }

        let err = last_error.unwrap_or_else(|| {
            Error::new(ErrorCode::AgentUnavailable, "all agents exhausted without an answer")
        });
        self.metrics
            .gateway
            .requests_total
            .with_label_values(&[tenant_id, "none", "exhausted"])
            .inc();
        Err(err)
    }

    /// Streaming variant of [`dispatch`](Dispatcher::dispatch): same
    /// classification, selection, and fallback chain, but the winning
    /// agent's answer arrives as a delta stream. Fallback only applies to
    /// failures that happen before the stream starts; once deltas flow,
    /// errors travel inside the stream.
    pub async fn dispatch_stream(
        &self,
        ctx: &RequestContext,
        generation: &Generation,
        runtime: &TenantRuntime,
        requested: AgentType,
        request: &AgentRequest,
    ) -> Result<AnswerStream> {
        let tenant_id = &runtime.config.id;
        let policy = generation.policy();
        debug!(tenant = %tenant_id, "streaming dispatch started");

        let initial = self
            .select_initial(ctx, runtime, generation, requested, &request.question)
            .await?;
        debug!(tenant = %tenant_id, agent = %initial, "agent selected");

        let chain = candidate_chain(initial, runtime);
        if chain.is_empty() {
            return Err(Error::new(
                ErrorCode::AgentDisabled,
                format!("no agent is enabled for tenant '{tenant_id}'"),
            ));
        }

        let mut attempts = 0u32;
        let mut last_error: Option<Error> = None;
        let mut remaining = chain.into_iter().peekable();

        while let Some(kind) = remaining.next() {
            if attempts >= policy.retry_count {
                break;
            }
            if ctx.expired() {
                return Err(Error::timeout("deadline exhausted during dispatch"));
            }
            attempts += 1;

            debug!(tenant = %tenant_id, agent = %kind, attempt = attempts, "streaming agent attempt");
            self.metrics
                .gateway
                .agent_attempts_total
                .with_label_values(&[tenant_id, kind.as_str()])
                .inc();

            let agent = self.agent_for(kind);
            match agent.answer_stream(ctx, runtime, policy, request).await {
                StreamedOutcome::Stream(stream) => {
                    self.metrics
                        .gateway
                        .requests_total
                        .with_label_values(&[tenant_id, kind.as_str(), "streamed"])
                        .inc();
                    return Ok(stream);
                }
                StreamedOutcome::Recoverable(err) => {
                    warn!(
                        tenant = %tenant_id,
                        agent = %kind,
                        code = %err.code,
                        "recoverable streaming failure: {}",
                        err.message
                    );
                    if let Some(next) = remaining.peek() {
                        debug!(tenant = %tenant_id, from = %kind, to = %next, "falling back");
                        self.metrics
                            .gateway
                            .agent_fallback_total
                            .with_label_values(&[tenant_id, kind.as_str(), next.as_str()])
                            .inc();
                    }
                    last_error = Some(err);
                }
                StreamedOutcome::Fatal(err) => {
                    self.metrics
                        .gateway
                        .requests_total
                        .with_label_values(&[tenant_id, kind.as_str(), "fatal"])
                        .inc();
                    return Err(err);
                }
            }
        }

        let err = last_error.unwrap_or_else(|| {
            Error::new(ErrorCode::AgentUnavailable, "all agents exhausted without an answer")
        });
        self.metrics
            .gateway
            .requests_total
            .with_label_values(&[tenant_id, "none", "exhausted"])
            .inc();
        Err(err)
    }

    /// Picks the first agent to try.
    async fn select_initial(
        &self,
        ctx: &RequestContext,
        runtime: &TenantRuntime,
        generation: &Generation,
        requested: AgentType,
        question: &str,
    ) -> Result<AgentType> {
        // explicit request bypasses classification, but not policy
        if requested != AgentType::Auto {
            if !runtime.config.agent_enabled(requested) {
                return Err(Error::new(
                    ErrorCode::AgentDisabled,
                    format!(
                        "agent '{requested}' is disabled for tenant '{}'",
                        runtime.config.id
                    ),
                ));
            }
            return Ok(requested);
        }

        match intent::classify(question) {
            Intent::Structured if runtime.config.agent_enabled(AgentType::Postgres) => {
                Ok(AgentType::Postgres)
            }
            Intent::Unstructured if runtime.config.agent_enabled(AgentType::KnowledgeBase) => {
                Ok(AgentType::KnowledgeBase)
            }
            Intent::Structured | Intent::Unstructured => Ok(generation.policy().fallback_agent),
            Intent::Ambiguous => {
                if let Some(preferred) = runtime.config.settings.default_agent_type {
                    if runtime.config.agent_enabled(preferred) {
                        return Ok(preferred);
                    }
                }
                Ok(self.route_with_llm(ctx, runtime, generation, question).await)
            }
        }
    }

    /// One cached, time-boxed LLM routing call. Any failure routes to the
    /// policy fallback agent rather than failing the request.
    async fn route_with_llm(
        &self,
        ctx: &RequestContext,
        runtime: &TenantRuntime,
        generation: &Generation,
        question: &str,
    ) -> AgentType {
        if let Some(cached) = self.routing_cache.get(question) {
            debug!(agent = %cached, "routing cache hit");
            return cached;
        }

        let messages = vec![
            ChatMessage::system(
                "Route the user's question to exactly one backend. Answer with one word: \
                 'postgres' for questions over business records (counts, sums, lookups), \
                 'knowledge_base' for questions answered by documents or policies.",
            ),
            ChatMessage::user(question.to_string()),
        ];
        let params = CompletionParams {
            model: runtime.config.model(generation.policy()).to_string(),
            temperature: 0.0,
            max_tokens: 8,
        };

        let verdict = ctx
            .run_until(
                ctx.sub_deadline(ROUTING_TIMEOUT),
                self.provider.complete(ctx, &messages, &params),
            )
            .await;

        let agent = match verdict {
            Ok(completion) => {
                let text = completion.text.to_lowercase();
                if text.contains("knowledge") {
                    AgentType::KnowledgeBase
                } else if text.contains("postgres") {
                    AgentType::Postgres
                } else {
                    generation.policy().fallback_agent
                }
            }
            Err(err) => {
                warn!("routing call failed, using fallback agent: {}", err.message);
                generation.policy().fallback_agent
            }
        };

        let agent = if runtime.config.agent_enabled(agent) {
            agent
        } else {
            generation.policy().fallback_agent
        };

        self.routing_cache.put(question, agent);
        info!(agent = %agent, "question routed by LLM");
        agent
    }
}

/// Builds the attempt chain: the selected agent first, then the remaining
/// enabled agents in canonical fallback order.
fn candidate_chain(initial: AgentType, runtime: &TenantRuntime) -> Vec<AgentType> {
    let canonical = [AgentType::Postgres, AgentType::KnowledgeBase, AgentType::Fallback];
    let mut chain = Vec::with_capacity(3);
    if runtime.config.agent_enabled(initial) {
        chain.push(initial);
    }
    for kind in canonical {
        if kind != initial && runtime.config.agent_enabled(kind) {
            chain.push(kind);
        }
    }
    chain
}

#[cfg(test)]
mod tests {
    use super::*;
    use askgate_core::{TenantRegistry, TenantsDocument};

    const DOC: &str = r#"
tenants:
  company-a:
    name: "Company A"
    database: {host: localhost, port: 5432, database: a, user: u, password: p}
    knowledge_base:
      {id: kb-1, prefix: company-a/, bucket: kb, region: ap-southeast-1, search_type: SEMANTIC, max_results: 5}
global_settings:
  llm: {endpoint: "http://llm:8081/v1", model: qa-large}
"#;

    fn runtime() -> Arc<TenantRuntime> {
        TenantRegistry::load(TenantsDocument::parse(DOC).unwrap())
            .snapshot()
            .runtime("company-a")
            .unwrap()
    }

    #[test]
    fn chain_starts_at_selection_and_ends_at_fallback() {
        let rt = runtime();
        assert_eq!(
            candidate_chain(AgentType::KnowledgeBase, &rt),
            vec![AgentType::KnowledgeBase, AgentType::Postgres, AgentType::Fallback]
        );
        assert_eq!(
            candidate_chain(AgentType::Postgres, &rt),
            vec![AgentType::Postgres, AgentType::KnowledgeBase, AgentType::Fallback]
        );
    }

    #[test]
    fn disabled_agents_drop_out_of_the_chain() {
        let doc = DOC.replace(
            "    knowledge_base:\n",
            "    settings: {enable_knowledge_base_agent: false}\n    knowledge_base:\n",
        );
        let rt = TenantRegistry::load(TenantsDocument::parse(&doc).unwrap())
            .snapshot()
            .runtime("company-a")
            .unwrap();
        assert_eq!(
            candidate_chain(AgentType::Postgres, &rt),
            vec![AgentType::Postgres, AgentType::Fallback]
        );
    }
}
