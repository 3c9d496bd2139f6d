//! Dispatcher fallback-chain behavior with scripted agents.

use askgate_agents::agent::{Agent, AgentRequest};
use askgate_agents::dispatch::Dispatcher;
use askgate_agents::llm::MockProvider;
use askgate_agents::outcome::{AgentOutcome, Answer};
use askgate_core::{
    AgentType, Error, ErrorCode, GlobalSettings, MetricsHandle, RequestContext, TenantRegistry,
    TenantRuntime, TenantsDocument,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const DOC: &str = r#"
tenants:
  company-a:
    name: "Company A"
    database: {host: localhost, port: 5432, database: a, user: u, password: p}
    knowledge_base:
      {id: kb-1, prefix: company-a/, bucket: kb, region: ap-southeast-1, search_type: SEMANTIC, max_results: 5}
global_settings:
  retry_count: 3
  llm: {endpoint: "http://llm:8081/v1", model: qa-large}
"#;

/// An agent that replays a fixed outcome and counts invocations.
struct ScriptedAgent {
    kind: AgentType,
    outcomes: std::sync::Mutex<Vec<AgentOutcome>>,
    calls: AtomicUsize,
}

impl ScriptedAgent {
    fn new(kind: AgentType, outcomes: Vec<AgentOutcome>) -> Arc<Self> {
        Arc::new(Self {
            kind,
            outcomes: std::sync::Mutex::new(outcomes),
            calls: AtomicUsize::new(0),
        })
    }

    fn succeeding(kind: AgentType, text: &str) -> Arc<Self> {
        Self::new(
            kind,
            vec![AgentOutcome::Success(Answer::new(kind, text.to_string()))],
        )
    }

    fn recoverable(kind: AgentType) -> Arc<Self> {
        Self::new(
            kind,
            vec![AgentOutcome::Recoverable(Error::new(
                ErrorCode::DbUnavailable,
                "scripted transient failure",
            ))],
        )
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    fn kind(&self) -> AgentType {
        self.kind
    }

    async fn answer(
        &self,
        _ctx: &RequestContext,
        _runtime: &TenantRuntime,
        _global: &GlobalSettings,
        _request: &AgentRequest,
    ) -> AgentOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut outcomes = self.outcomes.lock().unwrap();
        if outcomes.len() > 1 {
            outcomes.remove(0)
        } else if let Some(first) = outcomes.first() {
            // replay the final outcome forever
            match first {
                AgentOutcome::Success(a) => AgentOutcome::Success(a.clone()),
                AgentOutcome::Clarification(a) => AgentOutcome::Clarification(a.clone()),
                AgentOutcome::Recoverable(e) => AgentOutcome::Recoverable(e.clone()),
                AgentOutcome::Fatal(e) => AgentOutcome::Fatal(e.clone()),
            }
        } else {
            AgentOutcome::Fatal(Error::internal("script exhausted"))
        }
    }
}

struct Harness {
    dispatcher: Dispatcher,
    registry: TenantRegistry,
    postgres: Arc<ScriptedAgent>,
    knowledge_base: Arc<ScriptedAgent>,
    fallback: Arc<ScriptedAgent>,
}

impl Harness {
    fn new(
        postgres: Arc<ScriptedAgent>,
        knowledge_base: Arc<ScriptedAgent>,
        fallback: Arc<ScriptedAgent>,
    ) -> Self {
        let metrics = MetricsHandle::new("askgate_test").unwrap();
        let provider = Arc::new(MockProvider::scripted(&["postgres"]));
        let dispatcher = Dispatcher::new(
            provider,
            postgres.clone(),
            knowledge_base.clone(),
            fallback.clone(),
            metrics,
        );
        let registry = TenantRegistry::load(TenantsDocument::parse(DOC).unwrap());
        Self {
            dispatcher,
            registry,
            postgres,
            knowledge_base,
            fallback,
        }
    }

    async fn ask(&self, question: &str, requested: AgentType) -> askgate_core::Result<Answer> {
        let generation = self.registry.snapshot();
        let runtime = generation.runtime("company-a").unwrap();
        let (ctx, _guard) = RequestContext::new("req-t", "company-a", Duration::from_secs(30));
        let request = AgentRequest {
            question: question.to_string(),
            max_tokens: 256,
            temperature: 0.2,
        };
        self.dispatcher
            .dispatch(&ctx, &generation, &runtime, requested, &request)
            .await
    }

    /// Streaming dispatch, drained back into full text.
    async fn ask_streamed(
        &self,
        question: &str,
        requested: AgentType,
    ) -> askgate_core::Result<(AgentType, String)> {
        let generation = self.registry.snapshot();
        let runtime = generation.runtime("company-a").unwrap();
        let (ctx, _guard) = RequestContext::new("req-s", "company-a", Duration::from_secs(30));
        let request = AgentRequest {
            question: question.to_string(),
            max_tokens: 256,
            temperature: 0.2,
        };
        let stream = self
            .dispatcher
            .dispatch_stream(&ctx, &generation, &runtime, requested, &request)
            .await?;
        let agent = stream.agent;
        Ok((agent, stream.collect_text().await?))
    }
}

#[tokio::test]
async fn structured_question_goes_to_postgres() {
    let h = Harness::new(
        ScriptedAgent::succeeding(AgentType::Postgres, "42 employees"),
        ScriptedAgent::succeeding(AgentType::KnowledgeBase, "unused"),
        ScriptedAgent::succeeding(AgentType::Fallback, "unused"),
    );
    let answer = h.ask("How many employees are in IT?", AgentType::Auto).await.unwrap();
    assert_eq!(answer.text, "42 employees");
    assert_eq!(h.postgres.calls(), 1);
    assert_eq!(h.knowledge_base.calls(), 0);
    assert_eq!(h.fallback.calls(), 0);
}

#[tokio::test]
async fn recoverable_failure_walks_the_chain() {
    let h = Harness::new(
        ScriptedAgent::recoverable(AgentType::Postgres),
        ScriptedAgent::recoverable(AgentType::KnowledgeBase),
        ScriptedAgent::succeeding(AgentType::Fallback, "best effort"),
    );
    let answer = h.ask("How many employees are in IT?", AgentType::Auto).await.unwrap();
    assert_eq!(answer.agent, AgentType::Fallback);
    assert_eq!(h.postgres.calls(), 1);
    assert_eq!(h.knowledge_base.calls(), 1);
    assert_eq!(h.fallback.calls(), 1);
}

#[tokio::test]
async fn fatal_failure_surfaces_without_fallback() {
    let h = Harness::new(
        ScriptedAgent::new(
            AgentType::Postgres,
            vec![AgentOutcome::Fatal(Error::new(
                ErrorCode::SqlRejected,
                "generated SQL failed the safety gate",
            ))],
        ),
        ScriptedAgent::succeeding(AgentType::KnowledgeBase, "unused"),
        ScriptedAgent::succeeding(AgentType::Fallback, "unused"),
    );
    let err = h
        .ask("How many employees are in IT?", AgentType::Auto)
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::SqlRejected);
    assert_eq!(h.fallback.calls(), 0);
    assert_eq!(h.knowledge_base.calls(), 0);
}

#[tokio::test]
async fn retry_budget_caps_total_attempts() {
    // retry_count = 2: only two agents may run even though three exist
    let doc = DOC.replace("retry_count: 3", "retry_count: 2");
    let postgres = ScriptedAgent::recoverable(AgentType::Postgres);
    let kb = ScriptedAgent::recoverable(AgentType::KnowledgeBase);
    let fallback = ScriptedAgent::succeeding(AgentType::Fallback, "never reached");

    let metrics = MetricsHandle::new("askgate_test2").unwrap();
    let provider = Arc::new(MockProvider::scripted(&["postgres"]));
    let dispatcher = Dispatcher::new(
        provider,
        postgres.clone(),
        kb.clone(),
        fallback.clone(),
        metrics,
    );
    let registry = TenantRegistry::load(TenantsDocument::parse(&doc).unwrap());
    let generation = registry.snapshot();
    let runtime = generation.runtime("company-a").unwrap();
    let (ctx, _guard) = RequestContext::new("req-b", "company-a", Duration::from_secs(30));
    let request = AgentRequest {
        question: "How many employees are in IT?".to_string(),
        max_tokens: 256,
        temperature: 0.2,
    };

    let err = dispatcher
        .dispatch(&ctx, &generation, &runtime, AgentType::Auto, &request)
        .await
        .unwrap_err();
    assert!(err.is_transient());
    assert_eq!(postgres.calls() + kb.calls() + fallback.calls(), 2);
    assert_eq!(fallback.calls(), 0);
}

#[tokio::test]
async fn streamed_dispatch_concatenates_to_the_answer() {
    let h = Harness::new(
        ScriptedAgent::succeeding(
            AgentType::Postgres,
            "The answer is **42** (count).\n\n_Source: tables employees · 1 rows_",
        ),
        ScriptedAgent::succeeding(AgentType::KnowledgeBase, "unused"),
        ScriptedAgent::succeeding(AgentType::Fallback, "unused"),
    );
    let answer = h.ask("How many employees are in IT?", AgentType::Auto).await.unwrap();
    let (agent, streamed) = h
        .ask_streamed("How many employees are in IT?", AgentType::Auto)
        .await
        .unwrap();
    assert_eq!(agent, AgentType::Postgres);
    assert_eq!(streamed, answer.text);
}

#[tokio::test]
async fn streaming_failures_before_first_delta_walk_the_chain() {
    let h = Harness::new(
        ScriptedAgent::recoverable(AgentType::Postgres),
        ScriptedAgent::recoverable(AgentType::KnowledgeBase),
        ScriptedAgent::succeeding(AgentType::Fallback, "best effort"),
    );
    let (agent, streamed) = h
        .ask_streamed("How many employees are in IT?", AgentType::Auto)
        .await
        .unwrap();
    assert_eq!(agent, AgentType::Fallback);
    assert_eq!(streamed, "best effort");
    assert_eq!(h.postgres.calls(), 1);
    assert_eq!(h.knowledge_base.calls(), 1);
}

#[tokio::test]
async fn explicit_agent_type_bypasses_classification() {
    let h = Harness::new(
        ScriptedAgent::succeeding(AgentType::Postgres, "unused"),
        ScriptedAgent::succeeding(AgentType::KnowledgeBase, "from the docs [p-1]"),
        ScriptedAgent::succeeding(AgentType::Fallback, "unused"),
    );
    // a clearly structured question still goes to the KB when asked to
    let answer = h
        .ask("How many employees are in IT?", AgentType::KnowledgeBase)
        .await
        .unwrap();
    assert_eq!(answer.agent, AgentType::KnowledgeBase);
    assert_eq!(h.postgres.calls(), 0);
}

#[tokio::test]
async fn disabled_explicit_agent_is_a_policy_error() {
    let doc = DOC.replace(
        "    knowledge_base:\n",
        "    settings: {enable_knowledge_base_agent: false}\n    knowledge_base:\n",
    );
    let postgres = ScriptedAgent::succeeding(AgentType::Postgres, "unused");
    let kb = ScriptedAgent::succeeding(AgentType::KnowledgeBase, "unused");
    let fallback = ScriptedAgent::succeeding(AgentType::Fallback, "unused");

    let metrics = MetricsHandle::new("askgate_test3").unwrap();
    let provider = Arc::new(MockProvider::scripted(&["postgres"]));
    let dispatcher = Dispatcher::new(
        provider,
        postgres.clone(),
        kb.clone(),
        fallback.clone(),
        metrics,
    );
    let registry = TenantRegistry::load(TenantsDocument::parse(&doc).unwrap());
    let generation = registry.snapshot();
    let runtime = generation.runtime("company-a").unwrap();
    let (ctx, _guard) = RequestContext::new("req-c", "company-a", Duration::from_secs(30));
    let request = AgentRequest {
        question: "อธิบายนโยบายการลางาน".to_string(),
        max_tokens: 256,
        temperature: 0.2,
    };

    let err = dispatcher
        .dispatch(&ctx, &generation, &runtime, AgentType::KnowledgeBase, &request)
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::AgentDisabled);
    assert_eq!(kb.calls(), 0);
}

#[tokio::test]
async fn unstructured_question_with_kb_disabled_lands_on_fallback() {
    // spec scenario: Thai policy question, KB disabled, no SQL executed
    let doc = DOC.replace(
        "    knowledge_base:\n",
        "    settings: {enable_knowledge_base_agent: false}\n    knowledge_base:\n",
    );
    let postgres = ScriptedAgent::succeeding(AgentType::Postgres, "unused");
    let kb = ScriptedAgent::succeeding(AgentType::KnowledgeBase, "unused");
    let fallback = ScriptedAgent::succeeding(AgentType::Fallback, "general answer");

    let metrics = MetricsHandle::new("askgate_test4").unwrap();
    let provider = Arc::new(MockProvider::scripted(&["postgres"]));
    let dispatcher = Dispatcher::new(
        provider,
        postgres.clone(),
        kb.clone(),
        fallback.clone(),
        metrics,
    );
    let registry = TenantRegistry::load(TenantsDocument::parse(&doc).unwrap());
    let generation = registry.snapshot();
    let runtime = generation.runtime("company-a").unwrap();
    let (ctx, _guard) = RequestContext::new("req-d", "company-a", Duration::from_secs(30));
    let request = AgentRequest {
        question: "อธิบายนโยบายการลางาน".to_string(),
        max_tokens: 256,
        temperature: 0.2,
    };

    let answer = dispatcher
        .dispatch(&ctx, &generation, &runtime, AgentType::Auto, &request)
        .await
        .unwrap();
    assert_eq!(answer.agent, AgentType::Fallback);
    assert_eq!(postgres.calls(), 0);
    assert_eq!(kb.calls(), 0);
}
