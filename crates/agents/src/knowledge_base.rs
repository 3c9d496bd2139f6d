//! Knowledge-base agent: prefixed retrieval plus cited synthesis.
//!
//! Retrieval goes to the managed service with the tenant's binding
//! (`kb_id`, `prefix`, search type, `top_k = max_results`); isolation
//! holds because the prefix comes from tenant config, never the request.
//! The synthesis prompt requires passage-id citations so every claim in
//! the answer is traceable.

use crate::agent::{Agent, AgentRequest};
use crate::llm::{ChatMessage, CompletionParams, LlmProvider};
use crate::outcome::{AgentOutcome, Answer};
use askgate_core::{
    AgentType, Error, ErrorCode, GlobalSettings, MetricsHandle, RequestContext, SearchType,
    TenantRuntime,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// One retrieved passage.
#[derive(Debug, Clone, Deserialize)]
pub struct Passage {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub score: f64,
    #[serde(default)]
    pub source: Option<String>,
}

#[derive(Debug, Serialize)]
struct RetrieveRequest<'a> {
    kb_id: &'a str,
    prefix: &'a str,
    query: &'a str,
    top_k: u32,
    search_type: SearchType,
}

#[derive(Debug, Deserialize)]
struct RetrieveResponse {
    #[serde(default)]
    passages: Vec<Passage>,
}

/// HTTP client for the retrieval service.
pub struct KbClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl KbClient {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .expect("reqwest client construction");
        Self {
            http,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            api_key,
        }
    }

    async fn retrieve(
        &self,
        ctx: &RequestContext,
        request: &RetrieveRequest<'_>,
    ) -> askgate_core::Result<Vec<Passage>> {
        let url = format!("{}/retrieve", self.endpoint);
        let mut req = self.http.post(&url).json(request);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = ctx
            .run(async {
                req.send().await.map_err(|e| {
                    Error::new(ErrorCode::KbUnavailable, "knowledge-base service unreachable")
                        .with_details(e.to_string())
                })
            })
            .await?;

        if resp.status().is_server_error() {
            return Err(Error::new(
                ErrorCode::KbUnavailable,
                format!("knowledge-base service returned {}", resp.status()),
            ));
        }
        if !resp.status().is_success() {
            return Err(Error::internal(format!(
                "knowledge-base service rejected request with {}",
                resp.status()
            )));
        }

        let parsed: RetrieveResponse = ctx
            .run(async {
                resp.json().await.map_err(|e| {
                    Error::new(ErrorCode::KbUnavailable, "unreadable retrieval response")
                        .with_details(e.to_string())
                })
            })
            .await?;
        Ok(parsed.passages)
    }
}

pub struct KnowledgeBaseAgent {
    client: Option<KbClient>,
    provider: Arc<dyn LlmProvider>,
    metrics: MetricsHandle,
}

impl KnowledgeBaseAgent {
    pub fn new(
        client: Option<KbClient>,
        provider: Arc<dyn LlmProvider>,
        metrics: MetricsHandle,
    ) -> Self {
        Self {
            client,
            provider,
            metrics,
        }
    }
}

/// Builds the citation-required synthesis conversation.
fn synthesis_messages(
    question: &str,
    passages: &[Passage],
    response_language: &str,
) -> Vec<ChatMessage> {
    let mut context = String::new();
    for passage in passages {
        context.push_str(&format!("[{}] {}\n", passage.id, passage.text));
    }
    let system = format!(
        "Answer the user's question from the passages below and nothing else. \
         Cite every claim with its passage id in brackets, e.g. [p-12]. \
         If the passages do not contain the answer, say so. \
         Answer in '{response_language}'.\n\nPassages:\n{context}"
    );
    vec![ChatMessage::system(system), ChatMessage::user(question.to_string())]
}

#[async_trait]
impl Agent for KnowledgeBaseAgent {
    fn kind(&self) -> AgentType {
        AgentType::KnowledgeBase
    }

    async fn answer(
        &self,
        ctx: &RequestContext,
        runtime: &TenantRuntime,
        global: &GlobalSettings,
        request: &AgentRequest,
    ) -> AgentOutcome {
        let tenant_id = &runtime.config.id;

        let Some(binding) = &runtime.config.knowledge_base else {
            return AgentOutcome::Fatal(Error::new(
                ErrorCode::AgentDisabled,
                format!("tenant '{tenant_id}' has no knowledge-base binding"),
            ));
        };
        let Some(client) = &self.client else {
            return AgentOutcome::Recoverable(Error::new(
                ErrorCode::KbUnavailable,
                "no knowledge-base service configured",
            ));
        };

        let retrieve = RetrieveRequest {
            kb_id: &binding.id,
            prefix: &binding.prefix,
            query: &request.question,
            top_k: binding.max_results,
            search_type: binding.search_type,
        };

        let passages = match client.retrieve(ctx, &retrieve).await {
            Ok(passages) => passages,
            Err(err) => {
                self.metrics
                    .gateway
                    .kb_retrievals_total
                    .with_label_values(&[tenant_id, "error"])
                    .inc();
                return AgentOutcome::from_error(err);
            }
        };

        self.metrics
            .gateway
            .kb_retrievals_total
            .with_label_values(&[tenant_id, "ok"])
            .inc();

        if passages.is_empty() {
            warn!(tenant = %tenant_id, "retrieval returned no passages");
            return AgentOutcome::Recoverable(Error::new(
                ErrorCode::KbUnavailable,
                "no passages matched the question",
            ));
        }
        debug!(tenant = %tenant_id, passages = passages.len(), "passages retrieved");

        let messages = synthesis_messages(
            &request.question,
            &passages,
            &runtime.config.settings.response_language,
        );
        let params = CompletionParams {
            model: runtime.config.model(global).to_string(),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        match self.provider.complete(ctx, &messages, &params).await {
            Ok(completion) => {
                let mut text = completion.text;
                // source footer listing passage origins once each
                let mut sources: Vec<String> = passages
                    .iter()
                    .map(|p| p.source.clone().unwrap_or_else(|| p.id.clone()))
                    .collect();
                sources.sort();
                sources.dedup();
                text.push_str(&format!("\n\n_Sources: {}_", sources.join(", ")));

                let answer =
                    Answer::new(AgentType::KnowledgeBase, text).with_usage(completion.usage);
                AgentOutcome::Success(answer)
            }
            Err(err) => AgentOutcome::from_error(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn passage(id: &str, text: &str) -> Passage {
        Passage {
            id: id.to_string(),
            text: text.to_string(),
            score: 0.9,
            source: Some(format!("{id}.md")),
        }
    }

    #[test]
    fn synthesis_prompt_numbers_passages_and_demands_citations() {
        let passages = vec![
            passage("p-1", "Employees accrue 10 leave days."),
            passage("p-2", "Carry-over caps at 5 days."),
        ];
        let messages = synthesis_messages("leave policy?", &passages, "th");
        let system = &messages[0].content;
        assert!(system.contains("[p-1] Employees accrue"));
        assert!(system.contains("[p-2] Carry-over"));
        assert!(system.contains("Cite every claim"));
        assert!(system.contains("'th'"));
    }

    #[test]
    fn retrieval_wire_shape_matches_service_contract() {
        let req = RetrieveRequest {
            kb_id: "kb-1",
            prefix: "company-a/",
            query: "leave policy",
            top_k: 5,
            search_type: SearchType::Hybrid,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["kb_id"], "kb-1");
        assert_eq!(json["search_type"], "HYBRID");
        assert_eq!(json["top_k"], 5);
    }

    #[test]
    fn passages_decode_with_optional_fields() {
        let body = r#"{"passages": [{"id": "p-9", "text": "...", "score": 0.4}]}"#;
        let parsed: RetrieveResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.passages[0].id, "p-9");
        assert!(parsed.passages[0].source.is_none());
    }
}
