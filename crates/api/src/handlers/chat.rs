//! `POST /v1/chat/completions`.
//!
//! Tenant extraction order: configured header → `sk-<tenant>` API key →
//! `<tenant>-<model>` model prefix → body `tenant_id` → default tenant.
//! A streaming response forwards the dispatcher's delta stream as
//! `chat.completion.chunk` events whose concatenated `delta.content`
//! equals the non-streaming answer, with zero-content heartbeats during
//! silent stretches, terminated by a `[DONE]` sentinel.

use crate::api_middleware::request_id::RequestId;
use crate::error::ApiError;
use crate::state::AppState;
use crate::wire::{ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse};
use askgate_agents::AgentRequest;
use askgate_core::registry::ResolveHint;
use askgate_core::{AgentType, Error, ErrorCode, RequestContext, TenantSettings};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::Extension;
use axum::Json;
use futures::StreamExt;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

/// Heartbeat interval for silent stretches of a streaming response.
const KEEP_ALIVE: Duration = Duration::from_secs(15);

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|v| v.trim().to_string())
}

/// Clamps request overrides to the tenant's policy.
fn clamp_overrides(
    request: &ChatCompletionRequest,
    settings: &TenantSettings,
) -> Result<(u32, f32), Error> {
    let max_tokens = match request.max_tokens {
        Some(0) => {
            return Err(Error::new(
                ErrorCode::OverrideRejected,
                "max_tokens must be positive",
            ))
        }
        Some(requested) => requested.min(settings.max_tokens),
        None => settings.max_tokens,
    };
    let temperature = match request.temperature {
        Some(t) if !(0.0..=2.0).contains(&t) => {
            return Err(Error::new(
                ErrorCode::OverrideRejected,
                "temperature must be within [0.0, 2.0]",
            ))
        }
        Some(t) => t,
        None => settings.temperature,
    };
    Ok((max_tokens, temperature))
}

pub async fn chat_completions(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let started = tokio::time::Instant::now();

    let request: ChatCompletionRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            return ApiError::new(Error::bad_request(format!("invalid request body: {e}")))
                .with_request_id(request_id.0)
                .into_response()
        }
    };

    let generation = state.registry.snapshot();
    let policy = generation.policy();

    let header_tenant = headers
        .get(policy.security.tenant_header_name.as_str())
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());
    let bearer = bearer_token(&headers);

    let hint = ResolveHint {
        header: header_tenant,
        bearer: bearer.clone(),
        model: request.model.clone(),
        body: request.tenant_id.clone(),
    };

    let runtime = match generation.resolve(&hint) {
        Ok(runtime) => runtime,
        Err(e) => return ApiError::new(e).with_request_id(request_id.0).into_response(),
    };
    if let Err(e) = generation.authorize(&runtime, bearer.as_deref()) {
        return ApiError::new(e).with_request_id(request_id.0).into_response();
    }

    if request.messages.is_empty() {
        return ApiError::new(Error::bad_request("messages must not be empty"))
            .with_request_id(request_id.0)
            .into_response();
    }
    let question = match request.question() {
        Some(question) => question,
        None => {
            return ApiError::new(Error::bad_request("no user message with content"))
                .with_request_id(request_id.0)
                .into_response()
        }
    };

    let (max_tokens, temperature) = match clamp_overrides(&request, &runtime.config.settings) {
        Ok(clamped) => clamped,
        Err(e) => return ApiError::new(e).with_request_id(request_id.0).into_response(),
    };

    let requested_agent = request.agent_type.unwrap_or(AgentType::Auto);
    let tenant_id = runtime.config.id.clone();
    let model_echo = request.model.clone().unwrap_or_else(|| {
        format!("{}-{}", tenant_id, runtime.config.model(policy))
    });
    let completion_id = format!("chatcmpl-{}", Uuid::new_v4().simple());

    info!(
        tenant = %tenant_id,
        request_id = %request_id.0,
        stream = request.stream,
        agent = %requested_agent,
        "chat completion accepted"
    );

    let (ctx, guard) = RequestContext::new(
        request_id.0.clone(),
        tenant_id.clone(),
        Duration::from_secs(policy.timeout_seconds),
    );

    let agent_request = AgentRequest {
        question,
        max_tokens,
        temperature,
    };

    let streaming =
        request.stream && generation.document.feature_flags.enable_streaming_responses;

    if streaming {
        let dispatcher = state.dispatcher.clone();
        let metrics = state.metrics.clone();
        let generation = generation.clone();
        let runtime = runtime.clone();
        let request_id = request_id.0.clone();

        let stream = async_stream::stream! {
            // dropping the stream (client disconnect) drops the guard and
            // cancels everything downstream
            let _guard = guard;

            yield Ok::<Event, std::convert::Infallible>(
                chunk_event(&ChatCompletionChunk::role(&completion_id, &model_echo)),
            );

            let dispatch = dispatcher.dispatch_stream(
                &ctx,
                &generation,
                &runtime,
                requested_agent,
                &agent_request,
            );
            tokio::pin!(dispatch);

            let mut heartbeat = tokio::time::interval(KEEP_ALIVE);
            heartbeat.tick().await; // first tick is immediate

            // heartbeats cover classification and agent startup
            let outcome = loop {
                tokio::select! {
                    outcome = &mut dispatch => break outcome,
                    _ = heartbeat.tick() => {
                        yield Ok(chunk_event(&ChatCompletionChunk::heartbeat(&completion_id, &model_echo)));
                    }
                }
            };

            match outcome {
                Ok(mut answer) => {
                    let mut failed = false;
                    loop {
                        tokio::select! {
                            delta = answer.deltas.next() => match delta {
                                Some(Ok(text)) => {
                                    if !text.is_empty() {
                                        yield Ok(chunk_event(&ChatCompletionChunk::content(&completion_id, &model_echo, text)));
                                    }
                                }
                                Some(Err(e)) => {
                                    // mid-stream failure: the error travels in-band
                                    let body = ApiError::new(e).with_request_id(request_id.clone()).body();
                                    yield Ok(Event::default().data(body.to_string()));
                                    failed = true;
                                    break;
                                }
                                None => break,
                            },
                            _ = heartbeat.tick() => {
                                yield Ok(chunk_event(&ChatCompletionChunk::heartbeat(&completion_id, &model_echo)));
                            }
                        }
                    }
                    if !failed {
                        yield Ok(chunk_event(&ChatCompletionChunk::stop(&completion_id, &model_echo)));
                    }
                }
                Err(e) => {
                    // headers are already on the wire; the error travels in-band
                    let body = ApiError::new(e).with_request_id(request_id.clone()).body();
                    yield Ok(Event::default().data(body.to_string()));
                }
            }

            metrics
                .gateway
                .request_duration_seconds
                .with_label_values(&[&tenant_id])
                .observe(started.elapsed().as_secs_f64());

            yield Ok(Event::default().data("[DONE]"));
        };

        return Sse::new(stream).into_response();
    }

    let result = state
        .dispatcher
        .dispatch(&ctx, &generation, &runtime, requested_agent, &agent_request)
        .await;
    drop(guard);

    state
        .metrics
        .gateway
        .request_duration_seconds
        .with_label_values(&[&tenant_id])
        .observe(started.elapsed().as_secs_f64());

    match result {
        Ok(answer) => Json(ChatCompletionResponse::new(
            completion_id,
            model_echo,
            answer.text,
            answer.usage.prompt_tokens,
            answer.usage.completion_tokens,
        ))
        .into_response(),
        Err(e) => ApiError::new(e).with_request_id(request_id.0).into_response(),
    }
}

fn chunk_event(chunk: &ChatCompletionChunk) -> Event {
    Event::default().data(serde_json::to_string(chunk).expect("chunk serialization is infallible"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_with(max_tokens: Option<u32>, temperature: Option<f32>) -> ChatCompletionRequest {
        serde_json::from_value(serde_json::json!({
            "messages": [{"role": "user", "content": "q"}],
            "max_tokens": max_tokens,
            "temperature": temperature,
        }))
        .unwrap()
    }

    #[test]
    fn overrides_clamp_to_tenant_policy() {
        let settings = TenantSettings::default();
        let (max_tokens, _) = clamp_overrides(&request_with(Some(999_999), None), &settings).unwrap();
        assert_eq!(max_tokens, settings.max_tokens);

        let (max_tokens, _) = clamp_overrides(&request_with(Some(1), None), &settings).unwrap();
        assert_eq!(max_tokens, 1);
    }

    #[test]
    fn invalid_overrides_are_rejected() {
        let settings = TenantSettings::default();
        let err = clamp_overrides(&request_with(Some(0), None), &settings).unwrap_err();
        assert_eq!(err.code, ErrorCode::OverrideRejected);

        let err = clamp_overrides(&request_with(None, Some(3.5)), &settings).unwrap_err();
        assert_eq!(err.code, ErrorCode::OverrideRejected);
    }

    #[test]
    fn bearer_extraction_trims_the_scheme() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer sk-company-a".parse().unwrap());
        assert_eq!(bearer_token(&headers).as_deref(), Some("sk-company-a"));
        headers.insert("authorization", "Basic abc".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);
    }
}
