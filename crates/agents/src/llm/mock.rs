//! Scripted provider for tests.

use super::{ChatMessage, Completion, CompletionParams, DeltaStream, LlmProvider};
use crate::outcome::TokenUsage;
use askgate_core::{Error, ErrorCode, RequestContext, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

/// One scripted response.
#[derive(Debug, Clone)]
pub enum MockReply {
    Text(String),
    Transient(String),
    Permanent(String),
}

/// Pops scripted replies in order; repeats the last one when exhausted.
/// Records every prompt for assertions.
pub struct MockProvider {
    replies: Mutex<VecDeque<MockReply>>,
    last: Mutex<Option<MockReply>>,
    pub calls: Mutex<Vec<Vec<ChatMessage>>>,
}

impl MockProvider {
    pub fn new(replies: impl IntoIterator<Item = MockReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
            last: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn scripted(texts: &[&str]) -> Self {
        Self::new(texts.iter().map(|t| MockReply::Text(t.to_string())))
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn next_reply(&self) -> MockReply {
        let mut replies = self.replies.lock().unwrap();
        match replies.pop_front() {
            Some(reply) => {
                *self.last.lock().unwrap() = Some(reply.clone());
                reply
            }
            None => self
                .last
                .lock()
                .unwrap()
                .clone()
                .unwrap_or(MockReply::Permanent("mock exhausted".to_string())),
        }
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    async fn complete(
        &self,
        _ctx: &RequestContext,
        messages: &[ChatMessage],
        _params: &CompletionParams,
    ) -> Result<Completion> {
        self.calls.lock().unwrap().push(messages.to_vec());
        match self.next_reply() {
            MockReply::Text(text) => Ok(Completion {
                text,
                usage: TokenUsage {
                    prompt_tokens: 10,
                    completion_tokens: 5,
                },
            }),
            MockReply::Transient(msg) => {
                Err(Error::new(ErrorCode::ProviderUnavailable, msg))
            }
            MockReply::Permanent(msg) => Err(Error::internal(msg)),
        }
    }

    async fn stream(
        &self,
        ctx: &RequestContext,
        messages: &[ChatMessage],
        params: &CompletionParams,
    ) -> Result<DeltaStream> {
        let completion = self.complete(ctx, messages, params).await?;
        let words: Vec<Result<String>> = completion
            .text
            .split_inclusive(' ')
            .map(|w| Ok(w.to_string()))
            .collect();
        Ok(Box::pin(futures::stream::iter(words)))
    }
}
