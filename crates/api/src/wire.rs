//! OpenAI-compatible wire DTOs.
//!
//! Inputs decode permissively (message content may be a string or an
//! array of typed parts; unknown fields are ignored) so off-the-shelf
//! chat front-ends interoperate. Outputs encode strictly: a fixed
//! envelope shape with a fabricated completion id.

use askgate_core::AgentType;
use serde::{Deserialize, Serialize};

/// Chat completion request body.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default)]
    pub model: Option<String>,
    pub messages: Vec<WireMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Gateway extension: explicit tenant.
    #[serde(default)]
    pub tenant_id: Option<String>,
    /// Gateway extension: bypass intent classification.
    #[serde(default)]
    pub agent_type: Option<AgentType>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<MessageContent>,
}

/// Message content: plain string or multimodal part array.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    #[serde(default)]
    pub part_type: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
}

impl MessageContent {
    /// Text of this content: the string as-is, or the concatenated `text`
    /// fields of array parts. Non-text parts are skipped.
    pub fn as_text(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| p.text.as_deref())
                .collect::<Vec<_>>()
                .join(""),
        }
    }
}

impl ChatCompletionRequest {
    /// The question is the content of the last user message.
    pub fn question(&self) -> Option<String> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .and_then(|m| m.content.as_ref())
            .map(|c| c.as_text())
            .filter(|t| !t.trim().is_empty())
    }
}

// ---- responses ----

#[derive(Debug, Clone, Serialize)]
pub struct ResponseMessage {
    pub role: &'static str,
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Choice {
    pub index: u32,
    pub message: ResponseMessage,
    pub finish_reason: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    pub choices: Vec<Choice>,
    pub usage: Usage,
}

impl ChatCompletionResponse {
    pub fn new(id: String, model: String, content: String, prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            id,
            object: "chat.completion",
            created: chrono::Utc::now().timestamp(),
            model,
            choices: vec![Choice {
                index: 0,
                message: ResponseMessage {
                    role: "assistant",
                    content,
                },
                finish_reason: "stop",
            }],
            usage: Usage {
                prompt_tokens,
                completion_tokens,
                total_tokens: prompt_tokens + completion_tokens,
            },
        }
    }
}

// ---- streaming chunks ----

#[derive(Debug, Clone, Serialize, Default)]
pub struct Delta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: Delta,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<&'static str>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
}

impl ChatCompletionChunk {
    fn base(id: &str, model: &str, choice: ChunkChoice) -> Self {
        Self {
            id: id.to_string(),
            object: "chat.completion.chunk",
            created: chrono::Utc::now().timestamp(),
            model: model.to_string(),
            choices: vec![choice],
        }
    }

    /// First chunk: assistant role, empty content.
    pub fn role(id: &str, model: &str) -> Self {
        Self::base(
            id,
            model,
            ChunkChoice {
                index: 0,
                delta: Delta {
                    role: Some("assistant"),
                    content: Some(String::new()),
                },
                finish_reason: None,
            },
        )
    }

    pub fn content(id: &str, model: &str, content: String) -> Self {
        Self::base(
            id,
            model,
            ChunkChoice {
                index: 0,
                delta: Delta {
                    role: None,
                    content: Some(content),
                },
                finish_reason: None,
            },
        )
    }

    /// Zero-content heartbeat emitted while an agent is still working.
    pub fn heartbeat(id: &str, model: &str) -> Self {
        Self::content(id, model, String::new())
    }

    /// Terminal chunk with `finish_reason: "stop"`.
    pub fn stop(id: &str, model: &str) -> Self {
        Self::base(
            id,
            model,
            ChunkChoice {
                index: 0,
                delta: Delta::default(),
                finish_reason: Some("stop"),
            },
        )
    }
}

#[derive(Debug, Serialize)]
pub struct ModelInfo {
    pub id: String,
    pub object: &'static str,
    pub owned_by: String,
}

#[derive(Debug, Serialize)]
pub struct ModelsResponse {
    pub object: &'static str,
    pub data: Vec<ModelInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_and_part_content_both_decode() {
        let body = r#"{
            "model": "company-a-qa-large",
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": [{"type": "text", "text": "How many "}, {"type": "text", "text": "employees?"}]}
            ]
        }"#;
        let req: ChatCompletionRequest = serde_json::from_str(body).unwrap();
        assert_eq!(req.question().unwrap(), "How many employees?");
        assert!(!req.stream);
    }

    #[test]
    fn question_is_last_user_message() {
        let body = r#"{
            "messages": [
                {"role": "user", "content": "first"},
                {"role": "assistant", "content": "answer"},
                {"role": "user", "content": "second"}
            ]
        }"#;
        let req: ChatCompletionRequest = serde_json::from_str(body).unwrap();
        assert_eq!(req.question().unwrap(), "second");
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let body = r#"{"messages": [{"role": "user", "content": "q"}], "frequency_penalty": 0.5, "n": 1}"#;
        assert!(serde_json::from_str::<ChatCompletionRequest>(body).is_ok());
    }

    #[test]
    fn agent_type_extension_decodes() {
        let body = r#"{"messages": [{"role":"user","content":"q"}], "agent_type": "knowledge_base"}"#;
        let req: ChatCompletionRequest = serde_json::from_str(body).unwrap();
        assert_eq!(req.agent_type, Some(AgentType::KnowledgeBase));
    }

    #[test]
    fn envelope_shape_is_openai_compatible() {
        let resp = ChatCompletionResponse::new(
            "chatcmpl-1".into(),
            "company-a-qa-large".into(),
            "42".into(),
            10,
            2,
        );
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["object"], "chat.completion");
        assert_eq!(json["choices"][0]["message"]["role"], "assistant");
        assert_eq!(json["choices"][0]["finish_reason"], "stop");
        assert_eq!(json["usage"]["total_tokens"], 12);
    }

    #[test]
    fn content_chunk_shape_is_openai_compatible() {
        let chunk = ChatCompletionChunk::content("chatcmpl-1", "m", "The answer ".to_string());
        let json = serde_json::to_value(&chunk).unwrap();
        assert_eq!(json["object"], "chat.completion.chunk");
        assert_eq!(json["choices"][0]["delta"]["content"], "The answer ");
        assert!(json["choices"][0].get("finish_reason").is_none());
    }

    #[test]
    fn stop_chunk_has_empty_delta() {
        let chunk = ChatCompletionChunk::stop("chatcmpl-1", "m");
        let json = serde_json::to_value(&chunk).unwrap();
        assert_eq!(json["choices"][0]["finish_reason"], "stop");
        assert!(json["choices"][0]["delta"].get("content").is_none());
    }
}
