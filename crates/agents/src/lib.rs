pub mod agent;
pub mod dispatch;
pub mod fallback;
pub mod intent;
pub mod knowledge_base;
pub mod llm;
pub mod outcome;
pub mod postgres;

pub use agent::{Agent, AgentRequest};
pub use dispatch::Dispatcher;
pub use fallback::FallbackAgent;
pub use knowledge_base::{KbClient, KnowledgeBaseAgent};
pub use llm::{ChatMessage, CompletionParams, LlmProvider, MockProvider, OpenAiCompatProvider};
pub use outcome::{AgentOutcome, Answer, AnswerStream, StreamedOutcome, TokenUsage};
pub use postgres::{PostgresAgent, PostgresAgentSettings};
