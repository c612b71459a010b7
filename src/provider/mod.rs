// src/provider/mod.rs — Model API client layer

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::infra::errors::CycleError;
use crate::tools::ToolDeclaration;

/// Trait the model backend implements. A call must observe the supplied
/// cancellation token and return `CycleError::Aborted` promptly when it fires.
#[async_trait]
pub trait ApiClient: Send + Sync {
    async fn call(
        &self,
        request: ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<LlmReply, CycleError>;
}

/// One request to the model. `prompt` is `None` on the follow-up call after a
/// tool round, where the conversation lives entirely in `history`.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub prompt: Option<String>,
    pub system_instruction: String,
    pub model: String,
    pub function_decls: Vec<ToolDeclaration>,
    pub history: Vec<HistoryEntry>,
}

/// The model either answers with text or asks for exactly one function call.
/// There is no deeper nesting: a `FunctionCall` reply is resolved once and the
/// follow-up reply must be `Text`.
#[derive(Debug, Clone)]
pub enum LlmReply {
    Text { content: String, token_count: u64 },
    FunctionCall { call: FunctionCall, token_count: u64 },
}

impl LlmReply {
    pub fn token_count(&self) -> u64 {
        match self {
            LlmReply::Text { token_count, .. } | LlmReply::FunctionCall { token_count, .. } => {
                *token_count
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    pub args: serde_json::Value,
}

/// Conversation history entries fed back on the post-tool follow-up call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum HistoryEntry {
    User(String),
    ModelFunctionCall(FunctionCall),
    FunctionResult {
        name: String,
        response: serde_json::Value,
    },
    FunctionError {
        name: String,
        error: String,
    },
}

/// Strip markdown fences and leading/trailing chatter from a model reply that
/// is supposed to be a single JSON object.
pub fn sanitize_json_reply(raw: &str) -> String {
    let trimmed = raw.trim();
    let without_fence = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|s| s.strip_suffix("```").unwrap_or(s))
        .unwrap_or(trimmed)
        .trim();

    match (without_fence.find('{'), without_fence.rfind('}')) {
        (Some(start), Some(end)) if end > start => without_fence[start..=end].to_string(),
        _ => without_fence.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_plain_json() {
        assert_eq!(sanitize_json_reply(r#"{"a": 1}"#), r#"{"a": 1}"#);
    }

    #[test]
    fn test_sanitize_fenced_json() {
        let raw = "```json\n{\"a\": 1}\n```";
        assert_eq!(sanitize_json_reply(raw), "{\"a\": 1}");
    }

    #[test]
    fn test_sanitize_bare_fence() {
        let raw = "```\n{\"ok\": true}\n```";
        assert_eq!(sanitize_json_reply(raw), "{\"ok\": true}");
    }

    #[test]
    fn test_sanitize_surrounding_prose() {
        let raw = "Here is the result:\n{\"a\": 1}\nHope that helps!";
        assert_eq!(sanitize_json_reply(raw), "{\"a\": 1}");
    }

    #[test]
    fn test_sanitize_no_json_passthrough() {
        assert_eq!(sanitize_json_reply("no braces here"), "no braces here");
    }

    #[test]
    fn test_reply_token_count() {
        let text = LlmReply::Text {
            content: "x".into(),
            token_count: 42,
        };
        let call = LlmReply::FunctionCall {
            call: FunctionCall {
                name: "t".into(),
                args: serde_json::json!({}),
            },
            token_count: 7,
        };
        assert_eq!(text.token_count(), 42);
        assert_eq!(call.token_count(), 7);
    }
}
