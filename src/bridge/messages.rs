//! Chat message and tool-call wire types.
//!
//! These types serialize directly into the OpenAI chat-completions
//! message shape; the Ollama request builder re-maps them where the
//! wire formats differ.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Role of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// System instruction.
    System,
    /// User turn.
    User,
    /// Assistant turn (may carry tool calls).
    Assistant,
    /// Tool result turn.
    Tool,
}

/// The function half of a tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolFunction {
    /// Registered tool name.
    pub name: String,
    /// JSON-encoded arguments string, as providers emit it.
    pub arguments: String,
}

/// One tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Provider-assigned call id, echoed back on the tool result.
    pub id: String,
    /// Always `"function"` for the providers this crate targets.
    #[serde(rename = "type", default = "function_type")]
    pub call_type: String,
    /// Function name and arguments.
    pub function: ToolFunction,
}

fn function_type() -> String {
    "function".to_string()
}

impl ToolCall {
    /// Build a tool call from parts.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            call_type: "function".to_string(),
            function: ToolFunction {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }

    /// Parse the arguments string into a JSON value.
    ///
    /// Providers occasionally emit arguments as an already-parsed
    /// object; both forms are accepted.
    pub fn parsed_arguments(&self) -> Value {
        serde_json::from_str(&self.function.arguments)
            .unwrap_or_else(|_| Value::String(self.function.arguments.clone()))
    }
}

/// One message of an ordered conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Message role.
    pub role: MessageRole,
    /// Text content. Absent on pure tool-call assistant turns.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Tool calls carried by an assistant turn.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    /// Id of the tool call this message answers (role `tool` only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    /// System message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    /// User message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    /// Plain assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    /// Assistant message carrying tool calls (and optional text).
    pub fn assistant_tool_calls(content: Option<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content,
            tool_calls: Some(tool_calls),
            tool_call_id: None,
        }
    }

    /// Tool result message answering `tool_call_id`.
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Tool,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
        }
    }

    /// Text content or empty string.
    pub fn text(&self) -> &str {
        self.content.as_deref().unwrap_or("")
    }
}

/// Token usage reported by a provider for one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Prompt-side tokens.
    pub input_tokens: i64,
    /// Completion-side tokens.
    pub output_tokens: i64,
}

impl TokenUsage {
    /// Total tokens for limit accounting.
    pub fn total(&self) -> i64 {
        self.input_tokens + self.output_tokens
    }
}

/// Parsed projection of one provider response, plus the raw envelope.
#[derive(Debug, Clone, Default)]
pub struct ResponseEnvelope {
    /// The raw response body as returned by the provider.
    pub raw: Value,
    /// Extracted text content, if any.
    pub text_content: Option<String>,
    /// Extracted tool calls, possibly empty.
    pub tool_calls: Vec<ToolCall>,
    /// Finish/done reason, if reported.
    pub finish_reason: Option<String>,
    /// Token usage, if reported.
    pub usage: Option<TokenUsage>,
    /// Id of the response-log row persisted for this call, once known.
    pub log_id: Option<i64>,
}

impl ResponseEnvelope {
    /// Whether the response carries tool calls.
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    /// Text content or empty string.
    pub fn text(&self) -> &str {
        self.text_content.as_deref().unwrap_or("")
    }
}
