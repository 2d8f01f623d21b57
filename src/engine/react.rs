//! Tool-call (ReAct) sub-loop.
//!
//! When a step's response carries tool calls, the loop dispatches each
//! call to the registry, feeds results back as `tool` messages, and
//! re-invokes the model until it produces a final textual answer or
//! the iteration cap is hit. Loop termination is a correctness
//! requirement; the cap guarantees it.

use serde_json::Value;

use crate::bridge::messages::{ChatMessage, ToolCall};
use crate::bridge::ChatProvider;
use crate::context::ScopeContext;
use crate::error::{OrchestratorError, Result};
use crate::tools::ToolRegistry;
use crate::validation::{ValidatedCall, Validator};

/// Default per-step iteration cap.
pub const MAX_TOOL_ITERATIONS: usize = 8;

/// Result of a completed tool loop.
#[derive(Debug)]
pub struct ToolLoopResult {
    /// The final validated call (textual, or invalid if validation
    /// gave up).
    pub final_call: ValidatedCall,
    /// Tool-dispatch iterations executed.
    pub iterations: usize,
}

/// Drive the sub-loop to a final textual answer.
///
/// `conversation` is extended in place with the assistant tool-call
/// turns and their `tool` results, so the caller can persist or
/// inspect the full exchange.
pub async fn run_tool_loop(
    validator: &Validator,
    provider: &dyn ChatProvider,
    tools: &ToolRegistry,
    conversation: &mut Vec<ChatMessage>,
    first: ValidatedCall,
    tool_schemas: &[Value],
    max_iterations: usize,
    ctx: &ScopeContext,
) -> Result<ToolLoopResult> {
    let mut current = first;
    let mut iterations = 0;

    while current.envelope.has_tool_calls() {
        if iterations >= max_iterations {
            return Err(OrchestratorError::ToolLoopExceeded(max_iterations));
        }
        ctx.ensure_active()?;
        iterations += 1;

        let calls: Vec<ToolCall> = current.envelope.tool_calls.clone();
        log::debug!(
            "tool loop iteration {iterations}: {} call(s) from {}",
            calls.len(),
            provider.identity().model
        );

        conversation.push(ChatMessage::assistant_tool_calls(
            current.envelope.text_content.clone(),
            calls.clone(),
        ));

        for call in &calls {
            let result_text = match tools
                .dispatch(&call.function.name, call.parsed_arguments())
                .await
            {
                Ok(value) => render_tool_result(&value),
                Err(e) => {
                    // Unknown tool or tool failure goes back to the
                    // model as the tool result; it may recover.
                    log::warn!("tool '{}' failed: {e}", call.function.name);
                    format!("Tool error: {e}")
                }
            };
            conversation.push(ChatMessage::tool_result(call.id.clone(), result_text));
        }

        current = validator
            .call_with_validation(provider, conversation, tool_schemas, ctx)
            .await?;

        if !current.valid {
            // A terminally-invalid mid-loop response ends the loop;
            // the caller decides what to do with it.
            break;
        }
    }

    Ok(ToolLoopResult {
        final_call: current,
        iterations,
    })
}

/// Render a tool result for the `tool` message content: bare strings
/// stay bare, everything else serializes as JSON.
fn render_tool_result(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::bridge::messages::MessageRole;
    use crate::bridge::scripted::{ScriptedFactory, ScriptedProvider, ScriptedReply};
    use crate::registry::Registry;
    use crate::store::{ResponseLogWriter, Store};
    use crate::tools::tool_from_fn;
    use crate::validation::{ValidationOptions, Validator};
    use serde_json::json;

    fn fixture() -> (Validator, ToolRegistry) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let registry = Arc::new(Registry::new(store.clone()));
        let log = ResponseLogWriter::new(store.clone());
        let validator = Validator::new(
            store,
            registry,
            log,
            Arc::new(ScriptedFactory::new()),
            ValidationOptions {
                enable_fallback: false,
                ..ValidationOptions::default()
            },
        );

        let tools = ToolRegistry::new();
        tools.register(tool_from_fn(
            "lookup_name",
            "Look up a character name",
            |args| {
                let hint = args
                    .get("hint")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                Ok(json!(if hint == "hero" { "Aria" } else { "Nameless" }))
            },
        ));
        (validator, tools)
    }

    fn writer_ctx() -> ScopeContext {
        ScopeContext::new("story/generate").with_agent("W1", "writer")
    }

    #[tokio::test]
    async fn test_single_tool_round_then_answer() {
        let (validator, tools) = fixture();
        let provider = ScriptedProvider::new(
            "m1",
            vec![ScriptedReply::Text("The hero Aria sets out.".into())],
        );
        let ctx = writer_ctx();

        let first = ValidatedCall {
            envelope: crate::bridge::messages::ResponseEnvelope {
                tool_calls: vec![ToolCall::new(
                    "call_0",
                    "lookup_name",
                    r#"{"hint":"hero"}"#,
                )],
                ..Default::default()
            },
            valid: true,
            attempts: 1,
            verdict: None,
            adopted_fallback: None,
        };

        let mut conversation = vec![
            ChatMessage::system("write"),
            ChatMessage::user("name the hero and begin"),
        ];
        let result = run_tool_loop(
            &validator,
            &provider,
            &tools,
            &mut conversation,
            first,
            &[],
            MAX_TOOL_ITERATIONS,
            &ctx,
        )
        .await
        .unwrap();

        assert_eq!(result.iterations, 1);
        assert_eq!(result.final_call.envelope.text(), "The hero Aria sets out.");

        // Conversation shape: system, user, assistant(tool_calls),
        // tool(result).
        assert_eq!(conversation.len(), 4);
        assert_eq!(conversation[2].role, MessageRole::Assistant);
        assert_eq!(
            conversation[2].tool_calls.as_ref().unwrap()[0].function.name,
            "lookup_name"
        );
        assert_eq!(conversation[3].role, MessageRole::Tool);
        assert_eq!(conversation[3].text(), "Aria");
        assert_eq!(conversation[3].tool_call_id.as_deref(), Some("call_0"));
    }

    #[tokio::test]
    async fn test_unknown_tool_feeds_error_back() {
        let (validator, tools) = fixture();
        let provider = ScriptedProvider::new(
            "m1",
            vec![ScriptedReply::Text("recovered without the tool".into())],
        );
        let ctx = writer_ctx();

        let first = ValidatedCall {
            envelope: crate::bridge::messages::ResponseEnvelope {
                tool_calls: vec![ToolCall::new("c1", "no_such_tool", "{}")],
                ..Default::default()
            },
            valid: true,
            attempts: 1,
            verdict: None,
            adopted_fallback: None,
        };

        let mut conversation = vec![ChatMessage::user("go")];
        let result = run_tool_loop(
            &validator,
            &provider,
            &tools,
            &mut conversation,
            first,
            &[],
            MAX_TOOL_ITERATIONS,
            &ctx,
        )
        .await
        .unwrap();

        assert!(result.final_call.valid);
        let tool_msg = conversation
            .iter()
            .find(|m| m.role == MessageRole::Tool)
            .unwrap();
        assert!(tool_msg.text().starts_with("Tool error:"));
        assert!(tool_msg.text().contains("unknown tool"));
    }

    #[tokio::test]
    async fn test_iteration_cap_enforced() {
        let (validator, tools) = fixture();
        // The model keeps asking for tools forever.
        let provider = ScriptedProvider::new(
            "m1",
            vec![ScriptedReply::ToolCalls(vec![ToolCall::new(
                "c",
                "lookup_name",
                r#"{"hint":"hero"}"#,
            )])],
        );
        let ctx = writer_ctx();

        let first = ValidatedCall {
            envelope: crate::bridge::messages::ResponseEnvelope {
                tool_calls: vec![ToolCall::new("c0", "lookup_name", r#"{"hint":"hero"}"#)],
                ..Default::default()
            },
            valid: true,
            attempts: 1,
            verdict: None,
            adopted_fallback: None,
        };

        let mut conversation = vec![ChatMessage::user("go")];
        let err = run_tool_loop(
            &validator,
            &provider,
            &tools,
            &mut conversation,
            first,
            &[],
            3,
            &ctx,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, OrchestratorError::ToolLoopExceeded(3)));
    }

    #[tokio::test]
    async fn test_no_tool_calls_is_a_noop() {
        let (validator, tools) = fixture();
        let provider = ScriptedProvider::new("m1", vec![]);
        let ctx = writer_ctx();

        let first = ValidatedCall {
            envelope: crate::bridge::messages::ResponseEnvelope {
                text_content: Some("plain answer".into()),
                ..Default::default()
            },
            valid: true,
            attempts: 1,
            verdict: None,
            adopted_fallback: None,
        };

        let mut conversation = vec![ChatMessage::user("go")];
        let result = run_tool_loop(
            &validator,
            &provider,
            &tools,
            &mut conversation,
            first,
            &[],
            MAX_TOOL_ITERATIONS,
            &ctx,
        )
        .await
        .unwrap();
        assert_eq!(result.iterations, 0);
        assert_eq!(provider.call_count(), 0);
        assert_eq!(conversation.len(), 1);
    }

    #[test]
    fn test_render_tool_result() {
        assert_eq!(render_tool_result(&json!("Aria")), "Aria");
        assert_eq!(render_tool_result(&json!({"n": 1})), "{\"n\":1}");
        assert_eq!(render_tool_result(&json!(7)), "7");
    }
}
