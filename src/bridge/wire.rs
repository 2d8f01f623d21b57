//! Request assembly and response parsing for the two wire shapes.
//!
//! The bridge speaks OpenAI chat completions (`/v1/chat/completions`)
//! and the Ollama chat API (`/api/chat`). Request building applies the
//! per-model [`ParamFilter`]; response parsing first attempts a
//! structured deserialization and then falls back to a tolerant manual
//! walk that accepts three shapes: OpenAI `choices[].message`, Ollama
//! top-level `message`, and minimal `{response:"…"}`.

use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::messages::{
    ChatMessage, MessageRole, ResponseEnvelope, TokenUsage, ToolCall, ToolFunction,
};
use super::params::{uses_max_completion_tokens, ParamFilter, SamplingParams};

// ---------------------------------------------------------------------------
// Request assembly
// ---------------------------------------------------------------------------

/// Build an OpenAI-shaped request body.
pub fn build_openai_body(
    model: &str,
    messages: &[ChatMessage],
    tools: &[Value],
    params: &SamplingParams,
    filter: &ParamFilter,
) -> Value {
    let mut body = json!({
        "model": model,
        "messages": messages,
    });

    if !filter.no_temperature {
        body["temperature"] = json!(params.temperature);
    }
    if !filter.no_top_p {
        body["top_p"] = json!(params.top_p);
    }
    if let Some(freq) = params.frequency_penalty {
        if !filter.no_frequency_penalty {
            body["frequency_penalty"] = json!(freq);
        }
    }
    if let Some(max) = params.max_response_tokens {
        if !filter.no_max_tokens {
            if uses_max_completion_tokens(model) {
                body["max_completion_tokens"] = json!(max);
            } else {
                body["max_tokens"] = json!(max);
            }
        }
    }
    if let Some(ref format) = params.response_format {
        body["response_format"] = format.clone();
    }
    if !tools.is_empty() {
        body["tools"] = json!(tools);
        body["tool_choice"] = json!("auto");
    }

    body
}

/// Build an Ollama-shaped request body.
///
/// Sampling knobs nest under `options`; tool messages carry
/// `tool_name` instead of `tool_call_id`; `response_format` maps onto
/// the `format` field (`"json"` for `json_object`, the schema value
/// for `json_schema`).
pub fn build_ollama_body(
    model: &str,
    messages: &[ChatMessage],
    tools: &[Value],
    params: &SamplingParams,
    filter: &ParamFilter,
) -> Value {
    let api_messages: Vec<Value> = messages.iter().map(ollama_message).collect();

    let mut body = json!({
        "model": model,
        "messages": api_messages,
        "stream": false,
    });

    let mut opts = Map::new();
    if !filter.no_temperature {
        opts.insert("temperature".to_string(), json!(params.temperature));
    }
    if !filter.no_top_p {
        opts.insert("top_p".to_string(), json!(params.top_p));
    }
    if let Some(top_k) = params.top_k {
        if !filter.no_top_k {
            opts.insert("top_k".to_string(), json!(top_k));
        }
    }
    if let Some(penalty) = params.repeat_penalty {
        if !filter.no_repeat_penalty {
            opts.insert("repeat_penalty".to_string(), json!(penalty));
        }
    }
    if let Some(last_n) = params.repeat_last_n {
        if !filter.no_repeat_last_n {
            opts.insert("repeat_last_n".to_string(), json!(last_n));
        }
    }
    if let Some(predict) = params.num_predict.or(params.max_response_tokens) {
        if !filter.no_num_predict {
            opts.insert("num_predict".to_string(), json!(predict));
        }
    }
    if !opts.is_empty() {
        body["options"] = Value::Object(opts);
    }

    if let Some(ref format) = params.response_format {
        body["format"] = match format.get("type").and_then(Value::as_str) {
            Some("json_object") => json!("json"),
            Some("json_schema") => format
                .get("json_schema")
                .and_then(|s| s.get("schema"))
                .cloned()
                .unwrap_or_else(|| json!("json")),
            _ => format.clone(),
        };
    }

    if !tools.is_empty() {
        body["tools"] = json!(tools);
    }

    body
}

fn ollama_message(msg: &ChatMessage) -> Value {
    let role = match msg.role {
        MessageRole::System => "system",
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
        MessageRole::Tool => "tool",
    };

    let mut obj = json!({ "role": role });
    if let Some(ref content) = msg.content {
        obj["content"] = json!(content);
    }
    if let Some(ref tool_calls) = msg.tool_calls {
        let calls: Vec<Value> = tool_calls
            .iter()
            .enumerate()
            .map(|(i, tc)| {
                json!({
                    "type": "function",
                    "function": {
                        "index": i,
                        "name": tc.function.name,
                        "arguments": tc.parsed_arguments(),
                    }
                })
            })
            .collect();
        obj["tool_calls"] = json!(calls);
    }
    if msg.role == MessageRole::Tool {
        if let Some(ref id) = msg.tool_call_id {
            obj["tool_name"] = json!(id);
        }
    }
    obj
}

// ---------------------------------------------------------------------------
// Structured response shapes (first pass)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: WireMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    prompt_tokens: Option<i64>,
    completion_tokens: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    message: WireMessage,
    done_reason: Option<String>,
    prompt_eval_count: Option<i64>,
    eval_count: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    content: Option<String>,
    tool_calls: Option<Vec<Value>>,
}

// ---------------------------------------------------------------------------
// Response parsing
// ---------------------------------------------------------------------------

/// Parse a provider response body into a [`ResponseEnvelope`].
///
/// Never fails: an unrecognized body yields an envelope with no text
/// and no tool calls, which the validator treats as an empty response.
pub fn parse_response(raw: Value) -> ResponseEnvelope {
    // First pass: structured deserialization of the two known shapes.
    if let Ok(openai) = serde_json::from_value::<OpenAiResponse>(raw.clone()) {
        if let Some(choice) = openai.choices.into_iter().next() {
            let usage = openai.usage.map(|u| TokenUsage {
                input_tokens: u.prompt_tokens.unwrap_or(0),
                output_tokens: u.completion_tokens.unwrap_or(0),
            });
            return envelope_from_wire(raw, choice.message, choice.finish_reason, usage);
        }
    }
    if let Ok(ollama) = serde_json::from_value::<OllamaResponse>(raw.clone()) {
        let usage = if ollama.prompt_eval_count.is_some() || ollama.eval_count.is_some() {
            Some(TokenUsage {
                input_tokens: ollama.prompt_eval_count.unwrap_or(0),
                output_tokens: ollama.eval_count.unwrap_or(0),
            })
        } else {
            None
        };
        return envelope_from_wire(raw, ollama.message, ollama.done_reason, usage);
    }

    // Second pass: tolerant manual walk.
    tolerant_parse(raw)
}

fn envelope_from_wire(
    raw: Value,
    message: WireMessage,
    finish_reason: Option<String>,
    usage: Option<TokenUsage>,
) -> ResponseEnvelope {
    let mut tool_calls = message
        .tool_calls
        .map(|calls| normalize_tool_calls(&calls))
        .unwrap_or_default();

    let mut text_content = message.content.filter(|c| !c.is_empty());

    // Some models embed tool calls as JSON inside the text content.
    if tool_calls.is_empty() {
        if let Some(ref text) = text_content {
            if let Some(embedded) = extract_embedded_tool_calls(text) {
                tool_calls = embedded;
                text_content = None;
            }
        }
    }

    ResponseEnvelope {
        raw,
        text_content,
        tool_calls,
        finish_reason,
        usage,
        log_id: None,
    }
}

fn tolerant_parse(raw: Value) -> ResponseEnvelope {
    // OpenAI shape: choices[0].message
    if let Some(message) = raw
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
    {
        let finish = raw
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("finish_reason"))
            .and_then(Value::as_str)
            .map(String::from);
        return envelope_from_value(raw.clone(), message.clone(), finish);
    }
    // Ollama shape: top-level message
    if let Some(message) = raw.get("message") {
        let finish = raw
            .get("done_reason")
            .and_then(Value::as_str)
            .map(String::from);
        return envelope_from_value(raw.clone(), message.clone(), finish);
    }
    // Minimal shape: {response: "…"}
    if let Some(text) = raw.get("response").and_then(Value::as_str) {
        return ResponseEnvelope {
            text_content: if text.is_empty() {
                None
            } else {
                Some(text.to_string())
            },
            raw,
            ..Default::default()
        };
    }

    log::warn!("unrecognized provider response shape: {}", truncated(&raw, 200));
    ResponseEnvelope {
        raw,
        ..Default::default()
    }
}

fn envelope_from_value(
    raw: Value,
    message: Value,
    finish_reason: Option<String>,
) -> ResponseEnvelope {
    let wire = WireMessage {
        content: message
            .get("content")
            .and_then(Value::as_str)
            .map(String::from),
        tool_calls: message
            .get("tool_calls")
            .and_then(Value::as_array)
            .cloned(),
    };
    envelope_from_wire(raw, wire, finish_reason, None)
}

/// Normalize provider tool-call entries into [`ToolCall`] values.
///
/// OpenAI sends `arguments` as a JSON string; Ollama sends an object
/// and no call id. Missing ids are minted positionally so the tool
/// sub-loop can still correlate results.
fn normalize_tool_calls(calls: &[Value]) -> Vec<ToolCall> {
    calls
        .iter()
        .enumerate()
        .filter_map(|(i, call)| {
            let function = call.get("function").unwrap_or(call);
            let name = function.get("name").and_then(Value::as_str)?.to_string();
            let arguments = match function.get("arguments") {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => "{}".to_string(),
            };
            let id = call
                .get("id")
                .and_then(Value::as_str)
                .map(String::from)
                .unwrap_or_else(|| format!("call_{i}"));
            Some(ToolCall {
                id,
                call_type: "function".to_string(),
                function: ToolFunction { name, arguments },
            })
        })
        .collect()
}

/// Extract tool calls a model embedded as JSON inside its text content.
fn extract_embedded_tool_calls(text: &str) -> Option<Vec<ToolCall>> {
    let trimmed = text.trim();
    if !trimmed.starts_with('{') && !trimmed.starts_with('[') {
        return None;
    }
    let value: Value = serde_json::from_str(trimmed).ok()?;

    let calls = if let Some(array) = value.get("tool_calls").and_then(Value::as_array) {
        normalize_tool_calls(array)
    } else if value.get("name").is_some() && value.get("arguments").is_some() {
        normalize_tool_calls(std::slice::from_ref(&value))
    } else if let Some(array) = value.as_array() {
        if array
            .iter()
            .all(|v| v.get("name").is_some() || v.get("function").is_some())
        {
            normalize_tool_calls(array)
        } else {
            return None;
        }
    } else {
        return None;
    };

    if calls.is_empty() {
        None
    } else {
        Some(calls)
    }
}

/// Abbreviated rendering of a JSON value for log lines.
pub fn truncated(value: &Value, limit: usize) -> String {
    let mut text = value.to_string();
    if text.len() > limit {
        let mut cut = limit;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
        text.push('…');
    }
    text
}
