//! Deterministic response checks.
//!
//! These run before (and independently of) the LLM judge: empty
//! content, tool-call presence, and operation-specific structure
//! checks such as the voice-tag line coverage.

use std::collections::BTreeSet;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bridge::messages::{ChatMessage, MessageRole, ResponseEnvelope};

/// Operation key subject to the voice-tag coverage check.
pub const ADD_VOICE_TAGS_OPERATION: &str = "story/add_voice_tags_to_story";

static DIALOGUE_HEADING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)dialogue lines").expect("static regex"));

static DIALOGUE_LINE_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*\[?(\d{3,})\]?\s*[:.\-]").expect("static regex"));

/// Verdict of a deterministic or judge check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckVerdict {
    pub is_valid: bool,
    pub needs_retry: bool,
    pub reason: Option<String>,
    #[serde(default)]
    pub violated_rules: Vec<String>,
    pub system_message_override: Option<String>,
}

impl CheckVerdict {
    /// A passing verdict.
    pub fn valid() -> Self {
        Self {
            is_valid: true,
            needs_retry: false,
            reason: None,
            violated_rules: Vec::new(),
            system_message_override: None,
        }
    }

    /// A failing verdict worth retrying.
    pub fn invalid_retry(reason: impl Into<String>) -> Self {
        Self {
            is_valid: false,
            needs_retry: true,
            reason: Some(reason.into()),
            violated_rules: Vec::new(),
            system_message_override: None,
        }
    }

    /// A failing verdict not worth retrying.
    pub fn invalid_terminal(reason: impl Into<String>) -> Self {
        Self {
            is_valid: false,
            needs_retry: false,
            reason: Some(reason.into()),
            violated_rules: Vec::new(),
            system_message_override: None,
        }
    }

    /// Attach a targeted feedback message for the retry.
    pub fn with_override(mut self, message: impl Into<String>) -> Self {
        self.system_message_override = Some(message.into());
        self
    }
}

/// Run the deterministic checks for one response.
pub fn deterministic_verdict(
    operation_key: &str,
    envelope: &ResponseEnvelope,
    messages: &[ChatMessage],
) -> CheckVerdict {
    // A tool-call response is always acceptable; the sub-loop takes
    // over from here.
    if envelope.has_tool_calls() {
        return CheckVerdict::valid();
    }

    let text = envelope.text().trim();
    if text.is_empty() {
        return CheckVerdict::invalid_retry("empty_response");
    }

    if operation_key == ADD_VOICE_TAGS_OPERATION {
        return voice_tags_verdict(text, messages);
    }

    CheckVerdict::valid()
}

/// Collect the dialogue line ids declared in the user prompt.
///
/// Ids are numeric tokens (3+ digits, optionally bracketed) at line
/// starts, following a heading line containing "dialogue lines".
pub fn declared_line_ids(messages: &[ChatMessage]) -> BTreeSet<String> {
    let mut ids = BTreeSet::new();
    for message in messages.iter().filter(|m| m.role == MessageRole::User) {
        let text = message.text();
        let Some(heading) = DIALOGUE_HEADING.find(text) else {
            continue;
        };
        for line in text[heading.end()..].lines() {
            if let Some(captures) = DIALOGUE_LINE_ID.captures(line) {
                ids.insert(captures[1].to_string());
            }
        }
    }
    ids
}

/// Voice-tag coverage check: the response must map every declared
/// line id to an entry carrying both a character and an emotion tag.
fn voice_tags_verdict(text: &str, messages: &[ChatMessage]) -> CheckVerdict {
    let declared = declared_line_ids(messages);

    let Some(mapping) = extract_json_object(text) else {
        if declared.is_empty() {
            // Nothing to tag; any parseable-or-not response passes.
            return CheckVerdict::valid();
        }
        return CheckVerdict::invalid_retry("voice_tags_not_json").with_override(
            "The response must be a JSON object mapping each dialogue line id \
             to its tags.",
        );
    };

    if declared.is_empty() {
        return CheckVerdict::valid();
    }

    let mut missing_ids = Vec::new();
    let mut incomplete_ids = Vec::new();
    for id in &declared {
        match mapping.get(id) {
            None => missing_ids.push(id.clone()),
            Some(entry) => {
                if !entry_has_tag(entry, "character") || !entry_has_tag(entry, "emotion") {
                    incomplete_ids.push(id.clone());
                }
            }
        }
    }

    if missing_ids.is_empty() && incomplete_ids.is_empty() {
        return CheckVerdict::valid();
    }

    let mut feedback = String::from("The voice-tag mapping is incomplete.");
    if !missing_ids.is_empty() {
        feedback.push_str(&format!(
            " Missing line ids: {}.",
            missing_ids.join(", ")
        ));
    }
    if !incomplete_ids.is_empty() {
        feedback.push_str(&format!(
            " Entries without both character and emotion tags: {}.",
            incomplete_ids.join(", ")
        ));
    }
    feedback.push_str(" Return the full mapping for every dialogue line.");

    CheckVerdict::invalid_retry("voice_tags_incomplete").with_override(feedback)
}

fn entry_has_tag(entry: &Value, key: &str) -> bool {
    entry
        .get(key)
        .and_then(Value::as_str)
        .map(|tag| !tag.trim().is_empty())
        .unwrap_or(false)
}

/// Parse a JSON object out of model text, tolerating code fences and
/// surrounding prose.
pub fn extract_json_object(text: &str) -> Option<Value> {
    let trimmed = strip_code_fences(text);
    if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }
    // Last resort: the widest brace-delimited slice.
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    match serde_json::from_str::<Value>(&trimmed[start..=end]) {
        Ok(value @ Value::Object(_)) => Some(value),
        _ => None,
    }
}

/// Strip a surrounding ``` fence, with or without a language tag.
pub fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_suffix("```").unwrap_or(inner);
    // Drop the language tag line, if present.
    match inner.find('\n') {
        Some(newline) if inner[..newline].chars().all(|c| c.is_ascii_alphanumeric()) => {
            inner[newline + 1..].trim()
        }
        _ => inner.trim(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::messages::ToolCall;
    use serde_json::json;

    fn envelope_with_text(text: &str) -> ResponseEnvelope {
        ResponseEnvelope {
            text_content: Some(text.to_string()),
            ..Default::default()
        }
    }

    fn voice_prompt(ids: &[&str]) -> Vec<ChatMessage> {
        let mut prompt = String::from("Tag the following dialogue lines:\n");
        for id in ids {
            prompt.push_str(&format!("{id}: \"Some spoken line.\"\n"));
        }
        vec![ChatMessage::user(prompt)]
    }

    #[test]
    fn test_empty_response_needs_retry() {
        let verdict = deterministic_verdict(
            "story/generate",
            &ResponseEnvelope::default(),
            &[ChatMessage::user("write")],
        );
        assert!(!verdict.is_valid);
        assert!(verdict.needs_retry);
        assert_eq!(verdict.reason.as_deref(), Some("empty_response"));
    }

    #[test]
    fn test_tool_calls_are_valid_without_text() {
        let envelope = ResponseEnvelope {
            tool_calls: vec![ToolCall::new("c1", "lookup_name", "{}")],
            ..Default::default()
        };
        let verdict = deterministic_verdict("story/generate", &envelope, &[]);
        assert!(verdict.is_valid);
    }

    #[test]
    fn test_plain_text_is_valid() {
        let verdict = deterministic_verdict(
            "story/generate",
            &envelope_with_text("a fine chapter"),
            &[],
        );
        assert!(verdict.is_valid);
    }

    #[test]
    fn test_declared_line_ids_parsing() {
        let messages = voice_prompt(&["004", "007", "012"]);
        let ids = declared_line_ids(&messages);
        assert_eq!(
            ids.into_iter().collect::<Vec<_>>(),
            vec!["004", "007", "012"]
        );
    }

    #[test]
    fn test_declared_line_ids_bracketed() {
        let messages = vec![ChatMessage::user(
            "Dialogue lines:\n[101]: first\n[102] - second\nnot an id line",
        )];
        let ids = declared_line_ids(&messages);
        assert_eq!(ids.into_iter().collect::<Vec<_>>(), vec!["101", "102"]);
    }

    #[test]
    fn test_voice_tags_missing_id_rejected_with_override() {
        let messages = voice_prompt(&["004", "007", "012"]);
        let response = json!({
            "004": {"character": "Aria", "emotion": "calm"},
            "007": {"character": "Morwen", "emotion": "angry"}
        });
        let verdict = deterministic_verdict(
            ADD_VOICE_TAGS_OPERATION,
            &envelope_with_text(&response.to_string()),
            &messages,
        );
        assert!(!verdict.is_valid);
        assert!(verdict.needs_retry);
        let feedback = verdict.system_message_override.unwrap();
        assert!(feedback.contains("012"));
        assert!(!feedback.contains("004,"));
    }

    #[test]
    fn test_voice_tags_missing_emotion_rejected() {
        let messages = voice_prompt(&["004"]);
        let response = json!({"004": {"character": "Aria"}});
        let verdict = deterministic_verdict(
            ADD_VOICE_TAGS_OPERATION,
            &envelope_with_text(&response.to_string()),
            &messages,
        );
        assert!(!verdict.is_valid);
        assert!(verdict
            .system_message_override
            .unwrap()
            .contains("character and emotion"));
    }

    #[test]
    fn test_voice_tags_complete_mapping_accepted() {
        let messages = voice_prompt(&["004", "007"]);
        let response = json!({
            "004": {"character": "Aria", "emotion": "calm"},
            "007": {"character": "Morwen", "emotion": "angry"}
        });
        let verdict = deterministic_verdict(
            ADD_VOICE_TAGS_OPERATION,
            &envelope_with_text(&response.to_string()),
            &messages,
        );
        assert!(verdict.is_valid);
    }

    #[test]
    fn test_voice_tags_zero_lines_empty_mapping_valid() {
        let messages = vec![ChatMessage::user("Dialogue lines:\n(none)")];
        let verdict = deterministic_verdict(
            ADD_VOICE_TAGS_OPERATION,
            &envelope_with_text("{}"),
            &messages,
        );
        assert!(verdict.is_valid);
    }

    #[test]
    fn test_voice_tags_fenced_json_accepted() {
        let messages = voice_prompt(&["004"]);
        let text = "```json\n{\"004\": {\"character\": \"Aria\", \"emotion\": \"calm\"}}\n```";
        let verdict = deterministic_verdict(
            ADD_VOICE_TAGS_OPERATION,
            &envelope_with_text(text),
            &messages,
        );
        assert!(verdict.is_valid);
    }

    #[test]
    fn test_voice_tags_non_json_rejected() {
        let messages = voice_prompt(&["004"]);
        let verdict = deterministic_verdict(
            ADD_VOICE_TAGS_OPERATION,
            &envelope_with_text("I cannot tag these lines."),
            &messages,
        );
        assert!(!verdict.is_valid);
        assert_eq!(verdict.reason.as_deref(), Some("voice_tags_not_json"));
    }

    #[test]
    fn test_extract_json_object_with_prose() {
        let text = "Here is the mapping:\n{\"a\": 1}\nHope that helps!";
        let value = extract_json_object(text).unwrap();
        assert_eq!(value["a"], 1);
    }

    #[test]
    fn test_strip_code_fences() {
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("{\"a\":1}"), "{\"a\":1}");
    }
}
