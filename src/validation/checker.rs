//! The LLM judge ("checker").
//!
//! A second model, selected through the `response_checker` role,
//! receives the original instruction, the candidate response, and the
//! filtered rule set, and answers with a small JSON verdict. Checker
//! calls never pass through the validator themselves.

use std::sync::Arc;

use serde_json::Value;

use crate::bridge::messages::{ChatMessage, MessageRole, ResponseEnvelope};
use crate::bridge::{ProviderFactory, SamplingParams};
use crate::context::ScopeContext;
use crate::error::Result;
use crate::registry::Registry;

use super::checks::{extract_json_object, CheckVerdict};
use super::policy::ValidationRule;

/// Role that selects the judge agent and model.
pub const CHECKER_ROLE: &str = "response_checker";

/// LLM-judge runner.
pub struct Checker {
    registry: Arc<Registry>,
    factory: Arc<dyn ProviderFactory>,
}

impl std::fmt::Debug for Checker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Checker").finish_non_exhaustive()
    }
}

impl Checker {
    /// Checker resolving its agent and model through `registry`.
    pub fn new(registry: Arc<Registry>, factory: Arc<dyn ProviderFactory>) -> Self {
        Self { registry, factory }
    }

    /// Judge one candidate response.
    ///
    /// An unparseable judge reply counts as a pass: the judge is an
    /// advisory layer and must not wedge the pipeline.
    pub async fn judge(
        &self,
        conversation: &[ChatMessage],
        candidate: &ResponseEnvelope,
        rules: &[&ValidationRule],
        ctx: &ScopeContext,
    ) -> Result<CheckVerdict> {
        let agent = self.registry.active_agent_for_role(CHECKER_ROLE)?;
        let model_id = agent.model_id.ok_or(crate::error::OrchestratorError::NotFound {
            kind: "checker model",
            name: agent.name.clone(),
        })?;
        let model = self.registry.model_by_id(model_id)?;

        let params = SamplingParams {
            temperature: agent.temperature.unwrap_or(0.0),
            response_format: Some(serde_json::json!({"type": "json_object"})),
            ..SamplingParams::default()
        };
        let provider = self.factory.make(&model, &params);

        let judge_ctx = ctx
            .child(ctx.scope.clone())
            .reagent(agent.name.clone(), CHECKER_ROLE);

        let messages = vec![
            ChatMessage::system(build_judge_system(&agent.system_text(), rules)),
            ChatMessage::user(build_judge_user(conversation, candidate)),
        ];

        let envelope = provider.call_once(&messages, &[], &judge_ctx).await?;
        Ok(parse_judge_verdict(envelope.text()))
    }
}

fn build_judge_system(agent_system: &str, rules: &[&ValidationRule]) -> String {
    let mut system = String::new();
    if !agent_system.is_empty() {
        system.push_str(agent_system);
        system.push_str("\n\n");
    }
    system.push_str(
        "Judge whether the candidate response satisfies the instruction and \
         every listed rule.\n\
         Answer with a single JSON object:\n\
         {\"is_valid\": bool, \"needs_retry\": bool, \"reason\": string, \
         \"violated_rules\": [string], \"system_message_override\": string|null}",
    );
    if !rules.is_empty() {
        system.push_str("\n\nRules:\n");
        for rule in rules {
            system.push_str(&format!("- [{}] {}\n", rule.id, rule.text));
        }
    }
    system
}

fn build_judge_user(conversation: &[ChatMessage], candidate: &ResponseEnvelope) -> String {
    let mut user = String::from("Original instruction:\n");
    for message in conversation {
        match message.role {
            MessageRole::System => {
                user.push_str("[system] ");
                user.push_str(message.text());
                user.push('\n');
            }
            MessageRole::User => {
                user.push_str("[user] ");
                user.push_str(message.text());
                user.push('\n');
            }
            _ => {}
        }
    }
    user.push_str("\nCandidate response:\n");
    user.push_str(candidate.text());
    user
}

/// Parse the judge's JSON verdict, tolerating fences and prose.
pub fn parse_judge_verdict(text: &str) -> CheckVerdict {
    let Some(value) = extract_json_object(text) else {
        log::warn!("checker verdict unparseable, passing response through: {text}");
        return CheckVerdict::valid();
    };

    let is_valid = value
        .get("is_valid")
        .or_else(|| value.get("valid"))
        .and_then(Value::as_bool)
        .unwrap_or(true);
    let needs_retry = value
        .get("needs_retry")
        .and_then(Value::as_bool)
        .unwrap_or(!is_valid);
    let reason = value
        .get("reason")
        .and_then(Value::as_str)
        .filter(|r| !r.is_empty())
        .map(String::from);
    let violated_rules = value
        .get("violated_rules")
        .and_then(Value::as_array)
        .map(|rules| {
            rules
                .iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();
    let system_message_override = value
        .get("system_message_override")
        .and_then(Value::as_str)
        .filter(|m| !m.is_empty())
        .map(String::from);

    CheckVerdict {
        is_valid,
        needs_retry,
        reason,
        violated_rules,
        system_message_override,
    }
}
