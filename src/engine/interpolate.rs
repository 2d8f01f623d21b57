//! Placeholder interpolation for step instructions.
//!
//! Supported placeholders:
//! - `{{STEP_k}}`: the full output of a prior step
//! - `{{STEP_k_EXTRACT:<section>}}`: a heading-matched section of a
//!   prior step's output
//! - `{{STEP_k_SUMMARY}}`: a summarizer-derived summary of a prior
//!   step's output
//! - `{{STEPS_a-b_SUMMARY}}`: a summary of the concatenation of
//!   steps a..b
//!
//! Summaries are computed lazily through the summarizer role and
//! cached for the lifetime of the execution.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::bridge::messages::ChatMessage;
use crate::bridge::{ProviderFactory, SamplingParams};
use crate::context::ScopeContext;
use crate::error::{OrchestratorError, Result};
use crate::registry::Registry;
use crate::validation::Validator;

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\{\{(?:STEP_(?P<step>\d+)(?:_EXTRACT:(?P<section>[^}]+)|_SUMMARY)?|STEPS_(?P<from>\d+)-(?P<to>\d+)_SUMMARY)\}\}",
    )
    .expect("static regex")
});

/// Produces summaries of prior step output.
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Summarize `text` on behalf of the current execution.
    async fn summarize(&self, text: &str, ctx: &ScopeContext) -> Result<String>;
}

/// Summarizer backed by the `summarizer` role.
///
/// The role is in the validator's skip list, so summary calls are
/// plain one-shot calls.
pub struct RoleSummarizer {
    registry: Arc<Registry>,
    validator: Arc<Validator>,
    factory: Arc<dyn ProviderFactory>,
}

impl RoleSummarizer {
    /// Summarizer resolving its agent through `registry`.
    pub fn new(
        registry: Arc<Registry>,
        validator: Arc<Validator>,
        factory: Arc<dyn ProviderFactory>,
    ) -> Self {
        Self {
            registry,
            validator,
            factory,
        }
    }
}

#[async_trait]
impl Summarizer for RoleSummarizer {
    async fn summarize(&self, text: &str, ctx: &ScopeContext) -> Result<String> {
        let agent = self.registry.active_agent_for_role("summarizer")?;
        let model_id = agent.model_id.ok_or(OrchestratorError::NotFound {
            kind: "summarizer model",
            name: agent.name.clone(),
        })?;
        let model = self.registry.model_by_id(model_id)?;

        let params = SamplingParams {
            temperature: agent.temperature.unwrap_or(0.3),
            ..SamplingParams::default()
        };
        let provider = self.factory.make(&model, &params);
        let sub_ctx = ctx
            .child("story/summarize")
            .reagent(agent.name.clone(), "summarizer");

        let mut messages = Vec::new();
        let system = agent.system_text();
        if !system.is_empty() {
            messages.push(ChatMessage::system(system));
        }
        messages.push(ChatMessage::user(format!(
            "Summarize the following text in a compact paragraph, keeping every \
             plot-relevant fact:\n\n{text}"
        )));

        let call = self
            .validator
            .call_with_validation(provider.as_ref(), &messages, &[], &sub_ctx)
            .await?;
        Ok(call.envelope.text().to_string())
    }
}

/// Resolves placeholders against prior step outputs.
pub struct Interpolator<'a> {
    outputs: &'a HashMap<i64, String>,
    summaries: &'a DashMap<String, String>,
    summarizer: &'a dyn Summarizer,
}

impl<'a> Interpolator<'a> {
    /// Interpolator over the outputs recorded so far, a per-execution
    /// summary cache, and a summarizer.
    pub fn new(
        outputs: &'a HashMap<i64, String>,
        summaries: &'a DashMap<String, String>,
        summarizer: &'a dyn Summarizer,
    ) -> Self {
        Self {
            outputs,
            summaries,
            summarizer,
        }
    }

    /// Resolve every placeholder in `instruction` for step
    /// `step_number`.
    pub async fn interpolate(
        &self,
        instruction: &str,
        step_number: i64,
        ctx: &ScopeContext,
    ) -> Result<String> {
        let mut result = String::with_capacity(instruction.len());
        let mut cursor = 0;

        // Placeholders resolve left to right; summaries may suspend on
        // the summarizer call, so this is a manual scan rather than a
        // `replace_all`.
        for captures in PLACEHOLDER.captures_iter(instruction) {
            let full = captures.get(0).expect("capture 0");
            result.push_str(&instruction[cursor..full.start()]);
            cursor = full.end();

            let replacement = if let Some(step) = captures.name("step") {
                let step: i64 = step.as_str().parse().expect("digits");
                let output = self.prior_output(step, step_number)?;
                if let Some(section) = captures.name("section") {
                    extract_section(output, section.as_str())
                } else if full.as_str().contains("_SUMMARY") {
                    self.cached_summary(&format!("step:{step}"), output, ctx)
                        .await?
                } else {
                    output.to_string()
                }
            } else {
                let from: i64 = captures["from"].parse().expect("digits");
                let to: i64 = captures["to"].parse().expect("digits");
                if from > to {
                    return Err(OrchestratorError::Template(format!(
                        "invalid summary range {from}-{to}"
                    )));
                }
                let mut joined = String::new();
                for step in from..=to {
                    if !joined.is_empty() {
                        joined.push_str("\n\n");
                    }
                    joined.push_str(self.prior_output(step, step_number)?);
                }
                self.cached_summary(&format!("steps:{from}-{to}"), &joined, ctx)
                    .await?
            };
            result.push_str(&replacement);
        }
        result.push_str(&instruction[cursor..]);
        Ok(result)
    }

    fn prior_output(&self, step: i64, current: i64) -> Result<&'a str> {
        if step >= current {
            return Err(OrchestratorError::Template(format!(
                "step {current} references step {step}, which has not run yet"
            )));
        }
        self.outputs
            .get(&step)
            .map(String::as_str)
            .ok_or_else(|| {
                OrchestratorError::Template(format!("no recorded output for step {step}"))
            })
    }

    async fn cached_summary(
        &self,
        key: &str,
        text: &str,
        ctx: &ScopeContext,
    ) -> Result<String> {
        if let Some(cached) = self.summaries.get(key) {
            return Ok(cached.clone());
        }
        let summary = self.summarizer.summarize(text, ctx).await?;
        self.summaries.insert(key.to_string(), summary.clone());
        Ok(summary)
    }
}

/// Extract a heading-matched section from step output.
///
/// A heading line either starts with `#` or ends with `:` and must
/// contain the section name case-insensitively. The section runs to
/// the next heading line. When no heading matches, the full output is
/// returned so a model's formatting drift does not sink the step.
pub fn extract_section(text: &str, section: &str) -> String {
    let wanted = section.trim().to_lowercase();
    let lines: Vec<&str> = text.lines().collect();

    let mut start = None;
    for (index, line) in lines.iter().enumerate() {
        if is_heading(line) && line.to_lowercase().contains(&wanted) {
            start = Some(index + 1);
            break;
        }
    }
    let Some(start) = start else {
        log::warn!("section '{section}' not found in step output, using full text");
        return text.to_string();
    };

    let mut end = lines.len();
    for (offset, line) in lines[start..].iter().enumerate() {
        if is_heading(line) {
            end = start + offset;
            break;
        }
    }
    lines[start..end].join("\n").trim().to_string()
}

fn is_heading(line: &str) -> bool {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return false;
    }
    trimmed.starts_with('#')
        || (trimmed.ends_with(':') && trimmed.len() <= 64 && !trimmed.contains('.'))
}
