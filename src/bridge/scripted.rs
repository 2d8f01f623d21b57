//! Scripted in-memory provider.
//!
//! Returns predefined envelopes in sequence without touching the
//! network. Useful for exercising the validator, fallback, and step
//! engine in tests and dry runs.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};

use crate::context::ScopeContext;
use crate::error::{OrchestratorError, Result};
use crate::store::ResponseLogWriter;

use super::messages::{ChatMessage, ResponseEnvelope, ToolCall};
use super::params::SamplingParams;
use super::{ChatProvider, ModelIdentity};

/// One scripted reply.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    /// Plain text answer.
    Text(String),
    /// Tool calls, no text.
    ToolCalls(Vec<ToolCall>),
    /// Provider HTTP failure.
    HttpError(u16, String),
    /// Empty response body.
    Empty,
}

impl ScriptedReply {
    fn into_result(self, model: &str) -> Result<ResponseEnvelope> {
        match self {
            ScriptedReply::Text(text) => Ok(ResponseEnvelope {
                raw: json!({
                    "choices": [{"message": {"role": "assistant", "content": text.clone()},
                                 "finish_reason": "stop"}]
                }),
                text_content: Some(text),
                tool_calls: Vec::new(),
                finish_reason: Some("stop".to_string()),
                usage: None,
                log_id: None,
            }),
            ScriptedReply::ToolCalls(calls) => Ok(ResponseEnvelope {
                raw: json!({"scripted": "tool_calls"}),
                text_content: None,
                tool_calls: calls,
                finish_reason: Some("tool_calls".to_string()),
                usage: None,
                log_id: None,
            }),
            ScriptedReply::HttpError(status, body) => {
                if body.contains("does not support tools") {
                    Err(OrchestratorError::ModelRejectsTools {
                        model: model.to_string(),
                    })
                } else {
                    Err(OrchestratorError::ProviderHttp { status, body })
                }
            }
            ScriptedReply::Empty => Ok(ResponseEnvelope {
                raw: json!({"response": ""}),
                ..Default::default()
            }),
        }
    }
}

/// A provider that replays a scripted reply sequence.
///
/// The final reply repeats once the script is exhausted. Every
/// received conversation is recorded for assertions.
pub struct ScriptedProvider {
    identity: RwLock<ModelIdentity>,
    params: SamplingParams,
    script: Mutex<VecDeque<ScriptedReply>>,
    last_reply: Mutex<Option<ScriptedReply>>,
    calls: Mutex<Vec<Vec<ChatMessage>>>,
    log: Option<ResponseLogWriter>,
}

impl std::fmt::Debug for ScriptedProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedProvider")
            .field("model", &self.identity.read().model)
            .field("remaining", &self.script.lock().len())
            .finish_non_exhaustive()
    }
}

impl ScriptedProvider {
    /// Provider named `model` replaying `replies` in order.
    pub fn new(model: impl Into<String>, replies: Vec<ScriptedReply>) -> Self {
        Self {
            identity: RwLock::new(ModelIdentity::new(model, "scripted://local")),
            params: SamplingParams::default(),
            script: Mutex::new(replies.into()),
            last_reply: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
            log: None,
        }
    }

    /// Convenience: a provider that always answers `text`.
    pub fn always_text(model: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(model, vec![ScriptedReply::Text(text.into())])
    }

    /// Append one response-log row per call, like the HTTP bridge.
    pub fn with_log(mut self, log: ResponseLogWriter) -> Self {
        self.log = Some(log);
        self
    }

    /// Use a registry-backed identity.
    pub fn with_identity(self, identity: ModelIdentity) -> Self {
        *self.identity.write() = identity;
        self
    }

    /// Conversations received so far, in call order.
    pub fn received(&self) -> Vec<Vec<ChatMessage>> {
        self.calls.lock().clone()
    }

    /// Number of calls received so far.
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    fn next_reply(&self) -> ScriptedReply {
        let mut script = self.script.lock();
        match script.pop_front() {
            Some(reply) => {
                *self.last_reply.lock() = Some(reply.clone());
                reply
            }
            None => self
                .last_reply
                .lock()
                .clone()
                .unwrap_or(ScriptedReply::Empty),
        }
    }
}

#[async_trait]
impl ChatProvider for ScriptedProvider {
    async fn call_once(
        &self,
        messages: &[ChatMessage],
        _tools: &[Value],
        ctx: &ScopeContext,
    ) -> Result<ResponseEnvelope> {
        ctx.ensure_active()?;
        self.calls.lock().push(messages.to_vec());

        let identity = self.identity.read().clone();
        let result = self.next_reply().into_result(&identity.model);

        if let Some(log) = &self.log {
            let response = match &result {
                Ok(envelope) => Some(envelope.raw.clone()),
                Err(e) => Some(json!({"error": e.to_string()})),
            };
            log.append(
                &ctx.thread_id,
                ctx.agent_name.as_deref(),
                &identity.model,
                &json!({"messages": messages.len()}),
                response.as_ref(),
            );
        }
        result
    }

    fn identity(&self) -> ModelIdentity {
        self.identity.read().clone()
    }

    fn adopt(&self, identity: ModelIdentity) {
        *self.identity.write() = identity;
    }

    fn sampling(&self) -> SamplingParams {
        self.params.clone()
    }
}

/// Scripted stand-in for [`super::ProviderFactory`]: hands out
/// pre-registered providers by model name.
#[derive(Default)]
pub struct ScriptedFactory {
    providers: Mutex<std::collections::HashMap<String, Arc<ScriptedProvider>>>,
}

impl ScriptedFactory {
    /// Empty factory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the provider handed out for `model`.
    pub fn register(&self, model: impl Into<String>, provider: Arc<ScriptedProvider>) {
        self.providers.lock().insert(model.into(), provider);
    }

    /// The provider registered for `model`, if any.
    pub fn get(&self, model: &str) -> Option<Arc<ScriptedProvider>> {
        self.providers.lock().get(model).cloned()
    }
}

impl super::ProviderFactory for ScriptedFactory {
    fn make(
        &self,
        model: &crate::store::Model,
        _params: &SamplingParams,
    ) -> Arc<dyn ChatProvider> {
        match self.get(&model.name) {
            Some(provider) => provider,
            None => Arc::new(ScriptedProvider::new(model.name.clone(), Vec::new())),
        }
    }
}
