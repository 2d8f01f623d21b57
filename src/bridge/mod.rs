//! Chat bridge: one outbound call to one model endpoint.
//!
//! The bridge abstracts over two wire shapes (OpenAI chat completions
//! and Ollama chat) behind the [`ChatProvider`] trait. A bridge owns
//! an adoptable [`ModelIdentity`]: on successful fallback the
//! validator swaps the identity in place and subsequent calls on the
//! same task use the adopted model.

pub mod hooks;
pub mod messages;
pub mod params;
pub mod scripted;
pub mod wire;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{json, Value};

use crate::context::ScopeContext;
use crate::error::{OrchestratorError, Result};
use crate::store::{Model, ResponseLogWriter, Store};

use hooks::{NoopHooks, SharedHooks};
use messages::{ChatMessage, ResponseEnvelope};

pub use hooks::BridgeHooks;
pub use messages::TokenUsage;
pub use params::{ParamFilter, SamplingParams};

/// Default per-call HTTP timeout.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(600);

/// Error-body substring that identifies a tools rejection.
const NO_TOOLS_MARKER: &str = "does not support tools";

/// Which wire shape an endpoint speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// OpenAI-compatible `/v1/chat/completions`.
    OpenAi,
    /// Ollama `/api/chat`.
    Ollama,
}

impl ProviderKind {
    /// Infer the provider from the endpoint host/port.
    pub fn detect(endpoint: &str) -> Self {
        let lower = endpoint.to_lowercase();
        if lower.contains(":11434") || lower.contains("ollama") {
            ProviderKind::Ollama
        } else {
            ProviderKind::OpenAi
        }
    }
}

/// The model a bridge currently speaks to.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelIdentity {
    /// Registry row id, when the model is cataloged.
    pub model_id: Option<i64>,
    pub model: String,
    pub endpoint: String,
    pub api_key: Option<String>,
    pub provider: ProviderKind,
    pub filter: ParamFilter,
    /// The model never receives tool schemas.
    pub no_tools: bool,
    pub input_token_cost: f64,
    pub output_token_cost: f64,
}

impl ModelIdentity {
    /// Identity for a bare model name and endpoint; provider inferred.
    pub fn new(model: impl Into<String>, endpoint: impl Into<String>) -> Self {
        let model = model.into();
        let endpoint = endpoint.into();
        Self {
            model_id: None,
            provider: ProviderKind::detect(&endpoint),
            filter: ParamFilter::for_model(&model),
            model,
            endpoint,
            api_key: None,
            no_tools: false,
            input_token_cost: 0.0,
            output_token_cost: 0.0,
        }
    }

    /// Identity built from a registry row.
    pub fn from_model(model: &Model, api_key: Option<String>) -> Self {
        let provider = ProviderKind::detect(&model.endpoint);
        Self {
            model_id: Some(model.id),
            filter: ParamFilter::from_metadata(&model.name, model.metadata.as_ref()),
            model: model.name.clone(),
            endpoint: model.endpoint.clone(),
            api_key,
            provider,
            no_tools: model.no_tools,
            input_token_cost: model.input_token_cost,
            output_token_cost: model.output_token_cost,
        }
    }

    /// Explicit provider override.
    pub fn with_provider(mut self, provider: ProviderKind) -> Self {
        self.provider = provider;
        self
    }

    /// Set the bearer key (ignored on Ollama endpoints).
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }
}

/// Provider seam: a single outbound call with an adoptable identity.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Issue one call and return the parsed envelope.
    async fn call_once(
        &self,
        messages: &[ChatMessage],
        tools: &[Value],
        ctx: &ScopeContext,
    ) -> Result<ResponseEnvelope>;

    /// Snapshot of the current identity.
    fn identity(&self) -> ModelIdentity;

    /// Swap the identity in place; subsequent calls use it.
    fn adopt(&self, identity: ModelIdentity);

    /// The sampling configuration this provider sends.
    fn sampling(&self) -> SamplingParams;
}

/// Constructs providers for fallback candidates and checker agents.
pub trait ProviderFactory: Send + Sync {
    /// Provider for a cataloged model, copying the given sampling.
    fn make(&self, model: &Model, params: &SamplingParams) -> Arc<dyn ChatProvider>;
}

/// HTTP implementation of [`ChatProvider`].
pub struct ChatBridge {
    client: reqwest::Client,
    identity: RwLock<ModelIdentity>,
    params: SamplingParams,
    timeout: Duration,
    hooks: SharedHooks,
    log: Option<ResponseLogWriter>,
    store: Option<Arc<Store>>,
}

impl std::fmt::Debug for ChatBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatBridge")
            .field("identity", &*self.identity.read())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl ChatBridge {
    /// Bridge for an identity with default timeout and no hooks.
    pub fn new(identity: ModelIdentity, params: SamplingParams) -> Self {
        Self {
            client: reqwest::Client::new(),
            identity: RwLock::new(identity),
            params,
            timeout: DEFAULT_CALL_TIMEOUT,
            hooks: Arc::new(NoopHooks),
            log: None,
            store: None,
        }
    }

    /// Set the per-call timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the busy/free hooks.
    pub fn with_hooks(mut self, hooks: SharedHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Attach the response-log writer; every call appends one row.
    pub fn with_log(mut self, log: ResponseLogWriter) -> Self {
        self.log = Some(log);
        self
    }

    /// Attach the store for usage accounting.
    pub fn with_store(mut self, store: Arc<Store>) -> Self {
        self.store = Some(store);
        self
    }

    fn request_url(&self, identity: &ModelIdentity) -> String {
        let base = identity.endpoint.trim_end_matches('/');
        match identity.provider {
            ProviderKind::OpenAi => format!("{base}/v1/chat/completions"),
            ProviderKind::Ollama => format!("{base}/api/chat"),
        }
    }

    fn build_body(
        &self,
        identity: &ModelIdentity,
        messages: &[ChatMessage],
        tools: &[Value],
    ) -> Value {
        let tools = if identity.no_tools { &[][..] } else { tools };
        match identity.provider {
            ProviderKind::OpenAi => wire::build_openai_body(
                &identity.model,
                messages,
                tools,
                &self.params,
                &identity.filter,
            ),
            ProviderKind::Ollama => wire::build_ollama_body(
                &identity.model,
                messages,
                tools,
                &self.params,
                &identity.filter,
            ),
        }
    }

    fn record_usage(&self, identity: &ModelIdentity, envelope: &ResponseEnvelope) {
        let Some(store) = &self.store else { return };
        let Some(usage) = envelope.usage else { return };
        let cost = usage.input_tokens as f64 * identity.input_token_cost
            + usage.output_tokens as f64 * identity.output_token_cost;
        if let Err(e) = store.add_usage(&crate::store::usage::current_month(), usage.total(), cost)
        {
            log::warn!("usage accounting failed: {e}");
        }
    }

    fn append_log(
        &self,
        ctx: &ScopeContext,
        identity: &ModelIdentity,
        request: &Value,
        response: Option<&Value>,
    ) {
        if let Some(log) = &self.log {
            log.append(
                &ctx.thread_id,
                ctx.agent_name.as_deref(),
                &identity.model,
                request,
                response,
            );
        }
    }
}

#[async_trait]
impl ChatProvider for ChatBridge {
    async fn call_once(
        &self,
        messages: &[ChatMessage],
        tools: &[Value],
        ctx: &ScopeContext,
    ) -> Result<ResponseEnvelope> {
        ctx.ensure_active()?;
        let identity = self.identity.read().clone();
        let body = self.build_body(&identity, messages, tools);
        let url = self.request_url(&identity);

        log::debug!(
            "call_once: model={} scope={} messages={} tools={}",
            identity.model,
            ctx.scope,
            messages.len(),
            tools.len()
        );

        let mut request = self.client.post(&url).timeout(self.timeout).json(&body);
        if identity.provider != ProviderKind::Ollama {
            if let Some(key) = &identity.api_key {
                request = request.bearer_auth(key);
            }
        }

        self.hooks.model_busy(&identity.model);
        let outcome = tokio::select! {
            response = request.send() => response,
            _ = ctx.cancel.cancelled() => {
                self.hooks.model_free(&identity.model);
                self.append_log(ctx, &identity, &body, None);
                log::error!(
                    "model={} scope={} call aborted by cancellation; request={}",
                    identity.model,
                    ctx.scope,
                    body
                );
                return Err(OrchestratorError::Cancelled);
            }
        };
        self.hooks.model_free(&identity.model);

        let response = match outcome {
            Ok(response) => response,
            Err(e) => {
                self.append_log(ctx, &identity, &body, None);
                log::error!(
                    "model={} scope={} transport failure: {e}; request={}",
                    identity.model,
                    ctx.scope,
                    body
                );
                return Err(e.into());
            }
        };

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            self.append_log(ctx, &identity, &body, Some(&json!({ "error": error_body })));
            log::error!(
                "model={} scope={} http {}: {error_body}; request={}",
                identity.model,
                ctx.scope,
                status.as_u16(),
                body
            );
            if error_body.contains(NO_TOOLS_MARKER) {
                return Err(OrchestratorError::ModelRejectsTools {
                    model: identity.model,
                });
            }
            return Err(OrchestratorError::ProviderHttp {
                status: status.as_u16(),
                body: error_body,
            });
        }

        let raw: Value = response.json().await?;
        self.append_log(ctx, &identity, &body, Some(&raw));

        let envelope = wire::parse_response(raw);
        self.record_usage(&identity, &envelope);

        log::info!(
            "model={} scope={} ok: {} chars, {} tool calls, finish={:?}",
            identity.model,
            ctx.scope,
            envelope.text().len(),
            envelope.tool_calls.len(),
            envelope.finish_reason
        );
        Ok(envelope)
    }

    fn identity(&self) -> ModelIdentity {
        self.identity.read().clone()
    }

    fn adopt(&self, identity: ModelIdentity) {
        log::info!(
            "bridge adopts model '{}' (was '{}')",
            identity.model,
            self.identity.read().model
        );
        *self.identity.write() = identity;
    }

    fn sampling(&self) -> SamplingParams {
        self.params.clone()
    }
}

/// Factory producing HTTP bridges that share log, store, and hooks.
pub struct HttpProviderFactory {
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub hooks: SharedHooks,
    pub log: Option<ResponseLogWriter>,
    pub store: Option<Arc<Store>>,
}

impl HttpProviderFactory {
    /// Factory wired to a store and its log writer.
    pub fn new(store: Arc<Store>, log: ResponseLogWriter) -> Self {
        Self {
            api_key: None,
            timeout: DEFAULT_CALL_TIMEOUT,
            hooks: Arc::new(NoopHooks),
            log: Some(log),
            store: Some(store),
        }
    }

    /// Default bearer key for non-Ollama endpoints.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }
}

impl ProviderFactory for HttpProviderFactory {
    fn make(&self, model: &Model, params: &SamplingParams) -> Arc<dyn ChatProvider> {
        let identity = ModelIdentity::from_model(model, self.api_key.clone());
        let mut bridge = ChatBridge::new(identity, params.clone())
            .with_timeout(self.timeout)
            .with_hooks(self.hooks.clone());
        if let Some(log) = &self.log {
            bridge = bridge.with_log(log.clone());
        }
        if let Some(store) = &self.store {
            bridge = bridge.with_store(store.clone());
        }
        Arc::new(bridge)
    }
}
