//! Response validation wrapper.
//!
//! [`Validator::call_with_validation`] wraps a bridge call with
//! deterministic checks, the optional LLM judge, feedback-injected
//! retries, verdict stamping on the response log, an optional
//! diagnosis call, and ranked-model fallback. Retry, checker, and
//! fallback compose in this one place so the "adopt fallback model
//! for the remainder of the task" side effect stays localized.

pub mod checker;
pub mod checks;
pub mod fallback;
pub mod policy;

use std::sync::Arc;

use serde_json::Value;

use crate::bridge::messages::{ChatMessage, ResponseEnvelope};
use crate::bridge::{ChatProvider, ProviderFactory};
use crate::context::ScopeContext;
use crate::error::{OrchestratorError, Result};
use crate::registry::Registry;
use crate::store::{CallResult, ResponseLogWriter, Store};

pub use checker::Checker;
pub use checks::CheckVerdict;
pub use policy::{operation_key, EffectivePolicy, OperationPolicy, ValidationOptions, ValidationRule};

/// Outcome of a validated call.
#[derive(Debug, Clone)]
pub struct ValidatedCall {
    /// The returned envelope; possibly invalid when `valid` is false.
    pub envelope: ResponseEnvelope,
    pub valid: bool,
    /// Attempts consumed on the model that produced `envelope`.
    pub attempts: u32,
    /// Last verdict, absent on passthrough calls.
    pub verdict: Option<CheckVerdict>,
    /// Name of the fallback model adopted mid-task, if any.
    pub adopted_fallback: Option<String>,
}

impl ValidatedCall {
    /// Step-record projection of this outcome.
    pub fn to_validation_json(&self) -> Value {
        serde_json::json!({
            "valid": self.valid,
            "attempts": self.attempts,
            "verdict": self.verdict,
            "adopted_fallback": self.adopted_fallback,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AttemptStatus {
    /// A valid response was produced.
    Valid,
    /// The response is invalid and the verdict forbids retrying.
    InvalidNoRetry,
    /// The retry budget ran out on retryable failures.
    Exhausted,
    /// The provider failed at the HTTP/transport level.
    ProviderFailed,
}

#[derive(Debug)]
pub(crate) struct AttemptOutcome {
    pub envelope: Option<ResponseEnvelope>,
    pub verdict: Option<CheckVerdict>,
    pub attempts: u32,
    pub status: AttemptStatus,
}

/// The validation orchestrator.
pub struct Validator {
    store: Arc<Store>,
    registry: Arc<Registry>,
    log: ResponseLogWriter,
    factory: Arc<dyn ProviderFactory>,
    options: ValidationOptions,
}

impl std::fmt::Debug for Validator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Validator")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Validator {
    /// Validator over a store, registry, log writer, and provider
    /// factory (used for checker and fallback bridges).
    pub fn new(
        store: Arc<Store>,
        registry: Arc<Registry>,
        log: ResponseLogWriter,
        factory: Arc<dyn ProviderFactory>,
        options: ValidationOptions,
    ) -> Self {
        Self {
            store,
            registry,
            log,
            factory,
            options,
        }
    }

    /// The active options.
    pub fn options(&self) -> &ValidationOptions {
        &self.options
    }

    pub(crate) fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub(crate) fn factory(&self) -> &Arc<dyn ProviderFactory> {
        &self.factory
    }

    /// Call the provider under the full validation contract.
    pub async fn call_with_validation(
        &self,
        provider: &dyn ChatProvider,
        messages: &[ChatMessage],
        tools: &[Value],
        ctx: &ScopeContext,
    ) -> Result<ValidatedCall> {
        // Skip-role and disabled-validation passthrough: one call, no
        // verdict, no stamping.
        if !self.options.enabled || self.options.skips_role(ctx.agent_role.as_deref()) {
            let envelope = provider.call_once(messages, tools, ctx).await?;
            self.log.flush()?;
            return Ok(ValidatedCall {
                envelope,
                valid: true,
                attempts: 1,
                verdict: None,
                adopted_fallback: None,
            });
        }

        let policy = self.options.policy_for_scope(&ctx.scope);
        let outcome = self
            .attempt_loop(provider, messages, tools, &policy, ctx)
            .await?;

        let primary = provider.identity();
        let role = ctx.agent_role.clone();

        match outcome.status {
            AttemptStatus::Valid => {
                self.record_outcome(role.as_deref(), primary.model_id, true);
                Ok(ValidatedCall {
                    envelope: outcome.envelope.expect("valid outcome has envelope"),
                    valid: true,
                    attempts: outcome.attempts,
                    verdict: outcome.verdict,
                    adopted_fallback: None,
                })
            }
            AttemptStatus::InvalidNoRetry => {
                // The verdict forbids retrying; hand the invalid
                // response back to the caller untouched.
                self.record_outcome(role.as_deref(), primary.model_id, false);
                Ok(ValidatedCall {
                    envelope: outcome.envelope.unwrap_or_default(),
                    valid: false,
                    attempts: outcome.attempts,
                    verdict: outcome.verdict,
                    adopted_fallback: None,
                })
            }
            AttemptStatus::Exhausted | AttemptStatus::ProviderFailed => {
                self.record_outcome(role.as_deref(), primary.model_id, false);

                if policy.ask_failure_reason {
                    self.ask_failure_reason(provider, messages, &outcome, ctx)
                        .await;
                }

                if self.options.enable_fallback && role.is_some() {
                    if let Some(call) = fallback::run_fallback(
                        self,
                        provider,
                        messages,
                        tools,
                        &policy,
                        ctx,
                    )
                    .await?
                    {
                        return Ok(call);
                    }
                }

                Ok(ValidatedCall {
                    envelope: outcome.envelope.unwrap_or_default(),
                    valid: false,
                    attempts: outcome.attempts,
                    verdict: outcome.verdict,
                    adopted_fallback: None,
                })
            }
        }
    }

    /// The bounded retry loop shared by the primary call and every
    /// fallback candidate: call, flush, check, judge, stamp, inject
    /// feedback, repeat.
    pub(crate) async fn attempt_loop(
        &self,
        provider: &dyn ChatProvider,
        messages: &[ChatMessage],
        tools: &[Value],
        policy: &EffectivePolicy,
        ctx: &ScopeContext,
    ) -> Result<AttemptOutcome> {
        let mut working: Vec<ChatMessage> = messages.to_vec();
        let mut last_envelope = None;
        let mut last_verdict = None;
        let total_attempts = policy.max_retries + 1;

        for attempt in 1..=total_attempts {
            ctx.ensure_active()?;

            let envelope = match provider.call_once(&working, tools, ctx).await {
                Ok(envelope) => envelope,
                Err(OrchestratorError::ModelRejectsTools { model }) => {
                    // Distinct outcome: the caller re-runs without
                    // tools. The appended log row still gets stamped.
                    self.stamp_last(ctx, CallResult::Failed, Some("model_rejects_tools"))?;
                    return Err(OrchestratorError::ModelRejectsTools { model });
                }
                Err(e) if e.is_recoverable() => {
                    // Provider-level failure: no in-place retry is
                    // consumed; terminal for this model.
                    self.stamp_last(ctx, CallResult::Failed, Some(&e.fail_reason()))?;
                    log::warn!(
                        "provider failure on attempt {attempt} for scope {}: {e}",
                        ctx.scope
                    );
                    return Ok(AttemptOutcome {
                        envelope: None,
                        verdict: None,
                        attempts: attempt,
                        status: AttemptStatus::ProviderFailed,
                    });
                }
                Err(e) => {
                    self.stamp_last(ctx, CallResult::Failed, Some(&e.fail_reason()))?;
                    return Err(e);
                }
            };

            // The response-log row must exist before its verdict is
            // stamped; the flush establishes that ordering.
            let log_id = self.log.flush_and_last_id(&ctx.thread_id)?;
            let mut envelope = envelope;
            envelope.log_id = log_id;

            let mut verdict =
                checks::deterministic_verdict(&policy.operation_key, &envelope, &working);

            if verdict.is_valid && policy.enable_checker {
                let judge = Checker::new(self.registry.clone(), self.factory.clone());
                let rules = self.options.rules_for(policy);
                verdict = judge.judge(&working, &envelope, &rules, ctx).await?;
                // The judge's own log row carries no verdict; persist
                // it alongside the attempt's.
                self.log.flush()?;
            }

            if let Some(log_id) = log_id {
                let result = if verdict.is_valid {
                    CallResult::Success
                } else {
                    CallResult::Failed
                };
                self.store
                    .stamp_response_log(log_id, result, verdict.reason.as_deref())?;
            }

            if verdict.is_valid {
                return Ok(AttemptOutcome {
                    envelope: Some(envelope),
                    verdict: Some(verdict),
                    attempts: attempt,
                    status: AttemptStatus::Valid,
                });
            }

            if !verdict.needs_retry {
                return Ok(AttemptOutcome {
                    envelope: Some(envelope),
                    verdict: Some(verdict),
                    attempts: attempt,
                    status: AttemptStatus::InvalidNoRetry,
                });
            }

            if attempt < total_attempts {
                let feedback = verdict.system_message_override.clone().unwrap_or_else(|| {
                    format!(
                        "attempt {attempt}: {}",
                        verdict.reason.as_deref().unwrap_or("response rejected")
                    )
                });
                working.push(ChatMessage::system(feedback));
            }

            last_envelope = Some(envelope);
            last_verdict = Some(verdict);
        }

        Ok(AttemptOutcome {
            envelope: last_envelope,
            verdict: last_verdict,
            attempts: total_attempts,
            status: AttemptStatus::Exhausted,
        })
    }

    /// Stamp the most recent log row of this thread, if one exists.
    fn stamp_last(
        &self,
        ctx: &ScopeContext,
        result: CallResult,
        fail_reason: Option<&str>,
    ) -> Result<()> {
        if let Some(log_id) = self.log.flush_and_last_id(&ctx.thread_id)? {
            self.store.stamp_response_log(log_id, result, fail_reason)?;
        }
        Ok(())
    }

    fn record_outcome(&self, role: Option<&str>, model_id: Option<i64>, success: bool) {
        let (Some(role), Some(model_id)) = (role, model_id) else {
            return;
        };
        if let Err(e) = self.registry.record_role_outcome(role, model_id, success) {
            log::warn!("role outcome accounting failed: {e}");
        }
    }

    /// Single-turn diagnosis: ask the model to explain its own
    /// failure. Best-effort; the answer goes to the log only.
    async fn ask_failure_reason(
        &self,
        provider: &dyn ChatProvider,
        messages: &[ChatMessage],
        outcome: &AttemptOutcome,
        ctx: &ScopeContext,
    ) {
        let reason = outcome
            .verdict
            .as_ref()
            .and_then(|v| v.reason.clone())
            .unwrap_or_else(|| "the response was rejected".to_string());

        let mut diagnostic = messages.to_vec();
        diagnostic.push(ChatMessage::user(format!(
            "Your previous answers were rejected ({reason}). In two or three \
             sentences, explain what made them fail the requirements. Do not \
             answer the original request again."
        )));

        match provider.call_once(&diagnostic, &[], ctx).await {
            Ok(envelope) => {
                // Keep the §8 invariant: every row of a validated call
                // path ends up examined.
                if let Err(e) = self.stamp_last(ctx, CallResult::Success, Some("diagnosis")) {
                    log::warn!("failed to stamp diagnosis row: {e}");
                }
                log::warn!(
                    "failure diagnosis from {} (scope {}): {}",
                    provider.identity().model,
                    ctx.scope,
                    envelope.text()
                );
            }
            Err(e) => {
                let _ = self.stamp_last(ctx, CallResult::Failed, Some("diagnosis_failed"));
                log::warn!("failure diagnosis call failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::messages::ToolCall;
    use crate::bridge::scripted::{ScriptedFactory, ScriptedProvider, ScriptedReply};
    use crate::store::Model;

    struct Fixture {
        store: Arc<Store>,
        registry: Arc<Registry>,
        log: ResponseLogWriter,
        factory: Arc<ScriptedFactory>,
    }

    impl Fixture {
        fn new() -> Self {
            let store = Arc::new(Store::open_in_memory().unwrap());
            let registry = Arc::new(Registry::new(store.clone()));
            let log = ResponseLogWriter::new(store.clone());
            Self {
                store,
                registry,
                log,
                factory: Arc::new(ScriptedFactory::new()),
            }
        }

        fn validator(&self, options: ValidationOptions) -> Validator {
            Validator::new(
                self.store.clone(),
                self.registry.clone(),
                self.log.clone(),
                self.factory.clone(),
                options,
            )
        }

        fn provider(&self, model: &str, replies: Vec<ScriptedReply>) -> ScriptedProvider {
            ScriptedProvider::new(model, replies).with_log(self.log.clone())
        }
    }

    fn writer_ctx() -> ScopeContext {
        ScopeContext::new("story/generate").with_agent("W1", "writer")
    }

    #[tokio::test]
    async fn test_valid_response_stamped_success() {
        let fixture = Fixture::new();
        let validator = fixture.validator(ValidationOptions {
            enable_fallback: false,
            ..ValidationOptions::default()
        });
        let provider = fixture.provider("m1", vec![ScriptedReply::Text("a chapter".into())]);
        let ctx = writer_ctx();

        let call = validator
            .call_with_validation(&provider, &[ChatMessage::user("write")], &[], &ctx)
            .await
            .unwrap();

        assert!(call.valid);
        assert_eq!(call.attempts, 1);
        assert_eq!(call.envelope.text(), "a chapter");

        let logs = fixture.store.response_logs_for_thread(&ctx.thread_id).unwrap();
        assert_eq!(logs.len(), 1);
        assert!(logs[0].examined);
        assert_eq!(logs[0].result.as_deref(), Some("SUCCESS"));
        assert_eq!(call.envelope.log_id, Some(logs[0].id));
    }

    #[tokio::test]
    async fn test_retry_in_place_on_empty_then_valid() {
        let fixture = Fixture::new();
        let validator = fixture.validator(ValidationOptions {
            enable_fallback: false,
            ..ValidationOptions::default()
        });
        let provider = fixture.provider(
            "m1",
            vec![
                ScriptedReply::Empty,
                ScriptedReply::Text("recovered".into()),
            ],
        );
        let ctx = writer_ctx();

        let call = validator
            .call_with_validation(&provider, &[ChatMessage::user("write")], &[], &ctx)
            .await
            .unwrap();

        assert!(call.valid);
        assert_eq!(call.attempts, 2);

        let logs = fixture.store.response_logs_for_thread(&ctx.thread_id).unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].result.as_deref(), Some("FAILED"));
        assert_eq!(logs[0].fail_reason.as_deref(), Some("empty_response"));
        assert_eq!(logs[1].result.as_deref(), Some("SUCCESS"));

        // The retry carried an injected feedback system line.
        let second_call = &provider.received()[1];
        assert!(second_call
            .iter()
            .any(|m| m.text().contains("attempt 1: empty_response")));
    }

    #[tokio::test]
    async fn test_zero_retries_means_single_attempt() {
        let fixture = Fixture::new();
        let validator = fixture.validator(ValidationOptions {
            max_retries: 0,
            enable_fallback: false,
            ..ValidationOptions::default()
        });
        let provider = fixture.provider("m1", vec![ScriptedReply::Empty]);
        let ctx = writer_ctx();

        let call = validator
            .call_with_validation(&provider, &[ChatMessage::user("write")], &[], &ctx)
            .await
            .unwrap();
        assert!(!call.valid);
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn test_skip_role_is_passthrough() {
        let fixture = Fixture::new();
        let validator = fixture.validator(ValidationOptions::default());
        let provider = fixture.provider("judge", vec![ScriptedReply::Empty]);
        let ctx = ScopeContext::new("story/check").with_agent("C1", "response_checker");

        // An empty response passes untouched: no validation, no retry.
        let call = validator
            .call_with_validation(&provider, &[ChatMessage::user("judge")], &[], &ctx)
            .await
            .unwrap();
        assert!(call.valid);
        assert!(call.verdict.is_none());
        assert_eq!(provider.call_count(), 1);

        let logs = fixture.store.response_logs_for_thread(&ctx.thread_id).unwrap();
        assert_eq!(logs.len(), 1);
        assert!(!logs[0].examined);
    }

    #[tokio::test]
    async fn test_tool_calls_count_as_valid() {
        let fixture = Fixture::new();
        let validator = fixture.validator(ValidationOptions {
            enable_fallback: false,
            ..ValidationOptions::default()
        });
        let provider = fixture.provider(
            "m1",
            vec![ScriptedReply::ToolCalls(vec![ToolCall::new(
                "c1",
                "lookup_name",
                "{}",
            )])],
        );
        let ctx = writer_ctx();

        let call = validator
            .call_with_validation(&provider, &[ChatMessage::user("write")], &[], &ctx)
            .await
            .unwrap();
        assert!(call.valid);
        assert!(call.envelope.has_tool_calls());
    }

    #[tokio::test]
    async fn test_provider_http_error_consumes_no_retries() {
        let fixture = Fixture::new();
        let validator = fixture.validator(ValidationOptions {
            max_retries: 3,
            enable_fallback: false,
            ..ValidationOptions::default()
        });
        let provider = fixture.provider("m1", vec![ScriptedReply::HttpError(500, "boom".into())]);
        let ctx = writer_ctx();

        let call = validator
            .call_with_validation(&provider, &[ChatMessage::user("write")], &[], &ctx)
            .await
            .unwrap();
        assert!(!call.valid);
        // One HTTP failure short-circuits the in-place budget.
        assert_eq!(provider.call_count(), 1);

        let logs = fixture.store.response_logs_for_thread(&ctx.thread_id).unwrap();
        assert_eq!(logs[0].result.as_deref(), Some("FAILED"));
        assert_eq!(logs[0].fail_reason.as_deref(), Some("http_500"));
    }

    #[tokio::test]
    async fn test_model_rejects_tools_surfaces() {
        let fixture = Fixture::new();
        let validator = fixture.validator(ValidationOptions::default());
        let provider = fixture.provider(
            "m1",
            vec![ScriptedReply::HttpError(
                400,
                "model does not support tools".into(),
            )],
        );
        let ctx = writer_ctx();

        let err = validator
            .call_with_validation(&provider, &[ChatMessage::user("write")], &[], &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::ModelRejectsTools { .. }));
    }

    #[tokio::test]
    async fn test_primary_failure_counter_recorded() {
        let fixture = Fixture::new();
        let model_id = fixture
            .registry
            .upsert_model(&Model::new("m1", "http://x"))
            .unwrap();
        let validator = fixture.validator(ValidationOptions {
            max_retries: 0,
            enable_fallback: false,
            ..ValidationOptions::default()
        });

        let mut identity = crate::bridge::ModelIdentity::new("m1", "http://x");
        identity.model_id = Some(model_id);
        let provider = fixture
            .provider("m1", vec![ScriptedReply::Empty])
            .with_identity(identity);
        let ctx = writer_ctx();

        validator
            .call_with_validation(&provider, &[ChatMessage::user("write")], &[], &ctx)
            .await
            .unwrap();

        assert_eq!(
            fixture.store.role_outcome_counts("writer", model_id).unwrap(),
            (0, 1)
        );
    }

    #[tokio::test]
    async fn test_checker_rejection_triggers_retry() {
        let fixture = Fixture::new();

        // Judge agent wired to a scripted judge model: rejects once,
        // then approves.
        let judge_model_id = fixture
            .registry
            .upsert_model(&Model::new("judge-model", "http://x"))
            .unwrap();
        let mut judge_agent = crate::store::Agent::new("C1", "response_checker");
        judge_agent.model_id = Some(judge_model_id);
        fixture.registry.upsert_agent(&judge_agent).unwrap();
        fixture.factory.register(
            "judge-model",
            Arc::new(ScriptedProvider::new(
                "judge-model",
                vec![
                    ScriptedReply::Text(
                        r#"{"is_valid": false, "needs_retry": true, "reason": "too bland"}"#
                            .into(),
                    ),
                    ScriptedReply::Text(r#"{"is_valid": true}"#.into()),
                ],
            )),
        );

        let validator = fixture.validator(ValidationOptions {
            enable_checker: true,
            enable_fallback: false,
            ..ValidationOptions::default()
        });
        let provider = fixture.provider(
            "m1",
            vec![
                ScriptedReply::Text("draft one".into()),
                ScriptedReply::Text("draft two".into()),
            ],
        );
        let ctx = writer_ctx();

        let call = validator
            .call_with_validation(&provider, &[ChatMessage::user("write")], &[], &ctx)
            .await
            .unwrap();
        assert!(call.valid);
        assert_eq!(call.attempts, 2);
        assert_eq!(call.envelope.text(), "draft two");

        // The rejected attempt was stamped FAILED with the judge's
        // reason.
        let logs = fixture.store.response_logs_for_thread(&ctx.thread_id).unwrap();
        let failed: Vec<_> = logs
            .iter()
            .filter(|l| l.result.as_deref() == Some("FAILED"))
            .collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].fail_reason.as_deref(), Some("too bland"));
    }

    #[tokio::test]
    async fn test_needs_retry_false_returns_invalid_without_fallback() {
        let fixture = Fixture::new();

        let judge_model_id = fixture
            .registry
            .upsert_model(&Model::new("judge-model", "http://x"))
            .unwrap();
        let mut judge_agent = crate::store::Agent::new("C1", "response_checker");
        judge_agent.model_id = Some(judge_model_id);
        fixture.registry.upsert_agent(&judge_agent).unwrap();
        fixture.factory.register(
            "judge-model",
            Arc::new(ScriptedProvider::always_text(
                "judge-model",
                r#"{"is_valid": false, "needs_retry": false, "reason": "unfixable"}"#,
            )),
        );

        let validator = fixture.validator(ValidationOptions {
            enable_checker: true,
            ..ValidationOptions::default()
        });
        let provider = fixture.provider("m1", vec![ScriptedReply::Text("draft".into())]);
        let ctx = writer_ctx();

        let call = validator
            .call_with_validation(&provider, &[ChatMessage::user("write")], &[], &ctx)
            .await
            .unwrap();
        assert!(!call.valid);
        assert_eq!(call.attempts, 1);
        assert_eq!(provider.call_count(), 1);
        assert_eq!(
            call.verdict.unwrap().reason.as_deref(),
            Some("unfixable")
        );
    }

    #[tokio::test]
    async fn test_cancellation_honored_between_attempts() {
        let fixture = Fixture::new();
        let validator = fixture.validator(ValidationOptions {
            enable_fallback: false,
            ..ValidationOptions::default()
        });
        let provider = fixture.provider("m1", vec![ScriptedReply::Empty]);
        let ctx = writer_ctx();
        ctx.cancel.cancel();

        let err = validator
            .call_with_validation(&provider, &[ChatMessage::user("write")], &[], &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Cancelled));
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn test_diagnosis_call_issued_on_terminal_failure() {
        let fixture = Fixture::new();
        let validator = fixture.validator(ValidationOptions {
            max_retries: 0,
            ask_failure_reason: true,
            enable_fallback: false,
            ..ValidationOptions::default()
        });
        let provider = fixture.provider(
            "m1",
            vec![
                ScriptedReply::Empty,
                ScriptedReply::Text("I misread the instruction.".into()),
            ],
        );
        let ctx = writer_ctx();

        let call = validator
            .call_with_validation(&provider, &[ChatMessage::user("write")], &[], &ctx)
            .await
            .unwrap();
        assert!(!call.valid);
        // One failed attempt plus the diagnosis turn.
        assert_eq!(provider.call_count(), 2);
        let diagnostic = &provider.received()[1];
        assert!(diagnostic
            .last()
            .unwrap()
            .text()
            .contains("explain what made them fail"));

        // Every row of the validated path is examined.
        let logs = fixture.store.response_logs_for_thread(&ctx.thread_id).unwrap();
        assert!(logs.iter().all(|l| l.examined));
    }
}
