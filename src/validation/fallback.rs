//! Ranked-model fallback.
//!
//! When the primary model terminally fails validation for a role, the
//! ranked alternates for that role each get the full retry budget. The
//! first success is adopted into the caller's bridge, so the rest of
//! the task runs on the fallback model.

use serde_json::Value;

use crate::bridge::messages::ChatMessage;
use crate::bridge::{ChatProvider, ModelIdentity};
use crate::context::ScopeContext;
use crate::error::Result;

use super::policy::EffectivePolicy;
use super::{AttemptStatus, ValidatedCall, Validator};

/// Try the ranked fallback models for the ambient role.
///
/// Returns `None` when no candidate produces a valid response (or the
/// role has no fallback list).
pub(crate) async fn run_fallback(
    validator: &Validator,
    caller: &dyn ChatProvider,
    messages: &[ChatMessage],
    tools: &[Value],
    policy: &EffectivePolicy,
    ctx: &ScopeContext,
) -> Result<Option<ValidatedCall>> {
    let Some(role) = ctx.agent_role.as_deref() else {
        return Ok(None);
    };

    let primary = caller.identity();
    let candidates = validator.registry().fallback_models(role)?;
    if candidates.is_empty() {
        log::warn!("no fallback models ranked for role '{role}'");
        return Ok(None);
    }

    let sampling = caller.sampling();
    for candidate in candidates {
        if Some(candidate.id) == primary.model_id || candidate.name == primary.model {
            continue;
        }
        ctx.ensure_active()?;
        log::info!(
            "fallback: trying '{}' for role '{role}' (scope {})",
            candidate.name,
            ctx.scope
        );

        let provider = validator.factory().make(&candidate, &sampling);
        // Each candidate sees a pristine copy of the conversation.
        let cloned: Vec<ChatMessage> = messages.to_vec();
        let outcome = validator
            .attempt_loop(provider.as_ref(), &cloned, tools, policy, ctx)
            .await?;

        let success = outcome.status == AttemptStatus::Valid;
        validator.record_outcome_for(role, candidate.id, success);

        if success {
            // Adopt the fallback identity: the remainder of the task
            // runs on this model.
            caller.adopt(ModelIdentity::from_model(
                &candidate,
                primary.api_key.clone(),
            ));
            return Ok(Some(ValidatedCall {
                envelope: outcome.envelope.expect("valid outcome has envelope"),
                valid: true,
                attempts: outcome.attempts,
                verdict: outcome.verdict,
                adopted_fallback: Some(candidate.name.clone()),
            }));
        }
    }

    log::warn!("every fallback candidate failed for role '{role}'");
    Ok(None)
}

impl Validator {
    pub(crate) fn record_outcome_for(&self, role: &str, model_id: i64, success: bool) {
        if let Err(e) = self.registry().record_role_outcome(role, model_id, success) {
            log::warn!("fallback outcome accounting failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::super::{ValidationOptions, Validator};
    use crate::bridge::scripted::{ScriptedFactory, ScriptedProvider, ScriptedReply};
    use crate::bridge::ChatProvider;
    use crate::bridge::messages::ChatMessage;
    use crate::context::ScopeContext;
    use crate::registry::Registry;
    use crate::store::{Model, ResponseLogWriter, Store};

    struct Fixture {
        store: Arc<Store>,
        registry: Arc<Registry>,
        log: ResponseLogWriter,
        factory: Arc<ScriptedFactory>,
        m1: i64,
        m2: i64,
        m3: i64,
    }

    impl Fixture {
        fn new() -> Self {
            let store = Arc::new(Store::open_in_memory().unwrap());
            let registry = Arc::new(Registry::new(store.clone()));
            let log = ResponseLogWriter::new(store.clone());
            let m1 = registry.upsert_model(&Model::new("m1", "http://x")).unwrap();
            let m2 = registry.upsert_model(&Model::new("m2", "http://x")).unwrap();
            let m3 = registry.upsert_model(&Model::new("m3", "http://x")).unwrap();
            registry.set_role_fallbacks("writer", &[m1, m2, m3]).unwrap();
            Self {
                store,
                registry,
                log,
                factory: Arc::new(ScriptedFactory::new()),
                m1,
                m2,
                m3,
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

        fn primary(&self, replies: Vec<ScriptedReply>) -> ScriptedProvider {
            let mut identity = crate::bridge::ModelIdentity::new("m1", "http://x");
            identity.model_id = Some(self.m1);
            ScriptedProvider::new("m1", replies)
                .with_log(self.log.clone())
                .with_identity(identity)
        }
    }

    fn writer_ctx() -> ScopeContext {
        ScopeContext::new("story/generate").with_agent("W1", "writer")
    }

    #[tokio::test]
    async fn test_fallback_adopts_first_successful_candidate() {
        let fixture = Fixture::new();
        fixture.factory.register(
            "m2",
            Arc::new(
                ScriptedProvider::always_text("m2", "rescued by m2")
                    .with_log(fixture.log.clone()),
            ),
        );

        let validator = fixture.validator(ValidationOptions {
            max_retries: 1,
            ..ValidationOptions::default()
        });
        let primary = fixture.primary(vec![ScriptedReply::Empty]);
        let ctx = writer_ctx();

        let call = validator
            .call_with_validation(&primary, &[ChatMessage::user("write")], &[], &ctx)
            .await
            .unwrap();

        assert!(call.valid);
        assert_eq!(call.adopted_fallback.as_deref(), Some("m2"));
        assert_eq!(call.envelope.text(), "rescued by m2");
        // The caller's bridge now speaks as m2.
        assert_eq!(primary.identity().model, "m2");

        // Primary recorded a failure, the fallback a success.
        assert_eq!(
            fixture.store.role_outcome_counts("writer", fixture.m1).unwrap(),
            (0, 1)
        );
        assert_eq!(
            fixture.store.role_outcome_counts("writer", fixture.m2).unwrap(),
            (1, 0)
        );
    }

    #[tokio::test]
    async fn test_fallback_skips_primary_in_ranking() {
        let fixture = Fixture::new();
        // m1 (the primary) is ranked first; it must not be re-probed.
        let m1_clone = Arc::new(
            ScriptedProvider::always_text("m1", "never called").with_log(fixture.log.clone()),
        );
        fixture.factory.register("m1", m1_clone.clone());
        fixture.factory.register(
            "m2",
            Arc::new(
                ScriptedProvider::always_text("m2", "ok").with_log(fixture.log.clone()),
            ),
        );

        let validator = fixture.validator(ValidationOptions::default());
        let primary = fixture.primary(vec![ScriptedReply::Empty]);
        let ctx = writer_ctx();

        let call = validator
            .call_with_validation(&primary, &[ChatMessage::user("write")], &[], &ctx)
            .await
            .unwrap();
        assert!(call.valid);
        assert_eq!(m1_clone.call_count(), 0);
    }

    #[tokio::test]
    async fn test_candidates_each_get_full_retry_budget() {
        let fixture = Fixture::new();
        let m2 = Arc::new(
            ScriptedProvider::new(
                "m2",
                vec![ScriptedReply::Empty, ScriptedReply::Text("second try".into())],
            )
            .with_log(fixture.log.clone()),
        );
        fixture.factory.register("m2", m2.clone());

        let validator = fixture.validator(ValidationOptions {
            max_retries: 1,
            ..ValidationOptions::default()
        });
        let primary = fixture.primary(vec![ScriptedReply::Empty]);
        let ctx = writer_ctx();

        let call = validator
            .call_with_validation(&primary, &[ChatMessage::user("write")], &[], &ctx)
            .await
            .unwrap();
        assert!(call.valid);
        assert_eq!(call.attempts, 2);
        assert_eq!(m2.call_count(), 2);
    }

    #[tokio::test]
    async fn test_all_candidates_fail_returns_last_invalid() {
        let fixture = Fixture::new();
        fixture.factory.register(
            "m2",
            Arc::new(
                ScriptedProvider::new("m2", vec![ScriptedReply::Empty])
                    .with_log(fixture.log.clone()),
            ),
        );
        fixture.factory.register(
            "m3",
            Arc::new(
                ScriptedProvider::new("m3", vec![ScriptedReply::Empty])
                    .with_log(fixture.log.clone()),
            ),
        );

        let validator = fixture.validator(ValidationOptions {
            max_retries: 0,
            ..ValidationOptions::default()
        });
        let primary = fixture.primary(vec![ScriptedReply::Empty]);
        let ctx = writer_ctx();

        let call = validator
            .call_with_validation(&primary, &[ChatMessage::user("write")], &[], &ctx)
            .await
            .unwrap();
        assert!(!call.valid);
        assert!(call.adopted_fallback.is_none());
        // Identity unchanged on total failure.
        assert_eq!(primary.identity().model, "m1");
        assert_eq!(
            fixture.store.role_outcome_counts("writer", fixture.m3).unwrap(),
            (0, 1)
        );
    }

    #[tokio::test]
    async fn test_empty_fallback_list_fails_immediately() {
        let fixture = Fixture::new();
        fixture.registry.set_role_fallbacks("writer", &[]).unwrap();

        let validator = fixture.validator(ValidationOptions::default());
        let primary = fixture.primary(vec![ScriptedReply::Empty]);
        let ctx = writer_ctx();

        let call = validator
            .call_with_validation(&primary, &[ChatMessage::user("write")], &[], &ctx)
            .await
            .unwrap();
        assert!(!call.valid);
        assert!(call.adopted_fallback.is_none());
    }

    #[tokio::test]
    async fn test_candidate_conversations_are_pristine() {
        let fixture = Fixture::new();
        let m2 = Arc::new(
            ScriptedProvider::always_text("m2", "ok").with_log(fixture.log.clone()),
        );
        fixture.factory.register("m2", m2.clone());

        let validator = fixture.validator(ValidationOptions {
            max_retries: 2,
            ..ValidationOptions::default()
        });
        let primary = fixture.primary(vec![ScriptedReply::Empty]);
        let ctx = writer_ctx();

        validator
            .call_with_validation(&primary, &[ChatMessage::user("write")], &[], &ctx)
            .await
            .unwrap();

        // The candidate's first conversation carries none of the
        // primary's injected feedback lines.
        let first = &m2.received()[0];
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].text(), "write");
    }
}
