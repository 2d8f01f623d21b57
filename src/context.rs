//! Explicit call-scope context.
//!
//! Every public operation takes a [`ScopeContext`] carrying the
//! operation scope string, thread-scope correlation id, agent
//! identity, and a cancellation signal. Scope strings select
//! validation policies (see `validation::policy::operation_key`) and
//! partition response-log rows per logical thread.

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};

/// Context value threaded through every outbound call.
#[derive(Debug, Clone)]
pub struct ScopeContext {
    /// Operation scope string, e.g. `story/add_voice_tags_to_story`
    /// or `tests/base/llama3.3`.
    pub scope: String,
    /// Correlation id shared by every log row of one logical thread.
    pub thread_id: String,
    /// Optional finer-grained operation id (one step, one judge call).
    pub operation_id: Option<String>,
    /// Name of the agent issuing the call, if any.
    pub agent_name: Option<String>,
    /// Role of the agent issuing the call, if any.
    pub agent_role: Option<String>,
    /// Cancellation signal. Honored between steps and between
    /// validation attempts; an in-flight HTTP call is aborted through
    /// the transport.
    pub cancel: CancellationToken,
}

impl ScopeContext {
    /// Create a context with a fresh thread id and no agent identity.
    pub fn new(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            thread_id: Uuid::new_v4().to_string(),
            operation_id: None,
            agent_name: None,
            agent_role: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Set the agent identity.
    pub fn with_agent(
        mut self,
        name: impl Into<String>,
        role: impl Into<String>,
    ) -> Self {
        self.agent_name = Some(name.into());
        self.agent_role = Some(role.into());
        self
    }

    /// Set an explicit thread id (e.g. minted from the numerator).
    pub fn with_thread_id(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = thread_id.into();
        self
    }

    /// Set the cancellation token.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Derive a child context with a different scope but the same
    /// thread id and cancellation token.
    ///
    /// Used for sub-calls issued on behalf of the current thread:
    /// checker verdicts, summaries, diagnosis calls.
    pub fn child(&self, scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            thread_id: self.thread_id.clone(),
            operation_id: self.operation_id.clone(),
            agent_name: self.agent_name.clone(),
            agent_role: self.agent_role.clone(),
            cancel: self.cancel.clone(),
        }
    }

    /// Same scope, different agent identity. The fallback controller
    /// uses this when probing candidates under the original scope.
    pub fn reagent(&self, name: impl Into<String>, role: impl Into<String>) -> Self {
        let mut ctx = self.clone();
        ctx.agent_name = Some(name.into());
        ctx.agent_role = Some(role.into());
        ctx
    }

    /// Error out if cancellation has been requested.
    pub fn ensure_active(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(OrchestratorError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_context_mints_thread_id() {
        let a = ScopeContext::new("story/generate");
        let b = ScopeContext::new("story/generate");
        assert_ne!(a.thread_id, b.thread_id);
        assert!(a.agent_name.is_none());
    }

    #[test]
    fn test_child_shares_thread_and_cancel() {
        let parent = ScopeContext::new("story/generate").with_agent("W1", "writer");
        let child = parent.child("story/summarize");
        assert_eq!(child.thread_id, parent.thread_id);
        assert_eq!(child.scope, "story/summarize");
        assert_eq!(child.agent_role.as_deref(), Some("writer"));

        parent.cancel.cancel();
        assert!(child.ensure_active().is_err());
    }

    #[test]
    fn test_ensure_active() {
        let ctx = ScopeContext::new("tests/base/m1");
        assert!(ctx.ensure_active().is_ok());
        ctx.cancel.cancel();
        assert!(matches!(
            ctx.ensure_active(),
            Err(OrchestratorError::Cancelled)
        ));
    }

    #[test]
    fn test_reagent_keeps_scope() {
        let ctx = ScopeContext::new("story/generate").with_agent("W1", "writer");
        let probe = ctx.reagent("W2", "writer");
        assert_eq!(probe.scope, "story/generate");
        assert_eq!(probe.agent_name.as_deref(), Some("W2"));
        assert_eq!(probe.thread_id, ctx.thread_id);
    }
}
