//! Error types for the orchestration core.
//!
//! One public error enum covers every failure the library surfaces.
//! Provider and validation failures are recovered locally by the
//! validator (retry, fallback); everything else propagates to the
//! caller of the step engine.

use thiserror::Error;

/// Errors surfaced by the orchestration core.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Non-2xx status from a model endpoint.
    #[error("provider returned HTTP {status}: {body}")]
    ProviderHttp { status: u16, body: String },

    /// The provider reported that the target model does not support tools.
    ///
    /// Callers can re-run the step without offering tools.
    #[error("model '{model}' does not support tools")]
    ModelRejectsTools { model: String },

    /// A response parsed but failed deterministic or judge checks.
    #[error("response failed validation: {reason}")]
    ValidationInvalid { needs_retry: bool, reason: String },

    /// Unknown tool name or a tool-internal failure.
    ///
    /// Within the tool-call sub-loop this is fed back to the model as
    /// the tool result rather than raised.
    #[error("tool '{tool}' dispatch failed: {message}")]
    ToolDispatch { tool: String, message: String },

    /// A second concurrent execution was requested for the same
    /// `(entity_id, task_type)` pair.
    #[error("an execution is already active for entity {entity_id:?}, task type '{task_type}'")]
    UniquenessViolation {
        entity_id: Option<i64>,
        task_type: String,
    },

    /// A referenced model, agent, or template does not exist.
    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    /// Transactional store failure.
    #[error("persistence error: {0}")]
    Persistence(#[from] rusqlite::Error),

    /// Transport-level HTTP failure (connect, timeout, abort).
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Malformed JSON in a wire body or stored column.
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// A step template failed to parse into ordered instructions,
    /// or a placeholder referenced a step that has not run yet.
    #[error("template error: {0}")]
    Template(String),

    /// The tool-call sub-loop hit its iteration cap without producing
    /// a final textual answer.
    #[error("tool-call loop exceeded {0} iterations")]
    ToolLoopExceeded(usize),

    /// The operation's cancellation signal fired.
    #[error("operation cancelled")]
    Cancelled,
}

impl OrchestratorError {
    /// Whether this error is recovered locally by the validator
    /// (retry in place or fallback) rather than propagated.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            OrchestratorError::ProviderHttp { .. }
                | OrchestratorError::Transport(_)
                | OrchestratorError::ValidationInvalid { .. }
        )
    }

    /// Short tag used when stamping a response-log row.
    pub fn fail_reason(&self) -> String {
        match self {
            OrchestratorError::ProviderHttp { status, .. } => format!("http_{status}"),
            OrchestratorError::ModelRejectsTools { .. } => "model_rejects_tools".to_string(),
            OrchestratorError::ValidationInvalid { reason, .. } => reason.clone(),
            OrchestratorError::Transport(e) => format!("transport: {e}"),
            OrchestratorError::Cancelled => "cancelled".to_string(),
            other => other.to_string(),
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, OrchestratorError>;
