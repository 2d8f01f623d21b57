//! # storyforge
//!
//! Multi-agent LLM orchestration core for a story-generation platform.
//!
//! The crate drives a chat-completion model through templated
//! multi-step workflows (outline, characters, structure, chapters),
//! validates every response deterministically and optionally through
//! an LLM judge, retries with feedback injection, falls back across a
//! ranked pool of alternate models, persists every step with full
//! provenance in SQLite, and runs a tool-calling sub-loop for steps
//! that invoke registered tools.
//!
//! The main composition:
//! - [`bridge`]: one outbound call to one model endpoint, OpenAI or
//!   Ollama shaped.
//! - [`validation`]: retry, LLM judge, verdict stamping, fallback.
//! - [`engine`]: step templates, interpolation, the ReAct sub-loop.
//! - [`eval`]: category scoring, writer-score propagation, chunked
//!   coherence.
//! - [`registry`] / [`store`]: cached catalog reads over one SQLite
//!   store.

pub mod bridge;
pub mod context;
pub mod engine;
pub mod error;
pub mod eval;
pub mod registry;
pub mod store;
pub mod tools;
pub mod validation;

pub use bridge::{ChatBridge, ChatProvider, HttpProviderFactory, ModelIdentity, ProviderKind};
pub use context::ScopeContext;
pub use engine::{StartRequest, StepEngine, TaskOutcome};
pub use error::{OrchestratorError, Result};
pub use eval::{CoherenceAnalyzer, Evaluator};
pub use registry::Registry;
pub use store::Store;
pub use tools::{Tool, ToolRegistry};
pub use validation::{ValidationOptions, Validator};

/// Initialize `env_logger`-backed logging for embedding applications.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_logging() {
    let _ = env_logger::Builder::from_default_env().try_init();
}

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
