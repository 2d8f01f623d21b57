//! Pre/post-call observability hooks.
//!
//! The surrounding system can watch model occupancy for admission
//! control. Hooks are best-effort: they never fail the call.

use std::sync::Arc;

/// Observer notified around every outbound model call.
pub trait BridgeHooks: Send + Sync {
    /// Called immediately before the HTTP request is issued.
    fn model_busy(&self, model: &str) {
        let _ = model;
    }

    /// Called after the call completes, success or failure.
    fn model_free(&self, model: &str) {
        let _ = model;
    }
}

/// Hooks that do nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl BridgeHooks for NoopHooks {}

/// Shared hook handle used by the bridge.
pub type SharedHooks = Arc<dyn BridgeHooks>;
