//! User callbacks for leadership transitions.

// Layer 1: Standard library imports
use std::collections::HashMap;

// Layer 2: Third-party crate imports
use async_trait::async_trait;

// Layer 3: Internal module imports
// (none)

/// Callbacks invoked on leadership transitions.
///
/// `on_elected` is awaited before the instance reports itself as elected,
/// so exclusive handlers never run before the hook finished preparing
/// state. Hooks are infallible by signature; anything that can fail inside
/// them should be logged by the hook itself rather than propagated into
/// the election.
#[async_trait]
pub trait LeadershipHooks: Send + Sync + 'static {
    /// This instance just became the group leader.
    async fn on_elected(&self, _metadata: &HashMap<String, serde_json::Value>) {}

    /// This instance lost (or released) leadership.
    async fn on_leadership_lost(&self, _reason: &str) {}
}

/// Default hooks that do nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

#[async_trait]
impl LeadershipHooks for NoopHooks {}
