//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::broadcast;

use crate::config::Config;
use crate::sessions::SessionRegistry;
use crate::store::ProjectStore;

/// Shared application state for the agentd server.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    /// Registry of live PTY sessions, keyed by output-project id.
    pub registry: SessionRegistry,
    /// Persisted output projects and milestones.
    pub store: Arc<ProjectStore>,
    /// Broadcast channel for lifecycle events: session created/destroyed and
    /// project status changes. This is the callback hook external
    /// collaborators subscribe to.
    pub events: broadcast::Sender<Value>,
}
