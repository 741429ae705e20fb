//! Application state shared across handlers.

use std::sync::Arc;

use crate::session::SessionEngine;

/// Service name reported by the health probe.
pub const SERVICE_NAME: &str = "sandman-orchestrator";

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Session engine driving all lifecycle operations.
    pub engine: Arc<SessionEngine>,
}

impl AppState {
    pub fn new(engine: Arc<SessionEngine>) -> Self {
        Self { engine }
    }
}
