//! Application state management
//!
//! Shared state for the dashboard handlers.

use crate::dashboard::DashboardHub;
use crate::pipeline::Pipeline;
use std::sync::Arc;

/// Application state shared across all handlers
pub struct AppState {
    /// Read model and push fan-out
    pub hub: Arc<DashboardHub>,
}

impl AppState {
    pub fn new(hub: Arc<DashboardHub>) -> Self {
        Self { hub }
    }

    /// The pipeline owns every mutation the trigger endpoints perform.
    pub fn pipeline(&self) -> &Arc<Pipeline> {
        self.hub.pipeline()
    }
}

/// Type alias for shared state
pub type SharedState = Arc<AppState>;
