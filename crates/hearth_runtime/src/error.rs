//! Hub Errors
//!
//! Every fallible runtime operation returns [`HubResult`]. Plugin callbacks
//! return `anyhow::Result` and are converted into [`HubError::Callback`] at the
//! plugin boundary.

use std::time::Duration;

/// Errors surfaced by the hub runtime
#[derive(Debug, Clone, thiserror::Error)]
pub enum HubError {
    /// Action properties failed schema validation (no job was created)
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Unknown action/condition class, job, device or plugin
    #[error("Not found: {0}")]
    NotFound(String),

    /// The job window is at capacity
    #[error("Job rejected: {active} active jobs within window (max {max_active})")]
    AdmissionRejected { active: usize, max_active: usize },

    /// An operation did not complete within its bound
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Plugin code failed while the runtime invoked it
    #[error("Plugin '{plugin_id}' callback failed: {message}")]
    Callback { plugin_id: String, message: String },

    #[error("Plugin already running: {0}")]
    AlreadyRunning(String),

    #[error("Plugin not running: {0}")]
    NotRunning(String),

    #[error("Channel closed")]
    ChannelClosed,

    /// Backing device store failure
    #[error("Store error: {0}")]
    Store(String),
}

impl HubError {
    /// Build a callback failure for a plugin from any displayable error
    pub fn callback(plugin_id: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Callback {
            plugin_id: plugin_id.into(),
            message: err.to_string(),
        }
    }

    /// Whether the error was raised before any work was admitted
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            HubError::Validation(_) | HubError::NotFound(_) | HubError::AdmissionRejected { .. }
        )
    }
}

/// Result type for hub operations
pub type HubResult<T> = Result<T, HubError>;
