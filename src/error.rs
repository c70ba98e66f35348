//! Custom error types for mender.
//!
//! This module provides structured error types that separate the four
//! fault families the loop controller cares about: configuration mistakes,
//! collaborator faults, persistence faults and controller-internal faults.
//! Emergency stops are not errors; they end a run with a stop reason.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for mender operations
#[derive(Error, Debug)]
pub enum MenderError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Failed to load configuration
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        path: Option<PathBuf>,
    },

    /// Invalid configuration value
    #[error("Invalid configuration: {field} - {reason}")]
    InvalidConfig { field: String, reason: String },

    // =========================================================================
    // Collaborator Errors
    // =========================================================================
    /// A detection, repair or verification call failed
    #[error("Collaborator '{collaborator}' failed: {message}")]
    Collaborator {
        collaborator: String,
        message: String,
    },

    /// A collaborator call exceeded its hard timeout
    #[error("Collaborator '{collaborator}' timed out after {timeout_ms}ms")]
    CollaboratorTimeout {
        collaborator: String,
        timeout_ms: u64,
    },

    /// A collaborator panicked while running
    #[error("Collaborator '{collaborator}' panicked: {message}")]
    CollaboratorPanicked {
        collaborator: String,
        message: String,
    },

    // =========================================================================
    // Persistence Errors
    // =========================================================================
    /// Session state could not be saved or loaded
    #[error("Session persistence error: {message}")]
    Persistence { message: String },

    /// Session state file is unreadable
    #[error("Corrupted session state at {path}: {reason}")]
    CorruptState { path: PathBuf, reason: String },

    // =========================================================================
    // Controller Errors
    // =========================================================================
    /// Internal controller fault (health math, scheduling, lifecycle)
    #[error("Internal controller error: {0}")]
    Internal(String),

    // =========================================================================
    // Wrapped Errors
    // =========================================================================
    /// IO error wrapper
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON error wrapper
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Generic error wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl MenderError {
    // =========================================================================
    // Constructor helpers
    // =========================================================================

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            path: None,
        }
    }

    /// Create a configuration error with path
    pub fn config_with_path(message: impl Into<String>, path: PathBuf) -> Self {
        Self::Config {
            message: message.into(),
            path: Some(path),
        }
    }

    /// Create an invalid configuration error
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create a collaborator error
    pub fn collaborator(collaborator: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Collaborator {
            collaborator: collaborator.into(),
            message: message.into(),
        }
    }

    /// Create a persistence error
    pub fn persistence(message: impl Into<String>) -> Self {
        Self::Persistence {
            message: message.into(),
        }
    }

    /// Create an internal controller error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Create a corrupt-state error for an unusable session file
    pub fn corrupt_state(path: PathBuf, reason: impl Into<String>) -> Self {
        Self::CorruptState {
            path,
            reason: reason.into(),
        }
    }

    /// Get error code for exit status
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Internal(_) => 4,
            Self::Config { .. } | Self::InvalidConfig { .. } => 7,
            _ => 1,
        }
    }
}

/// Type alias for mender results
pub type Result<T> = std::result::Result<T, MenderError>;

/// Best-effort text of a caught panic payload.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Extension trait for converting foreign errors to MenderError
pub trait IntoMenderError<T> {
    fn into_mender_persistence(self) -> Result<T>;
    fn into_mender_collaborator(self, name: &str) -> Result<T>;
}

impl<T, E: Into<anyhow::Error>> IntoMenderError<T> for std::result::Result<T, E> {
    fn into_mender_persistence(self) -> Result<T> {
        self.map_err(|e| MenderError::persistence(format!("{:#}", e.into())))
    }

    fn into_mender_collaborator(self, name: &str) -> Result<T> {
        self.map_err(|e| MenderError::collaborator(name, format!("{:#}", e.into())))
    }
}
