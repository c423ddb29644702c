use thiserror::Error;
use uuid::Uuid;

use crate::model::EntityId;

/// Failures of the entity model
#[derive(Debug, Error)]
pub enum ModelError {
    /// The remote facade call failed; the cache was left unchanged
    #[error("remote call failed: {0:#}")]
    Remote(#[from] anyhow::Error),

    /// Blocking model operations must run on a background worker
    #[error("{operation} illegally called from the UI thread")]
    OnUiThread { operation: &'static str },

    #[error("entity {0} not found")]
    NotFound(EntityId),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

pub type ModelResult<T> = std::result::Result<T, ModelError>;

/// Failures of the command stack
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("precondition failed for '{command}': {reason}")]
    Precondition { command: String, reason: String },

    #[error("execution failed for '{command}': {source}")]
    Execution {
        command: String,
        #[source]
        source: ModelError,
    },

    #[error("postcondition failed for '{command}': {reason}")]
    Postcondition { command: String, reason: String },

    #[error("nothing to undo")]
    AbsentUndo,

    #[error("nothing to redo")]
    AbsentRedo,

    /// A command returned itself as its own inverse
    #[error("command '{command}' ({id}) returned itself as its inverse")]
    BadCommandInverse { command: String, id: Uuid },
}

impl CommandError {
    pub fn precondition(command: impl Into<String>, reason: impl Into<String>) -> Self {
        CommandError::Precondition {
            command: command.into(),
            reason: reason.into(),
        }
    }

    pub fn postcondition(command: impl Into<String>, reason: impl Into<String>) -> Self {
        CommandError::Postcondition {
            command: command.into(),
            reason: reason.into(),
        }
    }

    pub fn execution(command: impl Into<String>, source: ModelError) -> Self {
        CommandError::Execution {
            command: command.into(),
            source,
        }
    }
}
