// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for switchyard-core.
//!
//! `CoreError` covers the step runtime and persistence. Registration, delivery
//! and step failures have their own types in the modules that raise them.

use thiserror::Error;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised by the step runtime and the persistence layer.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum CoreError {
    /// Run was not found in the store.
    #[error("Run '{run_id}' not found")]
    RunNotFound {
        /// The run ID that was not found.
        run_id: String,
    },

    /// No workflow with this id is registered in the catalog.
    #[error("Workflow '{workflow_id}' not found")]
    WorkflowNotFound {
        /// The workflow ID.
        workflow_id: String,
    },

    /// No cron trigger with this identifier is registered.
    #[error("Trigger '{identifier}' not found")]
    TriggerNotFound {
        /// The trigger identifier.
        identifier: String,
    },

    /// Run is in a state that does not allow the requested operation.
    #[error("Run '{run_id}' is in invalid state: expected '{expected}', got '{actual}'")]
    InvalidRunState {
        /// The run ID.
        run_id: String,
        /// The status the operation requires.
        expected: String,
        /// The status the run is in.
        actual: String,
    },

    /// Run already reached a terminal status.
    #[error("Run '{run_id}' is terminal ({status})")]
    RunTerminal {
        /// The run ID.
        run_id: String,
        /// The terminal status.
        status: String,
    },

    /// Resume data does not fit the suspended step.
    #[error("Resume rejected for run '{run_id}' at step '{step_id}': {reason}")]
    ResumeMismatch {
        /// The run ID.
        run_id: String,
        /// The step the run is suspended at.
        step_id: String,
        /// Why the resume was rejected.
        reason: String,
    },

    /// A workflow definition is malformed.
    #[error("Invalid workflow '{workflow_id}': {reason}")]
    InvalidWorkflow {
        /// The workflow ID.
        workflow_id: String,
        /// What is wrong with it.
        reason: String,
    },

    /// A workflow with this id is already in the catalog.
    #[error("Workflow '{workflow_id}' already registered")]
    DuplicateWorkflow {
        /// The workflow ID.
        workflow_id: String,
    },

    /// The delivery queue receiver is gone.
    #[error("Delivery queue is closed")]
    QueueClosed,

    /// Database operation failed.
    #[error("Database error during '{operation}': {details}")]
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// Stored JSON could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::RunNotFound { .. } => "RUN_NOT_FOUND",
            Self::WorkflowNotFound { .. } => "WORKFLOW_NOT_FOUND",
            Self::TriggerNotFound { .. } => "TRIGGER_NOT_FOUND",
            Self::InvalidRunState { .. } => "INVALID_RUN_STATE",
            Self::RunTerminal { .. } => "RUN_TERMINAL",
            Self::ResumeMismatch { .. } => "RESUME_MISMATCH",
            Self::InvalidWorkflow { .. } => "INVALID_WORKFLOW",
            Self::DuplicateWorkflow { .. } => "DUPLICATE_WORKFLOW",
            Self::QueueClosed => "QUEUE_CLOSED",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }

    pub(crate) fn run_not_found(run_id: impl ToString) -> Self {
        Self::RunNotFound {
            run_id: run_id.to_string(),
        }
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for CoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        CoreError::DatabaseError {
            operation: "migrate".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Serialization(err.to_string())
    }
}
