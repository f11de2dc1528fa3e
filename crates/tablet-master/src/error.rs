//! Error types
//!
//! Validation failures raised by `prepare_*` operations carry a structured
//! [`ErrorCode`] so that callers can tell them apart without parsing text.

use serde::{Deserialize, Serialize};

/// Structured error code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidTabletState,
    InvalidTabletRange,
    InvalidTableType,
    InvalidPivotKeys,
    TooManyTablets,
    NoHealthyCells,
    InvalidCell,
    NameTaken,
    InvalidName,
    NoSuchEntity,
    InvalidReplicaState,
    InvalidReplicaSettings,
    InvalidAction,
    TableNotAlive,
    InvalidOptions,
    Internal,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorCode::InvalidTabletState => "invalid_tablet_state",
            ErrorCode::InvalidTabletRange => "invalid_tablet_range",
            ErrorCode::InvalidTableType => "invalid_table_type",
            ErrorCode::InvalidPivotKeys => "invalid_pivot_keys",
            ErrorCode::TooManyTablets => "too_many_tablets",
            ErrorCode::NoHealthyCells => "no_healthy_cells",
            ErrorCode::InvalidCell => "invalid_cell",
            ErrorCode::NameTaken => "name_taken",
            ErrorCode::InvalidName => "invalid_name",
            ErrorCode::NoSuchEntity => "no_such_entity",
            ErrorCode::InvalidReplicaState => "invalid_replica_state",
            ErrorCode::InvalidReplicaSettings => "invalid_replica_settings",
            ErrorCode::InvalidAction => "invalid_action",
            ErrorCode::TableNotAlive => "table_not_alive",
            ErrorCode::InvalidOptions => "invalid_options",
            ErrorCode::Internal => "internal",
        };
        write!(f, "{}", name)
    }
}

/// Error raised by tablet manager operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct TabletError {
    pub code: ErrorCode,
    pub message: String,
}

impl TabletError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidTabletState, message)
    }

    pub fn invalid_range(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidTabletRange, message)
    }

    pub fn invalid_pivots(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidPivotKeys, message)
    }

    pub fn no_such(kind: &str, id: impl std::fmt::Display) -> Self {
        Self::new(ErrorCode::NoSuchEntity, format!("No such {} {}", kind, id))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }
}

pub type Result<T> = std::result::Result<T, TabletError>;
