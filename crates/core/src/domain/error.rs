// Domain Error Types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DomainError {
    #[error("Invalid slot state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("App not found: {0}")]
    AppNotFound(String),

    #[error("App already exists: {0}")]
    AppExists(String),

    #[error("Tenant not found: {0}")]
    TenantNotFound(String),

    #[error("Duplicate execution slot for app: {0}")]
    DuplicateSlot(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

pub type Result<T> = std::result::Result<T, DomainError>;
