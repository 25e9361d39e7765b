use std::fmt;

use imaging::ProcessingError;
use shared::{
    domain::{Collection, FileKind},
    error::{ApiError, ErrorCode},
};
use storage::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },
    #[error("{0}")]
    Validation(String),
    #[error("no pipeline for {0} transformers")]
    UnsupportedKind(FileKind),
    #[error("processing failed: {0}")]
    Processing(#[from] ProcessingError),
    #[error("{0}")]
    StorageTransaction(String),
    #[error("storage failure: {0}")]
    Storage(#[source] StorageError),
}

pub type Result<T, E = ServiceError> = std::result::Result<T, E>;

impl ServiceError {
    pub fn not_found(entity: &'static str, id: impl fmt::Display) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound { .. } => ErrorCode::NotFound,
            Self::Validation(_) => ErrorCode::Validation,
            Self::UnsupportedKind(_) => ErrorCode::UnsupportedKind,
            Self::Processing(_) => ErrorCode::Processing,
            Self::StorageTransaction(_) => ErrorCode::StorageTransaction,
            Self::Storage(_) => ErrorCode::Internal,
        }
    }
}

impl From<StorageError> for ServiceError {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::NotFound { collection, id } => Self::NotFound {
                entity: entity_name(collection),
                id,
            },
            StorageError::Validation(message) => Self::Validation(message),
            StorageError::Transaction(source) => {
                Self::StorageTransaction(format!("transaction failed: {source}"))
            }
            other => Self::Storage(other),
        }
    }
}

impl From<&ServiceError> for ApiError {
    fn from(error: &ServiceError) -> Self {
        ApiError::new(error.code(), error.to_string())
    }
}

impl From<ServiceError> for ApiError {
    fn from(error: ServiceError) -> Self {
        ApiError::from(&error)
    }
}

pub(crate) fn entity_name(collection: Collection) -> &'static str {
    match collection {
        Collection::Files => "file",
        Collection::Projects => "project",
        Collection::Transformers => "transformer",
    }
}
