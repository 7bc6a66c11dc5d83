//! Errors returned by the import service API

use thiserror::Error;
use uuid::Uuid;

use crate::import::records::MappingError;
use crate::store::StoreError;

/// Result type for [`crate::ImportService`] operations
pub type ImportResult<T> = Result<T, ImportError>;

#[derive(Error, Debug)]
pub enum ImportError {
    #[error("Unknown table '{0}'")]
    UnknownTable(String),

    #[error("File of {size} bytes exceeds the {limit} byte upload limit")]
    FileTooLarge { size: u64, limit: u64 },

    #[error("Too many uploads in progress, try again later")]
    Busy,

    #[error("Upload {0} not found")]
    NotFound(Uuid),

    #[error("Upload {0} is still in progress")]
    InProgress(Uuid),

    #[error("Upload {0} has already been rolled back")]
    AlreadyRolledBack(Uuid),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Mapping(#[from] MappingError),

    #[error("Storage error: {0}")]
    Store(StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Common(#[from] stowage_common::StowageError),
}

impl ImportError {
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }
}

impl From<StoreError> for ImportError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::UploadNotFound(id) => Self::NotFound(id),
            StoreError::AlreadyRolledBack(id) => Self::AlreadyRolledBack(id),
            other => Self::Store(other),
        }
    }
}
