use serde::Serialize;
use thiserror::Error;

/// Local, synchronous failures. Nothing is sent to the database when one of
/// these is raised.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// A draft in a batch failed; `position` is 1-based.
    #[error("Document {position}: {message}")]
    Draft { position: usize, message: String },
    #[error("{0}")]
    Field(String),
    #[error("Collection name {0}")]
    CollectionName(String),
    #[error("Type \"{expected}\" to confirm deletion")]
    ConfirmationMismatch { expected: String },
    #[error("Another operation is still in progress")]
    Busy,
    #[error("Nothing to save")]
    Empty,
}

/// A failure reported by the external database boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("{message}")]
pub struct RemoteError {
    pub message: String,
}

impl RemoteError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(err: reqwest::Error) -> Self {
        RemoteError::new(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

impl Error {
    pub fn is_validation(&self) -> bool {
        matches!(self, Error::Validation(_))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
