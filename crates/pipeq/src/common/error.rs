use thiserror::Error;

use crate::common::error::PipeqError::GenericError;

#[derive(Debug, Error)]
pub enum PipeqError {
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Invalid pipeline declaration: {0}")]
    DeclarationError(String),
    #[error("Inconsistent state: {0}")]
    InconsistentState(String),
    #[error("Error: {0}")]
    GenericError(String),
}

impl From<serde_json::error::Error> for PipeqError {
    fn from(e: serde_json::error::Error) -> Self {
        Self::SerializationError(e.to_string())
    }
}

impl From<anyhow::Error> for PipeqError {
    fn from(error: anyhow::Error) -> Self {
        Self::GenericError(format!("{error:?}"))
    }
}

impl From<std::fmt::Error> for PipeqError {
    fn from(error: std::fmt::Error) -> Self {
        Self::SerializationError(error.to_string())
    }
}

impl From<toml::de::Error> for PipeqError {
    fn from(error: toml::de::Error) -> Self {
        Self::DeserializationError(error.to_string())
    }
}

pub fn error<T>(message: String) -> crate::Result<T> {
    Err(GenericError(message))
}

impl From<String> for PipeqError {
    fn from(e: String) -> Self {
        GenericError(e)
    }
}
