use crate::filter::FilterError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Missing required endpoint property: {0}")]
    MissingProperty(&'static str),

    #[error("Invalid endpoint property {key}: {reason}")]
    InvalidProperty { key: &'static str, reason: String },

    #[error("Invalid filter: {0}")]
    InvalidFilter(#[from] FilterError),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}
