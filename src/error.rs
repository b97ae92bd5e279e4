use thiserror::Error;

use crate::domain::bandwidth::network::Network;

#[derive(Debug, Error)]
pub enum Error {
    #[error("File not found or could not be read: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse JSON: {0}")]
    DeserializationError(#[from] serde_json::Error),

    #[error("Invalid subscription definition: {0}")]
    Validation(String),

    #[error("No bucket configuration exists for network: {0}")]
    UnknownNetwork(Network),

    #[error("Invalid scheduler configuration: {0}")]
    Configuration(String),

    #[error("Persistence layer rejected the transaction: {0}")]
    Persistence(String),

    #[error("Retrieval agent failed: {0}")]
    Retrieval(String),
}

pub type Result<T> = std::result::Result<T, Error>;
