//! Error types for the transaction engine

use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Table not found: {0}")]
    TableNotFound(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Protocol fault: {0}")]
    ProtocolFault(String),
}
