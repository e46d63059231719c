//! Error types for the chain state core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChainError {
    #[error("{command} message invalid for protocol version {version}")]
    ProtocolVersion { command: &'static str, version: u32 },

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Short ID salt derivation failed: {0}")]
    SaltDerivation(String),

    #[error("UTXO consistency violated: {0}")]
    UtxoConsistency(String),

    #[error("Subscriber callback faulted: {0}")]
    CallbackFault(String),

    #[error("Block validation failed: {0}")]
    BlockValidation(String),

    #[error("Transaction validation failed: {0}")]
    TransactionValidation(String),

    #[error("Unknown block: {0}")]
    UnknownBlock(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ChainError {
    /// Map a read failure into a decode error; a short read is a truncated message.
    pub(crate) fn from_read(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            ChainError::Decode("truncated stream".to_string())
        } else {
            ChainError::Io(err)
        }
    }
}

pub type Result<T> = std::result::Result<T, ChainError>;
