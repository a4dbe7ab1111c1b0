//! Error kinds surfaced by the chain-state engine.

use utxod_pow::difficulty::{CompactError, DifficultyError};
use utxod_primitives::encoding::DecodeError;
use utxod_storage::StoreError;

use crate::validation::ValidationError;

#[derive(Debug)]
pub enum EngineError {
    /// The candidate block or transaction is unacceptable.
    Validation(ValidationError),
    Store(StoreError),
    Decode(DecodeError),
    /// Stored state contradicts itself. Never treated as a rejection.
    Invariant(String),
}

impl EngineError {
    pub fn invariant(message: impl Into<String>) -> Self {
        EngineError::Invariant(message.into())
    }

    pub fn as_validation(&self) -> Option<&ValidationError> {
        match self {
            EngineError::Validation(err) => Some(err),
            _ => None,
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(err) => write!(f, "{err}"),
            EngineError::Store(err) => write!(f, "store error: {err}"),
            EngineError::Decode(err) => write!(f, "corrupt record: {err}"),
            EngineError::Invariant(message) => write!(f, "invariant violated: {message}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<ValidationError> for EngineError {
    fn from(err: ValidationError) -> Self {
        EngineError::Validation(err)
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        EngineError::Store(err)
    }
}

impl From<DecodeError> for EngineError {
    fn from(err: DecodeError) -> Self {
        EngineError::Decode(err)
    }
}

impl From<CompactError> for EngineError {
    fn from(err: CompactError) -> Self {
        EngineError::Invariant(err.to_string())
    }
}

impl From<DifficultyError> for EngineError {
    fn from(err: DifficultyError) -> Self {
        EngineError::Invariant(err.to_string())
    }
}
