use contracts::system::sys_numbering::SequenceKey;
use thiserror::Error;

/// Ошибки хранилища нумераторов
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),

    #[error("Invalid stored data: {0}")]
    InvalidData(String),
}

/// Ошибки сервиса нумерации
#[derive(Debug, Error)]
pub enum NumberingError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Sequence {0} is disabled")]
    Disabled(SequenceKey),

    #[error("Sequence {key} exhausted after {attempts} attempts")]
    Exhausted { key: SequenceKey, attempts: u32 },

    #[error("Sequence {key} is contended: gave up after {retries} lost races")]
    Contended { key: SequenceKey, retries: u32 },

    #[error("Sequence {0} not found")]
    NotFound(SequenceKey),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),
}

impl NumberingError {
    pub fn config(message: impl Into<String>) -> Self {
        NumberingError::Configuration(message.into())
    }
}

pub type NumberingResult<T> = Result<T, NumberingError>;
