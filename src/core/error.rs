use thiserror::Error;

/// Classification attached to every backing-store failure.
///
/// Batch commit and reference resolution retry `Recoverable` failures until
/// their configured timeout; `Unrecoverable` failures end the operation at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    Recoverable,
    Unrecoverable,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind:?} storage error: {message}")]
pub struct StorageError {
    pub kind: StorageErrorKind,
    pub message: String,
}

impl StorageError {
    pub fn recoverable(message: impl Into<String>) -> Self {
        Self {
            kind: StorageErrorKind::Recoverable,
            message: message.into(),
        }
    }

    pub fn unrecoverable(message: impl Into<String>) -> Self {
        Self {
            kind: StorageErrorKind::Unrecoverable,
            message: message.into(),
        }
    }

    pub fn is_recoverable(&self) -> bool {
        self.kind == StorageErrorKind::Recoverable
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DbError {
    #[error("Decoding error: {0}")]
    Decoding(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Registration conflict: {0}")]
    Registration(String),

    #[error("Batch has already been committed")]
    BatchAlreadyCommitted,

    #[error("Entity '{0}' is already cached")]
    DuplicateEntity(String),

    #[error("Referenced entity '{0}' does not exist")]
    UnknownReference(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Lock error: {0}")]
    LockError(String),

    #[error("Execution error: {0}")]
    ExecutionError(String),
}

impl DbError {
    /// True for transient backing-store failures that a retry loop may repeat.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Storage(err) if err.is_recoverable())
    }
}

pub type Result<T> = std::result::Result<T, DbError>;

impl<T> From<std::sync::PoisonError<T>> for DbError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}
