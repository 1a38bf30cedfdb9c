pub mod error;
pub mod logging;
pub mod runtime;

pub use error::{DbError, Result, StorageError, StorageErrorKind};
pub use logging::{LogData, LogLevel, LogRecord, Logger, MemoryLogger, TracingLogger};
pub use runtime::RuntimeBinding;
