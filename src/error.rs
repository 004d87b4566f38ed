//! Error taxonomy: one message string, classified at the boundary, with a
//! `kind` callers can branch on rather than just display.

use std::fmt;

/// The errno treated as "aborted on purpose, not a real failure" -- used
/// to tell a host-exception abort apart from a genuine transaction failure
/// when inspecting a transaction's outcome.
pub const ERRNO_CANCELED: i32 = 125;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    OutOfMemory,
    PoolNotInitialized,
    TypeNotPersistable,
    IndexOutOfRange,
    TransactionMisuse,
    Internal,
}

#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    message: String,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Error {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::InvalidArgument, message)
    }

    pub fn out_of_memory(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::OutOfMemory, message)
    }

    pub fn pool_not_initialized(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::PoolNotInitialized, message)
    }

    pub fn type_not_persistable(class: &str) -> Self {
        Error::new(
            ErrorKind::TypeNotPersistable,
            format!("Don't know how to persist {:?} instance, class not registered", class),
        )
    }

    pub fn index_out_of_range(index: i64) -> Self {
        Error::new(ErrorKind::IndexOutOfRange, format!("index out of range: {}", index))
    }

    pub fn transaction_misuse(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::TransactionMisuse, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::Internal, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::internal(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
