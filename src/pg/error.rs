//! Error types for the PostgreSQL protocol implementation.

use std::io;
use std::sync::Arc;

use thiserror::Error;

use super::scram::ScramError;

/// Result type for PostgreSQL operations.
pub type PgResult<T> = Result<T, PgError>;

/// Errors that can occur during PostgreSQL operations.
///
/// `Clone` so a batch can hand the same first failure back on every later
/// call; I/O errors are shared behind an `Arc` for that reason.
#[derive(Debug, Clone, Error)]
pub enum PgError {
    /// I/O error during communication.
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    /// Protocol error (unexpected message, invalid format, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Authentication failed.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Server returned an error.
    #[error("{severity}: {message} ({code}){}", server_suffix(.detail, .hint))]
    Server {
        severity: String,
        code: String,
        message: String,
        detail: Option<String>,
        hint: Option<String>,
    },

    /// Type conversion error.
    #[error("Type error: {0}")]
    Type(String),

    /// Connection is closed or was marked dead.
    #[error("Connection is closed")]
    ConnectionClosed,

    /// The context deadline passed.
    #[error("Operation timed out")]
    Timeout,

    /// The context was cancelled.
    #[error("Operation cancelled")]
    Cancelled,

    /// API used in an order it does not support.
    #[error("Invalid use: {0}")]
    Misuse(&'static str),

    /// An earlier statement in the same pipeline failed, so the server
    /// skipped this one.
    #[error("Statement skipped: an earlier statement in the batch failed")]
    PipelineAborted,

    /// A single-row read found no rows.
    #[error("Query returned no rows")]
    NoRows,

    /// The pool was closed.
    #[error("Pool closed")]
    PoolClosed,

    /// Invalid connection or pool configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl PgError {
    /// SQLSTATE code for server errors.
    pub fn code(&self) -> Option<&str> {
        match self {
            PgError::Server { code, .. } => Some(code),
            _ => None,
        }
    }

    /// Server errors with FATAL or PANIC severity end the session.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PgError::Server { severity, .. } if severity == "FATAL" || severity == "PANIC")
    }
}

fn server_suffix(detail: &Option<String>, hint: &Option<String>) -> String {
    let mut out = String::new();
    if let Some(d) = detail {
        out.push_str("\nDetail: ");
        out.push_str(d);
    }
    if let Some(h) = hint {
        out.push_str("\nHint: ");
        out.push_str(h);
    }
    out
}

impl From<io::Error> for PgError {
    fn from(e: io::Error) -> Self {
        PgError::Io(Arc::new(e))
    }
}

impl From<ScramError> for PgError {
    fn from(e: ScramError) -> Self {
        PgError::Auth(e.to_string())
    }
}
