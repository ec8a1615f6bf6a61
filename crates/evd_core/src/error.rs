use serde::{Deserialize, Serialize};
use std::fmt;

/// Failure class. Decides whether a batch keeps going or the operation halts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// One file or one external call failed; logged, skipped or retried.
    Transient,
    /// Counter corruption, unreachable store or index. Halts the operation.
    Structural,
    /// Statistics could not be computed with the available sample.
    Indeterminate,
    /// Malformed input or a query outside the allowed grammar.
    Validation,
    NotFound,
}

/// Single structured error shape used across backend layers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppError {
    pub code: String,
    pub message: String,
    pub details: Option<String>,
    pub retryable: bool,
    pub kind: ErrorKind,
}

impl AppError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
            retryable: false,
            kind: ErrorKind::Structural,
        }
    }

    pub fn transient(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(code, message)
            .with_kind(ErrorKind::Transient)
            .with_retryable(true)
    }

    pub fn validation(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(code, message).with_kind(ErrorKind::Validation)
    }

    pub fn not_found(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(code, message).with_kind(ErrorKind::NotFound)
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn with_kind(mut self, kind: ErrorKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn is_fatal(&self) -> bool {
        self.kind == ErrorKind::Structural
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for AppError {}

/// Wrap a rusqlite failure as a structural error with context.
pub(crate) fn db_err(code: &str, message: &str) -> impl FnOnce(rusqlite::Error) -> AppError {
    let code = code.to_string();
    let message = message.to_string();
    move |e| AppError::new(code, message).with_details(e.to_string())
}
