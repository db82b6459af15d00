//! User-facing error type
//!
//! Misuse (bad names, missing branches, refusing a destructive operation
//! without --force) is reported as a `UserError` carrying an optional
//! remediation hint. Everything else travels as a plain `anyhow::Error`.
//! The CLI downcasts at the top level to decide how to print the failure;
//! both kinds exit non-zero.

use thiserror::Error;

#[derive(Debug, Error)]
#[error("{message}")]
pub struct UserError {
    pub message: String,
    pub hint: Option<String>,
}

impl UserError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            hint: None,
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

/// Build a user error as `anyhow::Error`, ready to bubble up with `?`.
pub fn user_error(message: impl Into<String>) -> anyhow::Error {
    UserError::new(message).into()
}

/// Build a user error with a remediation hint.
pub fn user_error_with_hint(
    message: impl Into<String>,
    hint: impl Into<String>,
) -> anyhow::Error {
    UserError::new(message).with_hint(hint).into()
}
