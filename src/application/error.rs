use std::{error::Error as StdError, fmt};

use axum::{
    http::{HeaderValue, StatusCode, header::CONTENT_TYPE},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::{config::LoadError, infra::error::InfraError};

/// Content type used for every serialized computation error.
pub const ERROR_CONTENT_TYPE: &str = "application/json";

#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub source: &'static str,
    pub status: StatusCode,
    pub messages: Vec<String>,
}

impl ErrorReport {
    pub fn from_error(source: &'static str, status: StatusCode, error: &dyn StdError) -> Self {
        Self {
            source,
            status,
            messages: error_chain(error),
        }
    }

    pub fn from_message(
        source: &'static str,
        status: StatusCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            source,
            status,
            messages: vec![message.into()],
        }
    }

    pub fn attach(self, response: &mut Response) {
        response.extensions_mut().insert(self);
    }
}

fn error_chain(error: &dyn StdError) -> Vec<String> {
    let mut messages = vec![error.to_string()];
    let mut current = error.source();
    while let Some(inner) = current {
        messages.push(inner.to_string());
        current = inner.source();
    }
    messages
}

/// Classification of a failed computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The request could not be turned into generator input.
    InvalidInput,
    /// The request payload could not be reduced to a cache key.
    KeyDerivation,
    /// The content generator failed.
    Generation,
    /// The computation task panicked or was torn down.
    Aborted,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::KeyDerivation => "key_derivation",
            ErrorKind::Generation => "generation",
            ErrorKind::Aborted => "aborted",
        }
    }

    pub fn status(self) -> StatusCode {
        match self {
            ErrorKind::InvalidInput | ErrorKind::KeyDerivation => StatusCode::BAD_REQUEST,
            ErrorKind::Generation => StatusCode::BAD_GATEWAY,
            ErrorKind::Aborted => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure produced while computing a memoized response.
///
/// The value is shared verbatim with every request coalesced onto the same
/// computation, so it is cheap to clone and compares structurally. It is never
/// written to the cache store.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("{kind}: {message}")]
pub struct ComputationError {
    kind: ErrorKind,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    cause: Option<String>,
}

impl ComputationError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, message)
    }

    pub fn generation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Generation, message)
    }

    pub fn aborted(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Aborted, message)
    }

    pub fn key_derivation(message: impl Into<String>, cause: &dyn StdError) -> Self {
        Self::new(ErrorKind::KeyDerivation, message).with_cause(cause)
    }

    /// Record the full source chain of `cause` as text.
    pub fn with_cause(mut self, cause: &dyn StdError) -> Self {
        self.cause = Some(error_chain(cause).join(": "));
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn cause(&self) -> Option<&str> {
        self.cause.as_deref()
    }

    /// Deterministic textual form used as the response body.
    pub fn to_body(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| Value::String(self.to_string()).to_string())
    }
}

impl IntoResponse for ComputationError {
    fn into_response(self) -> Response {
        let status = self.kind.status();
        let mut response = (
            status,
            [(CONTENT_TYPE, HeaderValue::from_static(ERROR_CONTENT_TYPE))],
            self.to_body(),
        )
            .into_response();
        ErrorReport::from_error("application::error::ComputationError", status, &self)
            .attach(&mut response);
        response
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error("failed to load configuration: {0}")]
    Config(#[from] LoadError),
}
