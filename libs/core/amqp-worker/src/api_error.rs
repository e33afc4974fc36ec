//! Errors that have a client-facing shape.
//!
//! An [`ApiError`] knows its status, a machine-readable code and a short
//! human detail. [`Response::from_error`](crate::Response::from_error) turns
//! one into an error reply.

use http::StatusCode;
use std::fmt;

/// Error that can be rendered into an error [`Response`](crate::Response).
pub trait ApiError: std::error::Error + Send + Sync {
    /// Status the error maps to by default
    fn status_code(&self) -> StatusCode {
        StatusCode::INTERNAL_SERVER_ERROR
    }

    /// Machine-readable error code, used as the key in the reply data
    fn code(&self) -> &str;

    /// Short human-readable description, used as the value in the reply data
    fn default_detail(&self) -> &str;
}

/// General-purpose API error carrying an explicit status, code and detail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiException {
    status: StatusCode,
    code: String,
    detail: String,
}

impl ApiException {
    pub fn new(status: StatusCode, code: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            detail: detail.into(),
        }
    }

    /// Status-only exception; code `error`, detail is the canonical reason phrase.
    pub fn from_status(status: StatusCode) -> Self {
        let detail = status.canonical_reason().unwrap_or("Unknown Error");
        Self::new(status, "error", detail)
    }

    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", detail)
    }
}

impl Default for ApiException {
    fn default() -> Self {
        Self::from_status(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

impl fmt::Display for ApiException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.detail)
    }
}

impl std::error::Error for ApiException {}

impl ApiError for ApiException {
    fn status_code(&self) -> StatusCode {
        self.status
    }

    fn code(&self) -> &str {
        &self.code
    }

    fn default_detail(&self) -> &str {
        &self.detail
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_exception() {
        let err = ApiException::default();
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.code(), "error");
        assert_eq!(err.default_detail(), "Internal Server Error");
        assert_eq!(err.to_string(), "Internal Server Error");
    }

    #[test]
    fn test_not_found() {
        let err = ApiException::not_found("order 42 does not exist");
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(err.code(), "not_found");
    }
}
