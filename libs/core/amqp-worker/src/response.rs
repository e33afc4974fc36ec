//! Outbound reply envelope.

use crate::api_error::ApiError;
use crate::broker::Headers;
use crate::error::WorkerError;
use http::StatusCode;
use serde_json::{Map, Value};
use std::backtrace::Backtrace;
use std::fmt::{Display, Write as _};

/// Header key carrying the numeric status code
pub const STATUS_HEADER: &str = "status";

/// Reply published back to the requester.
///
/// `headers` always contains `status`; `data` is always a JSON object.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    status: u16,
    headers: Headers,
    data: Map<String, Value>,
}

impl Response {
    /// Build a response.
    ///
    /// `status` may be an [`http::StatusCode`] or a raw `u16`; it must be a
    /// code in 100..=599. `headers` must not contain `status`. `data`, when
    /// given, must be a JSON object.
    pub fn new<S>(status: S, headers: Option<Headers>, data: Option<Value>) -> Result<Self, WorkerError>
    where
        S: TryInto<StatusCode>,
        S::Error: Display,
    {
        let status = normalize_status(status)?;

        let data = match data {
            None => Map::new(),
            Some(Value::Object(map)) => map,
            Some(other) => {
                return Err(WorkerError::invalid_argument(format!(
                    "response data must be a JSON object, got {}",
                    json_kind(&other)
                )))
            }
        };

        let mut headers = headers.unwrap_or_default();
        if headers.contains_key(STATUS_HEADER) {
            return Err(WorkerError::invalid_argument(
                "'status' is set from the response status and cannot be passed as a header",
            ));
        }
        headers.insert(STATUS_HEADER.to_string(), Value::from(status));

        Ok(Self {
            status,
            headers,
            data,
        })
    }

    /// Successful response carrying `data`.
    pub fn ok(data: Value) -> Result<Self, WorkerError> {
        Self::new(StatusCode::OK, None, Some(data))
    }

    /// Error response derived from an [`ApiError`].
    ///
    /// `data` is the caller's data plus `{code: default_detail}`; with `debug`
    /// a `traceback` entry holds the error chain and a captured backtrace.
    pub fn from_error<S, E>(
        status: S,
        error: &E,
        headers: Option<Headers>,
        data: Option<Value>,
        debug: bool,
    ) -> Result<Self, WorkerError>
    where
        S: TryInto<StatusCode>,
        S::Error: Display,
        E: ApiError + ?Sized,
    {
        let code = error.code();
        let detail = error.default_detail();
        if code.is_empty() || detail.is_empty() {
            return Err(WorkerError::invalid_argument(
                "API errors need a non-empty code and default detail",
            ));
        }

        let mut response = Self::new(status, headers, data)?;
        response
            .data
            .insert(code.to_string(), Value::String(detail.to_string()));
        if debug {
            response
                .data
                .insert("traceback".to_string(), Value::String(traceback(error)));
        }
        Ok(response)
    }

    /// Numeric status code
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Status as a typed code
    pub fn status_code(&self) -> StatusCode {
        // `status` was validated by the constructor
        StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn data(&self) -> &Map<String, Value> {
        &self.data
    }

    /// JSON encoding of `data`, the published message body.
    pub fn body(&self) -> Result<Vec<u8>, WorkerError> {
        Ok(serde_json::to_vec(&self.data)?)
    }

    pub(crate) fn into_parts(self) -> (Headers, Map<String, Value>) {
        (self.headers, self.data)
    }
}

fn normalize_status<S>(status: S) -> Result<u16, WorkerError>
where
    S: TryInto<StatusCode>,
    S::Error: Display,
{
    let code = status
        .try_into()
        .map_err(|e| WorkerError::invalid_argument(format!("invalid status: {e}")))?
        .as_u16();
    if !(100..=599).contains(&code) {
        return Err(WorkerError::invalid_argument(format!(
            "status {code} is outside 100..=599"
        )));
    }
    Ok(code)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn traceback<E: ApiError + ?Sized>(error: &E) -> String {
    let mut out = format!("{error}");
    let mut source = error.source();
    while let Some(cause) = source {
        let _ = write!(out, "\ncaused by: {cause}");
        source = cause.source();
    }
    let _ = write!(out, "\n\n{}", Backtrace::force_capture());
    out
}
