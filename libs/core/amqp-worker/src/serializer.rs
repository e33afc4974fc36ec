//! Payload validation.
//!
//! A [`Serializer`] wraps a raw body and a [`PayloadSchema`]. The first call to
//! [`Serializer::is_valid`] runs the schema and memoizes the outcome; every
//! later call (and every accessor) reads the memoized result:
//!
//! ```text
//! Unvalidated --is_valid()--> Valid   (data present, errors empty)
//!                         \-> Invalid (no data, errors populated)
//! ```

use crate::api_error::ApiError;
use crate::error::WorkerError;
use http::StatusCode;
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use std::fmt;
use std::marker::PhantomData;
use validator::Validate;

/// Key used for errors that do not belong to a single field
pub const NON_FIELD_ERRORS: &str = "non_field_errors";

/// Structured validation failure. Renders as a 400 `invalid` / `Bad Request`.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError {
    errors: Value,
}

impl ValidationError {
    pub fn new(errors: Value) -> Self {
        Self { errors }
    }

    /// Error not tied to a particular field (e.g. the body is not JSON)
    pub fn non_field(message: impl Into<String>) -> Self {
        Self::new(json!({ NON_FIELD_ERRORS: [message.into()] }))
    }

    /// Structured errors, usually `{field: [..]}`
    pub fn errors(&self) -> &Value {
        &self.errors
    }

    pub fn into_errors(self) -> Value {
        self.errors
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "validation failed: {}", self.errors)
    }
}

impl std::error::Error for ValidationError {}

impl ApiError for ValidationError {
    fn status_code(&self) -> StatusCode {
        StatusCode::BAD_REQUEST
    }

    fn code(&self) -> &str {
        "invalid"
    }

    fn default_detail(&self) -> &str {
        "Bad Request"
    }
}

/// Turns a raw payload into validated data.
pub trait PayloadSchema {
    type Output;

    /// Parse and validate `data`. Parse failures must be reported as
    /// [`ValidationError`] too.
    fn run_validation(&self, data: &[u8]) -> Result<Self::Output, ValidationError>;
}

enum Outcome<T> {
    Valid(T),
    Invalid(ValidationError),
}

/// Memoizing validator over one payload.
pub struct Serializer<S: PayloadSchema> {
    initial_data: Vec<u8>,
    schema: S,
    outcome: Option<Outcome<S::Output>>,
}

impl<S: PayloadSchema> Serializer<S> {
    pub fn new(data: impl Into<Vec<u8>>, schema: S) -> Self {
        Self {
            initial_data: data.into(),
            schema,
            outcome: None,
        }
    }

    /// The raw payload as received
    pub fn initial_data(&self) -> &[u8] {
        &self.initial_data
    }

    /// Run validation on first call; later calls return the memoized result.
    pub fn is_valid(&mut self) -> bool {
        let outcome = self.outcome.get_or_insert_with(|| {
            match self.schema.run_validation(&self.initial_data) {
                Ok(data) => Outcome::Valid(data),
                Err(errors) => Outcome::Invalid(errors),
            }
        });
        matches!(outcome, Outcome::Valid(_))
    }

    /// Like [`is_valid`](Self::is_valid) but returns the captured errors on failure.
    pub fn ensure_valid(&mut self) -> Result<(), ValidationError> {
        if self.is_valid() {
            return Ok(());
        }
        match &self.outcome {
            Some(Outcome::Invalid(errors)) => Err(errors.clone()),
            _ => Ok(()),
        }
    }

    /// Validated data; `None` when the payload was invalid.
    pub fn data(&self) -> Result<Option<&S::Output>, WorkerError> {
        match self.outcome()? {
            Outcome::Valid(data) => Ok(Some(data)),
            Outcome::Invalid(_) => Ok(None),
        }
    }

    /// Alias of [`data`](Self::data)
    pub fn validated_data(&self) -> Result<Option<&S::Output>, WorkerError> {
        self.data()
    }

    /// Take ownership of the validated data.
    pub fn into_validated_data(self) -> Result<Option<S::Output>, WorkerError> {
        match self.outcome {
            None => Err(not_validated()),
            Some(Outcome::Valid(data)) => Ok(Some(data)),
            Some(Outcome::Invalid(_)) => Ok(None),
        }
    }

    /// Structured errors; an empty object when the payload was valid.
    pub fn errors(&self) -> Result<Value, WorkerError> {
        match self.outcome()? {
            Outcome::Valid(_) => Ok(Value::Object(Map::new())),
            Outcome::Invalid(errors) => Ok(errors.errors().clone()),
        }
    }

    fn outcome(&self) -> Result<&Outcome<S::Output>, WorkerError> {
        self.outcome.as_ref().ok_or_else(not_validated)
    }
}

fn not_validated() -> WorkerError {
    WorkerError::illegal_state("call is_valid() before accessing validated data or errors")
}

/// JSON body deserialized into `T` and checked with [`validator::Validate`].
///
/// Field errors render as `{field: [{code, message, params}]}`; a body that
/// does not deserialize renders as `{non_field_errors: [message]}`.
pub struct JsonSchema<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonSchema<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonSchema<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: DeserializeOwned + Validate> PayloadSchema for JsonSchema<T> {
    type Output = T;

    fn run_validation(&self, data: &[u8]) -> Result<T, ValidationError> {
        let value: T = serde_json::from_slice(data)
            .map_err(|e| ValidationError::non_field(format!("invalid JSON payload: {e}")))?;
        value.validate().map_err(|e| from_validator(&e))?;
        Ok(value)
    }
}

fn from_validator(errors: &validator::ValidationErrors) -> ValidationError {
    let mut rendered = Map::new();
    for (field, field_errors) in errors.field_errors() {
        let entries = field_errors
            .iter()
            .map(|error| {
                json!({
                    "code": error.code,
                    "message": error.message,
                    "params": error.params,
                })
            })
            .collect();
        rendered.insert(field.to_string(), Value::Array(entries));
    }
    if rendered.is_empty() {
        return ValidationError::non_field(errors.to_string());
    }
    ValidationError::new(Value::Object(rendered))
}
