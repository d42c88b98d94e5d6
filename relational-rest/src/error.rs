//! Errors raised while mapping between wire representations and persisted objects.

use crate::orm;
use crate::resources::Method;
use crate::validation::ValidationErrors;
use itertools::Itertools;
use serde_json::Value as JsonValue;
use snafu::Snafu;
use std::fmt::Display;

/// Errors raised by the resource layer.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    /// A required key is absent from an incoming mapping.
    #[snafu(display("missing required key {key}"))]
    MissingKey { key: String },

    /// An incoming value cannot be converted to the declared type of a field.
    #[snafu(display("expected {expected}, got {value}"))]
    TypeCoercion { expected: String, value: JsonValue },

    /// An incoming URI does not resolve to an object of the expected kind.
    #[snafu(display("{uri} does not refer to a valid {class}"))]
    InvalidReference { uri: String, class: String },

    /// An object has no canonical address, so it cannot be referenced by URI.
    #[snafu(display("{model} {pk} has no canonical address"))]
    Unaddressable { model: String, pk: String },

    /// The authorizer of a field rejected a change.
    #[snafu(display("not authorized to change {field}"))]
    Authorization { field: String },

    /// An incoming payload failed validation.
    #[snafu(display("validation failed: {}", fmt_errors(errors)))]
    Validation { errors: ValidationErrors },

    /// A conditional write was based on a stale representation.
    #[snafu(display("precondition failed: the resource has changed"))]
    PreconditionFailed,

    /// The addressed resource does not support the requested method.
    #[snafu(display("{method} not allowed; allowed methods are {}", allowed.iter().join(", ")))]
    MethodNotAllowed { method: Method, allowed: Vec<Method> },

    /// No resource lives at the requested path.
    #[snafu(display("no resource at {path}"))]
    NotFound { path: String },

    /// A field or collection refers to a resource class that was never registered.
    #[snafu(display("unknown resource class {class}"))]
    UnknownResource { class: String },

    /// The attribute path of a field passes through an unset relation on an incoming write.
    #[snafu(display("cannot write {path}: {hop} is not set"))]
    UnreachablePath { path: String, hop: String },

    /// Resource classes or collections were registered inconsistently.
    #[snafu(display("invalid configuration: {error}"))]
    InvalidConfiguration { error: String },

    /// A document could not be read or written.
    #[snafu(display("malformed document: {error}"))]
    Format { error: String },

    /// The persistence layer failed.
    #[snafu(display("{source}"), context(false))]
    Orm { source: orm::Error },
}

fn fmt_errors(errors: &ValidationErrors) -> String {
    errors
        .iter()
        .map(|(key, messages)| format!("{key:?}: {}", messages.join("; ")))
        .join(", ")
}

impl Error {
    pub fn missing_key(key: impl Into<String>) -> Self {
        Self::MissingKey { key: key.into() }
    }

    pub fn type_coercion(expected: impl Display, value: &JsonValue) -> Self {
        Self::TypeCoercion {
            expected: expected.to_string(),
            value: value.clone(),
        }
    }

    pub fn invalid_reference(uri: impl Into<String>, class: impl Into<String>) -> Self {
        Self::InvalidReference {
            uri: uri.into(),
            class: class.into(),
        }
    }

    pub fn unknown_resource(class: impl Into<String>) -> Self {
        Self::UnknownResource {
            class: class.into(),
        }
    }

    pub fn invalid_configuration(error: impl Display) -> Self {
        Self::InvalidConfiguration {
            error: error.to_string(),
        }
    }

    pub fn format(error: impl Display) -> Self {
        Self::Format {
            error: error.to_string(),
        }
    }

    /// The status code a transport should answer with when a request fails with this error.
    pub fn status(&self) -> u16 {
        match self {
            Self::MissingKey { .. }
            | Self::TypeCoercion { .. }
            | Self::InvalidReference { .. }
            | Self::UnreachablePath { .. }
            | Self::Validation { .. }
            | Self::Format { .. } => 400,
            Self::Authorization { .. } => 403,
            Self::NotFound { .. } => 404,
            Self::MethodNotAllowed { .. } => 405,
            Self::PreconditionFailed => 412,
            Self::Orm {
                source: orm::Error::DoesNotExist { .. },
            } => 404,
            Self::Unaddressable { .. }
            | Self::UnknownResource { .. }
            | Self::InvalidConfiguration { .. }
            | Self::Orm { .. } => 500,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
