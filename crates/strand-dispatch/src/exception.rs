//! Request errors and the exception mapper chain.
//!
//! Domain errors carry a fixed status code and are answered with a status
//! body. Everything else is offered to the registered [`ExceptionMapper`]s in
//! order; the first mapper whose predicate matches produces the reply.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use strand_net::InterfaceData;

use crate::resource::Reply;

/// Status code for a missing resource.
pub const STATUS_NOT_FOUND: &str = "404";
/// Status code for an unsupported media type.
pub const STATUS_MEDIA_TYPE: &str = "401";
/// Status code for a parameter validation failure.
pub const STATUS_BAD_PARAM: &str = "400";
/// Status code for a handler that returned nothing.
pub const STATUS_OK: &str = "200";

/// Errors raised while dispatching a single request.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// No resource is registered at the path.
    #[error("resource not found: {0:?}")]
    ResourceNotFound(String),

    /// No interceptor handles the media type.
    #[error("media type not supported: {0}")]
    MediaTypeNotSupported(String),

    /// A parameter failed binding or validation.
    #[error("invalid parameter {param}: {message}")]
    ParamValidation {
        /// Parameter name.
        param: String,
        /// What was wrong.
        message: String,
    },

    /// The handler reported a failure.
    #[error("handler failed: {0}")]
    Handler(#[from] HandlerError),

    /// A filter rejected the request or response.
    #[error("filter failed: {0}")]
    Filter(#[from] FilterError),

    /// A writer could not encode the reply.
    #[error("encode failed: {0}")]
    Encode(String),
}

impl DispatchError {
    /// Fixed status code for domain errors, `None` for the rest.
    pub fn status_code(&self) -> Option<&'static str> {
        match self {
            DispatchError::ResourceNotFound(_) => Some(STATUS_NOT_FOUND),
            DispatchError::MediaTypeNotSupported(_) => Some(STATUS_MEDIA_TYPE),
            DispatchError::ParamValidation { .. } => Some(STATUS_BAD_PARAM),
            _ => None,
        }
    }
}

/// Failure reported by a resource handler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    /// Create an error with a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Failure reported by a request or response filter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct FilterError(pub String);

impl FilterError {
    /// Create an error with a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Body sent for status-only replies, e.g. `{"status":"404"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusBody {
    /// Status code.
    pub status: String,
}

impl StatusBody {
    /// Body with the given code.
    pub fn new(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
        }
    }

    /// The body as a JSON value, ready for a writer.
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::json!({ "status": self.status })
    }
}

/// Turns an unhandled error into a reply.
pub trait ExceptionMapper: Send + Sync {
    /// Whether this mapper handles `error`.
    fn matches(&self, error: &DispatchError) -> bool;

    /// Build the reply for `error` raised while serving `request`.
    fn to_response(&self, error: &DispatchError, request: &InterfaceData) -> Reply;
}

/// Ordered list of mappers. The first match wins.
#[derive(Default, Clone)]
pub struct MapperChain {
    mappers: Vec<Arc<dyn ExceptionMapper>>,
}

impl MapperChain {
    /// Create an empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a mapper.
    pub fn add(&mut self, mapper: Arc<dyn ExceptionMapper>) {
        self.mappers.push(mapper);
    }

    /// First mapper matching `error`.
    pub fn find(&self, error: &DispatchError) -> Option<&Arc<dyn ExceptionMapper>> {
        self.mappers.iter().find(|m| m.matches(error))
    }

    /// Number of mappers.
    pub fn len(&self) -> usize {
        self.mappers.len()
    }

    /// Whether the chain is empty.
    pub fn is_empty(&self) -> bool {
        self.mappers.is_empty()
    }
}
