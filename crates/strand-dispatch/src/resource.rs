//! Invocable resources and the immutable path registry.
//!
//! A [`Resource`] binds a path to a [`Handler`] plus the metadata needed to
//! call it: the media types it consumes and produces and an ordered list of
//! parameter specs. Resources are collected with a [`ResourceRegistryBuilder`]
//! at startup and looked up by path afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use strand_net::InterfaceData;

use crate::exception::HandlerError;
use crate::session::Session;
use crate::validation::Constraint;

/// Media type used when a resource declares none.
pub const DEFAULT_MEDIA_TYPE: &str = "json";

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

/// Declared type of a body parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    /// Any JSON value.
    Any,
    /// A string.
    String,
    /// An integer.
    Integer,
    /// Any number.
    Number,
    /// `true` or `false`.
    Boolean,
    /// A JSON object.
    Object,
    /// A JSON array.
    Array,
}

/// Context values a handler can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextParam {
    /// The caller's [`Session`].
    Session,
    /// The caller's connection id, bound as a string.
    ConnectionId,
}

/// Where a parameter's value comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamSource {
    /// A field of the request payload.
    Body,
    /// The request context.
    Context(ContextParam),
}

/// Declaration of one handler parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
    /// Parameter name; for body parameters, the payload field.
    pub name: String,
    /// Expected type.
    pub ty: ParamType,
    /// Value source.
    pub source: ParamSource,
    /// Checks applied after binding.
    pub constraints: Vec<Constraint>,
}

impl ParamSpec {
    /// A parameter read from the payload field `name`.
    pub fn body(name: impl Into<String>, ty: ParamType) -> Self {
        Self {
            name: name.into(),
            ty,
            source: ParamSource::Body,
            constraints: Vec::new(),
        }
    }

    /// The caller's session.
    pub fn session(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ty: ParamType::Any,
            source: ParamSource::Context(ContextParam::Session),
            constraints: Vec::new(),
        }
    }

    /// The caller's connection id.
    pub fn connection_id(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ty: ParamType::String,
            source: ParamSource::Context(ContextParam::ConnectionId),
            constraints: Vec::new(),
        }
    }

    /// Add a constraint.
    pub fn constraint(mut self, constraint: Constraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    /// The value must be present and non-null.
    pub fn required(self) -> Self {
        self.constraint(Constraint::Required)
    }

    /// Strings must hold a non-whitespace character.
    pub fn not_blank(self) -> Self {
        self.constraint(Constraint::NotBlank)
    }

    /// Strings or arrays of at least `len` items.
    pub fn min_length(self, len: usize) -> Self {
        self.constraint(Constraint::MinLength(len))
    }

    /// Strings or arrays of at most `len` items.
    pub fn max_length(self, len: usize) -> Self {
        self.constraint(Constraint::MaxLength(len))
    }

    /// Numbers no smaller than `value`.
    pub fn min(self, value: f64) -> Self {
        self.constraint(Constraint::Min(value))
    }

    /// Numbers no larger than `value`.
    pub fn max(self, value: f64) -> Self {
        self.constraint(Constraint::Max(value))
    }
}

/// Bound parameter values handed to a handler.
#[derive(Debug, Clone, Default)]
pub struct Params {
    values: HashMap<String, Value>,
    session: Option<Session>,
}

impl Params {
    /// Empty parameter set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a value.
    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.values.insert(name.into(), value);
    }

    /// Attach the caller's session.
    pub fn set_session(&mut self, session: Session) {
        self.session = Some(session);
    }

    /// Raw value of a parameter.
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// String value of a parameter.
    pub fn str(&self, name: &str) -> Option<&str> {
        self.values.get(name).and_then(Value::as_str)
    }

    /// Deserialize a parameter into `T`. Missing or null values yield `None`.
    pub fn get<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, HandlerError> {
        match self.values.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(v) => serde_json::from_value(v.clone())
                .map(Some)
                .map_err(|e| HandlerError::new(format!("parameter {name}: {e}"))),
        }
    }

    /// The caller's session, if the resource declared one.
    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Number of bound values, the session excluded.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether no value is bound.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

/// What a handler returns.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Nothing; answered with a `200` status body.
    Empty,
    /// A value encoded by the resource's writer.
    Value(Value),
    /// A complete envelope sent as is.
    Envelope(InterfaceData),
}

impl Reply {
    /// Serialize any value into a [`Reply::Value`].
    pub fn json<T: serde::Serialize>(value: &T) -> Result<Self, HandlerError> {
        serde_json::to_value(value)
            .map(Reply::Value)
            .map_err(|e| HandlerError::new(e.to_string()))
    }
}

/// A resource implementation.
pub trait Handler: Send + Sync {
    /// Serve one request.
    fn call(&self, params: &Params) -> Result<Reply, HandlerError>;
}

/// Blanket implementation for closures.
impl<F> Handler for F
where
    F: Fn(&Params) -> Result<Reply, HandlerError> + Send + Sync,
{
    fn call(&self, params: &Params) -> Result<Reply, HandlerError> {
        self(params)
    }
}

// ---------------------------------------------------------------------------
// Resource
// ---------------------------------------------------------------------------

/// A handler bound to a path.
pub struct Resource {
    path: String,
    consumes: String,
    produces: String,
    params: Vec<ParamSpec>,
    handler: Arc<dyn Handler>,
}

impl Resource {
    /// Resource at `path` consuming and producing the default media type.
    pub fn new<H: Handler + 'static>(path: &str, handler: H) -> Self {
        Self {
            path: normalize_path(path).to_string(),
            consumes: DEFAULT_MEDIA_TYPE.to_string(),
            produces: DEFAULT_MEDIA_TYPE.to_string(),
            params: Vec::new(),
            handler: Arc::new(handler),
        }
    }

    /// Set the media type of request payloads.
    pub fn consumes(mut self, media_type: impl Into<String>) -> Self {
        self.consumes = media_type.into();
        self
    }

    /// Set the media type of replies.
    pub fn produces(mut self, media_type: impl Into<String>) -> Self {
        self.produces = media_type.into();
        self
    }

    /// Append a parameter.
    pub fn param(mut self, spec: ParamSpec) -> Self {
        self.params.push(spec);
        self
    }

    /// Normalized path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Media type of request bodies.
    pub fn consumes_type(&self) -> &str {
        &self.consumes
    }

    /// Media type of replies.
    pub fn produces_type(&self) -> &str {
        &self.produces
    }

    /// Parameters in declaration order.
    pub fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    /// Parameters read from the payload.
    pub fn body_params(&self) -> impl Iterator<Item = &ParamSpec> {
        self.params
            .iter()
            .filter(|p| p.source == ParamSource::Body)
    }

    /// Invoke the handler.
    pub fn invoke(&self, params: &Params) -> Result<Reply, HandlerError> {
        self.handler.call(params)
    }
}

impl std::fmt::Debug for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resource")
            .field("path", &self.path)
            .field("consumes", &self.consumes)
            .field("produces", &self.produces)
            .field("params", &self.params)
            .finish()
    }
}

/// Strip leading and trailing `/` so `"/user/login"` and `"user/login"` match.
pub fn normalize_path(path: &str) -> &str {
    path.trim_matches('/')
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Immutable path to resource map.
#[derive(Debug, Default)]
pub struct ResourceRegistry {
    resources: HashMap<String, Arc<Resource>>,
}

impl ResourceRegistry {
    /// Start collecting resources.
    pub fn builder() -> ResourceRegistryBuilder {
        ResourceRegistryBuilder::default()
    }

    /// Resource registered at `path`. Empty paths never match.
    pub fn find(&self, path: &str) -> Option<Arc<Resource>> {
        let path = normalize_path(path);
        if path.is_empty() {
            return None;
        }
        self.resources.get(path).cloned()
    }

    /// Registered paths.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.resources.keys().map(String::as_str)
    }

    /// Number of resources.
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// Whether no resource is registered.
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

/// Collects resources before freezing them into a [`ResourceRegistry`].
#[derive(Default)]
pub struct ResourceRegistryBuilder {
    resources: HashMap<String, Arc<Resource>>,
}

impl ResourceRegistryBuilder {
    /// Add a resource. A later registration at the same path replaces an
    /// earlier one.
    pub fn register(mut self, resource: Resource) -> Self {
        let path = resource.path().to_string();
        if path.is_empty() {
            tracing::warn!("Ignoring resource with an empty path");
            return self;
        }
        if self
            .resources
            .insert(path.clone(), Arc::new(resource))
            .is_some()
        {
            tracing::warn!(path = %path, "Resource registered twice, keeping the latest");
        }
        self
    }

    /// Freeze the registry.
    pub fn build(self) -> ResourceRegistry {
        tracing::debug!("Built resource registry with {} paths", self.resources.len());
        ResourceRegistry {
            resources: self.resources,
        }
    }
}
