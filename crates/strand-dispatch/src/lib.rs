//! Request dispatch on top of the strand transport: resource registry,
//! media-type interceptors, filters, exception mappers, per-connection
//! sessions and the multi-threaded engine that ties them together.

pub mod context;
pub mod engine;
pub mod exception;
pub mod filter;
pub mod interceptor;
pub mod resource;
pub mod session;
pub mod validation;

pub use context::{RequestContext, RequestView};
pub use engine::{Components, DispatchEngine, EngineConfig, EngineError};
pub use exception::{
    DispatchError, ExceptionMapper, FilterError, HandlerError, MapperChain, STATUS_BAD_PARAM,
    STATUS_MEDIA_TYPE, STATUS_NOT_FOUND, STATUS_OK, StatusBody,
};
pub use filter::{Filter, FilterChain};
pub use interceptor::{Interceptors, JsonReader, JsonWriter, ReaderInterceptor, WriterInterceptor};
pub use resource::{
    ContextParam, DEFAULT_MEDIA_TYPE, Handler, ParamSource, ParamSpec, ParamType, Params, Reply,
    Resource, ResourceRegistry, ResourceRegistryBuilder, normalize_path,
};
pub use session::{Session, SessionStore};
pub use validation::{Constraint, validate};
