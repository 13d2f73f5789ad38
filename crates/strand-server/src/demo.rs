//! Resources served by the bundled binary.

use std::sync::Arc;

use serde_json::json;
use strand_dispatch::{
    Components, DispatchError, ExceptionMapper, HandlerError, ParamSpec, ParamType, Params,
    Reply, Resource, ResourceRegistry,
};
use strand_net::InterfaceData;

/// Session key holding the logged-in user name.
pub const USER_KEY: &str = "user";

/// `user/login`, `user/whoami` and `echo`.
pub fn demo_registry() -> ResourceRegistry {
    ResourceRegistry::builder()
        .register(
            Resource::new("user/login", login)
                .param(ParamSpec::body("username", ParamType::String).not_blank())
                .param(
                    ParamSpec::body("password", ParamType::String)
                        .required()
                        .min_length(1),
                )
                .param(ParamSpec::session("session")),
        )
        .register(Resource::new("user/whoami", whoami).param(ParamSpec::session("session")))
        .register(
            Resource::new("echo", echo)
                .param(ParamSpec::body("message", ParamType::Any).required())
                .param(ParamSpec::connection_id("connection")),
        )
        .build()
}

/// The demo registry plus a mapper answering handler failures.
pub fn demo_components() -> Components {
    Components::new(demo_registry()).with_mapper(Arc::new(HandlerFailureMapper))
}

fn login(params: &Params) -> Result<Reply, HandlerError> {
    let username: String = params
        .get("username")?
        .ok_or_else(|| HandlerError::new("username missing"))?;
    let session = params
        .session()
        .ok_or_else(|| HandlerError::new("no session"))?;
    session.set(USER_KEY, username.clone());
    tracing::debug!(session = %session.id(), user = %username, "User logged in");
    Ok(Reply::Value(json!({ "user": username })))
}

fn whoami(params: &Params) -> Result<Reply, HandlerError> {
    let user = params
        .session()
        .and_then(|s| s.get::<String>(USER_KEY))
        .ok_or_else(|| HandlerError::new("not logged in"))?;
    Ok(Reply::Value(json!({ "user": user })))
}

fn echo(params: &Params) -> Result<Reply, HandlerError> {
    Ok(Reply::Value(json!({
        "message": params.value("message"),
        "connection": params.str("connection"),
    })))
}

/// Answers handler failures with `{"error": message}`.
struct HandlerFailureMapper;

impl ExceptionMapper for HandlerFailureMapper {
    fn matches(&self, error: &DispatchError) -> bool {
        matches!(error, DispatchError::Handler(_))
    }

    fn to_response(&self, error: &DispatchError, _request: &InterfaceData) -> Reply {
        let message = match error {
            DispatchError::Handler(e) => e.0.clone(),
            other => other.to_string(),
        };
        Reply::Value(json!({ "error": message }))
    }
}
