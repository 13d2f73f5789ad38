//! Dispatch engine: pulls inbound frames off the bridge queue, resolves the
//! resource, runs the filter pipeline and publishes the response.
//!
//! A single consumer thread drains the [`InboundQueue`] and feeds a fixed
//! pool of worker threads through a rendezvous channel, so a request leaves
//! the queue only when a worker is ready for it. Workers hold a shared lock
//! on the live components while they serve a request; [`DispatchEngine::shutdown`]
//! takes it exclusively, so it returns only once in-flight requests finish.
//! Requests taken off the queue after shutdown began go back to its head.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::bounded;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use rand::distr::Alphanumeric;
use serde_json::{Map, Value};
use strand_net::datagram::{self, DatagramType};
use strand_net::{
    BridgeEnvelope, Bus, DEFAULT_TOPIC, InboundQueue, InterfaceData, JsonSerializer, Serializer,
};

use crate::context::RequestContext;
use crate::exception::{DispatchError, ExceptionMapper, MapperChain, STATUS_OK, StatusBody};
use crate::filter::{Filter, FilterChain};
use crate::interceptor::{Interceptors, WriterInterceptor};
use crate::resource::{
    ContextParam, DEFAULT_MEDIA_TYPE, ParamSource, Params, Reply, Resource, ResourceRegistry,
};
use crate::session::SessionStore;
use crate::validation::validate;

/// Errors from engine lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// A dispatch thread could not be started.
    #[error("failed to spawn dispatch thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Engine tuning.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long the consumer waits on an empty queue before rechecking the
    /// shutdown flag.
    pub poll_timeout: Duration,
    /// Worker threads. Zero means one per CPU.
    pub workers: usize,
    /// Media type used to write status replies when the resource's own
    /// writer is unavailable.
    pub default_media_type: String,
    /// Bus topic responses are published on.
    pub topic: String,
    /// Charset tag written into response frames.
    pub charset: String,
    /// Largest response frame, header included. Bigger responses are dropped.
    pub max_frame_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(200),
            workers: 0,
            default_media_type: DEFAULT_MEDIA_TYPE.to_string(),
            topic: DEFAULT_TOPIC.to_string(),
            charset: datagram::DEFAULT_CHARSET.to_string(),
            max_frame_size: datagram::MAX_FRAME_LENGTH,
        }
    }
}

impl EngineConfig {
    /// Effective worker count.
    pub fn worker_count(&self) -> usize {
        if self.workers == 0 {
            num_cpus::get().max(1)
        } else {
            self.workers
        }
    }
}

/// Everything a worker needs to serve a request.
pub struct Components {
    /// Resources looked up by invoke path.
    pub resources: ResourceRegistry,
    /// Body readers and writers keyed by media type.
    pub interceptors: Interceptors,
    /// Filters run around every handler.
    pub filters: FilterChain,
    /// Mappers for errors that have no status code.
    pub mappers: MapperChain,
    /// Per-connection sessions.
    pub sessions: SessionStore,
}

impl Components {
    /// Components with the JSON interceptors and no filters or mappers.
    pub fn new(resources: ResourceRegistry) -> Self {
        Self {
            resources,
            interceptors: Interceptors::json(),
            filters: FilterChain::new(),
            mappers: MapperChain::new(),
            sessions: SessionStore::new(),
        }
    }

    /// Replace the interceptors.
    pub fn with_interceptors(mut self, interceptors: Interceptors) -> Self {
        self.interceptors = interceptors;
        self
    }

    /// Add a filter at `priority`. Higher runs first.
    pub fn with_filter(mut self, priority: i32, filter: Arc<dyn Filter>) -> Self {
        self.filters.add(priority, filter);
        self
    }

    /// Append an exception mapper.
    pub fn with_mapper(mut self, mapper: Arc<dyn ExceptionMapper>) -> Self {
        self.mappers.add(mapper);
        self
    }
}

type ShutdownCallback = Box<dyn Fn() + Send + Sync>;

struct Runtime {
    name: String,
    consumer: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
}

struct Shared<S: Serializer> {
    config: EngineConfig,
    queue: Arc<InboundQueue>,
    bus: Arc<Bus<S>>,
    serializer: S,
    components: Arc<Components>,
    live: RwLock<Option<Arc<Components>>>,
    stopping: AtomicBool,
}

/// Multi-threaded request dispatcher.
pub struct DispatchEngine<S: Serializer = JsonSerializer> {
    shared: Arc<Shared<S>>,
    runtime: Mutex<Option<Runtime>>,
    on_shutdown: Mutex<Option<ShutdownCallback>>,
}

impl DispatchEngine<JsonSerializer> {
    /// Create an engine that decodes requests as JSON.
    pub fn new(
        config: EngineConfig,
        queue: Arc<InboundQueue>,
        bus: Arc<Bus<JsonSerializer>>,
        components: Components,
    ) -> Self {
        Self::with_serializer(config, queue, bus, components, JsonSerializer)
    }
}

impl<S: Serializer> DispatchEngine<S> {
    /// Create an engine with an explicit request serializer.
    pub fn with_serializer(
        config: EngineConfig,
        queue: Arc<InboundQueue>,
        bus: Arc<Bus<S>>,
        components: Components,
        serializer: S,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                queue,
                bus,
                serializer,
                components: Arc::new(components),
                live: RwLock::new(None),
                stopping: AtomicBool::new(false),
            }),
            runtime: Mutex::new(None),
            on_shutdown: Mutex::new(None),
        }
    }

    /// Run `callback` after every completed shutdown.
    pub fn set_shutdown_callback(&self, callback: impl Fn() + Send + Sync + 'static) {
        *self.on_shutdown.lock() = Some(Box::new(callback));
    }

    /// Start the consumer and worker threads.
    ///
    /// An empty `name` picks a random one. Starting a running engine changes
    /// nothing and returns the name it already runs under.
    pub fn start(&self, name: &str) -> Result<String, EngineError> {
        let mut runtime = self.runtime.lock();
        if let Some(running) = runtime.as_ref() {
            tracing::debug!(engine = %running.name, "Dispatch engine already running");
            return Ok(running.name.clone());
        }

        let name = if name.is_empty() {
            random_name()
        } else {
            name.to_string()
        };
        let worker_count = self.shared.config.worker_count();

        self.shared.stopping.store(false, Ordering::SeqCst);
        *self.shared.live.write() = Some(Arc::clone(&self.shared.components));

        let (job_tx, job_rx) = bounded::<BridgeEnvelope>(0);

        let mut workers = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let receiver = job_rx.clone();
            let shared = Arc::clone(&self.shared);
            let handle = std::thread::Builder::new()
                .name(format!("{name}-worker-{index}"))
                .spawn(move || {
                    while let Ok(envelope) = receiver.recv() {
                        shared.serve(envelope);
                    }
                })?;
            workers.push(handle);
        }
        drop(job_rx);

        let shared = Arc::clone(&self.shared);
        let consumer = std::thread::Builder::new()
            .name(format!("{name}-consumer"))
            .spawn(move || {
                while !shared.stopping.load(Ordering::SeqCst) {
                    let Some(envelope) = shared.queue.poll_first(shared.config.poll_timeout)
                    else {
                        continue;
                    };
                    if shared.stopping.load(Ordering::SeqCst) {
                        shared.queue.push_front(envelope);
                        break;
                    }
                    if let Err(unsent) = job_tx.send(envelope) {
                        shared.queue.push_front(unsent.into_inner());
                        break;
                    }
                }
            })?;

        tracing::info!(engine = %name, workers = worker_count, "Dispatch engine started");
        *runtime = Some(Runtime {
            name: name.clone(),
            consumer,
            workers,
        });
        Ok(name)
    }

    /// Stop accepting work, wait for in-flight requests and tear down the
    /// pool. Sessions are discarded. The engine may be started again.
    pub fn shutdown(&self) {
        let Some(runtime) = self.runtime.lock().take() else {
            return;
        };

        self.shared.stopping.store(true, Ordering::SeqCst);
        if let Some(components) = self.shared.live.write().take() {
            components.sessions.clear();
        }

        if runtime.consumer.join().is_err() {
            tracing::error!(engine = %runtime.name, "Dispatch consumer panicked");
        }
        for worker in runtime.workers {
            if worker.join().is_err() {
                tracing::error!(engine = %runtime.name, "Dispatch worker panicked");
            }
        }
        tracing::info!(engine = %runtime.name, "Dispatch engine stopped");

        if let Some(callback) = self.on_shutdown.lock().as_ref() {
            callback();
        }
    }

    /// Whether the worker pool is running.
    pub fn is_running(&self) -> bool {
        self.runtime.lock().is_some()
    }

    /// Name of the running engine.
    pub fn name(&self) -> Option<String> {
        self.runtime.lock().as_ref().map(|r| r.name.clone())
    }

    /// Tuning the engine runs with.
    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Per-connection sessions.
    pub fn sessions(&self) -> &SessionStore {
        &self.shared.components.sessions
    }
}

impl<S: Serializer> Drop for DispatchEngine<S> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn random_name() -> String {
    let suffix: String = rand::rng()
        .sample_iter(Alphanumeric)
        .take(4)
        .map(char::from)
        .collect();
    format!("dispatch-{suffix}")
}

impl<S: Serializer> Shared<S> {
    fn serve(&self, envelope: BridgeEnvelope) {
        let live = self.live.read_recursive();
        let Some(components) = live.as_deref() else {
            tracing::debug!(
                connection_id = %envelope.connection_id,
                "Engine stopping, returning request to queue"
            );
            self.queue.push_front(envelope);
            return;
        };

        let frame = match datagram::decode(&envelope.body) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(connection_id = %envelope.connection_id, "Undecodable frame: {e}");
                return;
            }
        };
        if frame.kind() != DatagramType::Application {
            tracing::trace!(kind = ?frame.kind(), "Ignoring non-application frame");
            return;
        }
        if frame.body().is_empty() {
            tracing::warn!(connection_id = %envelope.connection_id, "Empty request body");
            return;
        }

        let request: InterfaceData = match self.serializer.decode(frame.body()) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(connection_id = %envelope.connection_id, "Malformed request: {e}");
                return;
            }
        };

        let connection_id = envelope.connection_id;
        let response = match handle(components, &connection_id, &request) {
            Ok(response) => response,
            Err(error) => match self.recover(components, &request, error) {
                Some(response) => response,
                None => return,
            },
        };
        self.respond(&connection_id, frame.version(), &response);
    }

    /// Turn a failed request into a reply: status bodies for domain errors,
    /// the first matching mapper otherwise.
    fn recover(
        &self,
        components: &Components,
        request: &InterfaceData,
        error: DispatchError,
    ) -> Option<InterfaceData> {
        let writer = self.reply_writer(components, request);

        if let Some(code) = error.status_code() {
            tracing::debug!(id = %request.id, invoke = %request.invoke, status = code, "{error}");
            let Some(writer) = writer else {
                tracing::error!(invoke = %request.invoke, "No writer for status reply");
                return None;
            };
            return match writer.write(&StatusBody::new(code).to_value()) {
                Ok(data) => Some(request.reply(Some(data))),
                Err(e) => {
                    tracing::error!(invoke = %request.invoke, "Status reply failed: {e}");
                    None
                }
            };
        }

        let Some(mapper) = components.mappers.find(&error) else {
            tracing::error!(
                id = %request.id,
                invoke = %request.invoke,
                "Unhandled dispatch error, no response sent: {error}"
            );
            return None;
        };
        let reply = mapper.to_response(&error, request);
        let Some(writer) = writer else {
            tracing::error!(invoke = %request.invoke, "No writer for mapped reply");
            return None;
        };
        match render(&**writer, request, reply) {
            Ok(response) => Some(response),
            Err(e) => {
                tracing::error!(invoke = %request.invoke, "Mapped reply failed: {e}");
                None
            }
        }
    }

    /// The resource's writer when it resolves, else the default one.
    fn reply_writer<'a>(
        &self,
        components: &'a Components,
        request: &InterfaceData,
    ) -> Option<&'a Arc<dyn WriterInterceptor>> {
        components
            .resources
            .find(&request.invoke)
            .and_then(|r| components.interceptors.writer(r.produces_type()).ok())
            .or_else(|| {
                components
                    .interceptors
                    .writer(&self.config.default_media_type)
                    .ok()
            })
    }

    fn respond(&self, connection_id: &str, version: u8, response: &InterfaceData) {
        let body = match self.serializer.encode(response) {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(connection_id, "Response encoding failed: {e}");
                return;
            }
        };
        let frame = match datagram::encode_with_charset(
            &body,
            version,
            DatagramType::Application,
            &self.config.charset,
        ) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(connection_id, "Response framing failed: {e}");
                return;
            }
        };
        let frame = frame.into_frame();
        if frame.len() > self.config.max_frame_size {
            tracing::error!(
                connection_id,
                size = frame.len(),
                limit = self.config.max_frame_size,
                "Response exceeds frame limit, dropping"
            );
            return;
        }
        let envelope = BridgeEnvelope::new(frame, connection_id);
        match self.bus.publish(&self.config.topic, &envelope) {
            Ok(0) => tracing::warn!(topic = %self.config.topic, "Response had no listener"),
            Ok(_) => tracing::trace!(connection_id, invoke = %response.invoke, "Response sent"),
            Err(e) => tracing::error!(connection_id, "Response publish failed: {e}"),
        }
    }
}

/// Serve one decoded request through the full pipeline.
fn handle(
    components: &Components,
    connection_id: &str,
    request: &InterfaceData,
) -> Result<InterfaceData, DispatchError> {
    let resource = components
        .resources
        .find(&request.invoke)
        .ok_or_else(|| DispatchError::ResourceNotFound(request.invoke.clone()))?;
    let reader = components.interceptors.reader(resource.consumes_type())?;
    let body = reader.read(&resource, request.data.as_deref())?;
    let params = bind(&resource, body, &components.sessions, connection_id)?;

    let context = RequestContext::new(connection_id, request.clone(), resource, params);
    components.filters.run_request(&context.view())?;
    let mut reply = context.resource().invoke(context.params())?;
    components
        .filters
        .run_response(&context.view(), &mut reply)?;

    let writer = components
        .interceptors
        .writer(context.resource().produces_type())?;
    render(&**writer, request, reply)
}

/// Bind body values and context values in declaration order, validating each
/// body parameter as it is bound.
fn bind(
    resource: &Resource,
    mut body: Map<String, Value>,
    sessions: &SessionStore,
    connection_id: &str,
) -> Result<Params, DispatchError> {
    let mut params = Params::new();
    for spec in resource.params() {
        match spec.source {
            ParamSource::Body => {
                let value = body.remove(&spec.name);
                validate(spec, value.as_ref())?;
                if let Some(value) = value {
                    params.insert(spec.name.clone(), value);
                }
            }
            ParamSource::Context(ContextParam::Session) => {
                params.set_session(sessions.get(connection_id));
            }
            ParamSource::Context(ContextParam::ConnectionId) => {
                params.insert(spec.name.clone(), Value::String(connection_id.to_string()));
            }
        }
    }
    Ok(params)
}

fn render(
    writer: &dyn WriterInterceptor,
    request: &InterfaceData,
    reply: Reply,
) -> Result<InterfaceData, DispatchError> {
    match reply {
        Reply::Empty => {
            let data = writer.write(&StatusBody::new(STATUS_OK).to_value())?;
            Ok(request.reply(Some(data)))
        }
        Reply::Value(value) => Ok(request.reply(Some(writer.write(&value)?))),
        Reply::Envelope(envelope) => Ok(envelope),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exception::HandlerError;
    use crate::resource::{ParamSpec, ParamType};
    use crossbeam_channel::{Receiver, Sender, unbounded};
    use std::sync::atomic::AtomicUsize;
    use serde_json::json;
    use strand_net::Listener;
    use strand_net::datagram::{DEFAULT_VERSION, encode, heartbeat};

    const WAIT: Duration = Duration::from_secs(2);

    struct Collector(Sender<BridgeEnvelope>);

    impl Listener for Collector {
        type Message = BridgeEnvelope;

        fn on_message(&self, _topic: &str, envelope: BridgeEnvelope) {
            let _ = self.0.send(envelope);
        }
    }

    struct HandlerFailures;

    impl ExceptionMapper for HandlerFailures {
        fn matches(&self, error: &DispatchError) -> bool {
            matches!(error, DispatchError::Handler(_))
        }

        fn to_response(&self, error: &DispatchError, _request: &InterfaceData) -> Reply {
            Reply::Value(json!({ "error": error.to_string() }))
        }
    }

    fn registry() -> ResourceRegistry {
        ResourceRegistry::builder()
            .register(
                Resource::new("user/login", |p: &Params| -> Result<Reply, HandlerError> {
                    let name: String = p.get("username")?.unwrap_or_default();
                    Ok(Reply::Value(json!({ "welcome": name })))
                })
                .param(ParamSpec::body("username", ParamType::String).not_blank())
                .param(ParamSpec::body("password", ParamType::String).required()),
            )
            .register(
                Resource::new("xml/only", |_: &Params| -> Result<Reply, HandlerError> {
                    Ok(Reply::Empty)
                })
                .consumes("xml"),
            )
            .register(Resource::new(
                "silent",
                |_: &Params| -> Result<Reply, HandlerError> { Ok(Reply::Empty) },
            ))
            .register(Resource::new(
                "fail",
                |_: &Params| -> Result<Reply, HandlerError> { Err(HandlerError::new("boom")) },
            ))
            .register(Resource::new(
                "raw",
                |_: &Params| -> Result<Reply, HandlerError> {
                    Ok(Reply::Envelope(InterfaceData::new("raw-id", "/custom", None)))
                },
            ))
            .register(
                Resource::new("counter", |p: &Params| -> Result<Reply, HandlerError> {
                    let session = p.session().ok_or_else(|| HandlerError::new("no session"))?;
                    let count = session.get::<u32>("count").unwrap_or(0) + 1;
                    session.set("count", count);
                    Ok(Reply::Value(json!(count)))
                })
                .param(ParamSpec::session("session")),
            )
            .register(
                Resource::new("whoami", |p: &Params| -> Result<Reply, HandlerError> {
                    Ok(Reply::Value(json!(p.str("conn"))))
                })
                .param(ParamSpec::connection_id("conn")),
            )
            .build()
    }

    struct Harness {
        engine: DispatchEngine,
        queue: Arc<InboundQueue>,
        responses: Receiver<BridgeEnvelope>,
    }

    fn test_config() -> EngineConfig {
        EngineConfig {
            poll_timeout: Duration::from_millis(20),
            workers: 2,
            ..EngineConfig::default()
        }
    }

    impl Harness {
        fn new(components: Components) -> Self {
            Self::with_config(components, test_config())
        }

        fn with_config(components: Components, config: EngineConfig) -> Self {
            let queue = Arc::new(InboundQueue::new());
            let bus = Arc::new(Bus::new());
            let (tx, responses) = unbounded();
            bus.register(DEFAULT_TOPIC, Arc::new(Collector(tx)));
            let engine = DispatchEngine::new(config, Arc::clone(&queue), bus, components);
            engine.start("test").unwrap();
            Self {
                engine,
                queue,
                responses,
            }
        }

        fn send(&self, connection_id: &str, request: &InterfaceData) {
            let body = serde_json::to_vec(request).unwrap();
            let frame = encode(&body, DEFAULT_VERSION, DatagramType::Application).unwrap();
            self.queue
                .push_back(BridgeEnvelope::new(frame.into_frame(), connection_id));
        }

        fn recv(&self) -> (String, InterfaceData) {
            let envelope = self.responses.recv_timeout(WAIT).unwrap();
            let frame = datagram::decode(&envelope.body).unwrap();
            assert_eq!(frame.kind(), DatagramType::Application);
            let response = serde_json::from_slice(frame.body()).unwrap();
            (envelope.connection_id, response)
        }

        fn call(&self, connection_id: &str, invoke: &str, data: Option<&str>) -> InterfaceData {
            self.send(
                connection_id,
                &InterfaceData::new("1", invoke, data.map(str::to_string)),
            );
            self.recv().1
        }
    }

    fn data_json(response: &InterfaceData) -> Value {
        serde_json::from_str(response.data.as_deref().unwrap()).unwrap()
    }

    #[test]
    fn test_login_round_trip() {
        let harness = Harness::new(Components::new(registry()));
        harness.send(
            "conn-1",
            &InterfaceData::new(
                "1",
                "/user/login",
                Some(r#"{"username":"joe","password":"pw"}"#.into()),
            ),
        );
        let (connection_id, response) = harness.recv();
        assert_eq!(connection_id, "conn-1");
        assert_eq!(response.id, "1");
        assert_eq!(response.invoke, "/back/user/login");
        assert_eq!(data_json(&response), json!({ "welcome": "joe" }));
    }

    #[test]
    fn test_status_replies() {
        let harness = Harness::new(Components::new(registry()));

        let missing = harness.call("c", "/nope", None);
        assert_eq!(missing.invoke, "/back/nope");
        assert_eq!(data_json(&missing), json!({ "status": "404" }));

        let media = harness.call("c", "/xml/only", Some("<a/>"));
        assert_eq!(data_json(&media), json!({ "status": "401" }));

        let blank = harness.call(
            "c",
            "/user/login",
            Some(r#"{"username":"  ","password":"pw"}"#),
        );
        assert_eq!(data_json(&blank), json!({ "status": "400" }));

        let empty = harness.call("c", "silent", None);
        assert_eq!(empty.invoke, "/back/silent");
        assert_eq!(data_json(&empty), json!({ "status": "200" }));
    }

    #[test]
    fn test_envelope_reply_passes_through() {
        let harness = Harness::new(Components::new(registry()));
        let response = harness.call("c", "/raw", None);
        assert_eq!(response, InterfaceData::new("raw-id", "/custom", None));
    }

    #[test]
    fn test_unmapped_error_sends_nothing() {
        let harness = Harness::new(Components::new(registry()));
        harness.send("c", &InterfaceData::new("1", "/fail", None));
        assert!(
            harness
                .responses
                .recv_timeout(Duration::from_millis(300))
                .is_err()
        );
    }

    #[test]
    fn test_mapper_handles_handler_error() {
        let components = Components::new(registry()).with_mapper(Arc::new(HandlerFailures));
        let harness = Harness::new(components);
        let response = harness.call("c", "/fail", None);
        assert_eq!(response.invoke, "/back/fail");
        assert_eq!(
            data_json(&response),
            json!({ "error": "handler failed: boom" })
        );
    }

    #[test]
    fn test_heartbeat_and_empty_body_are_dropped() {
        let harness = Harness::new(Components::new(registry()));
        harness.queue.push_back(BridgeEnvelope::new(
            heartbeat(DEFAULT_VERSION).into_frame(),
            "c",
        ));
        let empty = encode(&[], DEFAULT_VERSION, DatagramType::Application).unwrap();
        harness
            .queue
            .push_back(BridgeEnvelope::new(empty.into_frame(), "c"));
        harness
            .queue
            .push_back(BridgeEnvelope::new(b"garbage".to_vec(), "c"));

        let response = harness.call("c", "silent", None);
        assert_eq!(response.invoke, "/back/silent");
        assert!(harness.responses.try_recv().is_err());
    }

    #[test]
    fn test_session_follows_connection() {
        let harness = Harness::new(Components::new(registry()));
        assert_eq!(data_json(&harness.call("a", "counter", None)), json!(1));
        assert_eq!(data_json(&harness.call("a", "counter", None)), json!(2));
        assert_eq!(data_json(&harness.call("b", "counter", None)), json!(1));
        assert_eq!(harness.engine.sessions().len(), 2);

        assert_eq!(
            data_json(&harness.call("conn-7", "whoami", None)),
            json!("conn-7")
        );
    }

    #[test]
    fn test_filters_wrap_handler() {
        struct Tag;

        impl Filter for Tag {
            fn on_request(
                &self,
                request: &crate::context::RequestView<'_>,
            ) -> Result<(), crate::exception::FilterError> {
                if request.connection_id() == "blocked" {
                    return Err(crate::exception::FilterError::new("blocked"));
                }
                Ok(())
            }

            fn on_response(
                &self,
                _request: &crate::context::RequestView<'_>,
                reply: &mut Reply,
            ) -> Result<(), crate::exception::FilterError> {
                if let Reply::Value(value) = reply {
                    *value = json!({ "wrapped": value.clone() });
                }
                Ok(())
            }
        }

        let harness = Harness::new(Components::new(registry()).with_filter(0, Arc::new(Tag)));
        assert_eq!(
            data_json(&harness.call("a", "counter", None)),
            json!({ "wrapped": 1 })
        );

        harness.send("blocked", &InterfaceData::new("1", "counter", None));
        assert!(
            harness
                .responses
                .recv_timeout(Duration::from_millis(300))
                .is_err()
        );
    }

    #[test]
    fn test_start_is_idempotent_and_restartable() {
        let harness = Harness::new(Components::new(registry()));
        let stops = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&stops);
        harness.engine.set_shutdown_callback(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(harness.engine.start("other").unwrap(), "test");
        assert_eq!(harness.engine.name().as_deref(), Some("test"));

        harness.call("a", "counter", None);
        harness.engine.shutdown();
        assert!(!harness.engine.is_running());
        assert!(harness.engine.sessions().is_empty());
        assert_eq!(stops.load(Ordering::SeqCst), 1);

        harness.engine.shutdown();
        assert_eq!(stops.load(Ordering::SeqCst), 1);

        let name = harness.engine.start("").unwrap();
        assert!(name.starts_with("dispatch-"));
        assert_eq!(name.len(), "dispatch-".len() + 4);
        assert_eq!(data_json(&harness.call("a", "counter", None)), json!(1));
    }

    #[test]
    fn test_shutdown_waits_for_in_flight_handler() {
        let (entered_tx, entered_rx) = unbounded();
        let (release_tx, release_rx) = unbounded::<()>();
        let registry = ResourceRegistry::builder()
            .register(Resource::new(
                "block",
                move |_: &Params| -> Result<Reply, HandlerError> {
                    let _ = entered_tx.send(());
                    let _ = release_rx.recv_timeout(Duration::from_secs(5));
                    Ok(Reply::Value(json!("done")))
                },
            ))
            .build();
        let harness = Harness::new(Components::new(registry));
        harness.send("c", &InterfaceData::new("1", "block", None));
        entered_rx.recv_timeout(WAIT).unwrap();

        let stopped = AtomicBool::new(false);
        std::thread::scope(|scope| {
            let stopper = scope.spawn(|| {
                harness.engine.shutdown();
                stopped.store(true, Ordering::SeqCst);
            });
            std::thread::sleep(Duration::from_millis(100));
            assert!(!stopped.load(Ordering::SeqCst));
            assert!(harness.responses.is_empty());

            release_tx.send(()).unwrap();
            stopper.join().unwrap();
        });

        assert!(stopped.load(Ordering::SeqCst));
        assert!(!harness.engine.is_running());
        let response = harness.responses.try_recv().unwrap();
        let frame = datagram::decode(&response.body).unwrap();
        let response: InterfaceData = serde_json::from_slice(frame.body()).unwrap();
        assert_eq!(response.invoke, "/back/block");
        assert_eq!(data_json(&response), json!("done"));
    }

    #[test]
    fn test_shutdown_returns_unserved_requests_to_queue() {
        let registry = ResourceRegistry::builder()
            .register(Resource::new(
                "slow",
                |_: &Params| -> Result<Reply, HandlerError> {
                    std::thread::sleep(Duration::from_millis(20));
                    Ok(Reply::Empty)
                },
            ))
            .build();
        let config = EngineConfig {
            workers: 1,
            ..test_config()
        };
        let harness = Harness::with_config(Components::new(registry), config);
        for id in 0..20 {
            harness.send("c", &InterfaceData::new(id.to_string(), "slow", None));
        }
        std::thread::sleep(Duration::from_millis(50));
        harness.engine.shutdown();

        let served = harness.responses.len();
        assert!(served < 20);
        assert_eq!(served + harness.queue.len(), 20);

        harness.engine.start("again").unwrap();
        let mut ids: Vec<u32> = (0..20)
            .map(|_| harness.recv().1.id.parse().unwrap())
            .collect();
        ids.sort_unstable();
        assert_eq!(ids, (0..20).collect::<Vec<_>>());
        assert!(harness.queue.is_empty());
    }

    #[test]
    fn test_oversized_response_is_dropped() {
        let registry = ResourceRegistry::builder()
            .register(Resource::new(
                "big",
                |_: &Params| -> Result<Reply, HandlerError> {
                    Ok(Reply::Value(json!("x".repeat(1024))))
                },
            ))
            .register(Resource::new(
                "silent",
                |_: &Params| -> Result<Reply, HandlerError> { Ok(Reply::Empty) },
            ))
            .build();
        let config = EngineConfig {
            max_frame_size: 256,
            ..test_config()
        };
        let harness = Harness::with_config(Components::new(registry), config);

        harness.send("c", &InterfaceData::new("1", "big", None));
        assert!(
            harness
                .responses
                .recv_timeout(Duration::from_millis(300))
                .is_err()
        );

        let response = harness.call("c", "silent", None);
        assert_eq!(data_json(&response), json!({ "status": "200" }));
    }

    #[test]
    fn test_worker_count_defaults_to_cpus() {
        assert!(EngineConfig::default().worker_count() >= 1);
        let config = EngineConfig {
            workers: 3,
            ..EngineConfig::default()
        };
        assert_eq!(config.worker_count(), 3);
        assert_eq!(
            EngineConfig::default().max_frame_size,
            datagram::MAX_FRAME_LENGTH
        );
    }
}
