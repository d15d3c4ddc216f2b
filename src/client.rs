//! Agent client: connection lifecycle and the client-side session API.
//!
//! # Connection Lifecycle
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Error -> (auto restart) Connecting
//!                                         \-> Disconnected (stop)
//! ```
//!
//! A [`Connection`] bundles the RPC connection, its session router and the
//! child process. It is never repaired: after an unexpected close the whole
//! bundle is discarded and, with `auto_restart`, a new one is built from
//! scratch. Sessions registered on the old connection are not recreated.
//!
//! # Example
//!
//! ```ignore
//! use agent_rpc::{AgentClient, ClientOptions, MessageOptions, SessionConfig};
//!
//! let client = AgentClient::new(ClientOptions::default())?;
//! client.start().await?;
//!
//! let session = client.create_session(SessionConfig::default()).await?;
//! session.on(|event| println!("{}", event.event_type));
//! session.send(MessageOptions::new("Hello")).await?;
//!
//! client.stop().await;
//! ```

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::process::Child;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::ClientOptions;
use crate::error::{RpcError, RpcResult};
use crate::events::{default_event_parser, EventParser, SessionEvent};
use crate::ipc::{Dispatcher, RpcConnection};
use crate::methods;
use crate::session::{Session, SessionRouter, ToolHandler};
use crate::transport::{Connector, ProcessConnector, Transport};

/// Protocol version this client speaks; checked during the handshake.
pub const PROTOCOL_VERSION: u32 = 2;

/// Per-session bound on `session.destroy` during [`AgentClient::stop`].
const STOP_DESTROY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

// =============================================================================
// Wire Types
// =============================================================================

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingResponse {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub protocol_version: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub protocol_version: Option<u32>,
}

/// Tool declaration sent to the server when a session is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON schema of the arguments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            parameters: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_parameters(mut self, schema: Value) -> Self {
        self.parameters = Some(schema);
        self
    }
}

/// Options for `session.create` / `session.resume`.
#[derive(Default)]
pub struct SessionConfig {
    pub session_id: Option<String>,
    pub model: Option<String>,
    pub streaming: Option<bool>,
    /// Extra fields passed through verbatim.
    pub extra: Map<String, Value>,
    tools: Vec<(ToolDefinition, Arc<dyn ToolHandler>)>,
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session_id(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(id.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = Some(streaming);
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// Declare a tool and the handler that serves it.
    pub fn with_tool(mut self, definition: ToolDefinition, handler: Arc<dyn ToolHandler>) -> Self {
        self.tools.push((definition, handler));
        self
    }

    fn to_params(&self) -> Value {
        let mut params = self.extra.clone();
        if let Some(id) = &self.session_id {
            params.insert("sessionId".to_string(), json!(id));
        }
        if let Some(model) = &self.model {
            params.insert("model".to_string(), json!(model));
        }
        if let Some(streaming) = self.streaming {
            params.insert("streaming".to_string(), json!(streaming));
        }
        if !self.tools.is_empty() {
            let defs: Vec<&ToolDefinition> = self.tools.iter().map(|(def, _)| def).collect();
            params.insert("tools".to_string(), json!(defs));
        }
        Value::Object(params)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionCreated {
    session_id: String,
}

/// A prompt for `session.send`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageOptions {
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
}

impl MessageOptions {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            attachments: None,
            mode: None,
        }
    }
}

/// Entry of `session.list`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    pub session_id: String,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub modified_time: Option<String>,
    #[serde(default)]
    pub is_remote: Option<bool>,
}

// =============================================================================
// Connection
// =============================================================================

/// Everything that lives and dies with one transport.
pub struct Connection {
    rpc: RpcConnection,
    router: Arc<SessionRouter>,
    child: Mutex<Option<Child>>,
}

impl Connection {
    /// Wire a fresh router and RPC connection over `transport`.
    fn establish(transport: Transport, parser: EventParser) -> Self {
        let router = Arc::new(SessionRouter::with_parser(parser));
        let dispatcher = router.install(Dispatcher::builder()).build();
        let rpc = RpcConnection::start(transport.reader, transport.writer, dispatcher);
        Self {
            rpc,
            router,
            child: Mutex::new(transport.child),
        }
    }

    pub fn rpc(&self) -> &RpcConnection {
        &self.rpc
    }

    pub fn router(&self) -> &Arc<SessionRouter> {
        &self.router
    }

    /// Dispose the RPC connection, drop all sessions and kill the child.
    fn shutdown(&self, reason: &str) {
        self.rpc.dispose(reason);
        self.router.clear();
        if let Some(mut child) = self.child.lock().take() {
            debug!(pid = child.id(), "Killing agent CLI");
            if let Err(e) = child.start_kill() {
                debug!(error = %e, "Agent CLI already gone");
            }
        }
    }

    /// `ping` and check the reported protocol version.
    async fn verify_protocol(&self) -> RpcResult<()> {
        let reply = self
            .rpc
            .send_request(methods::PING, Some(json!({})))
            .await?;
        let ping: PingResponse = serde_json::from_value(reply)?;

        match ping.protocol_version {
            Some(PROTOCOL_VERSION) => Ok(()),
            actual => Err(RpcError::ProtocolMismatch {
                expected: PROTOCOL_VERSION,
                actual,
            }),
        }
    }
}

// =============================================================================
// Client
// =============================================================================

struct Inner {
    options: ClientOptions,
    connector: Arc<dyn Connector>,
    parser: EventParser,
    state_tx: watch::Sender<ConnectionState>,
    connection: RwLock<Option<Arc<Connection>>>,
    /// Serializes start, stop and restart.
    lifecycle: tokio::sync::Mutex<()>,
    stopping: AtomicBool,
}

impl Inner {
    fn current(&self) -> Option<Arc<Connection>> {
        self.connection.read().clone()
    }

    fn set_state(&self, state: ConnectionState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current != state {
                *current = state;
                true
            } else {
                false
            }
        });
        if changed {
            debug!(?state, "Connection state changed");
        }
    }

    /// Open a transport and run the handshake. Does not publish the result.
    async fn establish(&self) -> RpcResult<Arc<Connection>> {
        self.set_state(ConnectionState::Connecting);

        let conn = match self.connector.connect().await {
            Ok(transport) => Arc::new(Connection::establish(transport, self.parser.clone())),
            Err(e) => {
                warn!(error = %e, "Failed to open transport");
                self.set_state(ConnectionState::Error);
                return Err(e);
            }
        };

        if let Err(e) = conn.verify_protocol().await {
            warn!(error = %e, "Handshake failed");
            conn.shutdown("Handshake failed");
            self.set_state(ConnectionState::Error);
            return Err(e);
        }

        *self.connection.write() = Some(Arc::clone(&conn));
        self.set_state(ConnectionState::Connected);
        info!("Connected to agent server");
        Ok(conn)
    }

    /// Establish a connection and start watching it. Caller holds `lifecycle`.
    async fn connect(self: &Arc<Self>) -> RpcResult<()> {
        let conn = self.establish().await?;
        tokio::spawn(monitor(Arc::downgrade(self), conn));
        Ok(())
    }

    /// Remove `conn` from the slot if it is still the active one.
    fn detach(&self, conn: &Arc<Connection>) -> bool {
        let mut slot = self.connection.write();
        match slot.as_ref() {
            Some(active) if Arc::ptr_eq(active, conn) => {
                *slot = None;
                true
            }
            _ => false,
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(conn) = self.connection.get_mut().take() {
            conn.shutdown("Client dropped");
        }
    }
}

/// Watch the active connection and rebuild it after an unexpected close.
///
/// Only a weak reference to the client is kept while waiting, so dropping
/// the last [`AgentClient`] still tears everything down.
async fn monitor(client: Weak<Inner>, mut conn: Arc<Connection>) {
    loop {
        let reason = conn.rpc.closed().await;

        let Some(inner) = client.upgrade() else {
            return;
        };
        if inner.stopping.load(Ordering::SeqCst) || !inner.detach(&conn) {
            return;
        }

        warn!(reason = %reason, "Connection to agent server lost");
        conn.shutdown(&reason);
        inner.set_state(ConnectionState::Error);

        if !inner.options.auto_restart {
            return;
        }

        let _guard = inner.lifecycle.lock().await;
        if inner.stopping.load(Ordering::SeqCst) || inner.current().is_some() {
            return;
        }
        info!("Restarting agent connection");
        conn = match inner.establish().await {
            Ok(next) => next,
            Err(e) => {
                warn!(error = %e, "Automatic restart failed");
                return;
            }
        };
    }
}

/// Builder for an [`AgentClient`] with a custom connector or event parser.
pub struct AgentClientBuilder {
    options: ClientOptions,
    connector: Option<Arc<dyn Connector>>,
    parser: EventParser,
}

impl AgentClientBuilder {
    /// Replace the default process/TCP connector.
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn event_parser(mut self, parser: EventParser) -> Self {
        self.parser = parser;
        self
    }

    /// # Errors
    ///
    /// Returns `RpcError::Configuration` if the options are contradictory.
    pub fn build(self) -> RpcResult<AgentClient> {
        self.options.validate()?;
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(ProcessConnector::new(self.options.clone())));
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);

        Ok(AgentClient {
            inner: Arc::new(Inner {
                options: self.options,
                connector,
                parser: self.parser,
                state_tx,
                connection: RwLock::new(None),
                lifecycle: tokio::sync::Mutex::new(()),
                stopping: AtomicBool::new(false),
            }),
        })
    }
}

/// Client for one agent server.
///
/// Cheap to clone; clones share the same connection.
#[derive(Clone)]
pub struct AgentClient {
    inner: Arc<Inner>,
}

impl AgentClient {
    /// Create a client. Nothing is spawned until [`AgentClient::start`] or
    /// the first call with `auto_start`.
    pub fn new(options: ClientOptions) -> RpcResult<Self> {
        Self::builder(options).build()
    }

    pub fn builder(options: ClientOptions) -> AgentClientBuilder {
        AgentClientBuilder {
            options,
            connector: None,
            parser: default_event_parser(),
        }
    }

    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    /// Receiver of lifecycle state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Connect and handshake. A no-op when already connected.
    ///
    /// # Errors
    ///
    /// - `RpcError::ProcessSpawn` / `RpcError::ConnectionFailed` if the
    ///   transport cannot be opened
    /// - `RpcError::ProtocolMismatch` if the server speaks another version
    pub async fn start(&self) -> RpcResult<()> {
        let _guard = self.inner.lifecycle.lock().await;
        self.inner.stopping.store(false, Ordering::SeqCst);
        if self.inner.current().is_some() {
            return Ok(());
        }
        self.inner.connect().await
    }

    /// Destroy registered sessions, then tear the connection down.
    ///
    /// Returns the errors from the individual `session.destroy` calls; the
    /// connection is closed regardless.
    pub async fn stop(&self) -> Vec<RpcError> {
        let _guard = self.inner.lifecycle.lock().await;
        self.inner.stopping.store(true, Ordering::SeqCst);

        let mut errors = Vec::new();
        let taken = self.inner.connection.write().take();
        if let Some(conn) = taken {
            for session_id in conn.router.session_ids() {
                if let Err(e) = conn
                    .rpc
                    .send_request_with_timeout(
                        methods::SESSION_DESTROY,
                        Some(json!({ "sessionId": session_id })),
                        STOP_DESTROY_TIMEOUT,
                    )
                    .await
                {
                    warn!(session_id = %session_id, error = %e, "Failed to destroy session");
                    errors.push(e);
                }
            }
            conn.shutdown("Client stopped");
        }

        self.inner.set_state(ConnectionState::Disconnected);
        info!(errors = errors.len(), "Agent client stopped");
        errors
    }

    /// Tear the connection down without contacting the server.
    pub async fn force_stop(&self) {
        let _guard = self.inner.lifecycle.lock().await;
        self.inner.stopping.store(true, Ordering::SeqCst);
        let taken = self.inner.connection.write().take();
        if let Some(conn) = taken {
            conn.shutdown("Client force-stopped");
        }
        self.inner.set_state(ConnectionState::Disconnected);
    }

    /// The active connection, starting one if `auto_start` allows.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::NotConnected` when disconnected and `auto_start`
    /// is off.
    pub async fn connection(&self) -> RpcResult<Arc<Connection>> {
        if let Some(conn) = self.inner.current() {
            return Ok(conn);
        }
        if !self.inner.options.auto_start {
            return Err(RpcError::NotConnected);
        }
        self.start().await?;
        self.inner.current().ok_or(RpcError::NotConnected)
    }

    async fn request(&self, method: &str, params: Value) -> RpcResult<Value> {
        let conn = self.connection().await?;
        conn.rpc.send_request(method, Some(params)).await
    }

    pub async fn ping(&self, message: Option<&str>) -> RpcResult<PingResponse> {
        let params = match message {
            Some(message) => json!({ "message": message }),
            None => json!({}),
        };
        let reply = self.request(methods::PING, params).await?;
        Ok(serde_json::from_value(reply)?)
    }

    pub async fn get_status(&self) -> RpcResult<StatusResponse> {
        let reply = self.request(methods::STATUS_GET, json!({})).await?;
        Ok(serde_json::from_value(reply)?)
    }

    /// Create a session and register it for routing.
    pub async fn create_session(&self, config: SessionConfig) -> RpcResult<SessionHandle> {
        self.open_session(methods::SESSION_CREATE, config).await
    }

    /// Resume an existing session by id.
    pub async fn resume_session(
        &self,
        session_id: impl Into<String>,
        config: SessionConfig,
    ) -> RpcResult<SessionHandle> {
        let config = config.with_session_id(session_id);
        self.open_session(methods::SESSION_RESUME, config).await
    }

    async fn open_session(&self, method: &str, config: SessionConfig) -> RpcResult<SessionHandle> {
        let conn = self.connection().await?;
        let reply = conn.rpc.send_request(method, Some(config.to_params())).await?;
        let created: SessionCreated = serde_json::from_value(reply)?;

        let session = conn.router.register(created.session_id.clone());
        for (definition, handler) in config.tools {
            session.register_tool(definition.name, handler);
        }
        info!(session_id = %created.session_id, method, "Session opened");

        Ok(SessionHandle { session, conn })
    }

    pub async fn list_sessions(&self) -> RpcResult<Vec<SessionMetadata>> {
        let reply = self.request(methods::SESSION_LIST, json!({})).await?;
        let sessions = reply.get("sessions").cloned().unwrap_or(Value::Array(Vec::new()));
        Ok(serde_json::from_value(sessions)?)
    }

    /// Delete a stored session on the server.
    pub async fn delete_session(&self, session_id: &str) -> RpcResult<()> {
        let reply = self
            .request(methods::SESSION_DELETE, json!({ "sessionId": session_id }))
            .await?;
        if reply.get("success").and_then(Value::as_bool) == Some(false) {
            let message = reply
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            return Err(RpcError::Handler(format!(
                "Failed to delete session {}: {}",
                session_id, message
            )));
        }
        if let Some(conn) = self.inner.current() {
            conn.router.unregister(session_id);
        }
        Ok(())
    }

    pub async fn get_last_session_id(&self) -> RpcResult<Option<String>> {
        let reply = self.request(methods::SESSION_GET_LAST_ID, json!({})).await?;
        Ok(reply
            .get("sessionId")
            .and_then(Value::as_str)
            .map(str::to_string))
    }
}

// =============================================================================
// Session Handle
// =============================================================================

/// Caller's view of one session on one connection.
///
/// Dereferences to [`Session`] for event subscriptions and local handlers.
/// A handle is tied to the connection it was opened on; after a restart its
/// calls fail with `RpcError::Disposed`.
#[derive(Clone)]
pub struct SessionHandle {
    session: Arc<Session>,
    conn: Arc<Connection>,
}

impl Deref for SessionHandle {
    type Target = Session;

    fn deref(&self) -> &Session {
        &self.session
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.session.id())
            .finish()
    }
}

impl SessionHandle {
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    fn params(&self, extra: Value) -> Value {
        let mut params = match extra {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        params.insert("sessionId".to_string(), json!(self.session.id()));
        Value::Object(params)
    }

    /// Send a prompt. Returns the server's message id.
    pub async fn send(&self, options: MessageOptions) -> RpcResult<String> {
        let reply = self
            .conn
            .rpc
            .send_request(methods::SESSION_SEND, Some(self.params(serde_json::to_value(options)?)))
            .await?;
        Ok(reply
            .get("messageId")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string())
    }

    /// Full event history of the session.
    pub async fn get_messages(&self) -> RpcResult<Vec<SessionEvent>> {
        let reply = self
            .conn
            .rpc
            .send_request(methods::SESSION_GET_MESSAGES, Some(self.params(json!({}))))
            .await?;
        let events = match reply.get("events") {
            Some(Value::Array(events)) => events.clone(),
            _ => Vec::new(),
        };
        events.into_iter().map(SessionEvent::from_value).collect()
    }

    /// Abort the turn in progress.
    pub async fn abort(&self) -> RpcResult<()> {
        self.conn
            .rpc
            .send_request(methods::SESSION_ABORT, Some(self.params(json!({}))))
            .await?;
        Ok(())
    }

    /// Destroy the session on the server and stop routing to it.
    ///
    /// The local registration is removed even if the request fails.
    pub async fn destroy(&self) -> RpcResult<()> {
        let result = self
            .conn
            .rpc
            .send_request(methods::SESSION_DESTROY, Some(self.params(json!({}))))
            .await;
        self.conn.router.unregister(self.session.id());
        result.map(|_| ())
    }

    /// Register a tool locally and announce it to the server.
    pub async fn register_tool(
        &self,
        definition: ToolDefinition,
        handler: Arc<dyn ToolHandler>,
    ) -> RpcResult<()> {
        self.session.register_tool(definition.name.clone(), handler);
        self.conn
            .rpc
            .send_notification(
                methods::TOOLS_REGISTER,
                Some(self.params(json!({ "tools": [definition] }))),
            )
            .await
    }

    /// Remove a tool locally and tell the server. Returns whether it existed.
    pub async fn unregister_tool(&self, name: &str) -> RpcResult<bool> {
        let existed = self.session.unregister_tool(name);
        self.conn
            .rpc
            .send_notification(
                methods::TOOLS_UNREGISTER,
                Some(self.params(json!({ "toolNames": [name] }))),
            )
            .await?;
        Ok(existed)
    }
}
