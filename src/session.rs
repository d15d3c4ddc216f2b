//! Session router and per-session event fan-out.
//!
//! Server-initiated requests (`tool.call`, `permission.request`,
//! `userInput.request`, `hooks.invoke`) and `session.event` notifications all
//! carry a `sessionId`. The [`SessionRouter`] owns the registry keyed by that
//! id and delegates each call to the handlers the caller registered on the
//! matching [`Session`].
//!
//! # Event delivery
//!
//! Each session has its own delivery queue drained by a dedicated task, so a
//! slow subscriber never stalls the connection's read loop or another
//! session. For every event, in receipt order:
//!
//! 1. the session's broadcast channel ([`Session::subscribe`])
//! 2. every "any event" callback, in registration order
//! 3. every callback registered for the event's type, in registration order
//! 4. one-shot waiters from [`Session::wait_for_event`]
//!
//! Each callback runs behind its own panic boundary; a panicking subscriber is
//! logged and the rest still run.

use std::collections::HashMap;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::{RpcError, RpcResult};
use crate::events::{default_event_parser, EventParser, SessionEvent};
use crate::ipc::dispatch::{
    panic_message, DispatcherBuilder, NotificationHandler, RequestHandler,
};
use crate::methods;

/// Capacity of each session's event broadcast channel.
const SESSION_EVENT_CHANNEL_CAPACITY: usize = 512;

// =============================================================================
// Handler Payloads
// =============================================================================

/// A tool call routed to a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInvocation {
    pub session_id: String,
    pub tool_call_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub arguments: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolResultType {
    Success,
    Failure,
    Rejected,
    Denied,
}

/// Result returned to the server for a tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    pub text_result_for_llm: String,
    pub result_type: ToolResultType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_log: Option<String>,
}

impl ToolResult {
    pub fn success(text: impl Into<String>) -> Self {
        Self {
            text_result_for_llm: text.into(),
            result_type: ToolResultType::Success,
            error: None,
            session_log: None,
        }
    }

    pub fn failure(text: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            text_result_for_llm: text.into(),
            result_type: ToolResultType::Failure,
            error: Some(error.into()),
            session_log: None,
        }
    }

    /// Normalize whatever a tool handler returned.
    ///
    /// A value already shaped like a `ToolResult` passes through; strings are
    /// used verbatim; other JSON is serialized; `null` counts as a failure.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Null => Self::failure("Tool returned no result", "tool returned no result"),
            Value::String(text) => Self::success(text),
            other => {
                if other.get("textResultForLlm").is_some() && other.get("resultType").is_some() {
                    if let Ok(result) = serde_json::from_value::<ToolResult>(other.clone()) {
                        return result;
                    }
                }
                Self::success(other.to_string())
            }
        }
    }
}

/// A permission prompt from the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRequest {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Kind-specific fields, kept verbatim.
    #[serde(flatten)]
    pub details: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PermissionResultKind {
    Approved,
    DeniedByRules,
    DeniedNoApprovalRuleAndCouldNotRequestFromUser,
    DeniedInteractivelyByUser,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionResult {
    pub kind: PermissionResultKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rules: Option<Vec<Value>>,
}

impl PermissionResult {
    pub fn approved() -> Self {
        Self {
            kind: PermissionResultKind::Approved,
            rules: None,
        }
    }

    /// The answer given when nobody could be asked.
    pub fn denied_no_rule() -> Self {
        Self {
            kind: PermissionResultKind::DeniedNoApprovalRuleAndCouldNotRequestFromUser,
            rules: None,
        }
    }
}

/// A question the agent wants the user to answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInputRequest {
    pub question: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub choices: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_freeform: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInputResponse {
    pub answer: String,
    pub was_freeform: bool,
}

// =============================================================================
// Handler Traits
// =============================================================================

/// Handles calls for one named tool.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, invocation: ToolInvocation) -> RpcResult<Value>;
}

#[async_trait]
impl<F, Fut> ToolHandler for F
where
    F: Fn(ToolInvocation) -> Fut + Send + Sync,
    Fut: Future<Output = RpcResult<Value>> + Send + 'static,
{
    async fn call(&self, invocation: ToolInvocation) -> RpcResult<Value> {
        self(invocation).await
    }
}

/// Decides permission prompts for a session.
#[async_trait]
pub trait PermissionHandler: Send + Sync {
    async fn decide(&self, request: PermissionRequest) -> RpcResult<PermissionResult>;
}

#[async_trait]
impl<F, Fut> PermissionHandler for F
where
    F: Fn(PermissionRequest) -> Fut + Send + Sync,
    Fut: Future<Output = RpcResult<PermissionResult>> + Send + 'static,
{
    async fn decide(&self, request: PermissionRequest) -> RpcResult<PermissionResult> {
        self(request).await
    }
}

/// Answers user-input questions for a session.
#[async_trait]
pub trait UserInputHandler: Send + Sync {
    async fn ask(&self, request: UserInputRequest) -> RpcResult<UserInputResponse>;
}

#[async_trait]
impl<F, Fut> UserInputHandler for F
where
    F: Fn(UserInputRequest) -> Fut + Send + Sync,
    Fut: Future<Output = RpcResult<UserInputResponse>> + Send + 'static,
{
    async fn ask(&self, request: UserInputRequest) -> RpcResult<UserInputResponse> {
        self(request).await
    }
}

/// Handles one lifecycle hook type (e.g. `preToolUse`).
#[async_trait]
pub trait HookHandler: Send + Sync {
    async fn invoke(&self, hook_type: String, input: Value) -> RpcResult<Value>;
}

#[async_trait]
impl<F, Fut> HookHandler for F
where
    F: Fn(String, Value) -> Fut + Send + Sync,
    Fut: Future<Output = RpcResult<Value>> + Send + 'static,
{
    async fn invoke(&self, hook_type: String, input: Value) -> RpcResult<Value> {
        self(hook_type, input).await
    }
}

// =============================================================================
// Session
// =============================================================================

/// Synchronous event callback.
pub type EventCallback = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

/// Id returned by a subscription, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
struct Subscribers {
    next_id: u64,
    any: Vec<(SubscriptionId, EventCallback)>,
    typed: HashMap<String, Vec<(SubscriptionId, EventCallback)>>,
    waiters: HashMap<String, Vec<oneshot::Sender<SessionEvent>>>,
}

impl Subscribers {
    fn next_id(&mut self) -> SubscriptionId {
        self.next_id += 1;
        SubscriptionId(self.next_id)
    }
}

/// Subscriber lists shared by a session and its delivery task.
struct Fanout {
    session_id: String,
    subscribers: Mutex<Subscribers>,
    broadcast_tx: broadcast::Sender<SessionEvent>,
}

impl Fanout {
    fn deliver(&self, event: &SessionEvent) {
        // Err only means there are no broadcast receivers
        let _ = self.broadcast_tx.send(event.clone());

        // Snapshot so callbacks may (un)subscribe without deadlocking
        let (any, typed, waiters) = {
            let mut subs = self.subscribers.lock();
            let any: Vec<EventCallback> = subs.any.iter().map(|(_, cb)| cb.clone()).collect();
            let typed: Vec<EventCallback> = subs
                .typed
                .get(&event.event_type)
                .map(|list| list.iter().map(|(_, cb)| cb.clone()).collect())
                .unwrap_or_default();
            let waiters = subs.waiters.remove(&event.event_type).unwrap_or_default();
            (any, typed, waiters)
        };

        for callback in any.iter().chain(typed.iter()) {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(event))) {
                warn!(
                    session_id = %self.session_id,
                    event_type = %event.event_type,
                    reason = %panic_message(panic.as_ref()),
                    "Event subscriber panicked"
                );
            }
        }

        for waiter in waiters {
            let _ = waiter.send(event.clone());
        }
    }
}

/// Handlers a caller registered for one session.
#[derive(Default)]
struct SessionHandlers {
    tools: HashMap<String, Arc<dyn ToolHandler>>,
    permission: Option<Arc<dyn PermissionHandler>>,
    user_input: Option<Arc<dyn UserInputHandler>>,
    hooks: HashMap<String, Arc<dyn HookHandler>>,
}

/// Session-local handler state and subscriber lists.
///
/// Created through [`SessionRouter::register`]; the router owns the registry
/// entry, callers hold `Arc<Session>` to register handlers and subscribe.
pub struct Session {
    id: String,
    handlers: RwLock<SessionHandlers>,
    fanout: Arc<Fanout>,
    queue_tx: mpsc::UnboundedSender<SessionEvent>,
}

impl Session {
    /// Create a session and start its delivery task.
    ///
    /// Must be called from within a tokio runtime.
    fn new(id: String) -> Self {
        let (broadcast_tx, _) = broadcast::channel(SESSION_EVENT_CHANNEL_CAPACITY);
        let fanout = Arc::new(Fanout {
            session_id: id.clone(),
            subscribers: Mutex::new(Subscribers::default()),
            broadcast_tx,
        });

        let (queue_tx, mut queue_rx) = mpsc::unbounded_channel::<SessionEvent>();
        let task_fanout = Arc::clone(&fanout);
        // Ends once the session (the only sender) is dropped and the queue drains
        tokio::spawn(async move {
            while let Some(event) = queue_rx.recv().await {
                task_fanout.deliver(&event);
            }
        });

        Self {
            id,
            handlers: RwLock::new(SessionHandlers::default()),
            fanout,
            queue_tx,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Queue an event for ordered delivery.
    pub(crate) fn enqueue(&self, event: SessionEvent) {
        if self.queue_tx.send(event).is_err() {
            debug!(session_id = %self.id, "Delivery task gone; dropping event");
        }
    }

    // ---- Events ----

    /// Subscribe to every event.
    pub fn on<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        let mut subs = self.fanout.subscribers.lock();
        let id = subs.next_id();
        subs.any.push((id, Arc::new(callback)));
        id
    }

    /// Subscribe to events of one type.
    pub fn on_type<F>(&self, event_type: impl Into<String>, callback: F) -> SubscriptionId
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        let mut subs = self.fanout.subscribers.lock();
        let id = subs.next_id();
        subs.typed
            .entry(event_type.into())
            .or_default()
            .push((id, Arc::new(callback)));
        id
    }

    /// Remove a subscription. Returns `false` if it was already gone.
    pub fn off(&self, id: SubscriptionId) -> bool {
        let mut subs = self.fanout.subscribers.lock();
        let before = subs.any.len();
        subs.any.retain(|(sub, _)| *sub != id);
        if subs.any.len() != before {
            return true;
        }
        for list in subs.typed.values_mut() {
            let before = list.len();
            list.retain(|(sub, _)| *sub != id);
            if list.len() != before {
                return true;
            }
        }
        false
    }

    /// Broadcast receiver of every event, delivered before any callback.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.fanout.broadcast_tx.subscribe()
    }

    /// Resolve with the next event of `event_type`.
    ///
    /// The receiver errors if the session is dropped first.
    pub fn wait_for_event(&self, event_type: impl Into<String>) -> oneshot::Receiver<SessionEvent> {
        let (tx, rx) = oneshot::channel();
        let mut subscribers = self.fanout.subscribers.lock();
        let waiters = subscribers.waiters.entry(event_type.into()).or_default();
        // Drop waiters whose receiver is gone
        waiters.retain(|waiter| !waiter.is_closed());
        waiters.push(tx);
        rx
    }

    /// Number of one-shot waiters still registered for `event_type`.
    pub fn pending_waiters(&self, event_type: &str) -> usize {
        self.fanout
            .subscribers
            .lock()
            .waiters
            .get(event_type)
            .map_or(0, Vec::len)
    }

    // ---- Handlers ----

    pub fn register_tool(&self, name: impl Into<String>, handler: Arc<dyn ToolHandler>) {
        self.handlers.write().tools.insert(name.into(), handler);
    }

    pub fn unregister_tool(&self, name: &str) -> bool {
        self.handlers.write().tools.remove(name).is_some()
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.read().tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn set_permission_handler(&self, handler: Option<Arc<dyn PermissionHandler>>) {
        self.handlers.write().permission = handler;
    }

    pub fn set_user_input_handler(&self, handler: Option<Arc<dyn UserInputHandler>>) {
        self.handlers.write().user_input = handler;
    }

    pub fn set_hook_handler(&self, hook_type: impl Into<String>, handler: Arc<dyn HookHandler>) {
        self.handlers.write().hooks.insert(hook_type.into(), handler);
    }

    pub fn remove_hook_handler(&self, hook_type: &str) -> bool {
        self.handlers.write().hooks.remove(hook_type).is_some()
    }

    fn tool_handler(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.handlers.read().tools.get(name).cloned()
    }

    fn permission_handler(&self) -> Option<Arc<dyn PermissionHandler>> {
        self.handlers.read().permission.clone()
    }

    fn user_input_handler(&self) -> Option<Arc<dyn UserInputHandler>> {
        self.handlers.read().user_input.clone()
    }

    fn hook_handler(&self, hook_type: &str) -> Option<Arc<dyn HookHandler>> {
        self.handlers.read().hooks.get(hook_type).cloned()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("id", &self.id).finish()
    }
}

// =============================================================================
// Router
// =============================================================================

/// Registry of live sessions for one connection.
pub struct SessionRouter {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    parser: EventParser,
}

impl Default for SessionRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRouter {
    pub fn new() -> Self {
        Self::with_parser(default_event_parser())
    }

    pub fn with_parser(parser: EventParser) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            parser,
        }
    }

    /// Register a session, replacing any previous entry with the same id.
    pub fn register(&self, session_id: impl Into<String>) -> Arc<Session> {
        let session_id = session_id.into();
        let session = Arc::new(Session::new(session_id.clone()));
        let previous = self
            .sessions
            .lock()
            .insert(session_id.clone(), Arc::clone(&session));
        if previous.is_some() {
            debug!(session_id = %session_id, "Replaced existing session registration");
        }
        session
    }

    pub fn unregister(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.lock().remove(session_id)
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.lock().get(session_id).cloned()
    }

    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn clear(&self) {
        self.sessions.lock().clear();
    }

    /// Wire the router's handlers into a dispatcher.
    pub fn install(self: &Arc<Self>, builder: DispatcherBuilder) -> DispatcherBuilder {
        let route = |kind: RouteKind| -> Arc<dyn RequestHandler> {
            Arc::new(RoutedRequest {
                router: Arc::clone(self),
                kind,
            })
        };

        builder
            .request_handler(methods::TOOL_CALL, route(RouteKind::ToolCall))
            .request_handler(methods::PERMISSION_REQUEST, route(RouteKind::Permission))
            .request_handler(methods::USER_INPUT_REQUEST, route(RouteKind::UserInput))
            .request_handler(methods::HOOKS_INVOKE, route(RouteKind::Hooks))
            .notification_handler(
                methods::SESSION_EVENT,
                Arc::clone(self) as Arc<dyn NotificationHandler>,
            )
    }

    /// Route a `session.event` notification. Unknown sessions are dropped.
    pub fn route_event(&self, params: Option<&Value>) {
        let Some(session_id) = params.and_then(session_id_of) else {
            debug!("session.event without sessionId; dropping");
            return;
        };
        let Some(session) = self.get(session_id) else {
            debug!(session_id, "Event for unknown session; dropping");
            return;
        };
        let Some(raw) = params.and_then(|p| p.get("event")).cloned() else {
            warn!(session_id, "session.event without event payload");
            return;
        };

        match (self.parser)(raw) {
            Ok(event) => session.enqueue(event),
            Err(e) => warn!(session_id, error = %e, "Failed to parse session event"),
        }
    }

    fn session_for(&self, params: &Value) -> RpcResult<Arc<Session>> {
        let session_id = session_id_of(params)
            .ok_or_else(|| RpcError::Protocol("Missing sessionId".to_string()))?;
        self.get(session_id)
            .ok_or_else(|| RpcError::SessionNotFound(session_id.to_string()))
    }

    async fn handle_tool_call(&self, params: Value) -> RpcResult<Value> {
        let session = self.session_for(&params)?;
        let invocation: ToolInvocation = serde_json::from_value(params)
            .map_err(|e| RpcError::Protocol(format!("Invalid tool.call params: {}", e)))?;
        let tool_name = invocation.tool_name.clone();

        let result = match session.tool_handler(&tool_name) {
            Some(handler) => match handler.call(invocation).await {
                Ok(value) => ToolResult::from_value(value),
                Err(e) => {
                    warn!(session_id = %session.id(), tool = %tool_name, error = %e, "Tool handler failed");
                    ToolResult::failure(
                        "Invoking this tool produced an error. Detailed information is not available.",
                        e.to_string(),
                    )
                }
            },
            None => ToolResult::failure(
                format!("Tool '{}' is not supported by this client instance.", tool_name),
                format!("tool '{}' not supported", tool_name),
            ),
        };

        Ok(json!({ "result": result }))
    }

    async fn handle_permission_request(&self, params: Value) -> RpcResult<Value> {
        let session = self.session_for(&params)?;
        let raw = params
            .get("permissionRequest")
            .cloned()
            .ok_or_else(|| RpcError::Protocol("Missing permissionRequest".to_string()))?;
        let request: PermissionRequest = serde_json::from_value(raw)
            .map_err(|e| RpcError::Protocol(format!("Invalid permissionRequest: {}", e)))?;

        let result = match session.permission_handler() {
            Some(handler) => handler.decide(request).await.unwrap_or_else(|e| {
                warn!(session_id = %session.id(), error = %e, "Permission handler failed; denying");
                PermissionResult::denied_no_rule()
            }),
            None => PermissionResult::denied_no_rule(),
        };

        Ok(json!({ "result": result }))
    }

    async fn handle_user_input_request(&self, params: Value) -> RpcResult<Value> {
        let session = self.session_for(&params)?;
        let request: UserInputRequest = serde_json::from_value(params)
            .map_err(|e| RpcError::Protocol(format!("Invalid userInput.request params: {}", e)))?;

        let handler = session
            .user_input_handler()
            .ok_or_else(|| RpcError::HandlerNotRegistered(methods::USER_INPUT_REQUEST.to_string()))?;
        let response = handler.ask(request).await?;

        Ok(serde_json::to_value(response)?)
    }

    async fn handle_hooks_invoke(&self, params: Value) -> RpcResult<Value> {
        let session = self.session_for(&params)?;
        let hook_type = params
            .get("hookType")
            .and_then(Value::as_str)
            .ok_or_else(|| RpcError::Protocol("Missing hookType".to_string()))?;
        let input = params.get("input").cloned().unwrap_or(Value::Null);

        let output = match session.hook_handler(hook_type) {
            Some(handler) => handler.invoke(hook_type.to_string(), input).await?,
            None => Value::Null,
        };

        Ok(json!({ "output": output }))
    }
}

impl NotificationHandler for SessionRouter {
    fn on_notification(&self, params: Option<&Value>) {
        self.route_event(params);
    }
}

fn session_id_of(params: &Value) -> Option<&str> {
    params.get("sessionId").and_then(Value::as_str)
}

#[derive(Debug, Clone, Copy)]
enum RouteKind {
    ToolCall,
    Permission,
    UserInput,
    Hooks,
}

/// Dispatcher entry that forwards one method to the router.
struct RoutedRequest {
    router: Arc<SessionRouter>,
    kind: RouteKind,
}

#[async_trait]
impl RequestHandler for RoutedRequest {
    async fn handle(&self, params: Value) -> RpcResult<Value> {
        match self.kind {
            RouteKind::ToolCall => self.router.handle_tool_call(params).await,
            RouteKind::Permission => self.router.handle_permission_request(params).await,
            RouteKind::UserInput => self.router.handle_user_input_request(params).await,
            RouteKind::Hooks => self.router.handle_hooks_invoke(params).await,
        }
    }
}
