//! Dispatch of server-initiated requests and notifications.
//!
//! The handler table is built once, before the read loop starts, and is
//! immutable afterwards. Every inbound request produces exactly one response
//! message: the handler's result, its error, or a synthesized error when no
//! handler exists or the handler panicked.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::RpcResult;
use crate::ipc::message::{ErrorObject, Message, RequestId};

/// Capacity of the raw notification broadcast channel. Slow receivers lag
/// (and lose the oldest items) instead of blocking the read loop.
const NOTIFICATION_CHANNEL_CAPACITY: usize = 256;

/// Handler for one server-initiated request method.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, params: Value) -> RpcResult<Value>;
}

/// Handler for one notification method.
///
/// Called on the read loop, so implementations must only hand work off
/// (enqueue, spawn) and never block.
pub trait NotificationHandler: Send + Sync {
    fn on_notification(&self, params: Option<&Value>);
}

/// Adapter turning an async closure into a [`RequestHandler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> RequestHandler for FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = RpcResult<Value>> + Send + 'static,
{
    async fn handle(&self, params: Value) -> RpcResult<Value> {
        (self.0)(params).await
    }
}

/// Wrap an async closure as a request handler.
///
/// ```ignore
/// let ping = handler_fn(|_params| async { Ok(json!({"message": "pong"})) });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn RequestHandler>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RpcResult<Value>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// A notification as received from the remote side.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundNotification {
    pub method: String,
    pub params: Option<Value>,
}

/// Builder for a [`Dispatcher`].
#[derive(Default)]
pub struct DispatcherBuilder {
    requests: HashMap<String, Arc<dyn RequestHandler>>,
    notifications: HashMap<String, Arc<dyn NotificationHandler>>,
}

impl DispatcherBuilder {
    /// Register the handler for a request method, replacing any previous one.
    pub fn request_handler(
        mut self,
        method: impl Into<String>,
        handler: Arc<dyn RequestHandler>,
    ) -> Self {
        self.requests.insert(method.into(), handler);
        self
    }

    /// Register the handler for a notification method, replacing any previous one.
    pub fn notification_handler(
        mut self,
        method: impl Into<String>,
        handler: Arc<dyn NotificationHandler>,
    ) -> Self {
        self.notifications.insert(method.into(), handler);
        self
    }

    pub fn build(self) -> Dispatcher {
        let (broadcast_tx, _) = broadcast::channel(NOTIFICATION_CHANNEL_CAPACITY);
        Dispatcher {
            requests: self.requests,
            notifications: self.notifications,
            broadcast_tx,
        }
    }
}

/// Routes inbound messages to the registered handlers.
pub struct Dispatcher {
    requests: HashMap<String, Arc<dyn RequestHandler>>,
    notifications: HashMap<String, Arc<dyn NotificationHandler>>,
    broadcast_tx: broadcast::Sender<InboundNotification>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        DispatcherBuilder::default().build()
    }
}

impl Dispatcher {
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::default()
    }

    /// Subscribe to every raw notification received on this connection.
    pub fn subscribe(&self) -> broadcast::Receiver<InboundNotification> {
        self.broadcast_tx.subscribe()
    }

    pub fn has_request_handler(&self, method: &str) -> bool {
        self.requests.contains_key(method)
    }

    /// Run the handler for an inbound request and build its single response.
    pub async fn handle_request(
        &self,
        id: RequestId,
        method: &str,
        params: Option<Value>,
    ) -> Message {
        let Some(handler) = self.requests.get(method).cloned() else {
            warn!(method, id = %id, "No handler for inbound request");
            return Message::error_response(id, ErrorObject::method_not_found(method));
        };

        let params = params.unwrap_or(Value::Null);
        let outcome = AssertUnwindSafe(handler.handle(params)).catch_unwind().await;

        match outcome {
            Ok(Ok(result)) => {
                debug!(method, id = %id, "Inbound request handled");
                Message::response(id, result)
            }
            Ok(Err(e)) => {
                warn!(method, id = %id, error = %e, "Inbound request handler failed");
                Message::error_response(id, e.to_error_object())
            }
            Err(panic) => {
                let reason = panic_message(panic.as_ref());
                warn!(method, id = %id, reason = %reason, "Inbound request handler panicked");
                Message::error_response(
                    id,
                    ErrorObject::internal(format!("Handler panicked: {}", reason)),
                )
            }
        }
    }

    /// Publish a notification and forward it to its method handler, if any.
    ///
    /// Never blocks: the broadcast send is fire-and-forget and method
    /// handlers only enqueue.
    pub fn handle_notification(&self, method: &str, params: Option<Value>) {
        if let Some(handler) = self.notifications.get(method) {
            handler.on_notification(params.as_ref());
        } else {
            debug!(method, "Notification has no method handler");
        }

        // Err only means nobody is subscribed right now
        let _ = self.broadcast_tx.send(InboundNotification {
            method: method.to_string(),
            params,
        });
    }
}

/// Best-effort text from a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RpcError;
    use crate::ipc::message::error_codes;
    use parking_lot::Mutex;
    use serde_json::json;

    struct Recorder(Mutex<Vec<Option<Value>>>);

    impl NotificationHandler for Recorder {
        fn on_notification(&self, params: Option<&Value>) {
            self.0.lock().push(params.cloned());
        }
    }

    #[tokio::test]
    async fn test_unknown_method_yields_method_not_found() {
        let dispatcher = Dispatcher::default();
        let reply = dispatcher
            .handle_request(RequestId::from(1i64), "nope", None)
            .await;

        match reply {
            Message::ErrorResponse { id, error } => {
                assert_eq!(id, RequestId::from(1i64));
                assert_eq!(error.code, error_codes::METHOD_NOT_FOUND);
            }
            other => panic!("Expected error response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_handler_result_becomes_response() {
        let dispatcher = Dispatcher::builder()
            .request_handler(
                "echo",
                handler_fn(|params| async move { Ok(json!({"echo": params})) }),
            )
            .build();

        let reply = dispatcher
            .handle_request(RequestId::from("r1"), "echo", Some(json!(5)))
            .await;
        assert_eq!(
            reply,
            Message::response(RequestId::from("r1"), json!({"echo": 5}))
        );
    }

    #[tokio::test]
    async fn test_handler_error_becomes_error_response() {
        let dispatcher = Dispatcher::builder()
            .request_handler(
                "fail",
                handler_fn(|_| async { Err(RpcError::handler("disk full")) }),
            )
            .build();

        let reply = dispatcher
            .handle_request(RequestId::from(2i64), "fail", None)
            .await;
        match reply {
            Message::ErrorResponse { error, .. } => {
                assert_eq!(error.code, error_codes::INTERNAL_ERROR);
                assert!(error.message.contains("disk full"));
            }
            other => panic!("Expected error response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_handler_panic_becomes_internal_error() {
        let dispatcher = Dispatcher::builder()
            .request_handler(
                "boom",
                handler_fn(|_| async {
                    if true {
                        panic!("kaboom");
                    }
                    Ok(Value::Null)
                }),
            )
            .build();

        let reply = dispatcher
            .handle_request(RequestId::from(3i64), "boom", None)
            .await;
        match reply {
            Message::ErrorResponse { error, .. } => {
                assert_eq!(error.code, error_codes::INTERNAL_ERROR);
                assert!(error.message.contains("kaboom"), "{}", error.message);
            }
            other => panic!("Expected error response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_notification_is_broadcast_and_forwarded() {
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let dispatcher = Dispatcher::builder()
            .notification_handler("session.event", recorder.clone())
            .build();
        let mut rx = dispatcher.subscribe();

        dispatcher.handle_notification("session.event", Some(json!({"sessionId": "abc"})));
        dispatcher.handle_notification("other", None);

        assert_eq!(recorder.0.lock().len(), 1);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.method, "session.event");
        let second = rx.recv().await.unwrap();
        assert_eq!(second.method, "other");
    }

    #[test]
    fn test_notification_without_subscribers_is_fine() {
        let dispatcher = Dispatcher::default();
        dispatcher.handle_notification("session.event", None);
    }
}
