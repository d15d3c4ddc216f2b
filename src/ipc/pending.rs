//! Pending-request table for outbound calls.
//!
//! Each outbound request owns one single-use result slot, keyed by the
//! canonical string form of its id. A slot is resolved exactly once: by the
//! matching response, or by disposal of the connection.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

use crate::error::{RpcError, RpcResult};
use crate::ipc::message::RequestId;

/// Receiving half of a pending request's result slot.
pub type ResultReceiver = oneshot::Receiver<RpcResult<Value>>;

#[derive(Default)]
struct PendingState {
    slots: HashMap<String, oneshot::Sender<RpcResult<Value>>>,
    /// Set once; new registrations are refused after this.
    disposed: Option<String>,
}

/// Outstanding requests awaiting a response.
#[derive(Default)]
pub struct PendingRequests {
    state: Mutex<PendingState>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh request id and its result slot.
    ///
    /// Ids are random UUIDs, re-drawn in the (theoretical) case of a clash
    /// with an id that is still outstanding.
    pub fn register(&self) -> RpcResult<(RequestId, ResultReceiver)> {
        let mut state = self.state.lock();
        if let Some(reason) = &state.disposed {
            return Err(RpcError::Disposed(reason.clone()));
        }

        let key = loop {
            let candidate = Uuid::new_v4().to_string();
            if !state.slots.contains_key(&candidate) {
                break candidate;
            }
        };

        let (tx, rx) = oneshot::channel();
        state.slots.insert(key.clone(), tx);
        debug!(id = %key, outstanding = state.slots.len(), "Registered pending request");

        Ok((RequestId::String(key), rx))
    }

    /// Resolve the slot for `id`, if it is still outstanding.
    ///
    /// Returns `false` for unknown ids (stale or duplicate responses); those
    /// are dropped without error.
    pub fn complete(&self, id: &RequestId, outcome: RpcResult<Value>) -> bool {
        let slot = self.state.lock().slots.remove(&id.key());
        match slot {
            Some(tx) => {
                // Receiver may have been dropped by a caller that gave up waiting
                let _ = tx.send(outcome);
                true
            }
            None => {
                debug!(id = %id, "Dropping response for unknown request id");
                false
            }
        }
    }

    /// Forget a slot without resolving it (the request was never sent).
    pub fn remove(&self, id: &RequestId) {
        self.state.lock().slots.remove(&id.key());
    }

    /// Reject every outstanding slot and refuse new registrations.
    ///
    /// Returns how many requests were rejected. Calling this twice is harmless;
    /// the first reason wins.
    pub fn dispose(&self, reason: &str) -> usize {
        let (reason, drained): (String, Vec<_>) = {
            let mut state = self.state.lock();
            let reason = state
                .disposed
                .get_or_insert_with(|| reason.to_string())
                .clone();
            (reason, state.slots.drain().map(|(_, tx)| tx).collect())
        };

        let count = drained.len();
        for tx in drained {
            let _ = tx.send(Err(RpcError::Disposed(reason.clone())));
        }
        if count > 0 {
            debug!(count, reason = %reason, "Rejected pending requests on dispose");
        }
        count
    }

    pub fn is_disposed(&self) -> bool {
        self.state.lock().disposed.is_some()
    }

    pub fn len(&self) -> usize {
        self.state.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_register_issues_unique_ids() {
        let pending = PendingRequests::new();
        let (a, _rx_a) = pending.register().unwrap();
        let (b, _rx_b) = pending.register().unwrap();
        assert_ne!(a, b);
        assert_eq!(pending.len(), 2);
    }

    #[tokio::test]
    async fn test_complete_resolves_once() {
        let pending = PendingRequests::new();
        let (id, rx) = pending.register().unwrap();

        assert!(pending.complete(&id, Ok(json!({"ok": true}))));
        // Second completion finds nothing
        assert!(!pending.complete(&id, Ok(json!(null))));

        let value = rx.await.unwrap().unwrap();
        assert_eq!(value, json!({"ok": true}));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_complete_with_error() {
        let pending = PendingRequests::new();
        let (id, rx) = pending.register().unwrap();

        pending.complete(
            &id,
            Err(RpcError::Server {
                code: -32601,
                message: "Method not found".into(),
                data: None,
            }),
        );

        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(err, RpcError::Server { code: -32601, .. }));
    }

    #[test]
    fn test_unknown_id_is_dropped() {
        let pending = PendingRequests::new();
        assert!(!pending.complete(&RequestId::from(99i64), Ok(json!(1))));
    }

    #[tokio::test]
    async fn test_dispose_rejects_everything() {
        let pending = PendingRequests::new();
        let (_, rx1) = pending.register().unwrap();
        let (_, rx2) = pending.register().unwrap();

        assert_eq!(pending.dispose("stream closed"), 2);

        for rx in [rx1, rx2] {
            match rx.await.unwrap() {
                Err(RpcError::Disposed(reason)) => assert_eq!(reason, "stream closed"),
                other => panic!("Expected Disposed, got {:?}", other),
            }
        }

        assert!(pending.is_disposed());
        assert!(matches!(pending.register(), Err(RpcError::Disposed(_))));
        // Second dispose keeps the first reason and rejects nothing
        assert_eq!(pending.dispose("other"), 0);
    }

    #[test]
    fn test_remove_forgets_slot() {
        let pending = PendingRequests::new();
        let (id, _rx) = pending.register().unwrap();
        pending.remove(&id);
        assert!(pending.is_empty());
    }
}
