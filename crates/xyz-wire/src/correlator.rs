//! Call correlator: matches response frames to pending outbound calls.
//!
//! Every outbound call registers a pending entry keyed by a fresh request id.
//! Whoever removes the entry (a response, the deadline, or a lost connection)
//! resolves its completion channel, so each call completes exactly once.
//!
//! A call is bound to the link its frame was queued on. When a link dies only
//! the calls bound to it fail; calls that have not been handed to a link yet
//! are left for whichever link carries them next.

use crate::message::{WireMessage, WireMessageKind, WireResponse};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, warn};
use xyz_types::{XyzError, XyzResult};

/// A successful call: the remote handler's value plus the frame it came in.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub body: Value,
    pub raw: WireMessage,
}

/// Outcome delivered to a call's completion.
pub type CallResult = XyzResult<Reply>;

struct PendingCall {
    /// Address of the peer the request went to.
    peer: String,
    /// Link the frame was queued on, once it has been handed to one.
    link: Option<u64>,
    completion: oneshot::Sender<CallResult>,
    created_at: Instant,
}

/// Thread-safe table of in-flight calls.
#[derive(Clone, Default)]
pub struct Correlator {
    pending: Arc<DashMap<String, PendingCall>>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending call to `peer` and return its id and completion.
    pub fn register(&self, peer: &str) -> (String, oneshot::Receiver<CallResult>) {
        let (tx, rx) = oneshot::channel();
        let entry = PendingCall {
            peer: peer.to_string(),
            link: None,
            completion: tx,
            created_at: Instant::now(),
        };
        loop {
            let id = uuid::Uuid::new_v4().to_string();
            if let Entry::Vacant(slot) = self.pending.entry(id.clone()) {
                slot.insert(entry);
                return (id, rx);
            }
        }
    }

    /// Remove the pending call and deliver `result` to it.
    ///
    /// Returns `false` if no such call is outstanding (already completed,
    /// timed out, or never registered).
    pub fn complete(&self, id: &str, result: CallResult) -> bool {
        match self.pending.remove(id) {
            Some((_, call)) => {
                debug!(
                    request_id = %id,
                    peer = %call.peer,
                    elapsed_ms = call.created_at.elapsed().as_millis() as u64,
                    ok = result.is_ok(),
                    "Call completed"
                );
                // The caller may have stopped waiting; nothing left to notify.
                let _ = call.completion.send(result);
                true
            }
            None => false,
        }
    }

    /// Route an inbound response frame to its pending call.
    pub fn resolve_response(&self, msg: WireMessage) -> bool {
        let id = msg.id.clone();
        let result = match &msg.kind {
            WireMessageKind::Response(WireResponse::Reply { payload }) => Ok(Reply {
                body: payload.clone(),
                raw: msg.clone(),
            }),
            WireMessageKind::Response(WireResponse::Pong { uptime_secs }) => Ok(Reply {
                body: Value::from(*uptime_secs),
                raw: msg.clone(),
            }),
            WireMessageKind::Response(WireResponse::Error { code, message }) => {
                Err(XyzError::Remote {
                    code: *code,
                    message: message.clone(),
                })
            }
            other => {
                warn!(request_id = %id, "Unexpected frame for pending call: {:?}", other);
                Err(XyzError::Connection(
                    "Unexpected frame in response to call".to_string(),
                ))
            }
        };
        let matched = self.complete(&id, result);
        if !matched {
            warn!(request_id = %id, "Dropping response with no pending call");
        }
        matched
    }

    /// Remove a pending call without resolving it.
    pub fn cancel(&self, id: &str) -> bool {
        self.pending.remove(id).is_some()
    }

    /// Record that the call's frame is being queued on `link`.
    ///
    /// Returns `false` if the call is no longer outstanding.
    pub fn bind_link(&self, id: &str, link: u64) -> bool {
        match self.pending.get_mut(id) {
            Some(mut call) => {
                call.link = Some(link);
                true
            }
            None => false,
        }
    }

    /// Fail every call bound to `link` with a connection error.
    pub fn fail_link(&self, link: u64, reason: &str) -> usize {
        let ids: Vec<String> = self
            .pending
            .iter()
            .filter(|entry| entry.value().link == Some(link))
            .map(|entry| entry.key().clone())
            .collect();
        ids.into_iter()
            .filter(|id| self.complete(id, Err(XyzError::Connection(reason.to_string()))))
            .count()
    }

    /// Wait for a call's completion, expiring it after `deadline`.
    pub async fn wait(
        &self,
        id: &str,
        completion: oneshot::Receiver<CallResult>,
        deadline: Duration,
    ) -> CallResult {
        self.wait_until(id, completion, tokio::time::Instant::now() + deadline, deadline)
            .await
    }

    /// Wait for a call's completion until `expires_at`, then fail it with
    /// `Timeout(budget)`.
    pub async fn wait_until(
        &self,
        id: &str,
        mut completion: oneshot::Receiver<CallResult>,
        expires_at: tokio::time::Instant,
        budget: Duration,
    ) -> CallResult {
        match tokio::time::timeout_at(expires_at, &mut completion).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(XyzError::Connection("Pending call was dropped".to_string())),
            Err(_) => {
                // Expire through the same removal path a response uses. If a
                // response won the race, its result is already in the channel.
                self.complete(id, Err(XyzError::Timeout(budget)));
                completion.await.unwrap_or_else(|_| {
                    Err(XyzError::Connection("Pending call was dropped".to_string()))
                })
            }
        }
    }

    /// Whether a call is still outstanding.
    pub fn contains(&self, id: &str) -> bool {
        self.pending.contains_key(id)
    }

    /// Number of outstanding calls.
    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }
}

/// Removes a pending call if the waiting future is dropped early.
pub(crate) struct PendingGuard {
    correlator: Correlator,
    id: String,
}

impl PendingGuard {
    pub(crate) fn new(correlator: Correlator, id: String) -> Self {
        Self { correlator, id }
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.correlator.cancel(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    #[test]
    fn test_ids_unique_among_outstanding() {
        let correlator = Correlator::new();
        let mut ids = HashSet::new();
        let mut receivers = Vec::new();
        for _ in 0..1000 {
            let (id, rx) = correlator.register("127.0.0.1:1");
            assert!(ids.insert(id));
            receivers.push(rx);
        }
        assert_eq!(correlator.outstanding(), 1000);
    }

    #[tokio::test]
    async fn test_response_completes_once() {
        let correlator = Correlator::new();
        let (id, rx) = correlator.register("peer");

        let reply = WireMessage::response(
            id.clone(),
            WireResponse::Reply {
                payload: json!("ABC"),
            },
        );
        assert!(correlator.resolve_response(reply.clone()));
        assert!(!correlator.resolve_response(reply));

        let result = rx.await.unwrap().unwrap();
        assert_eq!(result.body, json!("ABC"));
        assert_eq!(result.raw.id, id);
        assert_eq!(correlator.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_error_frame_becomes_remote_error() {
        let correlator = Correlator::new();
        let (id, rx) = correlator.register("peer");
        correlator.resolve_response(WireMessage::error(id, 500, "boom"));
        assert_eq!(
            rx.await.unwrap(),
            Err(XyzError::Remote {
                code: 500,
                message: "boom".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_timeout_fires_once_and_removes_entry() {
        let correlator = Correlator::new();
        let (id, rx) = correlator.register("peer");
        let deadline = Duration::from_millis(30);

        let result = correlator.wait(&id, rx, deadline).await;
        assert_eq!(result, Err(XyzError::Timeout(deadline)));
        assert!(!correlator.contains(&id));

        // A late response finds nothing to match.
        assert!(!correlator.resolve_response(WireMessage::response(
            id,
            WireResponse::Reply { payload: json!(1) }
        )));
    }

    #[tokio::test]
    async fn test_wait_returns_response_before_deadline() {
        let correlator = Correlator::new();
        let (id, rx) = correlator.register("peer");
        let completer = correlator.clone();
        let reply_id = id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            completer.resolve_response(WireMessage::response(
                reply_id,
                WireResponse::Reply { payload: json!(7) },
            ));
        });
        let result = correlator.wait(&id, rx, Duration::from_secs(5)).await;
        assert_eq!(result.unwrap().body, json!(7));
    }

    #[tokio::test]
    async fn test_concurrent_completion_is_exactly_once() {
        for _ in 0..50 {
            let correlator = Correlator::new();
            let (id, rx) = correlator.register("peer");

            let mut tasks = Vec::new();
            for n in 0..8 {
                let c = correlator.clone();
                let id = id.clone();
                tasks.push(tokio::spawn(async move {
                    c.complete(&id, Ok(Reply {
                        body: json!(n),
                        raw: WireMessage::error(id.clone(), 0, ""),
                    }))
                }));
            }
            let timeout_result = {
                let c = correlator.clone();
                let id = id.clone();
                tokio::spawn(async move { c.complete(&id, Err(XyzError::Timeout(Duration::ZERO))) })
            };

            let mut winners = 0;
            for t in tasks {
                if t.await.unwrap() {
                    winners += 1;
                }
            }
            if timeout_result.await.unwrap() {
                winners += 1;
            }
            assert_eq!(winners, 1);
            assert!(rx.await.is_ok());
        }
    }

    #[tokio::test]
    async fn test_fail_link_only_touches_calls_bound_to_it() {
        let correlator = Correlator::new();
        let (a, rx_a) = correlator.register("10.0.0.1:1");
        let (b, rx_b) = correlator.register("10.0.0.1:1");
        let (c, _rx_c) = correlator.register("10.0.0.2:2");
        assert!(correlator.bind_link(&a, 1));
        assert!(correlator.bind_link(&b, 1));
        assert!(correlator.bind_link(&c, 2));

        assert_eq!(correlator.fail_link(1, "Connection closed"), 2);
        assert!(matches!(rx_a.await.unwrap(), Err(XyzError::Connection(_))));
        assert!(matches!(rx_b.await.unwrap(), Err(XyzError::Connection(_))));
        assert!(correlator.contains(&c));
        assert_eq!(correlator.outstanding(), 1);
    }

    #[test]
    fn test_dying_link_spares_calls_headed_for_its_replacement() {
        let correlator = Correlator::new();
        let (old, _rx_old) = correlator.register("10.0.0.1:1");
        correlator.bind_link(&old, 7);
        // Registered for the same address while link 7 was going down.
        let (fresh, _rx_fresh) = correlator.register("10.0.0.1:1");

        assert_eq!(correlator.fail_link(7, "writer stopped"), 1);
        assert!(!correlator.contains(&old));
        assert!(correlator.contains(&fresh));

        // The replacement link picks the call up; its later death fails it.
        assert!(correlator.bind_link(&fresh, 8));
        assert_eq!(correlator.fail_link(7, "writer stopped"), 0);
        assert_eq!(correlator.fail_link(8, "closed by peer"), 1);
        assert_eq!(correlator.outstanding(), 0);
    }

    #[test]
    fn test_bind_link_after_completion() {
        let correlator = Correlator::new();
        let (id, _rx) = correlator.register("peer");
        correlator.cancel(&id);
        assert!(!correlator.bind_link(&id, 1));
    }

    #[test]
    fn test_guard_cancels_on_drop() {
        let correlator = Correlator::new();
        let (id, _rx) = correlator.register("peer");
        {
            let _guard = PendingGuard::new(correlator.clone(), id.clone());
        }
        assert!(!correlator.contains(&id));
    }
}
