//! Node: the public surface of an xyz microservice.
//!
//! A [`Node`] owns its identity, an action registry, a peer directory built
//! from the system configuration, a call correlator and the transport that
//! ties them to the network.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use serde_json::Value;
//! # use xyz_types::NodeConfig;
//! # use xyz_wire::{Node, Responder};
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let (node, _accept) = Node::start(NodeConfig::new("stringMS", "127.0.0.1", 3334)).await?;
//! node.register("up", |payload: Value, response: Responder| {
//!     let _ = response.send(payload.as_str().unwrap_or_default().to_uppercase());
//! })?;
//! node.call("mul", serde_json::json!({"x": 2, "y": 5}), |result| {
//!     println!("my fellow service responded with {:?}", result.map(|r| r.body));
//! });
//! # Ok(())
//! # }
//! ```

use crate::correlator::{CallResult, Correlator, PendingGuard};
use crate::directory::{PeerDescriptor, PeerDirectory};
use crate::message::{WireMessage, WireMessageKind, WireRequest};
use crate::registry::{ActionHandler, ActionRegistry};
use crate::transport::{PeerLinkInfo, Transport, WireError};

use serde::Serialize;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use xyz_types::{NodeConfig, SelfConf, XyzError, XyzResult};

/// A running microservice node.
pub struct Node {
    config: NodeConfig,
    registry: ActionRegistry,
    directory: PeerDirectory,
    correlator: Correlator,
    transport: Arc<Transport>,
}

impl Node {
    /// Bind the listener and start serving.
    ///
    /// Returns the node and the handle of its accept loop, which runs until
    /// [`Node::shutdown`] is called.
    pub async fn start(
        config: NodeConfig,
    ) -> Result<(Arc<Self>, tokio::task::JoinHandle<()>), WireError> {
        let registry = ActionRegistry::new();
        let correlator = Correlator::new();
        let directory = PeerDirectory::from_config(&config.system_conf);

        let (transport, accept_handle) = Transport::bind(
            &config.self_conf,
            &config.rpc.shared_secret,
            registry.clone(),
            correlator.clone(),
        )
        .await?;

        info!(
            node = %config.self_conf.name,
            peers = directory.len(),
            call_timeout_secs = config.rpc.call_timeout_secs,
            "Node started"
        );

        let node = Arc::new(Self {
            config,
            registry,
            directory,
            correlator,
            transport,
        });
        Ok((node, accept_handle))
    }

    /// This node's identity as configured.
    pub fn identity(&self) -> &SelfConf {
        &self.config.self_conf
    }

    /// Get the node name.
    pub fn name(&self) -> &str {
        &self.config.self_conf.name
    }

    /// Get the actual bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    /// Get a reference to the action registry.
    pub fn registry(&self) -> &ActionRegistry {
        &self.registry
    }

    /// Get a reference to the peer directory.
    pub fn directory(&self) -> &PeerDirectory {
        &self.directory
    }

    /// Expose `handler` to peers as `action`. A later registration of the
    /// same name replaces this one.
    pub fn register<H: ActionHandler>(&self, action: &str, handler: H) -> XyzResult<()> {
        if self.registry.register(action, handler)? {
            info!(node = %self.name(), action, "Replaced existing handler");
        } else {
            debug!(node = %self.name(), action, "Registered handler");
        }
        Ok(())
    }

    /// Call `service` without waiting; `callback` receives the outcome once.
    ///
    /// `service` is `"service/action"` or a bare name resolved through the
    /// peer directory. Must be called from within a tokio runtime.
    pub fn call<P, F>(self: &Arc<Self>, service: &str, payload: P, callback: F)
    where
        P: Serialize,
        F: FnOnce(CallResult) + Send + 'static,
    {
        let payload =
            serde_json::to_value(payload).map_err(|e| XyzError::Serialization(e.to_string()));
        let node = Arc::clone(self);
        let service = service.to_string();
        tokio::spawn(async move {
            let result = match payload {
                Ok(payload) => node.request(&service, payload).await,
                Err(e) => Err(e),
            };
            callback(result);
        });
    }

    /// Call `service` and wait for the reply, using the configured deadline.
    pub async fn request(&self, service: &str, payload: Value) -> CallResult {
        self.request_with_timeout(service, payload, self.config.rpc.call_timeout())
            .await
    }

    /// Call `service` and wait for the reply at most `deadline`.
    pub async fn request_with_timeout(
        &self,
        service: &str,
        payload: Value,
        deadline: Duration,
    ) -> CallResult {
        let (peer, action) = self.directory.route(service)?;
        self.exchange(&peer, deadline, |id| WireMessage::invoke(id, action, payload))
            .await
    }

    /// Ping a peer; returns its uptime in seconds.
    pub async fn ping(&self, service: &str) -> XyzResult<u64> {
        let peer = self.directory.resolve(service)?.clone();
        let reply = self
            .exchange(&peer, self.config.rpc.call_timeout(), |id| WireMessage {
                id,
                kind: WireMessageKind::Request(WireRequest::Ping),
            })
            .await?;
        reply
            .body
            .as_u64()
            .ok_or_else(|| XyzError::Serialization("Pong carried no uptime".to_string()))
    }

    /// Number of calls still waiting for a response.
    pub fn outstanding_calls(&self) -> usize {
        self.correlator.outstanding()
    }

    /// Open outbound links.
    pub fn connected_peers(&self) -> Vec<PeerLinkInfo> {
        self.transport.connected_peers()
    }

    /// Stop the accept loop and release outbound links.
    pub fn shutdown(&self) {
        info!(node = %self.name(), "Node shutting down");
        self.transport.shutdown();
    }

    /// Send a request and wait for its response, all within `deadline`.
    async fn exchange(
        &self,
        peer: &PeerDescriptor,
        deadline: Duration,
        build: impl FnOnce(String) -> WireMessage,
    ) -> CallResult {
        let expires_at = Instant::now() + deadline;
        let (id, completion) = self.correlator.register(&peer.address());
        // Removes the entry if this future is dropped before completion.
        let _guard = PendingGuard::new(self.correlator.clone(), id.clone());

        // Connecting and queueing count against the same deadline as the reply.
        let sent = tokio::time::timeout_at(
            expires_at,
            self.transport.send(peer, build(id.clone())),
        )
        .await;
        match sent {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(
                    node = %self.name(),
                    peer = %peer.name,
                    request_id = %id,
                    error = %e,
                    "Send failed"
                );
                return Err(e.into());
            }
            Err(_) => {
                warn!(
                    node = %self.name(),
                    peer = %peer.name,
                    request_id = %id,
                    deadline_ms = deadline.as_millis() as u64,
                    "Deadline passed before the request was sent"
                );
                self.correlator.complete(&id, Err(XyzError::Timeout(deadline)));
                return Err(XyzError::Timeout(deadline));
            }
        }

        self.correlator
            .wait_until(&id, completion, expires_at, deadline)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{WireResponse, PROTOCOL_VERSION};
    use crate::registry::Responder;
    use crate::transport::{read_message, write_message};
    use serde_json::json;
    use tokio::net::TcpListener;
    use xyz_types::MicroserviceConf;

    fn config(name: &str, peers: Vec<MicroserviceConf>) -> NodeConfig {
        let mut config = NodeConfig::new(name, "127.0.0.1", 0);
        config.system_conf.microservices = peers;
        config
    }

    fn peer(name: &str, node: &Node, actions: &[&str]) -> MicroserviceConf {
        MicroserviceConf {
            name: name.to_string(),
            host: "127.0.0.1".to_string(),
            port: node.local_addr().port(),
            actions: actions.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn peer_at(name: &str, port: u16, actions: &[&str]) -> MicroserviceConf {
        MicroserviceConf {
            name: name.to_string(),
            host: "127.0.0.1".to_string(),
            port,
            actions: actions.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn test_request_round_trip() {
        let (server, _t1) = Node::start(config("stringMS", vec![])).await.unwrap();
        server
            .register("up", |p: Value, r: Responder| {
                r.send(p.as_str().unwrap_or_default().to_uppercase()).unwrap();
            })
            .unwrap();

        let (client, _t2) = Node::start(config("client", vec![peer("stringMS", &server, &["up"])]))
            .await
            .unwrap();

        let reply = client.request("up", json!("abc")).await.unwrap();
        assert_eq!(reply.body, json!("ABC"));
        let reply = client.request("stringMS/up", json!("xyz")).await.unwrap();
        assert_eq!(reply.body, json!("XYZ"));
        assert_eq!(client.outstanding_calls(), 0);
        assert_eq!(client.connected_peers().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_service_fails_without_network() {
        let (client, _t) = Node::start(config("client", vec![])).await.unwrap();
        let err = client.request("mul", json!({"x": 2})).await.unwrap_err();
        assert_eq!(err, XyzError::ServiceNotFound("mul".to_string()));
        assert_eq!(client.outstanding_calls(), 0);
    }

    #[tokio::test]
    async fn test_remote_handler_failure() {
        let (server, _t1) = Node::start(config("server", vec![])).await.unwrap();
        server
            .register("div", |_: Value, r: Responder| {
                r.fail("division by zero").unwrap();
            })
            .unwrap();
        let (client, _t2) = Node::start(config("client", vec![peer("server", &server, &[])]))
            .await
            .unwrap();

        let err = client.request("server/div", json!([1, 0])).await.unwrap_err();
        assert_eq!(
            err,
            XyzError::Remote {
                code: 500,
                message: "division by zero".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_ping() {
        let (server, _t1) = Node::start(config("server", vec![])).await.unwrap();
        let (client, _t2) = Node::start(config("client", vec![peer("server", &server, &[])]))
            .await
            .unwrap();
        let uptime = client.ping("server").await.unwrap();
        assert!(uptime < 60);
    }

    #[tokio::test]
    async fn test_dropped_request_future_releases_pending_call() {
        let (server, _t1) = Node::start(config("server", vec![])).await.unwrap();
        let parked = Arc::new(std::sync::Mutex::new(Vec::<Responder>::new()));
        let sink = Arc::clone(&parked);
        server
            .register("hang", move |_: Value, r: Responder| {
                sink.lock().unwrap().push(r);
            })
            .unwrap();
        let (client, _t2) = Node::start(config("client", vec![peer("server", &server, &["hang"])]))
            .await
            .unwrap();

        let attempt = tokio::time::timeout(
            Duration::from_millis(100),
            client.request_with_timeout("hang", Value::Null, Duration::from_secs(30)),
        )
        .await;
        assert!(attempt.is_err());
        assert_eq!(client.outstanding_calls(), 0);
    }

    #[tokio::test]
    async fn test_deadline_covers_stalled_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        // Accepts the connection and never answers the handshake.
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            std::future::pending::<()>().await;
        });
        let (client, _t) = Node::start(config("client", vec![peer_at("stuckMS", port, &["up"])]))
            .await
            .unwrap();

        let deadline = Duration::from_millis(200);
        let started = std::time::Instant::now();
        let err = client
            .request_with_timeout("up", json!("abc"), deadline)
            .await
            .unwrap_err();
        assert_eq!(err, XyzError::Timeout(deadline));
        assert!(
            started.elapsed() < Duration::from_secs(2),
            "took {:?}",
            started.elapsed()
        );
        assert_eq!(client.outstanding_calls(), 0);
    }

    #[tokio::test]
    async fn test_deadline_covers_full_write_queue() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        // Completes the handshake, then never reads again.
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (mut reader, mut writer) = stream.into_split();
            let handshake = read_message(&mut reader).await.unwrap();
            let ack = WireMessage::response(
                handshake.id,
                WireResponse::HandshakeAck {
                    node_name: "deafMS".to_string(),
                    protocol_version: PROTOCOL_VERSION,
                    actions: vec!["up".to_string()],
                    nonce: String::new(),
                    auth_hmac: String::new(),
                },
            );
            write_message(&mut writer, &ack).await.unwrap();
            let _open = (reader, writer);
            std::future::pending::<()>().await;
        });
        let (client, _t) = Node::start(config("client", vec![peer_at("deafMS", port, &["up"])]))
            .await
            .unwrap();

        let deadline = Duration::from_millis(200);
        let blob = "x".repeat(64 * 1024);
        let mut calls = Vec::new();
        for _ in 0..600 {
            let client = Arc::clone(&client);
            let payload = json!(blob);
            calls.push(tokio::spawn(async move {
                client.request_with_timeout("up", payload, deadline).await
            }));
        }

        let results = tokio::time::timeout(Duration::from_secs(10), async {
            let mut results = Vec::new();
            for call in calls {
                results.push(call.await.unwrap());
            }
            results
        })
        .await
        .expect("every call should finish shortly after its deadline");
        for result in results {
            assert_eq!(result.unwrap_err(), XyzError::Timeout(deadline));
        }
        assert_eq!(client.outstanding_calls(), 0);
    }

    #[tokio::test]
    async fn test_panicking_handler_answers_with_failure() {
        fn explode(_: Value, _: Responder) {
            panic!("handler exploded");
        }
        let (server, _t1) = Node::start(config("server", vec![])).await.unwrap();
        server.register("boom", explode).unwrap();
        let (client, _t2) = Node::start(config("client", vec![peer("server", &server, &[])]))
            .await
            .unwrap();

        let started = std::time::Instant::now();
        let err = client
            .request_with_timeout("server/boom", Value::Null, Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(err, XyzError::Remote { code: 500, .. }), "got {err:?}");
        assert!(started.elapsed() < Duration::from_secs(5));

        // The server keeps serving after the panic.
        assert_eq!(client.ping("server").await.unwrap(), 0);
    }
}
