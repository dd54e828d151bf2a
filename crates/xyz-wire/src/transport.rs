//! Transport: TCP listener and peer links for the xyz wire protocol.
//!
//! The [`Transport`] binds one listener for inbound connections and keeps at
//! most one outbound link per peer address. Links are opened on first use,
//! reused by every later call to the same address and discarded when the
//! connection breaks; the next call reconnects.
//!
//! Every connection opens with a handshake that exchanges node names, the
//! protocol version and the registered action lists. When a shared secret is
//! configured the handshake is authenticated with HMAC-SHA256.

use crate::correlator::Correlator;
use crate::directory::PeerDescriptor;
use crate::message::*;
use crate::registry::ActionRegistry;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, error, info, warn};
use xyz_types::{SelfConf, XyzError};

type HmacSha256 = Hmac<Sha256>;

/// Generate HMAC-SHA256 signature for handshake authentication.
fn hmac_sign(secret: &str, data: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(data);
    hex::encode(mac.finalize().into_bytes())
}

/// Verify HMAC-SHA256 signature using constant-time comparison.
fn hmac_verify(secret: &str, data: &[u8], signature: &str) -> bool {
    let expected = hmac_sign(secret, data);
    subtle::ConstantTimeEq::ct_eq(expected.as_bytes(), signature.as_bytes()).into()
}

/// Errors from the wire protocol layer.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: u32, max: u32 },
    #[error("Protocol version mismatch: local={local}, remote={remote}")]
    VersionMismatch { local: u32, remote: u32 },
}

impl From<WireError> for XyzError {
    fn from(err: WireError) -> Self {
        XyzError::Connection(err.to_string())
    }
}

/// Maximum single message size (16 MB).
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// How long to wait for a peer to accept a connection and answer the handshake.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-connection queue of frames waiting to be written.
const WRITE_QUEUE: usize = 256;

/// Snapshot of an open outbound link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerLinkInfo {
    /// `host:port` the link was opened to.
    pub address: String,
    /// Name the peer announced in its handshake.
    pub node_name: String,
    /// Actions the peer had registered at handshake time.
    pub actions: Vec<String>,
    pub connected_at: DateTime<Utc>,
}

struct PeerLink {
    id: u64,
    tx: mpsc::Sender<WireMessage>,
    info: PeerLinkInfo,
}

type LinkSlot = Arc<Mutex<Option<PeerLink>>>;

/// The local network endpoint. Accepts peers and opens links to them.
pub struct Transport {
    node_name: String,
    shared_secret: String,
    registry: ActionRegistry,
    correlator: Correlator,
    links: Arc<DashMap<String, LinkSlot>>,
    next_link_id: AtomicU64,
    /// Actual bound address (useful when binding to port 0).
    local_addr: SocketAddr,
    started_at: Instant,
    shutdown: watch::Sender<bool>,
}

impl Transport {
    /// Bind the listener and start accepting connections.
    pub async fn bind(
        self_conf: &SelfConf,
        shared_secret: &str,
        registry: ActionRegistry,
        correlator: Correlator,
    ) -> Result<(Arc<Self>, tokio::task::JoinHandle<()>), WireError> {
        let listener = TcpListener::bind(self_conf.listen_address()).await?;
        let local_addr = listener.local_addr()?;

        info!(
            "xyz: {} listening on {} (auth={})",
            self_conf.name,
            local_addr,
            !shared_secret.is_empty()
        );

        let (shutdown, shutdown_rx) = watch::channel(false);
        let transport = Arc::new(Self {
            node_name: self_conf.name.clone(),
            shared_secret: shared_secret.to_string(),
            registry,
            correlator,
            links: Arc::new(DashMap::new()),
            next_link_id: AtomicU64::new(1),
            local_addr,
            started_at: Instant::now(),
            shutdown,
        });

        let transport_clone = Arc::clone(&transport);
        let accept_handle = tokio::spawn(async move {
            Self::accept_loop(listener, transport_clone, shutdown_rx).await;
        });

        Ok((transport, accept_handle))
    }

    /// Get the actual bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Seconds since the listener was bound.
    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Deliver `msg` to `peer`, opening a link first if none is usable.
    ///
    /// Success means the frame was queued on a live link; the response (or
    /// the link's failure) reaches the caller through the correlator. The
    /// pending call for `msg.id`, if any, is bound to that link first.
    ///
    /// Waits while the link's queue is full; callers bound this with their
    /// own deadline.
    pub async fn send(&self, peer: &PeerDescriptor, msg: WireMessage) -> Result<(), WireError> {
        if self.is_shut_down() {
            return Err(WireError::ConnectionClosed);
        }
        let address = peer.address();
        let slot = self.links.entry(address.clone()).or_default().value().clone();

        let (link_id, tx) = {
            let mut guard = slot.lock().await;
            match guard.as_ref() {
                Some(link) if !link.tx.is_closed() => (link.id, link.tx.clone()),
                _ => {
                    let link = self.connect(peer, &address).await?;
                    // Shut down while connecting: the new link is dropped here.
                    if self.is_shut_down() {
                        return Err(WireError::ConnectionClosed);
                    }
                    let pair = (link.id, link.tx.clone());
                    *guard = Some(link);
                    pair
                }
            }
        };

        self.correlator.bind_link(&msg.id, link_id);
        tx.send(msg).await.map_err(|_| WireError::ConnectionClosed)
    }

    fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Open links, one per peer address.
    pub fn connected_peers(&self) -> Vec<PeerLinkInfo> {
        let slots: Vec<LinkSlot> = self.links.iter().map(|e| e.value().clone()).collect();
        let mut peers: Vec<PeerLinkInfo> = slots
            .iter()
            .filter_map(|slot| {
                let guard = slot.try_lock().ok()?;
                guard
                    .as_ref()
                    .filter(|link| !link.tx.is_closed())
                    .map(|link| link.info.clone())
            })
            .collect();
        peers.sort_by(|a, b| a.address.cmp(&b.address));
        peers
    }

    /// Stop accepting connections and release every outbound link.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let slots: Vec<(String, LinkSlot)> = self
            .links
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        for (address, slot) in slots {
            match slot.try_lock() {
                Ok(mut guard) => {
                    guard.take();
                }
                Err(_) => debug!(
                    "xyz: link to {} is mid-connect; dropped once the connect returns",
                    address
                ),
            }
        }
    }

    /// Connect to a peer, perform the handshake and spawn the link tasks.
    async fn connect(&self, peer: &PeerDescriptor, address: &str) -> Result<PeerLink, WireError> {
        info!("xyz: connecting to {} at {}", peer.name, address);
        let (mut reader, mut writer, ack) =
            tokio::time::timeout(CONNECT_TIMEOUT, self.open_and_handshake(address))
                .await
                .map_err(|_| {
                    WireError::Io(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        format!("connecting to {address} timed out"),
                    ))
                })??;

        let link_id = self.next_link_id.fetch_add(1, Ordering::Relaxed);
        let info = PeerLinkInfo {
            address: address.to_string(),
            node_name: ack.0,
            actions: ack.1,
            connected_at: Utc::now(),
        };
        info!(
            "xyz: linked to {} ({}), {} actions",
            info.node_name,
            address,
            info.actions.len()
        );

        let (tx, rx) = mpsc::channel(WRITE_QUEUE);
        let (closed_tx, closed_rx) = oneshot::channel();
        let closer = LinkCloser {
            links: Arc::clone(&self.links),
            correlator: self.correlator.clone(),
            address: address.to_string(),
            link_id,
        };

        let writer_closer = closer.clone();
        tokio::spawn(async move {
            link_writer(&mut writer, rx, closed_rx, &writer_closer).await;
        });

        let correlator = self.correlator.clone();
        tokio::spawn(async move {
            let reason = link_reader(&mut reader, &correlator, &closer.address).await;
            debug!("xyz: link to {} ended: {}", closer.address, reason);
            let _ = closed_tx.send(());
            closer.close(&reason);
        });

        Ok(PeerLink { id: link_id, tx, info })
    }

    async fn open_and_handshake(
        &self,
        address: &str,
    ) -> Result<(OwnedReadHalf, OwnedWriteHalf, (String, Vec<String>)), WireError> {
        let stream = TcpStream::connect(address).await?;
        stream.set_nodelay(true)?;
        let (mut reader, mut writer) = stream.into_split();

        let nonce = uuid::Uuid::new_v4().to_string();
        let auth_hmac = self.sign(&nonce, &self.node_name);
        let handshake = WireMessage {
            id: uuid::Uuid::new_v4().to_string(),
            kind: WireMessageKind::Request(WireRequest::Handshake {
                node_name: self.node_name.clone(),
                protocol_version: PROTOCOL_VERSION,
                actions: self.registry.names(),
                nonce,
                auth_hmac,
            }),
        };
        write_message(&mut writer, &handshake).await?;

        let response = read_message(&mut reader).await?;
        match response.kind {
            WireMessageKind::Response(WireResponse::HandshakeAck {
                node_name,
                protocol_version,
                actions,
                nonce,
                auth_hmac,
            }) => {
                if protocol_version != PROTOCOL_VERSION {
                    return Err(WireError::VersionMismatch {
                        local: PROTOCOL_VERSION,
                        remote: protocol_version,
                    });
                }
                if !self.verify(&nonce, &node_name, &auth_hmac) {
                    return Err(WireError::HandshakeFailed(
                        "HMAC verification failed on HandshakeAck".into(),
                    ));
                }
                Ok((reader, writer, (node_name, actions)))
            }
            WireMessageKind::Response(WireResponse::Error { code, message }) => Err(
                WireError::HandshakeFailed(format!("Remote error {code}: {message}")),
            ),
            _ => Err(WireError::HandshakeFailed(
                "Unexpected response to handshake".to_string(),
            )),
        }
    }

    fn sign(&self, nonce: &str, node_name: &str) -> String {
        if self.shared_secret.is_empty() {
            return String::new();
        }
        hmac_sign(&self.shared_secret, format!("{nonce}{node_name}").as_bytes())
    }

    fn verify(&self, nonce: &str, node_name: &str, signature: &str) -> bool {
        self.shared_secret.is_empty()
            || hmac_verify(
                &self.shared_secret,
                format!("{nonce}{node_name}").as_bytes(),
                signature,
            )
    }

    /// Internal accept loop; runs in a spawned task until shutdown.
    async fn accept_loop(
        listener: TcpListener,
        transport: Arc<Transport>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!("xyz: accepted connection from {}", addr);
                        let transport = Arc::clone(&transport);
                        tokio::spawn(async move {
                            if let Err(e) = transport.handle_inbound(stream, addr).await {
                                debug!("xyz: inbound connection from {} ended: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("xyz: accept error: {}", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                },
                _ = shutdown.changed() => {
                    info!("xyz: listener on {} stopped", transport.local_addr);
                    return;
                }
            }
        }
    }

    /// Handle a single inbound connection: handshake, then serve requests.
    async fn handle_inbound(&self, stream: TcpStream, addr: SocketAddr) -> Result<(), WireError> {
        let (mut reader, mut writer) = stream.into_split();

        let msg = read_message(&mut reader).await?;
        let peer_name = match msg.kind {
            WireMessageKind::Request(WireRequest::Handshake {
                node_name,
                protocol_version,
                actions,
                nonce,
                auth_hmac,
            }) => {
                if protocol_version != PROTOCOL_VERSION {
                    let err_resp = WireMessage::error(
                        msg.id,
                        codes::VERSION_MISMATCH,
                        format!(
                            "Protocol version mismatch: expected {}, got {}",
                            PROTOCOL_VERSION, protocol_version
                        ),
                    );
                    write_message(&mut writer, &err_resp).await?;
                    return Err(WireError::VersionMismatch {
                        local: PROTOCOL_VERSION,
                        remote: protocol_version,
                    });
                }

                if !self.verify(&nonce, &node_name, &auth_hmac) {
                    let err_resp =
                        WireMessage::error(msg.id, codes::FORBIDDEN, "HMAC authentication failed");
                    write_message(&mut writer, &err_resp).await?;
                    return Err(WireError::HandshakeFailed(
                        "HMAC verification failed on incoming Handshake".into(),
                    ));
                }

                let ack_nonce = uuid::Uuid::new_v4().to_string();
                let ack = WireMessage::response(
                    msg.id,
                    WireResponse::HandshakeAck {
                        node_name: self.node_name.clone(),
                        protocol_version: PROTOCOL_VERSION,
                        actions: self.registry.names(),
                        auth_hmac: self.sign(&ack_nonce, &self.node_name),
                        nonce: ack_nonce,
                    },
                );
                write_message(&mut writer, &ack).await?;

                info!(
                    "xyz: handshake with {} from {}, {} actions",
                    node_name,
                    addr,
                    actions.len()
                );
                node_name
            }
            _ => {
                warn!(
                    "xyz: rejected message from {} before handshake",
                    addr
                );
                let err_resp = WireMessage::error(
                    msg.id,
                    codes::UNAUTHENTICATED,
                    "Handshake required before any request",
                );
                write_message(&mut writer, &err_resp).await?;
                return Err(WireError::HandshakeFailed(
                    "Rejected request before handshake".into(),
                ));
            }
        };

        // One writer per connection; dispatches finish in any order.
        let (tx, mut rx) = mpsc::channel::<WireMessage>(WRITE_QUEUE);
        let writer_peer = peer_name.clone();
        let mut writer_shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    msg = rx.recv() => match msg {
                        Some(msg) => msg,
                        None => break,
                    },
                    _ = writer_shutdown.changed() => break,
                };
                if let Err(e) = write_message(&mut writer, &msg).await {
                    debug!("xyz: write to {} failed: {}", writer_peer, e);
                    break;
                }
            }
        });

        let result = self.serve_requests(&mut reader, &peer_name, tx).await;
        debug!("xyz: connection with {} closed", peer_name);
        result
    }

    /// Request loop for an established inbound connection.
    async fn serve_requests(
        &self,
        reader: &mut OwnedReadHalf,
        peer_name: &str,
        tx: mpsc::Sender<WireMessage>,
    ) -> Result<(), WireError> {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            // The connection is abandoned on shutdown, so losing a partly
            // read frame here is harmless.
            let next = tokio::select! {
                next = read_message(reader) => next,
                _ = shutdown.changed() => return Ok(()),
            };
            let msg = match next {
                Ok(m) => m,
                Err(WireError::ConnectionClosed) => return Ok(()),
                Err(WireError::Json(e)) => {
                    warn!("xyz: dropping malformed frame from {}: {}", peer_name, e);
                    continue;
                }
                Err(e) => return Err(e),
            };

            let response = match msg.kind {
                WireMessageKind::Request(WireRequest::Invoke { action, payload }) => {
                    let id = msg.id;
                    let registry = self.registry.clone();
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        let response = invoke_local(&registry, id, action, payload).await;
                        let _ = tx.send(response).await;
                    });
                    continue;
                }
                WireMessageKind::Request(WireRequest::Ping) => WireMessage::response(
                    msg.id,
                    WireResponse::Pong {
                        uptime_secs: self.uptime_secs(),
                    },
                ),
                WireMessageKind::Request(WireRequest::Handshake { .. }) => {
                    WireMessage::error(msg.id, codes::BAD_REQUEST, "Already handshaked")
                }
                WireMessageKind::Response(_) => {
                    warn!(
                        "xyz: unexpected response frame from {}: {:?}",
                        peer_name, msg.id
                    );
                    continue;
                }
            };

            if tx.send(response).await.is_err() {
                return Err(WireError::ConnectionClosed);
            }
        }
    }
}

/// Run a local handler and turn its outcome into a response frame.
async fn invoke_local(
    registry: &ActionRegistry,
    id: String,
    action: String,
    payload: Value,
) -> WireMessage {
    match registry.dispatch(&id, &action, payload) {
        Ok(reply) => match reply.await {
            Ok(Ok(payload)) => WireMessage::response(id, WireResponse::Reply { payload }),
            Ok(Err(reason)) => WireMessage::error(id, codes::HANDLER_FAILED, reason),
            Err(_) => WireMessage::error(
                id,
                codes::HANDLER_FAILED,
                format!("Handler for '{action}' finished without responding"),
            ),
        },
        Err(e) => WireMessage::error(id, codes::NOT_FOUND, e.to_string()),
    }
}

/// Tears down an outbound link once, from whichever side notices first.
#[derive(Clone)]
struct LinkCloser {
    links: Arc<DashMap<String, LinkSlot>>,
    correlator: Correlator,
    address: String,
    link_id: u64,
}

impl LinkCloser {
    fn close(&self, reason: &str) {
        let slot = self.links.get(&self.address).map(|e| e.value().clone());
        if let Some(slot) = slot {
            // A locked slot is being reconnected; the new link replaces ours.
            if let Ok(mut guard) = slot.try_lock() {
                if guard.as_ref().map(|l| l.id) == Some(self.link_id) {
                    guard.take();
                }
            }
        }
        let failed = self.correlator.fail_link(
            self.link_id,
            &format!("Connection to {} lost: {reason}", self.address),
        );
        if failed > 0 {
            warn!(
                "xyz: failed {} pending call(s) to {}: {}",
                failed, self.address, reason
            );
        }
    }
}

/// Drain the link's queue onto the socket until the reader side ends.
async fn link_writer(
    writer: &mut OwnedWriteHalf,
    mut rx: mpsc::Receiver<WireMessage>,
    mut closed: oneshot::Receiver<()>,
    closer: &LinkCloser,
) {
    loop {
        tokio::select! {
            _ = &mut closed => break,
            outgoing = rx.recv() => match outgoing {
                Some(msg) => {
                    if let Err(e) = write_message(writer, &msg).await {
                        closer.correlator.complete(&msg.id, Err(XyzError::from(e)));
                        break;
                    }
                }
                None => break,
            },
        }
    }
    // Frames still queued will never be written.
    rx.close();
    while let Ok(msg) = rx.try_recv() {
        closer.correlator.complete(
            &msg.id,
            Err(XyzError::Connection(format!(
                "Connection to {} closed before send",
                closer.address
            ))),
        );
    }
    closer.close("writer stopped");
}

/// Route response frames to the correlator until the connection ends.
async fn link_reader(reader: &mut OwnedReadHalf, correlator: &Correlator, address: &str) -> String {
    loop {
        match read_message(reader).await {
            Ok(msg) => match msg.kind {
                WireMessageKind::Response(_) => {
                    correlator.resolve_response(msg);
                }
                WireMessageKind::Request(_) => {
                    warn!("xyz: ignoring request {} on outbound link to {}", msg.id, address);
                }
            },
            Err(WireError::ConnectionClosed) => return "closed by peer".to_string(),
            Err(WireError::Json(e)) => {
                warn!("xyz: dropping malformed frame from {}: {}", address, e);
            }
            Err(e) => return e.to_string(),
        }
    }
}

/// Write a framed message (4-byte length + JSON).
pub async fn write_message<W>(writer: &mut W, msg: &WireMessage) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = encode_message(msg)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a framed message (4-byte length + JSON).
///
/// A body that is not a valid message yields [`WireError::Json`] after the
/// whole frame has been consumed, so the stream stays aligned.
pub async fn read_message<R>(reader: &mut R) -> Result<WireMessage, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(WireError::ConnectionClosed);
        }
        Err(e) => return Err(WireError::Io(e)),
    }

    let len = decode_length(&header);
    if len > MAX_MESSAGE_SIZE {
        return Err(WireError::MessageTooLarge {
            size: len,
            max: MAX_MESSAGE_SIZE,
        });
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;

    let msg = decode_message(&body)?;
    Ok(msg)
}
