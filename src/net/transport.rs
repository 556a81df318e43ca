//! Datagram transport
//!
//! A message-oriented request/response channel on top of a single
//! shared UDP socket. Outgoing requests are tracked in a
//! `(peer id, message id)` correlation table until the first matching
//! response arrives or the deadline elapses; duplicate responses find
//! no table entry and are dropped. Incoming requests are dispatched to
//! handlers registered by `(namespace, type)`; the response envelope is
//! sent to the datagram's remote address, overriding the stated source.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, trace, warn};

use crate::swarm::Peer;

use super::envelope::Envelope;
use super::NetError;

/// Largest datagram we accept. Envelopes carry control traffic only;
/// bulk bytes go over the HTTP side-channel.
const MAX_DATAGRAM: usize = 64 * 1024;

/// Result of a dispatched handler.
pub type HandlerResult = Result<Value, String>;
/// Boxed handler future.
pub type HandlerFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;
/// A registered request handler.
pub type Handler = Arc<dyn Fn(Envelope) -> HandlerFuture + Send + Sync>;

type PendingKey = (String, String);
type PendingTable = Arc<Mutex<HashMap<PendingKey, mpsc::Sender<(String, Envelope)>>>>;
type HandlerTable = Arc<RwLock<HashMap<(String, String), Handler>>>;

/// Peer messaging endpoint bound to one UDP socket.
pub struct Transport {
    local_id: String,
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    pending: PendingTable,
    handlers: HandlerTable,
    request_timeout: Duration,
    broadcast_timeout: Duration,
    recv_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Transport {
    /// Bind the socket and start the receive loop.
    ///
    /// `port` 0 binds an ephemeral port; read it back via `local_addr`.
    pub async fn bind(
        local_id: String,
        port: u16,
        request_timeout: Duration,
        broadcast_timeout: Duration,
    ) -> std::io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind(("0.0.0.0", port)).await?);
        let local_addr = socket.local_addr()?;

        let pending: PendingTable = Arc::new(Mutex::new(HashMap::new()));
        let handlers: HandlerTable = Arc::new(RwLock::new(HashMap::new()));

        let task = tokio::spawn(Self::run_recv_loop(
            socket.clone(),
            local_id.clone(),
            pending.clone(),
            handlers.clone(),
        ));

        debug!(peer = %local_id, addr = %local_addr, "transport bound");

        Ok(Self {
            local_id,
            socket,
            local_addr,
            pending,
            handlers,
            request_timeout,
            broadcast_timeout,
            recv_task: Mutex::new(Some(task)),
        })
    }

    /// The local peer id this transport answers for.
    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// The bound socket address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Register a handler for `(namespace, type)` requests.
    pub async fn on<F, Fut>(&self, namespace: &str, kind: &str, f: F)
    where
        F: Fn(Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |env| -> HandlerFuture { Box::pin(f(env)) });
        self.handlers
            .write()
            .await
            .insert((namespace.to_string(), kind.to_string()), handler);
    }

    /// Send a request to one peer and await its response.
    pub async fn request(
        &self,
        peer: &Peer,
        namespace: &str,
        kind: &str,
        data: Value,
    ) -> Result<Value, NetError> {
        let env = Envelope::request(
            self.local_id.clone(),
            peer.id.clone(),
            namespace,
            kind,
            data,
            false,
        );
        let key = (peer.id.clone(), env.id.clone());
        let (tx, mut rx) = mpsc::channel(1);
        self.pending.lock().await.insert(key.clone(), tx);

        if let Err(e) = self.send_to_peer(peer, &env).await {
            self.pending.lock().await.remove(&key);
            return Err(e);
        }

        let outcome = tokio::time::timeout(self.request_timeout, rx.recv()).await;
        self.pending.lock().await.remove(&key);

        match outcome {
            Ok(Some((_, resp))) => match resp.error {
                Some(msg) => Err(NetError::Remote(msg)),
                None => Ok(resp.data),
            },
            _ => Err(NetError::Timeout),
        }
    }

    /// Send the same request to every peer; the first non-error
    /// response wins and later responses are dropped. Surfaces a
    /// timeout when the broadcast window elapses without a winner.
    pub async fn broadcast(
        &self,
        peers: &[Peer],
        namespace: &str,
        kind: &str,
        data: Value,
    ) -> Result<(String, Value), NetError> {
        if peers.is_empty() {
            return Err(NetError::NoPeers);
        }

        let message_id = uuid::Uuid::new_v4().to_string();
        let (tx, mut rx) = mpsc::channel(peers.len());
        {
            let mut pending = self.pending.lock().await;
            for peer in peers {
                pending.insert((peer.id.clone(), message_id.clone()), tx.clone());
            }
        }
        drop(tx);

        for peer in peers {
            let mut env = Envelope::request(
                self.local_id.clone(),
                peer.id.clone(),
                namespace,
                kind,
                data.clone(),
                true,
            );
            env.id = message_id.clone();
            if let Err(e) = self.send_to_peer(peer, &env).await {
                debug!(peer = %peer.id, error = %e, "broadcast send failed");
            }
        }

        let deadline = tokio::time::Instant::now() + self.broadcast_timeout;
        let outcome = loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some((peer_id, resp))) => {
                    if let Some(msg) = resp.error {
                        trace!(peer = %peer_id, error = %msg, "broadcast peer declined");
                        continue;
                    }
                    break Ok((peer_id, resp.data));
                }
                // every entry was consumed with an error response
                Ok(None) => break Err(NetError::NoResponse),
                Err(_) => break Err(NetError::Timeout),
            }
        };

        let mut pending = self.pending.lock().await;
        for peer in peers {
            pending.remove(&(peer.id.clone(), message_id.clone()));
        }
        outcome
    }

    /// Fire-and-forget send; any response finds no correlation entry
    /// and is dropped by the receive loop.
    pub async fn notify(
        &self,
        peer: &Peer,
        namespace: &str,
        kind: &str,
        data: Value,
    ) -> Result<(), NetError> {
        let env = Envelope::request(
            self.local_id.clone(),
            peer.id.clone(),
            namespace,
            kind,
            data,
            false,
        );
        self.send_to_peer(peer, &env).await
    }

    /// Stop the receive loop. Pending requests time out.
    pub async fn close(&self) {
        if let Some(task) = self.recv_task.lock().await.take() {
            task.abort();
        }
    }

    async fn send_to_peer(&self, peer: &Peer, env: &Envelope) -> Result<(), NetError> {
        let addr = resolve_peer(peer).await?;
        let bytes = serde_json::to_vec(env).map_err(|e| NetError::Malformed(e.to_string()))?;
        self.socket.send_to(&bytes, addr).await?;
        Ok(())
    }

    async fn run_recv_loop(
        socket: Arc<UdpSocket>,
        local_id: String,
        pending: PendingTable,
        handlers: HandlerTable,
    ) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (n, remote) = match socket.recv_from(&mut buf).await {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = %e, "transport receive failed");
                    continue;
                }
            };

            let env: Envelope = match serde_json::from_slice(&buf[..n]) {
                Ok(e) => e,
                Err(e) => {
                    debug!(from = %remote, error = %e, "dropping malformed datagram");
                    continue;
                }
            };

            // the shared socket's only multiplexing filter
            if env.target != local_id {
                trace!(target = %env.target, "dropping message for another peer");
                continue;
            }

            if env.pong {
                let key = (env.source.clone(), env.id.clone());
                let waiter = pending.lock().await.remove(&key);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send((env.source.clone(), env)).await;
                    }
                    None => trace!(id = %env.id, "dropping duplicate or late response"),
                }
                continue;
            }

            let handler = handlers
                .read()
                .await
                .get(&(env.namespace.clone(), env.kind.clone()))
                .cloned();
            let socket = socket.clone();
            let local_id = local_id.clone();
            tokio::spawn(async move {
                let response = match handler {
                    Some(h) => match h(env.clone()).await {
                        Ok(data) => Envelope::reply(&env, local_id, data),
                        Err(msg) => Envelope::reply_error(&env, local_id, msg),
                    },
                    None => Envelope::reply_error(
                        &env,
                        local_id,
                        format!("Message {} not found", env.kind),
                    ),
                };
                match serde_json::to_vec(&response) {
                    // reply to the datagram's origin, not the stated source
                    Ok(bytes) => {
                        if let Err(e) = socket.send_to(&bytes, remote).await {
                            debug!(to = %remote, error = %e, "response send failed");
                        }
                    }
                    Err(e) => warn!(error = %e, "response serialization failed"),
                }
            });
        }
    }
}

/// Resolve a peer's `address:port` to a socket address, preferring IPv4.
pub async fn resolve_peer(peer: &Peer) -> Result<SocketAddr, NetError> {
    let target = format!("{}:{}", peer.address, peer.port);
    let mut addrs: Vec<SocketAddr> = tokio::net::lookup_host(&target)
        .await
        .map_err(|e| NetError::Io(format!("resolve {}: {}", target, e)))?
        .collect();
    addrs.sort_by_key(|a| !a.is_ipv4());
    addrs
        .into_iter()
        .next()
        .ok_or_else(|| NetError::Io(format!("no address for {}", target)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_peer(id: &str, port: u16) -> Peer {
        Peer {
            id: id.to_string(),
            address: "127.0.0.1".to_string(),
            port,
            protocol: "http".to_string(),
            master: false,
        }
    }

    async fn bind_pair() -> (Transport, Transport) {
        let a = Transport::bind(
            "peer-a".into(),
            0,
            Duration::from_secs(2),
            Duration::from_secs(2),
        )
        .await
        .unwrap();
        let b = Transport::bind(
            "peer-b".into(),
            0,
            Duration::from_secs(2),
            Duration::from_secs(2),
        )
        .await
        .unwrap();
        (a, b)
    }

    #[tokio::test]
    async fn test_request_response() {
        let (a, b) = bind_pair().await;
        b.on("test", "echo", |env| async move { Ok(env.data) }).await;

        let peer_b = test_peer("peer-b", b.local_addr().port());
        let resp = a
            .request(&peer_b, "test", "echo", json!({"x": 1}))
            .await
            .unwrap();
        assert_eq!(resp["x"], 1);

        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn test_unknown_handler_reports_error() {
        let (a, b) = bind_pair().await;
        let peer_b = test_peer("peer-b", b.local_addr().port());

        let err = a
            .request(&peer_b, "test", "nope", Value::Null)
            .await
            .unwrap_err();
        match err {
            NetError::Remote(msg) => assert_eq!(msg, "Message nope not found"),
            other => panic!("unexpected error: {}", other),
        }

        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn test_request_times_out_without_listener() {
        let a = Transport::bind(
            "peer-a".into(),
            0,
            Duration::from_millis(200),
            Duration::from_millis(200),
        )
        .await
        .unwrap();
        // nothing bound on the peer port
        let ghost = test_peer("ghost", 1);

        let err = a.request(&ghost, "test", "echo", Value::Null).await.unwrap_err();
        assert!(matches!(err, NetError::Timeout));
        a.close().await;
    }

    #[tokio::test]
    async fn test_broadcast_first_non_error_wins() {
        let a = Transport::bind(
            "peer-a".into(),
            0,
            Duration::from_secs(2),
            Duration::from_secs(2),
        )
        .await
        .unwrap();
        let b = Transport::bind(
            "peer-b".into(),
            0,
            Duration::from_secs(2),
            Duration::from_secs(2),
        )
        .await
        .unwrap();
        let c = Transport::bind(
            "peer-c".into(),
            0,
            Duration::from_secs(2),
            Duration::from_secs(2),
        )
        .await
        .unwrap();

        // b declines, c answers
        b.on("test", "find", |_| async { Err("not here".to_string()) })
            .await;
        c.on("test", "find", |_| async { Ok(json!({"port": 9})) }).await;

        let peers = vec![
            test_peer("peer-b", b.local_addr().port()),
            test_peer("peer-c", c.local_addr().port()),
        ];
        let (winner, data) = a.broadcast(&peers, "test", "find", Value::Null).await.unwrap();
        assert_eq!(winner, "peer-c");
        assert_eq!(data["port"], 9);

        a.close().await;
        b.close().await;
        c.close().await;
    }

    #[tokio::test]
    async fn test_broadcast_all_errors_reports_no_response() {
        let (a, b) = bind_pair().await;
        b.on("test", "find", |_| async { Err("not here".to_string()) })
            .await;

        let peers = vec![test_peer("peer-b", b.local_addr().port())];
        let err = a.broadcast(&peers, "test", "find", Value::Null).await.unwrap_err();
        assert!(matches!(err, NetError::NoResponse));

        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn test_broadcast_without_peers() {
        let (a, b) = bind_pair().await;
        let err = a.broadcast(&[], "test", "find", Value::Null).await.unwrap_err();
        assert!(matches!(err, NetError::NoPeers));
        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn test_message_for_another_peer_is_dropped() {
        let (a, b) = bind_pair().await;
        b.on("test", "echo", |env| async move { Ok(env.data) }).await;

        // address peer-b's socket but a different peer id: the target
        // filter must drop it and the request must time out
        let a_short = Transport::bind(
            "peer-x".into(),
            0,
            Duration::from_millis(300),
            Duration::from_millis(300),
        )
        .await
        .unwrap();
        let wrong_identity = test_peer("someone-else", b.local_addr().port());
        let err = a_short
            .request(&wrong_identity, "test", "echo", Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, NetError::Timeout));

        a.close().await;
        b.close().await;
        a_short.close().await;
    }
}
