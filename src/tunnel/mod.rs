//! Tunnel layer - per-flow multiplexing over one carrier
//!
//! A [`Tunnel`] is one TCP flow carried between the peers. The
//! [`Manager`] owns the carrier and the tunnel table and runs the two
//! pumps moving packets between tunnels and the decorator stack;
//! [`exchange`] bridges a tunnel to a local socket.
//!
//! Both peers share the same tunnel id; message ids are 1-based and
//! monotonic per tunnel and direction, which lets the pull side restore
//! order and drop duplicates on carriers that guarantee neither.

mod control;
mod exchange;
mod manager;

pub use control::{
    ConnectEnvelope, Disconnect, OpenRequest, OpenResponse, TargetAddr, WireError,
};
pub use exchange::{exchange, SocketIo};
pub use manager::Manager;

use crate::carrier::{CarrierError, Command, PacketHead};
use bytes::Bytes;
use serde::Serialize;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Id of the pseudo-tunnel receiving every inbound Connect
pub const LISTENER_ID: &str = "listener";

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("timed out opening tunnel")]
    ConnectTimeout,

    #[error("tunnel idle timeout")]
    IdleTimeout,

    #[error("tunnel channel closed")]
    ChannelClosed,

    #[error("cancelled")]
    Cancelled,

    #[error("remote: {0}")]
    Remote(WireError),

    #[error("control encode: {0}")]
    Encode(String),

    #[error("control decode: {0}")]
    Decode(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Carrier(#[from] CarrierError),
}

/// Unit queued on the shared push channel
pub struct Bundle {
    pub tunnel: std::sync::Arc<Tunnel>,
    pub command: Command,
    pub data: Bytes,
}

struct PullState {
    next_mid: u64,
    /// Out-of-order packets, ascending by mid
    buffered: Vec<(u64, Bytes)>,
}

/// One multiplexed flow between the peers
pub struct Tunnel {
    id: String,
    connect_timeout: Duration,
    reorder_capacity: usize,
    push_mid: AtomicU64,
    push_tx: mpsc::Sender<Bundle>,
    pull_tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    pull_rx: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
    pull_state: Mutex<PullState>,
}

impl Tunnel {
    pub(crate) fn new(
        id: String,
        push_tx: mpsc::Sender<Bundle>,
        pull_chan_size: usize,
        reorder_capacity: usize,
        connect_timeout: Duration,
        next_pull_mid: u64,
    ) -> std::sync::Arc<Self> {
        let (pull_tx, pull_rx) = mpsc::channel(pull_chan_size);
        std::sync::Arc::new(Self {
            id,
            connect_timeout,
            reorder_capacity,
            push_mid: AtomicU64::new(0),
            push_tx,
            pull_tx: Mutex::new(Some(pull_tx)),
            pull_rx: tokio::sync::Mutex::new(pull_rx),
            pull_state: Mutex::new(PullState {
                next_mid: next_pull_mid,
                buffered: Vec::new(),
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Open the tunnel towards the responder, report the result through
    /// `reply`, then bridge bytes through `exchange`
    pub async fn open_and_serve<Reply, RF, Exchange, EF>(
        self: &std::sync::Arc<Self>,
        request: &OpenRequest,
        reply: Reply,
        exchange: Exchange,
    ) -> Result<(), TunnelError>
    where
        Reply: FnOnce(Option<SocketAddr>, Option<&TunnelError>) -> RF,
        RF: Future<Output = std::io::Result<()>>,
        Exchange: FnOnce(std::sync::Arc<Tunnel>) -> EF,
        EF: Future<Output = Result<(), TunnelError>>,
    {
        debug!(
            tid = %self.id,
            from = %request.client_addr,
            to = %request.server_addr,
            "opening tunnel"
        );

        let connected = self.open(request).await;
        match connected {
            Ok(response) => {
                reply(response.bind_addr, None).await?;
                exchange(std::sync::Arc::clone(self)).await
            }
            Err(error) => {
                warn!(tid = %self.id, %error, "open failed");
                let _ = reply(None, Some(&error)).await;
                Err(error)
            }
        }
    }

    async fn open(self: &std::sync::Arc<Self>, request: &OpenRequest) -> Result<OpenResponse, TunnelError> {
        let envelope = ConnectEnvelope {
            tunnel_id: self.id.clone(),
            connection: request.encode()?,
        };
        self.push(Command::Connect, to_json(&envelope)?).await?;

        let payload = tokio::time::timeout(self.connect_timeout, self.recv_pull())
            .await
            .map_err(|_| TunnelError::ConnectTimeout)?
            .ok_or(TunnelError::ChannelClosed)?;

        let text = std::str::from_utf8(&payload)
            .map_err(|_| TunnelError::Decode("connect ack is not text".into()))?;
        let mut response = OpenResponse::decode(text)?;
        match response.error.take() {
            Some(error) => Err(TunnelError::Remote(error)),
            None => Ok(response),
        }
    }

    /// Serve inbound Connects on the listener pseudo-tunnel
    ///
    /// For each Connect: `create` the flow tunnel under the id the
    /// initiator chose, dial the destination, acknowledge, and on success
    /// run `exchange` until the flow ends; `remove` tears the tunnel
    /// down in every path.
    pub async fn listen_and_serve<C, E, EF, R>(
        self: &std::sync::Arc<Self>,
        create: C,
        exchange: E,
        remove: R,
    ) -> Result<(), TunnelError>
    where
        C: Fn(&str) -> std::sync::Arc<Tunnel> + Send + Sync + 'static,
        E: Fn(std::sync::Arc<Tunnel>, TcpStream) -> EF + Send + Sync + 'static,
        EF: Future<Output = Result<(), TunnelError>> + Send + 'static,
        R: Fn(&std::sync::Arc<Tunnel>) + Send + Sync + 'static,
    {
        let create = std::sync::Arc::new(create);
        let exchange = std::sync::Arc::new(exchange);
        let remove = std::sync::Arc::new(remove);

        loop {
            let data = self.recv_pull().await.ok_or(TunnelError::ChannelClosed)?;

            let listener = std::sync::Arc::clone(self);
            let create = std::sync::Arc::clone(&create);
            let exchange = std::sync::Arc::clone(&exchange);
            let remove = std::sync::Arc::clone(&remove);
            tokio::spawn(async move {
                listener.serve_connect(data, create, exchange, remove).await;
            });
        }
    }

    async fn serve_connect<C, E, EF, R>(
        self: std::sync::Arc<Self>,
        data: Bytes,
        create: std::sync::Arc<C>,
        exchange: std::sync::Arc<E>,
        remove: std::sync::Arc<R>,
    ) where
        C: Fn(&str) -> std::sync::Arc<Tunnel> + Send + Sync,
        E: Fn(std::sync::Arc<Tunnel>, TcpStream) -> EF + Send + Sync,
        EF: Future<Output = Result<(), TunnelError>> + Send,
        R: Fn(&std::sync::Arc<Tunnel>) + Send + Sync,
    {
        let envelope: ConnectEnvelope = match serde_json::from_slice(&data) {
            Ok(envelope) => envelope,
            Err(error) => {
                error!(%error, "unparseable connect envelope");
                return;
            }
        };
        let request = match OpenRequest::decode(&envelope.connection) {
            Ok(request) => request,
            Err(error) => {
                error!(%error, "unparseable open request");
                return;
            }
        };

        let tunnel = create(&envelope.tunnel_id);
        debug!(
            tid = %tunnel.id,
            from = %request.client_addr,
            to = %request.server_addr,
            "serving tunnel"
        );

        let conn = match TcpStream::connect(request.server_addr.to_string()).await {
            Ok(conn) => conn,
            Err(error) => {
                warn!(tid = %tunnel.id, %error, "dial failed");
                let response = OpenResponse {
                    error: Some(WireError::dial(&request.server_addr, &error)),
                    ..OpenResponse::default()
                };
                tunnel.acknowledge(&response).await;
                remove(&tunnel);
                return;
            }
        };

        let response = OpenResponse {
            bind_addr: conn.local_addr().ok(),
            server_addr: conn.peer_addr().ok(),
            error: None,
        };
        tunnel.acknowledge(&response).await;

        if let Err(error) = exchange(std::sync::Arc::clone(&tunnel), conn).await {
            debug!(tid = %tunnel.id, %error, "exchange ended");
        }
        remove(&tunnel);
    }

    async fn acknowledge(self: &std::sync::Arc<Self>, response: &OpenResponse) {
        match response.encode() {
            Ok(encoded) => {
                if self
                    .push(Command::ConnectAck, Bytes::from(encoded))
                    .await
                    .is_err()
                {
                    warn!(tid = %self.id, "connect ack lost, push channel closed");
                }
            }
            Err(error) => error!(tid = %self.id, %error, "encode connect ack"),
        }
    }

    /// Queue an outgoing bundle on the shared push channel; blocks when
    /// the channel is full
    pub(crate) async fn push(
        self: &std::sync::Arc<Self>,
        command: Command,
        data: Bytes,
    ) -> Result<(), TunnelError> {
        self.push_tx
            .send(Bundle {
                tunnel: std::sync::Arc::clone(self),
                command,
                data,
            })
            .await
            .map_err(|_| TunnelError::ChannelClosed)
    }

    /// Receive the next in-order inbound payload
    pub(crate) async fn recv_pull(&self) -> Option<Bytes> {
        self.pull_rx.lock().await.recv().await
    }

    /// Mint the head for the next outgoing packet of this tunnel
    pub(crate) fn new_head(&self, from: &str, to: &str, cmd: Command) -> PacketHead {
        let mid = self.push_mid.fetch_add(1, Ordering::Relaxed) + 1;
        PacketHead {
            from: Some(from.to_string()),
            to: to.to_string(),
            tid: self.id.clone(),
            cmd,
            mid,
        }
    }

    /// Ordered delivery of an inbound packet
    ///
    /// Duplicates are dropped, gaps are buffered up to the reorder
    /// capacity, and contiguous mids drain into the pull channel. A full
    /// pull channel does not advance `next_mid`; the flow then stalls
    /// under back-pressure until its idle timer fires.
    pub(crate) fn pull(&self, head: &PacketHead, data: Bytes) {
        let mut state = self.pull_state.lock().expect("pull state lock");

        // duplicate of an already-delivered packet
        if head.mid < state.next_mid {
            return;
        }

        if state.buffered.len() >= self.reorder_capacity {
            warn!(
                tid = %self.id,
                head = %head,
                capacity = self.reorder_capacity,
                "reorder buffer full, dropping packet"
            );
            return;
        }

        if head.mid > state.next_mid {
            debug!(tid = %self.id, want = state.next_mid, got = head.mid, "out of order packet");
            match state.buffered.binary_search_by_key(&head.mid, |(mid, _)| *mid) {
                // duplicate of a buffered packet
                Ok(_) => {}
                Err(pos) => state.buffered.insert(pos, (head.mid, data)),
            }
            return;
        }

        // an equal mid already stuck at the front (pull channel was full
        // when it first arrived) makes this a duplicate; keep the stashed
        // payload and retry the drain below
        if state.buffered.first().map(|(mid, _)| *mid) != Some(head.mid) {
            state.buffered.insert(0, (head.mid, data));
        }

        let sender = self.pull_tx.lock().expect("pull sender lock").clone();
        let Some(sender) = sender else {
            return;
        };

        while let Some((mid, _)) = state.buffered.first() {
            if *mid != state.next_mid {
                break;
            }
            let (mid, payload) = state.buffered.remove(0);
            match sender.try_send(payload) {
                Ok(()) => state.next_mid += 1,
                Err(mpsc::error::TrySendError::Full(payload)) => {
                    warn!(tid = %self.id, head = %head, "pull channel full");
                    state.buffered.insert(0, (mid, payload));
                    break;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => return,
            }
        }
    }

    /// Non-blocking delivery of a Connect payload, bypassing mid
    /// ordering; used only on the listener pseudo-tunnel
    pub(crate) fn offer(&self, data: Bytes) {
        let sender = self.pull_tx.lock().expect("pull sender lock").clone();
        if let Some(sender) = sender {
            if sender.try_send(data).is_err() {
                warn!(tid = %self.id, "listener pull channel full, dropping connect");
            }
        }
    }

    /// Close the pull channel; safe to call more than once
    pub(crate) fn close_pull(&self) {
        self.pull_tx.lock().expect("pull sender lock").take();
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<Bytes, TunnelError> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|e| TunnelError::Encode(e.to_string()))
}
