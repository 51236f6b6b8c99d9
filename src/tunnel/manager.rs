//! Tunnel manager
//!
//! Owns the carrier and the tunnel table. The push pump is the only
//! writer to the decorator stack and also executes carrier events; the
//! pull pump is the only reader and dispatches inbound packets to
//! tunnels by command. A supervisor keeps recreating the transport with
//! exponential backoff until shutdown.

use super::{Bundle, Disconnect, Tunnel, TunnelError, LISTENER_ID};
use crate::carrier::{
    CarrierError, Command, Event, GatherReader, GatherWriter, Middleman, MuxReader, MuxWriter,
};
use crate::config::TunnelConfig;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, trace, warn};

/// Capacity of the shared event channel
const EVENT_CHAN_SIZE: usize = 128;

/// Owns the carrier and the tunnel table; cheap to clone
#[derive(Clone)]
pub struct Manager {
    shared: Arc<Shared>,
}

struct Shared {
    name: String,
    peer: String,
    config: TunnelConfig,
    write_space: AtomicUsize,
    push_tx: mpsc::Sender<Bundle>,
    event_tx: mpsc::Sender<Event>,
    tunnels: Mutex<HashMap<String, Arc<Tunnel>>>,
    next_tunnel_id: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
    pumps: Mutex<Option<Pumps>>,
}

/// Receiver halves handed to the supervisor on `serve`
struct Pumps {
    push_rx: mpsc::Receiver<Bundle>,
    event_rx: mpsc::Receiver<Event>,
}

impl Manager {
    pub fn new(config: TunnelConfig) -> Self {
        let (push_tx, push_rx) = mpsc::channel(config.push_chan_size);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHAN_SIZE);
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            shared: Arc::new(Shared {
                name: config.peer_name_self.clone(),
                peer: config.peer_name_other.clone(),
                config,
                write_space: AtomicUsize::new(0),
                push_tx,
                event_tx,
                tunnels: Mutex::new(HashMap::new()),
                next_tunnel_id: AtomicU64::new(0),
                shutdown_tx,
                pumps: Mutex::new(Some(Pumps { push_rx, event_rx })),
            }),
        }
    }

    /// Set up the middleman and start supervising transports in the
    /// background; call once
    pub async fn serve<M>(&self, mut middleman: M) -> Result<(), TunnelError>
    where
        M: Middleman + 'static,
    {
        middleman.setup().await?;

        let pumps = self
            .shared
            .pumps
            .lock()
            .expect("pumps lock")
            .take()
            .expect("Manager::serve called twice");

        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            supervise(shared, middleman, pumps).await;
        });

        Ok(())
    }

    /// Stop all pumps and close every tunnel
    pub fn shutdown(&self) {
        let _ = self.shared.shutdown_tx.send(true);
        // also reaches the push pump in-band, ahead of queued bundles
        let _ = self.shared.event_tx.try_send(Event::Exit);

        let mut tunnels = self.shared.tunnels.lock().expect("tunnel table lock");
        for (_, tunnel) in tunnels.drain() {
            tunnel.close_pull();
        }
    }

    /// Payload bytes one tunnel packet may carry: the carrier's write
    /// space minus the decorator stack's meta; zero until the first
    /// transport is up
    pub fn write_space(&self) -> usize {
        self.shared.write_space.load(Ordering::SeqCst)
    }

    pub fn idle_timeout(&self) -> Duration {
        self.shared.config.idle_timeout()
    }

    /// Allocate a fresh tunnel for an outbound flow; it expects the
    /// ConnectAck as pull mid 1
    pub fn new_initiator(&self) -> Arc<Tunnel> {
        let id = self.next_tunnel_id();
        self.insert(id, 1)
    }

    /// The single pseudo-tunnel receiving every inbound Connect
    pub fn new_listener(&self) -> Arc<Tunnel> {
        self.insert(LISTENER_ID.to_string(), 1)
    }

    /// Materialize the responder-side half of a tunnel under the id the
    /// initiator chose; the Connect consumed mid 1, so pulls start at 2
    pub fn create(&self, id: &str) -> Arc<Tunnel> {
        self.insert(id.to_string(), 2)
    }

    /// Drop a tunnel from the table and close its pull channel
    pub fn remove(&self, tunnel: &Arc<Tunnel>) {
        let mut tunnels = self.shared.tunnels.lock().expect("tunnel table lock");
        if tunnels.remove(tunnel.id()).is_some() {
            tunnel.close_pull();
        }
    }

    fn insert(&self, id: String, next_pull_mid: u64) -> Arc<Tunnel> {
        let config = &self.shared.config;
        let tunnel = Tunnel::new(
            id,
            self.shared.push_tx.clone(),
            config.pull_chan_size,
            config.reorder_capacity,
            config.connect_timeout(),
            next_pull_mid,
        );

        self.shared
            .tunnels
            .lock()
            .expect("tunnel table lock")
            .insert(tunnel.id().to_string(), Arc::clone(&tunnel));
        tunnel
    }

    fn next_tunnel_id(&self) -> String {
        let count = self.shared.next_tunnel_id.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{:06}", count % self.shared.config.max_tunnel_id)
    }
}

async fn supervise<M: Middleman>(shared: Arc<Shared>, mut middleman: M, mut pumps: Pumps) {
    let mut shutdown_rx = shared.shutdown_tx.subscribe();
    let mut backoff = shared.config.reconnect_backoff();

    loop {
        info!("creating transport");
        let error = serve_transport(
            &shared,
            &mut middleman,
            &mut pumps,
            &mut shutdown_rx,
        )
        .await;

        if matches!(error, TunnelError::Cancelled) || *shutdown_rx.borrow() {
            break;
        }
        warn!(%error, "transport stopped");

        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shutdown_rx.changed() => break,
        }
        backoff = (backoff * 2).min(shared.config.reconnect_backoff_max());
    }

    if let Err(error) = middleman.teardown().await {
        warn!(%error, "teardown middleman");
    }
}

/// Run one transport until its first error; returns that error
async fn serve_transport<M: Middleman>(
    shared: &Shared,
    middleman: &mut M,
    pumps: &mut Pumps,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> TunnelError {
    let (sink, stream) = match middleman.new_transport().await {
        Ok(transport) => transport,
        Err(error) => return error.into(),
    };

    let gather = GatherWriter::new(
        sink,
        shared.config.gather_max_delay(),
        middleman.write_space(),
        shared.config.gather_stats,
    );
    let mut writer = MuxWriter::new(gather, &shared.name, &shared.peer);
    let mut reader = MuxReader::new(GatherReader::new(stream));

    writer.attach(shared.event_tx.clone());
    shared.write_space.store(
        middleman.write_space().saturating_sub(writer.meta_length()),
        Ordering::SeqCst,
    );
    info!(write_space = shared.write_space.load(Ordering::SeqCst), "transport is working");

    let error = tokio::select! {
        error = push_pump(shared, &mut writer, &mut pumps.push_rx, &mut pumps.event_rx) => error,
        error = pull_pump(shared, &mut reader) => error,
        _ = shutdown_rx.changed() => TunnelError::Cancelled,
    };

    if let Err(close_error) = writer.close().await {
        debug!(error = %close_error, "close transport");
    }
    error
}

/// Sole writer to the carrier: drains bundles and carrier events
async fn push_pump(
    shared: &Shared,
    writer: &mut MuxWriter,
    push_rx: &mut mpsc::Receiver<Bundle>,
    event_rx: &mut mpsc::Receiver<Event>,
) -> TunnelError {
    loop {
        tokio::select! {
            bundle = push_rx.recv() => {
                let Some(bundle) = bundle else {
                    return TunnelError::ChannelClosed;
                };
                let head = bundle.tunnel.new_head(&shared.name, &shared.peer, bundle.command);
                debug!(head = %head, size = bundle.data.len(), "push packet");

                match writer.write_packet(&head, &bundle.data).await {
                    Ok(()) => {}
                    Err(error @ CarrierError::PayloadTooLarge { .. }) => {
                        // the submitter ignored the advertised write
                        // space; fail that flow, not the carrier
                        error!(head = %head, %error, "dropping oversized packet");
                    }
                    Err(error) => return error.into(),
                }
            }
            event = event_rx.recv() => {
                match event {
                    None => return TunnelError::ChannelClosed,
                    Some(Event::Exit) => return TunnelError::Cancelled,
                    Some(event) => {
                        if let Err(error) = writer.handle(event).await {
                            return error.into();
                        }
                    }
                }
            }
        }
    }
}

/// Sole reader of the carrier: routes packets to tunnels by command
async fn pull_pump(shared: &Shared, reader: &mut MuxReader) -> TunnelError {
    loop {
        let (head, data) = match reader.read_packet().await {
            Ok(packet) => packet,
            Err(error) => return error.into(),
        };

        if head.to != shared.name {
            trace!(head = %head, "packet not addressed to us");
            continue;
        }

        debug!(head = %head, size = data.len(), "pull packet");

        // the responder has no flow tunnel until the Connect is served
        let tid = if head.cmd == Command::Connect {
            LISTENER_ID
        } else {
            head.tid.as_str()
        };

        // dispatch never blocks while the table is locked
        let mut tunnels = shared.tunnels.lock().expect("tunnel table lock");
        let Some(tunnel) = tunnels.get(tid).cloned() else {
            // raced a close
            continue;
        };

        match head.cmd {
            Command::Connect => tunnel.offer(data),
            Command::ConnectAck | Command::Forward => tunnel.pull(&head, data),
            Command::Close => {
                if let Ok(text) = std::str::from_utf8(&data) {
                    if let Ok(notice) = Disconnect::decode(text) {
                        debug!(tid = %tunnel.id(), error = ?notice.error, "peer closed tunnel");
                    }
                }
                if tunnels.remove(tunnel.id()).is_some() {
                    tunnel.close_pull();
                }
            }
            Command::Execute | Command::ExecuteAck => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tunnel_id_allocation() {
        let manager = Manager::new(TunnelConfig::default());
        assert_eq!(manager.new_initiator().id(), "000001");
        assert_eq!(manager.new_initiator().id(), "000002");
    }

    #[test]
    fn test_tunnel_id_wraps() {
        let manager = Manager::new(TunnelConfig::default());
        manager.shared.next_tunnel_id.store(999_998, Ordering::Relaxed);

        assert_eq!(manager.new_initiator().id(), "999999");
        // the counter wraps; "000000" is a valid fresh id
        assert_eq!(manager.new_initiator().id(), "000000");
        assert_eq!(manager.new_initiator().id(), "000001");
    }

    #[test]
    fn test_remove_is_idempotent() {
        let manager = Manager::new(TunnelConfig::default());
        let tunnel = manager.new_initiator();
        manager.remove(&tunnel);
        manager.remove(&tunnel);
    }

    #[test]
    fn test_write_space_before_transport() {
        let manager = Manager::new(TunnelConfig::default());
        assert_eq!(manager.write_space(), 0);
    }
}
