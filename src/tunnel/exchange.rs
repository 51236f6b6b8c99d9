//! Flow exchange: the two-pump bridge between a local socket and a
//! tunnel
//!
//! The push pump forwards socket reads as `Forward` bundles; the pull
//! pump writes delivered payloads back to the socket. Either side
//! finishing cancels the other. When the local side finishes first, a
//! `Close` bundle carrying the reason travels to the peer so it tears
//! down its half too. A shared idle clock closes flows that move no
//! bytes in either direction for the idle timeout.

use super::{Disconnect, Tunnel, TunnelError, WireError};
use crate::carrier::Command;
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{debug, error};

/// The local end of a flow: a byte reader, a byte writer, and the chunk
/// size for reads (normally the manager's write space)
pub struct SocketIo<R, W> {
    pub reader: R,
    pub writer: W,
    pub read_buffer_size: usize,
}

/// Bridge bytes between `socket` and `tunnel` until either side ends;
/// the first error observed is the result
pub async fn exchange<R, W>(
    tunnel: Arc<Tunnel>,
    socket: SocketIo<R, W>,
    idle_timeout: Duration,
) -> Result<(), TunnelError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    debug!(tid = %tunnel.id(), "tunnel opened");

    let last_active = Mutex::new(Instant::now());

    let result = tokio::select! {
        result = push_socket(&tunnel, socket.reader, socket.read_buffer_size, &last_active) => {
            // the local reader finished first; tell the peer why
            let notice = Disconnect {
                error: result.as_ref().err().map(wire_error),
            };
            match notice.encode() {
                Ok(encoded) => {
                    let _ = tunnel.push(Command::Close, Bytes::from(encoded)).await;
                }
                Err(encode_error) => {
                    error!(tid = %tunnel.id(), error = %encode_error, "encode disconnect");
                }
            }
            result
        }
        result = pull_socket(&tunnel, socket.writer, idle_timeout, &last_active) => result,
    };

    match &result {
        Ok(()) => debug!(tid = %tunnel.id(), "tunnel closed"),
        Err(error) => debug!(tid = %tunnel.id(), %error, "tunnel closed"),
    }
    result
}

/// Socket to tunnel: one `Forward` bundle per successful read
async fn push_socket<R>(
    tunnel: &Arc<Tunnel>,
    mut reader: R,
    buffer_size: usize,
    last_active: &Mutex<Instant>,
) -> Result<(), TunnelError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; buffer_size.max(1)];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        touch(last_active);

        tunnel
            .push(Command::Forward, Bytes::copy_from_slice(&buf[..n]))
            .await?;
    }
}

/// Tunnel to socket, with the idle timer
async fn pull_socket<W>(
    tunnel: &Arc<Tunnel>,
    mut writer: W,
    idle_timeout: Duration,
    last_active: &Mutex<Instant>,
) -> Result<(), TunnelError>
where
    W: AsyncWrite + Unpin,
{
    let mut pull_rx = tunnel.pull_rx.lock().await;
    loop {
        let deadline = *last_active.lock().expect("idle clock lock") + idle_timeout;
        tokio::select! {
            data = pull_rx.recv() => {
                match data {
                    Some(data) => {
                        writer.write_all(&data).await?;
                        writer.flush().await?;
                        touch(last_active);
                    }
                    // pull channel closed: the peer closed the tunnel
                    None => return Ok(()),
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                // the push side may have touched the clock since the
                // deadline was read
                if last_active.lock().expect("idle clock lock").elapsed() >= idle_timeout {
                    return Err(TunnelError::IdleTimeout);
                }
            }
        }
    }
}

fn touch(last_active: &Mutex<Instant>) {
    *last_active.lock().expect("idle clock lock") = Instant::now();
}

fn wire_error(error: &TunnelError) -> WireError {
    match error {
        TunnelError::Io(io_error) => WireError::from_io(io_error),
        other => WireError::message(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::carrier::PacketHead;
    use crate::tunnel::Bundle;
    use tokio::sync::mpsc;

    fn test_tunnel(
        push_chan_size: usize,
    ) -> (Arc<Tunnel>, mpsc::Receiver<Bundle>) {
        let (push_tx, push_rx) = mpsc::channel(push_chan_size);
        let tunnel = Tunnel::new(
            "000001".to_string(),
            push_tx,
            16,
            128,
            Duration::from_secs(30),
            1,
        );
        (tunnel, push_rx)
    }

    fn forward(mid: u64) -> PacketHead {
        PacketHead {
            from: Some("server".to_string()),
            to: "client".to_string(),
            tid: "000001".to_string(),
            cmd: Command::Forward,
            mid,
        }
    }

    #[tokio::test]
    async fn test_exchange_bridges_both_directions() {
        let (tunnel, mut push_rx) = test_tunnel(16);

        let (local, mut remote) = tokio::io::duplex(1024);
        let (reader, writer) = tokio::io::split(local);

        let exchange_tunnel = Arc::clone(&tunnel);
        let exchanging = tokio::spawn(async move {
            exchange(
                exchange_tunnel,
                SocketIo {
                    reader,
                    writer,
                    read_buffer_size: 1024,
                },
                Duration::from_secs(5),
            )
            .await
        });

        // socket to tunnel
        remote.write_all(b"outbound").await.unwrap();
        let bundle = push_rx.recv().await.unwrap();
        assert_eq!(bundle.command, Command::Forward);
        assert_eq!(&bundle.data[..], b"outbound");

        // tunnel to socket
        tunnel.pull(&forward(1), Bytes::from_static(b"inbound"));
        let mut got = [0u8; 7];
        remote.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"inbound");

        // local EOF ends the exchange and notifies the peer
        remote.shutdown().await.unwrap();
        let close = push_rx.recv().await.unwrap();
        assert_eq!(close.command, Command::Close);
        let notice =
            Disconnect::decode(std::str::from_utf8(&close.data).unwrap()).unwrap();
        assert_eq!(notice.error, None);

        assert!(exchanging.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_exchange_idle_timeout() {
        let (tunnel, _push_rx) = test_tunnel(16);

        let (local, _remote) = tokio::io::duplex(64);
        let (reader, writer) = tokio::io::split(local);

        let result = exchange(
            tunnel,
            SocketIo {
                reader,
                writer,
                read_buffer_size: 64,
            },
            Duration::from_millis(50),
        )
        .await;

        assert!(matches!(result, Err(TunnelError::IdleTimeout)));
    }

    #[tokio::test]
    async fn test_exchange_ends_on_peer_close() {
        let (tunnel, _push_rx) = test_tunnel(16);

        let (local, _remote) = tokio::io::duplex(64);
        let (reader, writer) = tokio::io::split(local);

        // the manager does this when a Close arrives
        tunnel.close_pull();

        let result = exchange(
            tunnel,
            SocketIo {
                reader,
                writer,
                read_buffer_size: 64,
            },
            Duration::from_secs(5),
        )
        .await;

        assert!(result.is_ok());
    }
}
