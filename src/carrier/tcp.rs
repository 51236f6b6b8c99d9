//! Plain TCP carrier
//!
//! The simplest real link: one TCP connection carrying discrete messages
//! as `u32` big-endian length-prefixed frames. The client side dials, the
//! server side accepts one peer per transport. A keepalive timer submits
//! [`Event::Ping`] on the event channel; the push pump hands it back to
//! the sink, which answers with an empty frame the reader silently skips.

use super::{CarrierError, Event, EventSender, MessageSink, MessageStream, Middleman};
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tracing::info;

/// Message payload capacity per frame
const WRITE_SPACE: usize = 16 * 1024;

/// Upper bound on an incoming frame before it is treated as garbage
const MAX_FRAME: usize = 16 * 1024 * 1024;

/// Keepalive period
const PING_PERIOD: Duration = Duration::from_secs(45);

enum Endpoint {
    Dial(String),
    Accept(String),
}

/// TCP middleman; reconnectable by dialing (or accepting) again
pub struct TcpMiddleman {
    endpoint: Endpoint,
    listener: Option<TcpListener>,
}

impl TcpMiddleman {
    /// Client side: dial `addr` for every transport
    pub fn dial(addr: impl Into<String>) -> Self {
        Self {
            endpoint: Endpoint::Dial(addr.into()),
            listener: None,
        }
    }

    /// Server side: bind `addr` once, accept one peer per transport
    pub fn accept(addr: impl Into<String>) -> Self {
        Self {
            endpoint: Endpoint::Accept(addr.into()),
            listener: None,
        }
    }
}

#[async_trait]
impl Middleman for TcpMiddleman {
    async fn setup(&mut self) -> Result<(), CarrierError> {
        if let Endpoint::Accept(addr) = &self.endpoint {
            let listener = TcpListener::bind(addr).await?;
            info!(%addr, "carrier listening");
            self.listener = Some(listener);
        }
        Ok(())
    }

    async fn teardown(&mut self) -> Result<(), CarrierError> {
        self.listener.take();
        Ok(())
    }

    async fn new_transport(
        &mut self,
    ) -> Result<(Box<dyn MessageSink>, Box<dyn MessageStream>), CarrierError> {
        let stream = match &self.endpoint {
            Endpoint::Dial(addr) => {
                let stream = TcpStream::connect(addr).await?;
                info!(%addr, "carrier connected");
                stream
            }
            Endpoint::Accept(_) => {
                let listener = self.listener.as_ref().ok_or(CarrierError::Closed)?;
                let (stream, peer) = listener.accept().await?;
                info!(%peer, "carrier peer connected");
                stream
            }
        };
        stream.set_nodelay(true).ok();

        let (read_half, write_half) = stream.into_split();
        Ok((
            Box::new(TcpSink {
                writer: write_half,
                ping_guard: None,
            }),
            Box::new(TcpSource { reader: read_half }),
        ))
    }

    fn write_space(&self) -> usize {
        WRITE_SPACE
    }
}

struct TcpSink {
    writer: OwnedWriteHalf,
    ping_guard: Option<oneshot::Sender<()>>,
}

impl TcpSink {
    async fn send_frame(&mut self, payload: &[u8]) -> Result<(), CarrierError> {
        let len = (payload.len() as u32).to_be_bytes();
        self.writer.write_all(&len).await?;
        self.writer.write_all(payload).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl MessageSink for TcpSink {
    async fn send(&mut self, message: Bytes) -> Result<(), CarrierError> {
        self.send_frame(&message).await
    }

    async fn close(&mut self) -> Result<(), CarrierError> {
        self.ping_guard.take();
        self.writer.shutdown().await.ok();
        Ok(())
    }

    fn attach(&mut self, events: EventSender) {
        let (guard_tx, mut guard_rx) = oneshot::channel();
        self.ping_guard = Some(guard_tx);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(PING_PERIOD) => {
                        if events.send(Event::Ping).await.is_err() {
                            return;
                        }
                    }
                    _ = &mut guard_rx => return,
                }
            }
        });
    }

    async fn handle(&mut self, event: Event) -> Result<(), CarrierError> {
        match event {
            Event::Ping => self.send_frame(&[]).await,
            _ => Ok(()),
        }
    }
}

struct TcpSource {
    reader: OwnedReadHalf,
}

#[async_trait]
impl MessageStream for TcpSource {
    async fn recv(&mut self) -> Result<Bytes, CarrierError> {
        loop {
            let mut len_buf = [0u8; 4];
            self.reader.read_exact(&mut len_buf).await.map_err(|e| {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    CarrierError::Closed
                } else {
                    CarrierError::Io(e)
                }
            })?;

            let len = u32::from_be_bytes(len_buf) as usize;
            if len > MAX_FRAME {
                return Err(CarrierError::Frame(format!("frame of {} bytes", len)));
            }
            // keepalive frame
            if len == 0 {
                continue;
            }

            let mut payload = vec![0u8; len];
            self.reader.read_exact(&mut payload).await?;
            return Ok(Bytes::from(payload));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tcp_carrier_roundtrip() {
        let mut server = TcpMiddleman::accept("127.0.0.1:0");
        server.setup().await.unwrap();
        let addr = server.listener.as_ref().unwrap().local_addr().unwrap();

        let accept = tokio::spawn(async move {
            let transport = server.new_transport().await.unwrap();
            (server, transport)
        });

        let mut client = TcpMiddleman::dial(addr.to_string());
        client.setup().await.unwrap();
        let (mut c_sink, mut c_stream) = client.new_transport().await.unwrap();
        let (_server, (mut s_sink, mut s_stream)) = accept.await.unwrap();

        c_sink.send(Bytes::from_static(b"hello")).await.unwrap();
        assert_eq!(&s_stream.recv().await.unwrap()[..], b"hello");

        s_sink.send(Bytes::from_static(b"world")).await.unwrap();
        assert_eq!(&c_stream.recv().await.unwrap()[..], b"world");
    }

    #[tokio::test]
    async fn test_keepalive_frame_skipped() {
        let mut server = TcpMiddleman::accept("127.0.0.1:0");
        server.setup().await.unwrap();
        let addr = server.listener.as_ref().unwrap().local_addr().unwrap();

        let accept = tokio::spawn(async move {
            let transport = server.new_transport().await.unwrap();
            (server, transport)
        });

        let mut client = TcpMiddleman::dial(addr.to_string());
        client.setup().await.unwrap();
        let (c_sink, _c_stream) = client.new_transport().await.unwrap();
        let (_server, (_s_sink, mut s_stream)) = accept.await.unwrap();

        let mut c_sink = c_sink;
        c_sink.handle(Event::Ping).await.unwrap();
        c_sink.send(Bytes::from_static(b"after ping")).await.unwrap();

        // the empty keepalive frame never surfaces
        assert_eq!(&s_stream.recv().await.unwrap()[..], b"after ping");
    }

    #[tokio::test]
    async fn test_peer_close_is_closed_error() {
        let mut server = TcpMiddleman::accept("127.0.0.1:0");
        server.setup().await.unwrap();
        let addr = server.listener.as_ref().unwrap().local_addr().unwrap();

        let accept = tokio::spawn(async move {
            let transport = server.new_transport().await.unwrap();
            (server, transport)
        });

        let mut client = TcpMiddleman::dial(addr.to_string());
        client.setup().await.unwrap();
        let (mut c_sink, _c_stream) = client.new_transport().await.unwrap();
        let (_server, (_s_sink, mut s_stream)) = accept.await.unwrap();

        c_sink.close().await.unwrap();
        assert!(matches!(s_stream.recv().await, Err(CarrierError::Closed)));
    }
}
