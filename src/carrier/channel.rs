//! In-memory channel carrier
//!
//! Moves carrier messages over bounded tokio channels. Serves as the
//! loopback demo carrier and as the test double for everything above the
//! carrier boundary; tests can also drive the raw [`link`] endpoints to
//! inject reordered or duplicated messages.

use super::{
    Base64Sink, Base64Stream, CarrierError, MessageSink, MessageStream, Middleman,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Create a duplex pair of in-memory carrier endpoints
///
/// Everything sent on one side's sink arrives on the other side's stream.
/// `write_space` bounds the size of one message; `capacity` bounds how
/// many messages may be in flight per direction.
pub fn link(
    write_space: usize,
    capacity: usize,
) -> ((ChannelSink, ChannelStream), (ChannelSink, ChannelStream)) {
    let (a_tx, b_rx) = mpsc::channel(capacity);
    let (b_tx, a_rx) = mpsc::channel(capacity);
    (
        (
            ChannelSink {
                tx: Some(a_tx),
                write_space,
            },
            ChannelStream { rx: a_rx },
        ),
        (
            ChannelSink {
                tx: Some(b_tx),
                write_space,
            },
            ChannelStream { rx: b_rx },
        ),
    )
}

/// Write half of an in-memory carrier
pub struct ChannelSink {
    tx: Option<mpsc::Sender<Bytes>>,
    write_space: usize,
}

#[async_trait]
impl MessageSink for ChannelSink {
    async fn send(&mut self, message: Bytes) -> Result<(), CarrierError> {
        if message.len() > self.write_space {
            return Err(CarrierError::PayloadTooLarge {
                size: message.len(),
                limit: self.write_space,
            });
        }
        let tx = self.tx.as_ref().ok_or(CarrierError::Closed)?;
        tx.send(message).await.map_err(|_| CarrierError::Closed)
    }

    async fn close(&mut self) -> Result<(), CarrierError> {
        self.tx.take();
        Ok(())
    }
}

/// Read half of an in-memory carrier
pub struct ChannelStream {
    rx: mpsc::Receiver<Bytes>,
}

impl ChannelStream {
    /// Non-blocking receive, for tests asserting that nothing was sent
    pub fn try_recv(&mut self) -> Option<Bytes> {
        self.rx.try_recv().ok()
    }
}

#[async_trait]
impl MessageStream for ChannelStream {
    async fn recv(&mut self) -> Result<Bytes, CarrierError> {
        self.rx.recv().await.ok_or(CarrierError::Closed)
    }
}

/// Middleman handing out pre-provisioned in-memory transports
///
/// [`ChannelMiddleman::pair`] provisions one connected transport per
/// side; tests exercising carrier churn push replacement transports with
/// [`ChannelMiddleman::provision`]. When the queue is empty
/// `new_transport` fails and the manager backs off, exactly as with a
/// real carrier that cannot reconnect yet.
pub struct ChannelMiddleman {
    write_space: usize,
    text_mode: bool,
    transports: Mutex<VecDeque<(ChannelSink, ChannelStream)>>,
}

impl ChannelMiddleman {
    /// A middleman with no transport yet; `provision` endpoints before
    /// (or while) a manager serves it
    pub fn new(write_space: usize) -> Self {
        Self {
            write_space,
            text_mode: false,
            transports: Mutex::new(VecDeque::new()),
        }
    }

    /// A connected pair of middlemen moving raw binary messages
    pub fn pair(write_space: usize, capacity: usize) -> (Self, Self) {
        let (a, b) = link(write_space, capacity);
        (Self::with_transport(write_space, false, a), Self::with_transport(write_space, false, b))
    }

    /// A connected pair whose link only carries text: messages are
    /// base64-wrapped, and the advertised write space shrinks to
    /// `raw / 4 * 3`
    pub fn pair_text(raw_space: usize, capacity: usize) -> (Self, Self) {
        let (a, b) = link(raw_space, capacity);
        (
            Self::with_transport(raw_space, true, a),
            Self::with_transport(raw_space, true, b),
        )
    }

    fn with_transport(
        write_space: usize,
        text_mode: bool,
        transport: (ChannelSink, ChannelStream),
    ) -> Self {
        let middleman = Self {
            write_space,
            text_mode,
            transports: Mutex::new(VecDeque::new()),
        };
        middleman.provision(transport.0, transport.1);
        middleman
    }

    /// Queue a replacement transport for the next `new_transport` call
    pub fn provision(&self, sink: ChannelSink, stream: ChannelStream) {
        self.transports
            .lock()
            .expect("transport queue lock")
            .push_back((sink, stream));
    }
}

#[async_trait]
impl Middleman for ChannelMiddleman {
    async fn setup(&mut self) -> Result<(), CarrierError> {
        Ok(())
    }

    async fn teardown(&mut self) -> Result<(), CarrierError> {
        Ok(())
    }

    async fn new_transport(
        &mut self,
    ) -> Result<(Box<dyn MessageSink>, Box<dyn MessageStream>), CarrierError> {
        let (sink, stream) = self
            .transports
            .lock()
            .expect("transport queue lock")
            .pop_front()
            .ok_or(CarrierError::Closed)?;

        if self.text_mode {
            Ok((
                Box::new(Base64Sink::new(Box::new(sink))),
                Box::new(Base64Stream::new(Box::new(stream))),
            ))
        } else {
            Ok((Box::new(sink), Box::new(stream)))
        }
    }

    fn write_space(&self) -> usize {
        if self.text_mode {
            self.write_space / 4 * 3
        } else {
            self.write_space
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_link_roundtrip() {
        let ((mut a_sink, mut a_stream), (mut b_sink, mut b_stream)) = link(64, 4);

        a_sink.send(Bytes::from_static(b"to b")).await.unwrap();
        assert_eq!(&b_stream.recv().await.unwrap()[..], b"to b");

        b_sink.send(Bytes::from_static(b"to a")).await.unwrap();
        assert_eq!(&a_stream.recv().await.unwrap()[..], b"to a");
    }

    #[tokio::test]
    async fn test_write_space_enforced() {
        let ((mut a_sink, _), _) = link(4, 4);
        assert!(matches!(
            a_sink.send(Bytes::from_static(b"too big")).await,
            Err(CarrierError::PayloadTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn test_closed_sink_surfaces_on_stream() {
        let ((mut a_sink, _a_stream), (_b_sink, mut b_stream)) = link(64, 4);
        a_sink.close().await.unwrap();
        assert!(matches!(b_stream.recv().await, Err(CarrierError::Closed)));
    }

    #[tokio::test]
    async fn test_middleman_exhausts_transports() {
        let (mut a, _b) = ChannelMiddleman::pair(64, 4);
        assert!(a.new_transport().await.is_ok());
        assert!(matches!(
            a.new_transport().await,
            Err(CarrierError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_text_mode_write_space() {
        let (a, _b) = ChannelMiddleman::pair_text(4096, 4);
        assert_eq!(a.write_space(), 4096 / 4 * 3);
    }
}
