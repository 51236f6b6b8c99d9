//! Base64 transform layer for text-only carriers
//!
//! Wraps a sink/stream pair so every outgoing message is base64-encoded
//! and every incoming message decoded. Meta length is zero: the inflation
//! is the carrier's to account for by reporting a smaller `write_space`
//! (typically `raw / 4 * 3`).

use super::{CarrierError, Event, EventSender, MessageSink, MessageStream};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;

/// Base64-encoding write half
pub struct Base64Sink {
    inner: Box<dyn MessageSink>,
}

impl Base64Sink {
    pub fn new(inner: Box<dyn MessageSink>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl MessageSink for Base64Sink {
    async fn send(&mut self, message: Bytes) -> Result<(), CarrierError> {
        let encoded = STANDARD.encode(&message);
        self.inner.send(Bytes::from(encoded)).await
    }

    async fn close(&mut self) -> Result<(), CarrierError> {
        self.inner.close().await
    }

    fn attach(&mut self, events: EventSender) {
        self.inner.attach(events);
    }

    async fn handle(&mut self, event: Event) -> Result<(), CarrierError> {
        self.inner.handle(event).await
    }
}

/// Base64-decoding read half
pub struct Base64Stream {
    inner: Box<dyn MessageStream>,
}

impl Base64Stream {
    pub fn new(inner: Box<dyn MessageStream>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl MessageStream for Base64Stream {
    async fn recv(&mut self) -> Result<Bytes, CarrierError> {
        let message = self.inner.recv().await?;
        let decoded = STANDARD
            .decode(&message)
            .map_err(|e| CarrierError::Frame(format!("base64 decode: {}", e)))?;
        Ok(Bytes::from(decoded))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::carrier::link;

    #[tokio::test]
    async fn test_base64_roundtrip() {
        let ((a_sink, _a_stream), (_b_sink, b_stream)) = link(1024, 4);
        let mut sink = Base64Sink::new(Box::new(a_sink));
        let mut stream = Base64Stream::new(Box::new(b_stream));

        for data in [&b"ABC"[..], b"ABCD", b"ABCDE", b"", b"\x00\xff\x7f"] {
            sink.send(Bytes::copy_from_slice(data)).await.unwrap();
            let got = stream.recv().await.unwrap();
            assert_eq!(&got[..], data);
        }
    }

    #[tokio::test]
    async fn test_base64_rejects_garbage() {
        let ((a_sink, _a_stream), (_b_sink, b_stream)) = link(1024, 4);
        let mut raw = a_sink;
        let mut stream = Base64Stream::new(Box::new(b_stream));

        raw.send(Bytes::from_static(b"not!base64%")).await.unwrap();
        assert!(matches!(
            stream.recv().await,
            Err(CarrierError::Frame(_))
        ));
    }
}
