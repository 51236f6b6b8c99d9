//! Batching/gather layer
//!
//! Packs many small logical packets into one carrier message up to
//! `write_space`, with a bounded flush delay, amortizing the per-message
//! carrier overhead. Each packet is framed as `LEN8 || bytes` where LEN8
//! is the 8-digit upper-case zero-padded hex length, so the reader can
//! split a received message back into packets.
//!
//! The delay timer runs as a spawned task that submits
//! [`Event::FlushDelay`] on the shared channel; the push pump hands it
//! back via [`GatherWriter::handle`] so the flush executes on the writer
//! task. A generation counter makes timers for already-flushed messages
//! harmless.

use super::{CarrierError, Event, EventSender, MessageSink, MessageStream};
use bytes::{BufMut, Bytes, BytesMut};
use std::time::Duration;
use tracing::info;

/// Length prefix width: 8 ASCII hex digits
pub const LEN_PREFIX: usize = 8;

/// Write half of the gather layer; owns the carrier sink
pub struct GatherWriter {
    sink: Box<dyn MessageSink>,
    max_delay: Duration,
    write_space: usize,
    pending: BytesMut,
    packed: usize,
    generation: u64,
    events: Option<EventSender>,
    stats: Option<GatherStats>,
}

impl GatherWriter {
    pub fn new(
        sink: Box<dyn MessageSink>,
        max_delay: Duration,
        write_space: usize,
        stats: bool,
    ) -> Self {
        Self {
            sink,
            max_delay,
            write_space,
            pending: BytesMut::with_capacity(write_space),
            packed: 0,
            generation: 0,
            events: None,
            stats: stats.then(GatherStats::default),
        }
    }

    /// Meta length of this layer: the LEN8 prefix
    pub fn meta_length(&self) -> usize {
        LEN_PREFIX
    }

    pub fn attach(&mut self, events: EventSender) {
        self.events = Some(events.clone());
        self.sink.attach(events);
    }

    /// Append one logical packet, flushing the pending carrier message
    /// when capacity requires it
    pub async fn write_packet(&mut self, packet: &[u8]) -> Result<(), CarrierError> {
        if LEN_PREFIX + packet.len() > self.write_space {
            return Err(CarrierError::PayloadTooLarge {
                size: packet.len(),
                limit: self.write_space.saturating_sub(LEN_PREFIX),
            });
        }

        if self.pending.len() + LEN_PREFIX + packet.len() > self.write_space {
            self.flush().await?;
        }

        if self.pending.is_empty() {
            self.arm_delay();
        }

        let mut prefix = [0u8; LEN_PREFIX];
        write_len_prefix(&mut prefix, packet.len());
        self.pending.put_slice(&prefix);
        self.pending.put_slice(packet);
        self.packed += 1;

        if self.pending.len() == self.write_space {
            self.flush().await?;
        }

        Ok(())
    }

    /// Send the pending carrier message now; a no-op when nothing is
    /// pending
    pub async fn flush(&mut self) -> Result<(), CarrierError> {
        if self.pending.is_empty() {
            return Ok(());
        }

        let message = self.pending.split().freeze();
        if let Some(stats) = &mut self.stats {
            stats.record(self.packed);
        }
        self.packed = 0;

        self.sink.send(message).await
    }

    pub async fn handle(&mut self, event: Event) -> Result<(), CarrierError> {
        match event {
            Event::FlushDelay { generation } if generation == self.generation => {
                self.flush().await
            }
            // a timer for a message that already went out
            Event::FlushDelay { .. } => Ok(()),
            other => self.sink.handle(other).await,
        }
    }

    pub async fn close(&mut self) -> Result<(), CarrierError> {
        let flushed = self.flush().await;
        if let Some(stats) = &self.stats {
            stats.dump();
        }
        self.sink.close().await?;
        flushed
    }

    fn arm_delay(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        let Some(events) = self.events.clone() else {
            return;
        };
        let generation = self.generation;
        let delay = self.max_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(Event::FlushDelay { generation }).await;
        });
    }
}

fn write_len_prefix(buf: &mut [u8; LEN_PREFIX], len: usize) {
    const DIGITS: &[u8; 16] = b"0123456789ABCDEF";
    let mut len = len;
    for slot in buf.iter_mut().rev() {
        *slot = DIGITS[len & 0xF];
        len >>= 4;
    }
}

/// Read half of the gather layer; owns the carrier stream
pub struct GatherReader {
    stream: Box<dyn MessageStream>,
    current: Bytes,
}

impl GatherReader {
    pub fn new(stream: Box<dyn MessageStream>) -> Self {
        Self {
            stream,
            current: Bytes::new(),
        }
    }

    /// Return the next logical packet, pulling further carrier messages
    /// as the current one is exhausted
    pub async fn read_packet(&mut self) -> Result<Bytes, CarrierError> {
        while self.current.is_empty() {
            self.current = self.stream.recv().await?;
        }

        if self.current.len() < LEN_PREFIX {
            return Err(CarrierError::Frame(format!(
                "length prefix truncated to {} bytes",
                self.current.len()
            )));
        }

        let prefix = self.current.split_to(LEN_PREFIX);
        let text = std::str::from_utf8(&prefix)
            .map_err(|_| CarrierError::Frame("length prefix is not ASCII".into()))?;
        let length = usize::from_str_radix(text, 16)
            .map_err(|_| CarrierError::Frame(format!("bad length prefix {:?}", text)))?;

        if self.current.len() < length {
            return Err(CarrierError::Frame(format!(
                "packet of {} bytes truncated to {}",
                length,
                self.current.len()
            )));
        }

        Ok(self.current.split_to(length))
    }
}

/// Packets-per-flush histogram, dumped on transport close
#[derive(Default)]
struct GatherStats {
    times_per_count: Vec<u64>,
}

impl GatherStats {
    fn record(&mut self, packed: usize) {
        if self.times_per_count.len() <= packed {
            self.times_per_count.resize(packed + 1, 0);
        }
        self.times_per_count[packed] += 1;
    }

    fn dump(&self) {
        for (count, times) in self.times_per_count.iter().enumerate() {
            if *times > 0 {
                info!(packets = count, flushes = times, "gather statistics");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::carrier::link;
    use tokio::sync::mpsc;

    fn gather_pair(
        write_space: usize,
        max_delay: Duration,
    ) -> (GatherWriter, GatherReader) {
        let ((a_sink, _a_stream), (_b_sink, b_stream)) = link(write_space, 8);
        (
            GatherWriter::new(Box::new(a_sink), max_delay, write_space, false),
            GatherReader::new(Box::new(b_stream)),
        )
    }

    #[test]
    fn test_len_prefix_format() {
        let mut buf = [0u8; LEN_PREFIX];
        write_len_prefix(&mut buf, 0);
        assert_eq!(&buf, b"00000000");
        write_len_prefix(&mut buf, 5);
        assert_eq!(&buf, b"00000005");
        write_len_prefix(&mut buf, 0xAB_CDEF);
        assert_eq!(&buf, b"00ABCDEF");
    }

    #[test]
    fn test_meta_length_is_the_prefix() {
        let ((a_sink, _a_stream), _) = link(64, 1);
        let writer =
            GatherWriter::new(Box::new(a_sink), Duration::from_millis(50), 64, false);
        assert_eq!(writer.meta_length(), 8);
    }

    #[tokio::test]
    async fn test_write_now_at_capacity() {
        // exactly filling write_space flushes without waiting for the delay
        let ((a_sink, _a_stream), (_b_sink, mut b_stream)) = link(64, 8);
        let mut writer = GatherWriter::new(
            Box::new(a_sink),
            Duration::from_secs(60),
            LEN_PREFIX + 5,
            false,
        );

        writer.write_packet(b"hello").await.unwrap();

        let message = b_stream.recv().await.unwrap();
        assert_eq!(&message[..], b"00000005hello");
    }

    #[tokio::test]
    async fn test_delayed_flush_via_event() {
        let ((a_sink, _a_stream), (_b_sink, mut b_stream)) = link(64, 8);
        let mut writer = GatherWriter::new(
            Box::new(a_sink),
            Duration::from_millis(20),
            64,
            false,
        );
        let (event_tx, mut event_rx) = mpsc::channel(8);
        writer.attach(event_tx);

        writer.write_packet(b"hello").await.unwrap();

        // nothing goes out until the timer event is handled
        assert!(b_stream.try_recv().is_none());

        let event = event_rx.recv().await.unwrap();
        writer.handle(event).await.unwrap();

        let message = b_stream.recv().await.unwrap();
        assert_eq!(&message[..], b"00000005hello");
    }

    #[tokio::test]
    async fn test_stale_delay_event_is_ignored() {
        let ((a_sink, _a_stream), (_b_sink, mut b_stream)) = link(64, 8);
        let mut writer = GatherWriter::new(
            Box::new(a_sink),
            Duration::from_millis(5),
            LEN_PREFIX + 5,
            false,
        );
        let (event_tx, mut event_rx) = mpsc::channel(8);
        writer.attach(event_tx);

        // fills write_space, so it flushes on its own
        writer.write_packet(b"hello").await.unwrap();
        assert_eq!(&b_stream.recv().await.unwrap()[..], b"00000005hello");

        // the timer still fires but must not produce another message
        let event = event_rx.recv().await.unwrap();
        writer.handle(event).await.unwrap();
        assert!(b_stream.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_gather_coalescing() {
        // two packets written back to back land in one carrier message,
        // in order, and read back as two logical packets
        let (mut writer, mut reader) = gather_pair(64, Duration::from_millis(100));

        writer.write_packet(b"hello").await.unwrap();
        writer.write_packet(b"world").await.unwrap();
        writer.flush().await.unwrap();

        assert_eq!(&reader.read_packet().await.unwrap()[..], b"hello");
        assert_eq!(&reader.read_packet().await.unwrap()[..], b"world");
    }

    #[tokio::test]
    async fn test_capacity_rolls_to_next_message() {
        // the second packet does not fit, so the first message is flushed
        // and the second opens a fresh one
        let write_space = LEN_PREFIX + 5 + LEN_PREFIX + 2;
        let ((a_sink, _a_stream), (_b_sink, mut b_stream)) = link(write_space, 8);
        let mut writer = GatherWriter::new(
            Box::new(a_sink),
            Duration::from_secs(60),
            write_space,
            false,
        );

        writer.write_packet(b"hello").await.unwrap();
        writer.write_packet(b"world").await.unwrap();
        writer.flush().await.unwrap();

        let first = b_stream.recv().await.unwrap();
        assert_eq!(&first[..], b"00000005hello");
        let second = b_stream.recv().await.unwrap();
        assert_eq!(&second[..], b"00000005world");
    }

    #[tokio::test]
    async fn test_oversize_rejected_without_flush() {
        let write_space = 32;
        let ((a_sink, _a_stream), (_b_sink, mut b_stream)) = link(write_space, 8);
        let mut writer = GatherWriter::new(
            Box::new(a_sink),
            Duration::from_secs(60),
            write_space,
            false,
        );

        let oversize = vec![b'X'; write_space - LEN_PREFIX + 1];
        assert!(matches!(
            writer.write_packet(&oversize).await,
            Err(CarrierError::PayloadTooLarge { .. })
        ));
        assert!(b_stream.try_recv().is_none());

        // a fitting packet still goes through afterwards
        writer.write_packet(b"ok").await.unwrap();
        writer.flush().await.unwrap();
        assert_eq!(&b_stream.recv().await.unwrap()[..], b"00000002ok");
    }

    #[tokio::test]
    async fn test_empty_packet_roundtrip() {
        let (mut writer, mut reader) = gather_pair(64, Duration::from_secs(60));

        writer.write_packet(b"").await.unwrap();
        writer.write_packet(b"next").await.unwrap();
        writer.flush().await.unwrap();

        assert!(reader.read_packet().await.unwrap().is_empty());
        assert_eq!(&reader.read_packet().await.unwrap()[..], b"next");
    }

    #[tokio::test]
    async fn test_read_across_messages() {
        let (mut writer, mut reader) = gather_pair(64, Duration::from_secs(60));

        writer.write_packet(b"first").await.unwrap();
        writer.flush().await.unwrap();
        writer.write_packet(b"second").await.unwrap();
        writer.flush().await.unwrap();

        assert_eq!(&reader.read_packet().await.unwrap()[..], b"first");
        assert_eq!(&reader.read_packet().await.unwrap()[..], b"second");
    }

    #[tokio::test]
    async fn test_malformed_length_prefix() {
        let ((a_sink, _a_stream), (_b_sink, b_stream)) = link(64, 8);
        let mut raw = a_sink;
        let mut reader = GatherReader::new(Box::new(b_stream));

        raw.send(Bytes::from_static(b"zzzzzzzzjunk")).await.unwrap();
        assert!(matches!(
            reader.read_packet().await,
            Err(CarrierError::Frame(_))
        ));
    }
}
