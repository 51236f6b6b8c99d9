//! Carrier abstraction and the decorator stack built on top of it
//!
//! A carrier moves discrete, opaque messages between the two peers. No
//! ordering or uniqueness is assumed across messages; the layers above
//! tolerate reordering and duplication. The stack, bottom up:
//!
//! - a concrete carrier ([`tcp`], [`channel`], ...) exposed as a
//!   [`MessageSink`] / [`MessageStream`] pair,
//! - optional transform layers ([`Base64Sink`] / [`Base64Stream`]) that
//!   re-encode whole messages for carriers restricted to text,
//! - the gather layer ([`GatherWriter`] / [`GatherReader`]) packing many
//!   logical packets into one carrier message under `write_space`,
//! - the multiplex layer ([`MuxWriter`] / [`MuxReader`]) adding the JSON
//!   routing head.
//!
//! Transform layers map sink to sink and stream to stream, while gather
//! and multiplex change the API type, so a transform cannot be stacked
//! above them. Exclusive ownership of the write half by a single task
//! replaces the original design's "one writer at a time" convention.

mod base64;
mod channel;
mod gather;
mod multiplex;
mod tcp;

pub use self::base64::{Base64Sink, Base64Stream};
pub use self::channel::{link, ChannelMiddleman, ChannelSink, ChannelStream};
pub use self::gather::{GatherReader, GatherWriter, LEN_PREFIX};
pub use self::multiplex::{Command, MuxReader, MuxWriter, PacketHead};
pub use self::tcp::TcpMiddleman;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

/// Carrier layer errors
#[derive(Debug, Error)]
pub enum CarrierError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("carrier closed")]
    Closed,

    #[error("malformed frame: {0}")]
    Frame(String),

    #[error("payload of {size} bytes exceeds write space of {limit}")]
    PayloadTooLarge { size: usize, limit: usize },
}

/// Asynchronous events executed on the writer task
///
/// Carrier-internal timers must not touch framing state from their own
/// tasks; instead they submit an event on the shared channel and the push
/// pump dispatches it down the decorator stack via
/// [`MessageSink::handle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// The gather delay elapsed for the message opened at `generation`
    FlushDelay { generation: u64 },
    /// Carrier keepalive tick
    Ping,
    /// Terminate the pump
    Exit,
}

/// Sender half of the shared event channel
pub type EventSender = mpsc::Sender<Event>;

/// A reconnectable source of carrier transports
#[async_trait]
pub trait Middleman: Send + Sync {
    /// Called once before the first transport
    async fn setup(&mut self) -> Result<(), CarrierError>;

    /// Called once after the last transport
    async fn teardown(&mut self) -> Result<(), CarrierError>;

    /// Establish a fresh transport, as a write half and a read half
    async fn new_transport(
        &mut self,
    ) -> Result<(Box<dyn MessageSink>, Box<dyn MessageStream>), CarrierError>;

    /// Payload capacity of one carrier message, after any encoding the
    /// carrier applies internally
    fn write_space(&self) -> usize;
}

/// Write half of a carrier: sends one discrete message at a time
#[async_trait]
pub trait MessageSink: Send {
    /// Send one carrier message of at most `write_space` bytes
    async fn send(&mut self, message: Bytes) -> Result<(), CarrierError>;

    /// Close the underlying link
    async fn close(&mut self) -> Result<(), CarrierError>;

    /// Provide the shared event channel; layers that run timers keep a
    /// clone and must forward the channel to the layer below
    fn attach(&mut self, _events: EventSender) {}

    /// Handle an event on the writer task; unrecognized events are passed
    /// to the layer below
    async fn handle(&mut self, _event: Event) -> Result<(), CarrierError> {
        Ok(())
    }
}

/// Read half of a carrier: yields one discrete message at a time
#[async_trait]
pub trait MessageStream: Send {
    /// Receive the next carrier message; fails with
    /// [`CarrierError::Closed`] when the link terminates
    async fn recv(&mut self) -> Result<Bytes, CarrierError>;
}
