//! Routing/multiplex layer
//!
//! Prefixes each logical packet with a compact JSON routing head
//! `{"from","to","tid","cmd","mid"}` and parses it back on ingress. The
//! head budget (`meta_length`) is computed once from a maximal head so
//! the write space advertised upward stays stable.

use super::{CarrierError, Event, EventSender, GatherReader, GatherWriter};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Tunnel control commands, with stable wire names
///
/// `Execute` and `ExecuteAck` are reserved and ignored on receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    Connect,
    ConnectAck,
    Execute,
    ExecuteAck,
    Forward,
    Close,
}

impl Command {
    const ALL: [Command; 6] = [
        Command::Connect,
        Command::ConnectAck,
        Command::Execute,
        Command::ExecuteAck,
        Command::Forward,
        Command::Close,
    ];

    fn name(&self) -> &'static str {
        match self {
            Command::Connect => "Connect",
            Command::ConnectAck => "ConnectAck",
            Command::Execute => "Execute",
            Command::ExecuteAck => "ExecuteAck",
            Command::Forward => "Forward",
            Command::Close => "Close",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Routing head carried in front of every logical packet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketHead {
    /// Sending peer, omitted on the wire when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    /// Receiving peer; anything else than our own name is dropped
    pub to: String,
    /// Tunnel id: 6-digit zero-padded decimal, or "listener"
    pub tid: String,
    pub cmd: Command,
    /// 1-based monotonic sequence number per tunnel and direction
    pub mid: u64,
}

impl fmt::Display for PacketHead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        if let Some(from) = &self.from {
            write!(f, "from={},", from)?;
        }
        write!(
            f,
            "to={},tid={},cmd={},mid={}}}",
            self.to, self.tid, self.cmd, self.mid
        )
    }
}

/// Serialized length of the largest head these peer names can produce
fn max_head_length(self_name: &str, peer_name: &str) -> usize {
    let longest_command = Command::ALL
        .iter()
        .copied()
        .max_by_key(|c| c.name().len())
        .expect("commands are not empty");

    let longer_name = if self_name.len() >= peer_name.len() {
        self_name
    } else {
        peer_name
    };
    let max_head = PacketHead {
        from: Some(longer_name.to_string()),
        to: longer_name.to_string(),
        tid: "999999".to_string(),
        cmd: longest_command,
        mid: u64::MAX,
    };

    serde_json::to_vec(&max_head)
        .expect("head serialization cannot fail")
        .len()
}

/// Write half of the multiplex layer
pub struct MuxWriter {
    gather: GatherWriter,
    meta_length: usize,
}

impl MuxWriter {
    pub fn new(gather: GatherWriter, self_name: &str, peer_name: &str) -> Self {
        let meta_length = max_head_length(self_name, peer_name) + gather.meta_length();
        Self {
            gather,
            meta_length,
        }
    }

    /// Meta length of this layer plus all the lower ones
    pub fn meta_length(&self) -> usize {
        self.meta_length
    }

    pub fn attach(&mut self, events: EventSender) {
        self.gather.attach(events);
    }

    /// Write one logical packet: the head immediately followed by the
    /// payload, inside one gather frame
    pub async fn write_packet(
        &mut self,
        head: &PacketHead,
        payload: &[u8],
    ) -> Result<(), CarrierError> {
        let mut packet = serde_json::to_vec(head)
            .map_err(|e| CarrierError::Frame(format!("routing head encode: {}", e)))?;
        debug_assert!(
            packet.len() + self.gather.meta_length() <= self.meta_length,
            "head exceeds meta length budget"
        );
        packet.extend_from_slice(payload);
        self.gather.write_packet(&packet).await
    }

    pub async fn flush(&mut self) -> Result<(), CarrierError> {
        self.gather.flush().await
    }

    pub async fn handle(&mut self, event: Event) -> Result<(), CarrierError> {
        self.gather.handle(event).await
    }

    pub async fn close(&mut self) -> Result<(), CarrierError> {
        self.gather.close().await
    }
}

/// Read half of the multiplex layer
pub struct MuxReader {
    gather: GatherReader,
}

impl MuxReader {
    pub fn new(gather: GatherReader) -> Self {
        Self { gather }
    }

    /// Read one logical packet, splitting it into head and payload
    ///
    /// The streaming deserializer stops at the end of the JSON object, so
    /// whatever follows is the payload.
    pub async fn read_packet(&mut self) -> Result<(PacketHead, Bytes), CarrierError> {
        let packet = self.gather.read_packet().await?;

        let mut heads = serde_json::Deserializer::from_slice(&packet).into_iter::<PacketHead>();
        let head = match heads.next() {
            Some(Ok(head)) => head,
            Some(Err(e)) => {
                return Err(CarrierError::Frame(format!("routing head decode: {}", e)))
            }
            None => return Err(CarrierError::Frame("missing routing head".into())),
        };
        let offset = heads.byte_offset();

        let mut packet = packet;
        let payload = packet.split_off(offset);
        Ok((head, payload))
    }
}
