//! Control-message encoding
//!
//! OpenRequest / OpenResponse / Disconnect travel as CBOR (self-describing
//! binary, able to round-trip address types and error values), wrapped in
//! base64 so the blob embeds as a string inside the JSON routing
//! envelope.

use super::TunnelError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

/// A destination address; domains are kept unresolved because the
/// initiator typically cannot resolve the responder's internal names
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetAddr {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl TargetAddr {
    pub fn port(&self) -> u16 {
        match self {
            TargetAddr::Ip(addr) => addr.port(),
            TargetAddr::Domain(_, port) => *port,
        }
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ip(addr) => write!(f, "{}", addr),
            TargetAddr::Domain(host, port) => write!(f, "{}:{}", host, port),
        }
    }
}

/// An error value that survives the wire
///
/// Round-trips at least dial failures with the address that was tried,
/// generic I/O failures with their `ErrorKind` and OS error number, and
/// plain text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireError {
    /// The responder failed to dial the destination
    Dial {
        addr: String,
        kind: String,
        errno: Option<i32>,
        message: String,
    },
    /// A generic I/O failure
    Io {
        kind: String,
        errno: Option<i32>,
        message: String,
    },
    /// Anything else, carried as display text
    Message(String),
}

impl WireError {
    pub fn from_io(err: &std::io::Error) -> Self {
        WireError::Io {
            kind: format!("{:?}", err.kind()),
            errno: err.raw_os_error(),
            message: err.to_string(),
        }
    }

    pub fn dial(addr: &TargetAddr, err: &std::io::Error) -> Self {
        WireError::Dial {
            addr: addr.to_string(),
            kind: format!("{:?}", err.kind()),
            errno: err.raw_os_error(),
            message: err.to_string(),
        }
    }

    pub fn message(text: impl Into<String>) -> Self {
        WireError::Message(text.into())
    }

    fn kind_and_message(&self) -> (Option<&str>, &str) {
        match self {
            WireError::Dial { kind, message, .. } => (Some(kind), message),
            WireError::Io { kind, message, .. } => (Some(kind), message),
            WireError::Message(message) => (None, message),
        }
    }

    /// The destination refused the connection
    pub fn is_refused(&self) -> bool {
        let (kind, message) = self.kind_and_message();
        kind == Some("ConnectionRefused") || message.contains("refused")
    }

    /// The network towards the destination is unreachable
    pub fn is_net_unreachable(&self) -> bool {
        let (kind, message) = self.kind_and_message();
        kind == Some("NetworkUnreachable") || message.contains("network is unreachable")
    }
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireError::Dial { addr, message, .. } => {
                write!(f, "dial {}: {}", addr, message)
            }
            WireError::Io { message, .. } => f.write_str(message),
            WireError::Message(message) => f.write_str(message),
        }
    }
}

impl std::error::Error for WireError {}

/// Sent by the initiator inside a Connect
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenRequest {
    /// The SOCKS5 client behind the initiator; observational, shared so
    /// both peers log the same connection details
    pub client_addr: SocketAddr,
    /// The destination the responder must dial
    pub server_addr: TargetAddr,
}

/// Sent by the responder inside a ConnectAck
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenResponse {
    /// Local address the responder used to dial the destination
    pub bind_addr: Option<SocketAddr>,
    /// The resolved destination address
    pub server_addr: Option<SocketAddr>,
    pub error: Option<WireError>,
}

/// Sent inside a Close so the peer learns why the flow ended
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disconnect {
    pub error: Option<WireError>,
}

/// Envelope a Connect payload travels in: the tunnel id plus the encoded
/// [`OpenRequest`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectEnvelope {
    #[serde(rename = "tunnel")]
    pub tunnel_id: String,
    #[serde(rename = "socket")]
    pub connection: String,
}

fn encode<T: Serialize>(message: &T) -> Result<String, TunnelError> {
    let mut buf = Vec::new();
    ciborium::into_writer(message, &mut buf)
        .map_err(|e| TunnelError::Encode(e.to_string()))?;
    Ok(STANDARD.encode(buf))
}

fn decode<T: DeserializeOwned>(data: &str) -> Result<T, TunnelError> {
    let raw = STANDARD
        .decode(data)
        .map_err(|e| TunnelError::Decode(e.to_string()))?;
    ciborium::from_reader(raw.as_slice()).map_err(|e| TunnelError::Decode(e.to_string()))
}

impl OpenRequest {
    pub fn encode(&self) -> Result<String, TunnelError> {
        encode(self)
    }

    pub fn decode(data: &str) -> Result<Self, TunnelError> {
        decode(data)
    }
}

impl OpenResponse {
    pub fn encode(&self) -> Result<String, TunnelError> {
        encode(self)
    }

    pub fn decode(data: &str) -> Result<Self, TunnelError> {
        decode(data)
    }
}

impl Disconnect {
    pub fn encode(&self) -> Result<String, TunnelError> {
        encode(self)
    }

    pub fn decode(data: &str) -> Result<Self, TunnelError> {
        decode(data)
    }
}
