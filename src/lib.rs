//! # Sidedoor
//!
//! A covert SOCKS5 proxy tunnel that carries TCP flows over a pluggable,
//! possibly unreliable, possibly out-of-order, *narrow* application-layer
//! carrier (a chat room, a comment thread, an SSRF-reflective endpoint, a
//! plain socket, ...). Arbitrary TCP looks like innocuous traffic over the
//! chosen carrier while each flow is delivered byte-exact.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 SOCKS5 Front-end                     │
//! │        (CONNECT handling, reply code mapping)        │
//! ├─────────────────────────────────────────────────────┤
//! │                  Tunnel Layer                        │
//! │   (per-flow tunnels, reorder buffers, manager,       │
//! │    flow exchange, Connect/ConnectAck/Close control)  │
//! ├─────────────────────────────────────────────────────┤
//! │                 Multiplex Layer                      │
//! │        (JSON routing heads, peer addressing)         │
//! ├─────────────────────────────────────────────────────┤
//! │                  Gather Layer                        │
//! │   (LEN8 framing, batching under write space,         │
//! │    bounded flush delay)                              │
//! ├─────────────────────────────────────────────────────┤
//! │                 Carrier Layer                        │
//! │    (pluggable middlemen: TCP, in-memory channel,     │
//! │     optional base64 transform for text carriers)     │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod carrier;
pub mod config;
pub mod proxy;
pub mod tunnel;

pub use config::Config;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("carrier error: {0}")]
    Carrier(#[from] carrier::CarrierError),

    #[error("tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("proxy error: {0}")]
    Proxy(#[from] proxy::ProxyError),

    #[error("configuration error: {0}")]
    Config(String),
}
