//! Proxy front-end
//!
//! The SOCKS5 server parses requests and hands the tunnel engine a
//! destination address plus the connection's reader and writer; the
//! engine's result decides the reply code.

mod socks5;

pub use socks5::{bridge_connect, reply_for, send_reply, Reply, Socks5Server};

use thiserror::Error;

/// Proxy errors
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid SOCKS version: {0}")]
    InvalidSocksVersion(u8),

    #[error("unsupported command: {0}")]
    UnsupportedCommand(u8),

    #[error("address type not supported: {0}")]
    UnsupportedAddressType(u8),

    #[error("no acceptable authentication method")]
    NoAcceptableAuth,

    #[error("tunnel failed: {0}")]
    Tunnel(#[from] crate::tunnel::TunnelError),
}
