//! SOCKS5 proxy server (RFC 1928 subset)
//!
//! CONNECT only, no authentication. The success/failure reply is not
//! sent during negotiation: the handler forwards the request through the
//! tunnel and answers with the responder's verdict.

use super::ProxyError;
use crate::tunnel::{exchange, Manager, OpenRequest, SocketIo, TargetAddr, TunnelError};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

/// SOCKS5 version
const SOCKS_VERSION: u8 = 0x05;

/// Authentication methods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum AuthMethod {
    NoAuth = 0x00,
    NoAcceptable = 0xFF,
}

/// Address types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum AddressType {
    Ipv4 = 0x01,
    Domain = 0x03,
    Ipv6 = 0x04,
}

/// Reply codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reply {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

/// Map a tunnel failure to the closest SOCKS5 reply code
pub fn reply_for(error: &TunnelError) -> Reply {
    match error {
        TunnelError::Remote(wire) if wire.is_refused() => Reply::ConnectionRefused,
        TunnelError::Remote(wire) if wire.is_net_unreachable() => Reply::NetworkUnreachable,
        TunnelError::Remote(_) | TunnelError::ConnectTimeout => Reply::HostUnreachable,
        _ => Reply::GeneralFailure,
    }
}

/// Emit the reply byte sequence; a missing bind address becomes the
/// all-zero IPv4 address
pub async fn send_reply<W: AsyncWrite + Unpin>(
    writer: &mut W,
    reply: Reply,
    bind_addr: Option<SocketAddr>,
) -> std::io::Result<()> {
    let mut buf = vec![SOCKS_VERSION, reply as u8, 0x00];

    match bind_addr {
        Some(SocketAddr::V4(addr)) => {
            buf.push(AddressType::Ipv4 as u8);
            buf.extend_from_slice(&addr.ip().octets());
            buf.extend_from_slice(&addr.port().to_be_bytes());
        }
        Some(SocketAddr::V6(addr)) => {
            buf.push(AddressType::Ipv6 as u8);
            buf.extend_from_slice(&addr.ip().octets());
            buf.extend_from_slice(&addr.port().to_be_bytes());
        }
        None => {
            buf.push(AddressType::Ipv4 as u8);
            buf.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
        }
    }

    writer.write_all(&buf).await
}

/// SOCKS5 proxy server
pub struct Socks5Server {
    listener: TcpListener,
}

impl Socks5Server {
    /// Create a new SOCKS5 server
    pub async fn bind(addr: &str) -> Result<Self, ProxyError> {
        let listener = TcpListener::bind(addr).await?;
        info!("SOCKS5 server listening on {}", addr);

        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept and handle incoming connections
    ///
    /// The handler receives the negotiated connection and the requested
    /// destination; it owns the reply.
    pub async fn run<F, Fut>(&self, handler: F) -> Result<(), ProxyError>
    where
        F: Fn(TcpStream, TargetAddr) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = Result<(), ProxyError>> + Send,
    {
        loop {
            let (stream, peer_addr) = self.listener.accept().await?;
            debug!("new SOCKS5 connection from {}", peer_addr);

            let handler = handler.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, handler).await {
                    debug!("SOCKS5 connection error: {}", e);
                }
            });
        }
    }

    async fn handle_connection<F, Fut>(mut stream: TcpStream, handler: F) -> Result<(), ProxyError>
    where
        F: Fn(TcpStream, TargetAddr) -> Fut,
        Fut: Future<Output = Result<(), ProxyError>>,
    {
        let destination = negotiate(&mut stream).await?;
        handler(stream, destination).await
    }
}

/// Run the greeting and request phases, leaving the reply to the caller
async fn negotiate<S>(stream: &mut S) -> Result<TargetAddr, ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = [0u8; 260];

    // greeting
    stream.read_exact(&mut buf[..2]).await?;
    if buf[0] != SOCKS_VERSION {
        return Err(ProxyError::InvalidSocksVersion(buf[0]));
    }

    let nmethods = buf[1] as usize;
    stream.read_exact(&mut buf[..nmethods]).await?;

    let method = if buf[..nmethods].contains(&(AuthMethod::NoAuth as u8)) {
        AuthMethod::NoAuth
    } else {
        AuthMethod::NoAcceptable
    };
    stream.write_all(&[SOCKS_VERSION, method as u8]).await?;
    if method == AuthMethod::NoAcceptable {
        return Err(ProxyError::NoAcceptableAuth);
    }

    // request
    stream.read_exact(&mut buf[..4]).await?;
    if buf[0] != SOCKS_VERSION {
        return Err(ProxyError::InvalidSocksVersion(buf[0]));
    }

    let command = buf[1];
    // buf[2] is reserved
    let addr_type = buf[3];

    if command != 0x01 {
        // only CONNECT
        send_reply(stream, Reply::CommandNotSupported, None).await?;
        return Err(ProxyError::UnsupportedCommand(command));
    }

    let destination = match addr_type {
        t if t == AddressType::Ipv4 as u8 => {
            let mut ip = [0u8; 4];
            stream.read_exact(&mut ip).await?;
            let mut port_buf = [0u8; 2];
            stream.read_exact(&mut port_buf).await?;
            let port = u16::from_be_bytes(port_buf);
            TargetAddr::Ip(SocketAddr::from((ip, port)))
        }
        t if t == AddressType::Domain as u8 => {
            stream.read_exact(&mut buf[..1]).await?;
            let len = buf[0] as usize;
            stream.read_exact(&mut buf[..len]).await?;
            let domain = String::from_utf8_lossy(&buf[..len]).to_string();
            let mut port_buf = [0u8; 2];
            stream.read_exact(&mut port_buf).await?;
            let port = u16::from_be_bytes(port_buf);
            TargetAddr::Domain(domain, port)
        }
        t if t == AddressType::Ipv6 as u8 => {
            let mut ip = [0u8; 16];
            stream.read_exact(&mut ip).await?;
            let mut port_buf = [0u8; 2];
            stream.read_exact(&mut port_buf).await?;
            let port = u16::from_be_bytes(port_buf);
            TargetAddr::Ip(SocketAddr::from((ip, port)))
        }
        other => {
            send_reply(stream, Reply::AddressTypeNotSupported, None).await?;
            return Err(ProxyError::UnsupportedAddressType(other));
        }
    };

    Ok(destination)
}

/// Bridge one negotiated CONNECT through the tunnel engine
///
/// Opens an initiator tunnel, relays the responder's verdict as the
/// SOCKS5 reply, then exchanges bytes until the flow ends.
pub async fn bridge_connect(
    manager: Manager,
    stream: TcpStream,
    destination: TargetAddr,
) -> Result<(), ProxyError> {
    let client_addr = stream.peer_addr()?;
    debug!(client = %client_addr, dest = %destination, "SOCKS5 CONNECT via tunnel");

    let initiator = manager.new_initiator();
    let request = OpenRequest {
        client_addr,
        server_addr: destination,
    };

    let (reader, writer) = stream.into_split();
    let writer = Arc::new(tokio::sync::Mutex::new(writer));
    let reply_writer = Arc::clone(&writer);
    let exchange_manager = manager.clone();

    let result = initiator
        .open_and_serve(
            &request,
            move |bind_addr, open_error: Option<&TunnelError>| {
                let reply = match open_error {
                    None => Reply::Succeeded,
                    Some(error) => reply_for(error),
                };
                async move {
                    let mut writer = reply_writer.lock().await;
                    send_reply(&mut *writer, reply, bind_addr).await
                }
            },
            move |tunnel| async move {
                let mut writer = writer.lock().await;
                let socket = SocketIo {
                    reader,
                    writer: &mut *writer,
                    read_buffer_size: exchange_manager.write_space(),
                };
                exchange(tunnel, socket, exchange_manager.idle_timeout()).await
            },
        )
        .await;

    manager.remove(&initiator);
    if let Err(error) = &result {
        error!(client = %client_addr, %error, "tunnel flow failed");
    }
    result.map_err(ProxyError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::WireError;

    async fn negotiate_with(request: &[u8]) -> (Result<TargetAddr, ProxyError>, Vec<u8>) {
        let (mut local, mut remote) = tokio::io::duplex(512);
        local.write_all(request).await.unwrap();

        let result = negotiate(&mut remote).await;

        // whatever negotiate wrote is buffered in the duplex by now
        let mut replies = vec![0u8; 64];
        let n = tokio::time::timeout(
            std::time::Duration::from_millis(100),
            local.read(&mut replies),
        )
        .await
        .ok()
        .and_then(|r| r.ok())
        .unwrap_or(0);
        replies.truncate(n);
        (result, replies)
    }

    #[tokio::test]
    async fn test_negotiate_ipv4() {
        let mut request = vec![0x05, 0x01, 0x00]; // greeting, one method, no-auth
        request.extend_from_slice(&[0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0x1F, 0x90]);

        let (result, replies) = negotiate_with(&request).await;
        assert_eq!(
            result.unwrap(),
            TargetAddr::Ip("127.0.0.1:8080".parse().unwrap())
        );
        // method selection only; the CONNECT reply is deferred
        assert_eq!(replies, vec![0x05, 0x00]);
    }

    #[tokio::test]
    async fn test_negotiate_domain() {
        let mut request = vec![0x05, 0x01, 0x00];
        request.extend_from_slice(&[0x05, 0x01, 0x00, 0x03, 11]);
        request.extend_from_slice(b"example.com");
        request.extend_from_slice(&443u16.to_be_bytes());

        let (result, _) = negotiate_with(&request).await;
        assert_eq!(
            result.unwrap(),
            TargetAddr::Domain("example.com".to_string(), 443)
        );
    }

    #[tokio::test]
    async fn test_negotiate_rejects_bind() {
        let mut request = vec![0x05, 0x01, 0x00];
        request.extend_from_slice(&[0x05, 0x02, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);

        let (result, replies) = negotiate_with(&request).await;
        assert!(matches!(result, Err(ProxyError::UnsupportedCommand(0x02))));
        // method selection, then command-not-supported
        assert_eq!(replies[..2], [0x05, 0x00]);
        assert_eq!(replies[2..4], [0x05, 0x07]);
    }

    #[tokio::test]
    async fn test_send_reply_encoding() {
        let mut buf = Vec::new();
        send_reply(
            &mut buf,
            Reply::Succeeded,
            Some("10.1.2.3:4242".parse().unwrap()),
        )
        .await
        .unwrap();
        assert_eq!(buf, vec![0x05, 0x00, 0x00, 0x01, 10, 1, 2, 3, 0x10, 0x92]);

        let mut buf = Vec::new();
        send_reply(&mut buf, Reply::HostUnreachable, None).await.unwrap();
        assert_eq!(buf, vec![0x05, 0x04, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_reply_mapping() {
        let refused = TunnelError::Remote(WireError::Io {
            kind: "ConnectionRefused".to_string(),
            errno: Some(111),
            message: "connection refused".to_string(),
        });
        assert_eq!(reply_for(&refused), Reply::ConnectionRefused);

        let unreachable =
            TunnelError::Remote(WireError::message("connect: network is unreachable"));
        assert_eq!(reply_for(&unreachable), Reply::NetworkUnreachable);

        assert_eq!(
            reply_for(&TunnelError::ConnectTimeout),
            Reply::HostUnreachable
        );
        assert_eq!(
            reply_for(&TunnelError::ChannelClosed),
            Reply::GeneralFailure
        );
    }
}
