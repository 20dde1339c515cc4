// ============================================
// File: crates/vpngate-transport/src/net.rs
// ============================================
//! # Socket Helpers
//!
//! Outbound TCP connections for long-lived tunnels. Tunnels can sit idle
//! for hours (an SSH session with nothing typed), so keepalive is turned
//! on to let dead peers be noticed by the kernel.
//!
//! ## Last Modified
//! v0.3.0 - Keepalive connect for tunnel forwarding

use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::error::{Result, TransportError};

/// Idle time before the first keepalive probe.
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(60);

/// Enables TCP keepalive and disables Nagle on an established stream.
///
/// # Errors
/// `Io` if the socket options cannot be set.
pub fn configure_tunnel_socket(stream: &TcpStream, keepalive: Duration) -> Result<()> {
    let sock = SockRef::from(stream);
    let params = TcpKeepalive::new()
        .with_time(keepalive)
        .with_interval(keepalive / 4);
    sock.set_tcp_keepalive(&params)
        .map_err(|e| TransportError::io("setting TCP keepalive", e))?;
    stream
        .set_nodelay(true)
        .map_err(|e| TransportError::io("setting TCP_NODELAY", e))?;
    trace!(keepalive_secs = keepalive.as_secs(), "Tunnel socket configured");
    Ok(())
}

/// Connects to `host:port` and configures the socket for tunnelling.
///
/// # Errors
/// `ConnectFailed` if no address accepted the connection.
pub async fn connect_tunnel(host: &str, port: u16, keepalive: Duration) -> Result<TcpStream> {
    let stream = TcpStream::connect((host, port))
        .await
        .map_err(|e| TransportError::connect_failed(format!("{host}:{port}"), e.to_string()))?;
    configure_tunnel_socket(&stream, keepalive)?;
    debug!(host, port, "Tunnel connection established");
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connect_tunnel_sets_keepalive() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let stream = connect_tunnel("127.0.0.1", port, DEFAULT_KEEPALIVE).await.unwrap();
        assert!(SockRef::from(&stream).keepalive().unwrap());
        assert!(stream.nodelay().unwrap());
    }

    #[tokio::test]
    async fn test_connect_tunnel_refused() {
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };
        let err = connect_tunnel("127.0.0.1", port, DEFAULT_KEEPALIVE).await.unwrap_err();
        assert!(matches!(err, TransportError::ConnectFailed { .. }));
    }
}
