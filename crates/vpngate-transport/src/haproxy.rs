// ============================================
// File: crates/vpngate-transport/src/haproxy.rs
// ============================================
//! # HAProxy Runtime API Client
//!
//! ## Creation Reason
//! Each worker registers its OpenVPN port as a server slot in the local
//! HAProxy backend, and flips that slot to `drain` when shutting down.
//!
//! ## Main Functionality
//! - `HaproxyClient`: `LoadBalancer` over HAProxy's stats unix socket
//!
//! ## Wire Format
//! ```text
//! set server vpn-workers/vpn3 addr 127.0.0.1 port 10003\r\n
//! set server vpn-workers/vpn3 state ready\r\n
//! ```
//! Commands are written in one batch; HAProxy closes the connection
//! after answering, so the reply is read to EOF.
//!
//! ## Last Modified
//! v0.3.0 - Initial HAProxy client

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::{debug, info};

use crate::error::{Result, TransportError};
use crate::traits::{BackendState, LoadBalancer};

/// Client for the HAProxy runtime API on a unix socket.
#[derive(Debug, Clone)]
pub struct HaproxyClient {
    socket_path: PathBuf,
}

impl HaproxyClient {
    /// Creates a client for the socket at `socket_path`.
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    /// Socket path.
    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Sends `commands` in one write and returns HAProxy's reply.
    async fn send(&self, commands: &[String]) -> Result<String> {
        let path = self.socket_path.display().to_string();
        let mut stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|e| TransportError::connect_failed(&path, e.to_string()))?;

        let mut payload = commands.join("\r\n");
        payload.push_str("\r\n");
        stream
            .write_all(payload.as_bytes())
            .await
            .map_err(|e| TransportError::io(format!("writing to {path}"), e))?;
        stream.shutdown().await.ok();

        let mut reply = String::new();
        stream
            .read_to_string(&mut reply)
            .await
            .map_err(|e| TransportError::io(format!("reading from {path}"), e))?;
        debug!(socket = %path, reply = %reply.trim(), "HAProxy replied");
        Ok(reply)
    }
}

#[async_trait]
impl LoadBalancer for HaproxyClient {
    async fn register(&self, server: &str, host: &str, port: u16) -> Result<()> {
        self.send(&[
            format!("set server {server} addr {host} port {port}"),
            format!("set server {server} state {}", BackendState::Ready),
        ])
        .await?;
        info!(server, host, port, "Registered with HAProxy");
        Ok(())
    }

    async fn set_state(&self, server: &str, state: BackendState) -> Result<()> {
        self.send(&[format!("set server {server} state {state}")]).await?;
        info!(server, %state, "HAProxy server state changed");
        Ok(())
    }
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixListener;

    async fn capture_one(listener: UnixListener) -> String {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut received = String::new();
        stream.read_to_string(&mut received).await.unwrap();
        stream.write_all(b"\n").await.unwrap();
        received
    }

    #[tokio::test]
    async fn test_register_writes_addr_and_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("haproxy.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let server = tokio::spawn(capture_one(listener));

        let client = HaproxyClient::new(&path);
        client.register("vpn-workers/vpn2", "127.0.0.1", 10002).await.unwrap();

        assert_eq!(
            server.await.unwrap(),
            "set server vpn-workers/vpn2 addr 127.0.0.1 port 10002\r\n\
             set server vpn-workers/vpn2 state ready\r\n"
        );
    }

    #[tokio::test]
    async fn test_set_state_drain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("haproxy.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let server = tokio::spawn(capture_one(listener));

        HaproxyClient::new(&path)
            .set_state("vpn-workers/vpn1", BackendState::Drain)
            .await
            .unwrap();
        assert_eq!(server.await.unwrap(), "set server vpn-workers/vpn1 state drain\r\n");
    }

    #[tokio::test]
    async fn test_missing_socket() {
        let dir = tempfile::tempdir().unwrap();
        let client = HaproxyClient::new(dir.path().join("absent.sock"));
        let err = client
            .set_state("vpn-workers/vpn1", BackendState::Ready)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::ConnectFailed { .. }));
    }
}
