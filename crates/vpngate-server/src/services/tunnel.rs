// ============================================
// File: crates/vpngate-server/src/services/tunnel.rs
// ============================================
//! # Tunnel Router
//!
//! ## Creation Reason
//! Users reach TCP ports on their devices through a CONNECT proxy. A
//! device's VPN session lives on exactly one gateway process, so the
//! proxy that receives the request either dials the device directly or
//! hands the request to the peer that owns the session.
//!
//! ## Main Functionality
//! - `TunnelRouter::authorize`: device lookup, access check, availability
//! - `TunnelRouter::route`: local dial vs. peer forward, with loop guards
//! - `TunnelRouter::serve`: accept loop that splices established tunnels
//! - `AccessCache`: short-lived cache of access decisions
//!
//! ## Request Pipeline
//! ```text
//! CONNECT <uuid>.balena:<port>
//!        │
//!        ▼
//! ┌──────────────┐ 400 / 403
//! │ parse head   │──────────►
//! └──────┬───────┘
//!        ▼
//! ┌──────────────┐ 404 not found / 407 denied / 503 not on VPN
//! │ authorize    │──────────►
//! └──────┬───────┘
//!        ▼
//! ┌──────────────┐  resolves   ┌──────────────┐
//! │ <uuid>.vpn ? │────────────►│ dial device  │
//! └──────┬───────┘             └──────────────┘
//!        │ no
//!        ▼
//! ┌──────────────┐ none / self / By=<us> already in chain → 500
//! │ owning peer  │──────────►
//! └──────┬───────┘
//!        ▼
//! ┌──────────────────────────┐ non-200 / early close → 500
//! │ CONNECT via peer, By+=us │──────────►
//! └──────┬───────────────────┘
//!        ▼
//!   200 + splice
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - The peer only ever sees `response_head(status)`. Error text stays in
//!   logs and the error reporter
//! - Self and loop checks run before any forwarding socket is opened
//! - Bytes that arrive after a head are never dropped: they are written
//!   through once the tunnel is up
//!
//! ## Last Modified
//! v0.3.0 - CONNECT tunnel routing between gateway instances

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use vpngate_common::ServiceId;
use vpngate_core::protocol::tunnel::{
    encode_forward_request, find_head_end, parse_status_line, response_head, ConnectRequest,
    ForwardedChain, TunnelRequest,
};
use vpngate_transport::net::{connect_tunnel, configure_tunnel_socket, DEFAULT_KEEPALIVE};

use crate::config::ProxyConfig;
use crate::error::TunnelError;
use crate::management::models::DeviceInfo;
use crate::management::reporting::{ErrorReporter, TUNNEL_ERROR};
use crate::management::DeviceDirectory;

/// How long a client may take to send its request head.
const HEAD_TIMEOUT: Duration = Duration::from_secs(30);

/// Access cache size above which expired entries are pruned.
const CACHE_PRUNE_THRESHOLD: usize = 4096;

// ============================================
// LocalResolver
// ============================================

/// Resolves `<uuid>.vpn` hosts served by this gateway.
#[async_trait]
pub trait LocalResolver: Send + Sync {
    /// Address of `host:port`, or `None` if it is not local.
    async fn resolve(&self, host: &str, port: u16) -> Option<SocketAddr>;
}

/// Resolver backed by the system resolver (hosts file maintained by
/// the VPN connect scripts).
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

#[async_trait]
impl LocalResolver for SystemResolver {
    async fn resolve(&self, host: &str, port: u16) -> Option<SocketAddr> {
        tokio::net::lookup_host((host, port)).await.ok()?.next()
    }
}

// ============================================
// AccessCache
// ============================================

type AccessKey = (u64, u16, Option<Vec<u8>>);

/// Caches access decisions per (device, port, credential).
#[derive(Debug)]
pub struct AccessCache {
    ttl: Duration,
    entries: DashMap<AccessKey, (bool, Instant)>,
}

impl AccessCache {
    /// Creates a cache; a zero `ttl` disables caching.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: DashMap::new(),
        }
    }

    fn get(&self, key: &AccessKey) -> Option<bool> {
        let entry = self.entries.get(key)?;
        let (allowed, at) = *entry;
        (at.elapsed() < self.ttl).then_some(allowed)
    }

    fn insert(&self, key: AccessKey, allowed: bool) {
        if self.ttl.is_zero() {
            return;
        }
        if self.entries.len() >= CACHE_PRUNE_THRESHOLD {
            let ttl = self.ttl;
            self.entries.retain(|_, (_, at)| at.elapsed() < ttl);
        }
        self.entries.insert(key, (allowed, Instant::now()));
    }

    /// Number of cached decisions, expired ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ============================================
// Route
// ============================================

/// Where an authorized tunnel goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// The device session is on this gateway.
    Local(SocketAddr),
    /// Forward to the peer gateway at `host`.
    Forward {
        /// Peer address
        host: String,
        /// Chain to send, already including this gateway
        chain: ForwardedChain,
    },
}

/// Result of reading an HTTP head.
enum HeadRead {
    Complete { head: Vec<u8>, rest: Vec<u8> },
    Closed,
    TooLarge,
}

async fn read_head<S: AsyncRead + Unpin>(stream: &mut S, max: usize) -> io::Result<HeadRead> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(HeadRead::Closed);
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(end) = find_head_end(&buf) {
            let rest = buf.split_off(end);
            return Ok(HeadRead::Complete { head: buf, rest });
        }
        if buf.len() > max {
            return Ok(HeadRead::TooLarge);
        }
    }
}

// ============================================
// TunnelRouter
// ============================================

/// Tunnel router settings.
#[derive(Debug, Clone)]
pub struct TunnelSettings {
    /// This gateway's registry id
    pub service_id: ServiceId,
    /// Port peers accept forwarded tunnels on
    pub forward_port: u16,
    /// Access decision lifetime
    pub access_cache_ttl: Duration,
    /// Largest request head accepted
    pub max_head_bytes: usize,
    /// Keepalive idle time on tunnel sockets
    pub keepalive: Duration,
}

impl TunnelSettings {
    /// Settings from the proxy configuration.
    #[must_use]
    pub fn from_config(config: &ProxyConfig, service_id: ServiceId) -> Self {
        Self {
            service_id,
            forward_port: config.forward_port,
            access_cache_ttl: config.access_cache_ttl(),
            max_head_bytes: config.max_request_head_bytes,
            keepalive: DEFAULT_KEEPALIVE,
        }
    }
}

/// An established upstream plus any bytes it already sent.
pub struct Upstream {
    /// Socket to the device or the peer gateway
    pub stream: TcpStream,
    /// Bytes received after the peer's response head
    pub early_data: Vec<u8>,
}

/// CONNECT proxy that routes tunnels to the gateway owning the device.
pub struct TunnelRouter {
    settings: TunnelSettings,
    directory: Arc<dyn DeviceDirectory>,
    resolver: Arc<dyn LocalResolver>,
    reporter: Arc<dyn ErrorReporter>,
    access: AccessCache,
}

impl TunnelRouter {
    /// Creates a router.
    pub fn new(
        settings: TunnelSettings,
        directory: Arc<dyn DeviceDirectory>,
        resolver: Arc<dyn LocalResolver>,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Self {
        let access = AccessCache::new(settings.access_cache_ttl);
        Self {
            settings,
            directory,
            resolver,
            reporter,
            access,
        }
    }

    /// Router settings.
    #[must_use]
    pub const fn settings(&self) -> &TunnelSettings {
        &self.settings
    }

    // ========================================
    // Phase 1: authorization
    // ========================================

    /// Checks that the device exists, the credential may reach the port,
    /// and the device is on the VPN.
    ///
    /// # Errors
    /// `DeviceNotFound`, `AccessDenied`, `DeviceUnavailable`, or
    /// `UpstreamApi` if the directory lookup fails.
    pub async fn authorize(&self, request: &TunnelRequest) -> Result<DeviceInfo, TunnelError> {
        let device = self
            .directory
            .get_device(&request.uuid)
            .await?
            .ok_or_else(|| TunnelError::DeviceNotFound(request.uuid.clone()))?;

        if !self.can_access(&device, request).await? {
            return Err(TunnelError::AccessDenied(request.uuid.clone()));
        }
        if !device.is_connected_to_vpn {
            return Err(TunnelError::DeviceUnavailable(request.uuid.clone()));
        }
        Ok(device)
    }

    async fn can_access(&self, device: &DeviceInfo, request: &TunnelRequest) -> Result<bool, TunnelError> {
        let key = (device.id, request.port, request.credential.clone());
        if let Some(allowed) = self.access.get(&key) {
            debug!(uuid = %request.uuid, allowed, "Access decision from cache");
            return Ok(allowed);
        }
        let allowed = self
            .directory
            .can_access(device, request.port, request.credential.as_deref())
            .await?;
        self.access.insert(key, allowed);
        Ok(allowed)
    }

    // ========================================
    // Phase 2: routing
    // ========================================

    /// Decides where the tunnel goes. Opens no sockets.
    ///
    /// # Errors
    /// `ServiceInstanceNotFound`, `SelfForwardDetected`, `LoopDetected`,
    /// or `UpstreamApi` if the registry lookup fails.
    pub async fn route(&self, request: &TunnelRequest) -> Result<Route, TunnelError> {
        let vpn_host = request.uuid.vpn_host();
        if let Some(addr) = self.resolver.resolve(&vpn_host, request.port).await {
            debug!(uuid = %request.uuid, %addr, "Device is local");
            return Ok(Route::Local(addr));
        }

        let host = self
            .directory
            .get_device_vpn_host(&request.uuid, request.credential.as_deref())
            .await?
            .ok_or_else(|| TunnelError::ServiceInstanceNotFound(request.uuid.clone()))?;

        let service_id = self.settings.service_id;
        if host.id == service_id {
            return Err(TunnelError::SelfForwardDetected(request.uuid.clone()));
        }
        if request.forwarded.contains(service_id) {
            return Err(TunnelError::LoopDetected(request.uuid.clone()));
        }

        let mut chain = request.forwarded.clone();
        chain.append(service_id);
        info!(
            uuid = %request.uuid,
            port = request.port,
            via = %host.ip_address,
            peer = %host.id,
            "Forwarding tunnel request"
        );
        Ok(Route::Forward {
            host: host.ip_address,
            chain,
        })
    }

    /// Opens the upstream for `route`.
    ///
    /// # Errors
    /// `RemoteTunneling` when a peer refuses or fails, `Internal` when a
    /// local device port cannot be reached.
    pub async fn connect(&self, request: &TunnelRequest, route: &Route) -> Result<Upstream, TunnelError> {
        match route {
            Route::Local(addr) => {
                let stream = TcpStream::connect(*addr).await.map_err(|e| {
                    TunnelError::Internal(format!("could not connect to {addr}: {e}"))
                })?;
                configure_tunnel_socket(&stream, self.settings.keepalive)
                    .map_err(|e| TunnelError::Internal(e.to_string()))?;
                info!(uuid = %request.uuid, port = request.port, "Connected to device");
                Ok(Upstream {
                    stream,
                    early_data: Vec::new(),
                })
            }
            Route::Forward { host, chain } => self.forward(request, host, chain).await,
        }
    }

    async fn forward(&self, request: &TunnelRequest, host: &str, chain: &ForwardedChain) -> Result<Upstream, TunnelError> {
        let target = format!("{}:{}", request.uuid, request.port);
        let remote = |reason: String| TunnelError::RemoteTunneling(format!("{target}: {reason}"));

        let mut stream = connect_tunnel(host, self.settings.forward_port, self.settings.keepalive)
            .await
            .map_err(|e| remote(format!("could not connect to vpn tunnel: {e}")))?;

        let head = encode_forward_request(&request.uuid, request.port, request.credential.as_deref(), chain);
        stream
            .write_all(head.as_bytes())
            .await
            .map_err(|e| remote(format!("could not send request: {e}")))?;

        let (response, early_data) = match read_head(&mut stream, self.settings.max_head_bytes).await {
            Ok(HeadRead::Complete { head, rest }) => (head, rest),
            Ok(HeadRead::Closed) => return Err(remote("tunneling socket closed prematurely".into())),
            Ok(HeadRead::TooLarge) => return Err(remote("response head too large".into())),
            Err(e) => return Err(remote(format!("could not read response: {e}"))),
        };

        let (status, line) = parse_status_line(&response).map_err(|e| remote(e.to_string()))?;
        if status != 200 {
            return Err(remote(line));
        }
        Ok(Upstream { stream, early_data })
    }

    /// Runs the whole pipeline for one request head.
    ///
    /// # Errors
    /// Any [`TunnelError`]; its `status_code()` is what the client gets.
    pub async fn establish(&self, head: &[u8]) -> Result<(TunnelRequest, Upstream), TunnelError> {
        let connect = ConnectRequest::parse(head)?;
        let request = TunnelRequest::from_connect(&connect)?;
        info!(uuid = %request.uuid, port = request.port, "Tunnel requested");

        self.authorize(&request).await?;
        let route = self.route(&request).await?;
        let upstream = self.connect(&request, &route).await?;
        Ok((request, upstream))
    }

    // ========================================
    // Serving
    // ========================================

    /// Accepts connections on `listener` until `shutdown` fires.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, mut shutdown: broadcast::Receiver<()>) {
        match listener.local_addr() {
            Ok(addr) => info!(%addr, service_id = %self.settings.service_id, "Tunnel listening"),
            Err(e) => warn!(error = %e, "Tunnel listening on unknown address"),
        }
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Tunnel listener stopping");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let router = Arc::clone(&self);
                        tokio::spawn(async move { router.handle_connection(stream, peer).await });
                    }
                    Err(e) => {
                        error!(error = %e, "Accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }
    }

    /// Serves one client connection to completion.
    pub async fn handle_connection(&self, mut client: TcpStream, peer: SocketAddr) {
        let read = tokio::time::timeout(HEAD_TIMEOUT, read_head(&mut client, self.settings.max_head_bytes)).await;
        let (head, rest) = match read {
            Ok(Ok(HeadRead::Complete { head, rest })) => (head, rest),
            Ok(Ok(HeadRead::TooLarge)) => {
                self.reject(&mut client, peer, &TunnelError::BadRequest("request head too large".into()))
                    .await;
                return;
            }
            Ok(Ok(HeadRead::Closed)) | Ok(Err(_)) | Err(_) => {
                debug!(%peer, "Client went away before sending a request");
                return;
            }
        };

        let (request, mut upstream) = match self.establish(&head).await {
            Ok(established) => established,
            Err(e) => {
                self.reject(&mut client, peer, &e).await;
                return;
            }
        };

        if let Err(e) = configure_tunnel_socket(&client, self.settings.keepalive) {
            debug!(%peer, error = %e, "Could not configure client socket");
        }
        if let Err(e) = self.start_splice(&mut client, &mut upstream, &rest).await {
            debug!(%peer, error = %e, "Tunnel setup write failed");
            return;
        }

        match tokio::io::copy_bidirectional(&mut client, &mut upstream.stream).await {
            Ok((up, down)) => debug!(uuid = %request.uuid, port = request.port, up, down, "Tunnel closed"),
            Err(e) => debug!(uuid = %request.uuid, port = request.port, error = %e, "Tunnel closed with error"),
        }
    }

    async fn start_splice(&self, client: &mut TcpStream, upstream: &mut Upstream, rest: &[u8]) -> io::Result<()> {
        client.write_all(response_head(200)).await?;
        if !upstream.early_data.is_empty() {
            client.write_all(&upstream.early_data).await?;
        }
        if !rest.is_empty() {
            upstream.stream.write_all(rest).await?;
        }
        Ok(())
    }

    async fn reject(&self, client: &mut TcpStream, peer: SocketAddr, err: &TunnelError) {
        match err {
            TunnelError::Internal(_) => {
                error!(%peer, "Unexpected tunnel error: {}", err);
                self.reporter.capture(err, TUNNEL_ERROR, &[("peer", peer.to_string())]);
            }
            TunnelError::RemoteTunneling(_) | TunnelError::UpstreamApi(_) => {
                warn!(%peer, "Tunneling error: {}", err);
            }
            _ => debug!(%peer, "Tunnel rejected: {}", err),
        }
        let _ = client.write_all(response_head(err.status_code())).await;
        let _ = client.shutdown().await;
    }
}

impl std::fmt::Debug for TunnelRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelRouter")
            .field("settings", &self.settings)
            .field("cached_decisions", &self.access.len())
            .finish_non_exhaustive()
    }
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use super::*;
    use crate::error::{Result, ServerError};
    use crate::management::models::VpnHost;
    use crate::management::reporting::testing::RecordingReporter;
    use vpngate_common::DeviceUuid;

    struct MockDirectory {
        device: Option<DeviceInfo>,
        allowed: bool,
        host: Option<VpnHost>,
        access_calls: AtomicUsize,
        host_calls: AtomicUsize,
        fail_lookup: bool,
    }

    impl MockDirectory {
        fn new(device: Option<DeviceInfo>, allowed: bool, host: Option<VpnHost>) -> Self {
            Self {
                device,
                allowed,
                host,
                access_calls: AtomicUsize::new(0),
                host_calls: AtomicUsize::new(0),
                fail_lookup: false,
            }
        }
    }

    #[async_trait]
    impl DeviceDirectory for MockDirectory {
        async fn get_device(&self, _uuid: &DeviceUuid) -> Result<Option<DeviceInfo>> {
            if self.fail_lookup {
                return Err(ServerError::upstream_status("device lookup", 502));
            }
            Ok(self.device)
        }

        async fn can_access(&self, _device: &DeviceInfo, _port: u16, _credential: Option<&[u8]>) -> Result<bool> {
            self.access_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.allowed)
        }

        async fn get_device_vpn_host(&self, _uuid: &DeviceUuid, _credential: Option<&[u8]>) -> Result<Option<VpnHost>> {
            self.host_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.host.clone())
        }
    }

    struct MockResolver(Option<SocketAddr>);

    #[async_trait]
    impl LocalResolver for MockResolver {
        async fn resolve(&self, host: &str, _port: u16) -> Option<SocketAddr> {
            assert!(host.ends_with(".vpn"));
            self.0
        }
    }

    /// Records every head a peer receives, answers with `reply`.
    struct FakePeer {
        heads: Mutex<Vec<String>>,
    }

    fn settings(service_id: u64, forward_port: u16) -> TunnelSettings {
        TunnelSettings {
            service_id: ServiceId(service_id),
            forward_port,
            access_cache_ttl: Duration::from_secs(5),
            max_head_bytes: 8192,
            keepalive: DEFAULT_KEEPALIVE,
        }
    }

    fn router(
        service_id: u64,
        forward_port: u16,
        directory: Arc<MockDirectory>,
        local: Option<SocketAddr>,
        reporter: Arc<RecordingReporter>,
    ) -> Arc<TunnelRouter> {
        Arc::new(TunnelRouter::new(
            settings(service_id, forward_port),
            directory,
            Arc::new(MockResolver(local)),
            reporter,
        ))
    }

    fn online() -> Option<DeviceInfo> {
        Some(DeviceInfo {
            id: 1,
            is_connected_to_vpn: true,
        })
    }

    fn request(head: &str) -> TunnelRequest {
        TunnelRequest::from_connect(&ConnectRequest::parse(head.as_bytes()).unwrap()).unwrap()
    }

    async fn echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = stream.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    async fn serve(router: Arc<TunnelRouter>) -> (SocketAddr, broadcast::Sender<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = broadcast::channel(1);
        tokio::spawn(router.serve(listener, rx));
        (addr, tx)
    }

    async fn fake_peer(reply: &'static [u8]) -> (u16, Arc<FakePeer>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let peer = Arc::new(FakePeer {
            heads: Mutex::new(Vec::new()),
        });
        let recorder = peer.clone();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                if let Ok(HeadRead::Complete { head, .. }) = read_head(&mut stream, 8192).await {
                    recorder.heads.lock().push(String::from_utf8_lossy(&head).into_owned());
                }
                let _ = stream.write_all(reply).await;
            }
        });
        (port, peer)
    }

    /// Sends a CONNECT head and returns the status line.
    async fn open(proxy: SocketAddr, head: &str) -> (TcpStream, String) {
        let mut stream = TcpStream::connect(proxy).await.unwrap();
        stream.write_all(head.as_bytes()).await.unwrap();
        let HeadRead::Complete { head, .. } = read_head(&mut stream, 8192).await.unwrap() else {
            panic!("no response head");
        };
        let (_, line) = parse_status_line(&head).unwrap();
        (stream, line)
    }

    #[tokio::test]
    async fn test_authorize_outcomes() {
        let reporter = Arc::new(RecordingReporter::default());
        let req = request("CONNECT deadbeef.balena:8080 HTTP/1.1\r\n\r\n");

        let r = router(1, 1, Arc::new(MockDirectory::new(None, true, None)), None, reporter.clone());
        assert_eq!(r.authorize(&req).await.unwrap_err().status_code(), 404);

        let r = router(1, 1, Arc::new(MockDirectory::new(online(), false, None)), None, reporter.clone());
        assert_eq!(r.authorize(&req).await.unwrap_err().status_code(), 407);

        let offline = Some(DeviceInfo {
            id: 1,
            is_connected_to_vpn: false,
        });
        let r = router(1, 1, Arc::new(MockDirectory::new(offline, true, None)), None, reporter.clone());
        assert_eq!(r.authorize(&req).await.unwrap_err().status_code(), 503);

        let mut failing = MockDirectory::new(online(), true, None);
        failing.fail_lookup = true;
        let r = router(1, 1, Arc::new(failing), None, reporter);
        let err = r.authorize(&req).await.unwrap_err();
        assert!(matches!(err, TunnelError::UpstreamApi(_)));
        assert_eq!(err.status_code(), 500);
    }

    #[tokio::test]
    async fn test_access_decisions_are_cached() {
        let directory = Arc::new(MockDirectory::new(online(), true, None));
        let r = router(1, 1, directory.clone(), None, Arc::new(RecordingReporter::default()));
        let req = request("CONNECT deadbeef.balena:22 HTTP/1.0\r\n\r\n");
        r.authorize(&req).await.unwrap();
        r.authorize(&req).await.unwrap();
        assert_eq!(directory.access_calls.load(Ordering::SeqCst), 1);

        let other_port = request("CONNECT deadbeef.balena:80 HTTP/1.0\r\n\r\n");
        r.authorize(&other_port).await.unwrap();
        assert_eq!(directory.access_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_route_local_self_and_loop() {
        let reporter = Arc::new(RecordingReporter::default());
        let local: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let req = request("CONNECT deadbeef.balena:8080 HTTP/1.0\r\n\r\n");

        let directory = Arc::new(MockDirectory::new(online(), true, None));
        let r = router(7, 1, directory.clone(), Some(local), reporter.clone());
        assert_eq!(r.route(&req).await.unwrap(), Route::Local(local));
        assert_eq!(directory.host_calls.load(Ordering::SeqCst), 0);

        // Registry points back at us
        let me = Some(VpnHost {
            id: ServiceId(7),
            ip_address: "10.0.0.7".into(),
        });
        let r = router(7, 1, Arc::new(MockDirectory::new(online(), true, me)), None, reporter.clone());
        let err = r.route(&req).await.unwrap_err();
        assert!(matches!(err, TunnelError::SelfForwardDetected(_)));
        assert_eq!(err.status_code(), 500);

        let peer = Some(VpnHost {
            id: ServiceId(8),
            ip_address: "10.0.0.8".into(),
        });
        let r = router(7, 1, Arc::new(MockDirectory::new(online(), true, peer)), None, reporter.clone());

        // Already forwarded by us once
        let looped = request("CONNECT deadbeef.balena:8080 HTTP/1.0\r\nForwarded: By=8,By=7\r\n\r\n");
        let err = r.route(&looped).await.unwrap_err();
        assert!(matches!(err, TunnelError::LoopDetected(_)));

        let Route::Forward { host, chain } = r.route(&req).await.unwrap() else {
            panic!("expected forward");
        };
        assert_eq!(host, "10.0.0.8");
        assert_eq!(chain.to_header_value(), "By=7");

        let r = router(7, 1, Arc::new(MockDirectory::new(online(), true, None)), None, reporter);
        assert!(matches!(
            r.route(&req).await.unwrap_err(),
            TunnelError::ServiceInstanceNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_local_tunnel_end_to_end() {
        let echo = echo_server().await;
        let reporter = Arc::new(RecordingReporter::default());
        let r = router(1, 1, Arc::new(MockDirectory::new(online(), true, None)), Some(echo), reporter);
        let (proxy, _shutdown) = serve(r).await;

        let (mut stream, line) = open(proxy, "CONNECT deadbeef.balena:8080 HTTP/1.0\r\n\r\n").await;
        assert_eq!(line, "HTTP/1.0 200 Connection Established");

        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_forward_through_peer_gateway() {
        let echo = echo_server().await;
        let reporter = Arc::new(RecordingReporter::default());

        // Gateway 2 owns the device
        let owner = router(2, 1, Arc::new(MockDirectory::new(online(), true, None)), Some(echo), reporter.clone());
        let (owner_addr, _owner_shutdown) = serve(owner).await;

        // Gateway 1 forwards to gateway 2's forward port
        let host = Some(VpnHost {
            id: ServiceId(2),
            ip_address: "127.0.0.1".into(),
        });
        let entry = router(1, owner_addr.port(), Arc::new(MockDirectory::new(online(), true, host)), None, reporter.clone());
        let (entry_addr, _entry_shutdown) = serve(entry).await;

        let (mut stream, line) = open(entry_addr, "CONNECT deadbeef.balena:22 HTTP/1.0\r\n\r\n").await;
        assert_eq!(line, "HTTP/1.0 200 Connection Established");
        stream.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        assert!(reporter.fingerprints().is_empty());
    }

    #[tokio::test]
    async fn test_forward_sends_chain_and_credential() {
        let (port, peer) = fake_peer(b"HTTP/1.0 200 Connection Established\r\n\r\n").await;
        let host = Some(VpnHost {
            id: ServiceId(2),
            ip_address: "127.0.0.1".into(),
        });
        let r = router(1, port, Arc::new(MockDirectory::new(online(), true, host)), None, Arc::new(RecordingReporter::default()));

        // base64(":secret") from the client is forwarded unchanged
        let head = "CONNECT deadbeef.balena:22 HTTP/1.0\r\nProxy-Authorization: Basic OnNlY3JldA==\r\nForwarded: By=5\r\n\r\n";
        r.establish(head.as_bytes()).await.unwrap();

        let heads = peer.heads.lock().clone();
        assert_eq!(
            heads,
            vec!["CONNECT deadbeef.balena:22 HTTP/1.0\r\nProxy-Authorization: Basic OnNlY3JldA==\r\nForwarded: By=5,By=1\r\n\r\n"]
        );
    }

    #[tokio::test]
    async fn test_peer_refusal_is_remote_tunneling_error() {
        let (port, _peer) = fake_peer(b"HTTP/1.0 503 Service Unavailable\r\n\r\n").await;
        let host = Some(VpnHost {
            id: ServiceId(2),
            ip_address: "127.0.0.1".into(),
        });
        let reporter = Arc::new(RecordingReporter::default());
        let r = router(1, port, Arc::new(MockDirectory::new(online(), true, host)), None, reporter.clone());

        match r.establish(b"CONNECT deadbeef.balena:22 HTTP/1.0\r\n\r\n").await {
            Err(TunnelError::RemoteTunneling(reason)) => {
                assert!(reason.contains("HTTP/1.0 503 Service Unavailable"));
            }
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("tunnel should fail"),
        }

        let (proxy, _shutdown) = serve(r).await;
        let (_, line) = open(proxy, "CONNECT deadbeef.balena:22 HTTP/1.0\r\n\r\n").await;
        assert_eq!(line, "HTTP/1.0 500 Internal Server Error");
        // handled errors are not reported
        assert!(reporter.fingerprints().is_empty());
    }

    #[tokio::test]
    async fn test_bad_requests_and_unexpected_errors() {
        let closed = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap()
        };
        let reporter = Arc::new(RecordingReporter::default());
        let r = router(1, 1, Arc::new(MockDirectory::new(online(), true, None)), Some(closed), reporter.clone());
        let (proxy, _shutdown) = serve(r).await;

        let (_, line) = open(proxy, "CONNECT example.com:443 HTTP/1.0\r\n\r\n").await;
        assert_eq!(line, "HTTP/1.0 403 Forbidden");

        let (_, line) = open(proxy, "GET / HTTP/1.0\r\n\r\n").await;
        assert_eq!(line, "HTTP/1.0 400 Bad Request");

        // Local device port refuses: opaque 500, reported
        let (_, line) = open(proxy, "CONNECT deadbeef.balena:8080 HTTP/1.0\r\n\r\n").await;
        assert_eq!(line, "HTTP/1.0 500 Internal Server Error");
        assert_eq!(reporter.fingerprints(), vec![TUNNEL_ERROR.to_string()]);
    }
}
