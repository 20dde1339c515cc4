// ============================================
// File: crates/vpngate-core/src/protocol/tunnel.rs
// ============================================
//! # Tunnel Request Codec
//!
//! ## Creation Reason
//! Tunnel clients and peer gateways speak a minimal HTTP CONNECT dialect.
//! Parsing and encoding live here so the router only deals in typed
//! requests and status codes.
//!
//! ## Main Functionality
//! - `ConnectRequest`: parsed request head (target + headers)
//! - `TunnelTarget` / `TunnelRequest`: `<hex>.<balena|resin|vpn>[:port]`
//! - `ForwardedChain`: `By=<service-id>` tokens for loop detection
//! - `encode_forward_request`, `parse_status_line`, `response_head`
//!
//! ## Wire Format
//! ```text
//! CONNECT deadbeef.balena:22222 HTTP/1.0\r\n
//! Proxy-Authorization: Basic OmFwaWtleQ==\r\n     (optional)
//! Forwarded: By=3,By=7\r\n                        (optional)
//! \r\n
//! ────────────────────────────────────────────────
//! HTTP/1.0 200 Connection Established\r\n\r\n      (then raw bytes)
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - `ForwardedChain` is only ever used to detect loops; never derive
//!   trust or routing from it
//! - Credentials are raw bytes; never log them
//!
//! ## Last Modified
//! v0.3.0 - Initial tunnel codec

use std::fmt;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use tracing::warn;

use vpngate_common::{DeviceUuid, ServiceId};

use crate::error::{CoreError, Result};

// ============================================
// Constants
// ============================================

/// Port used when the target carries none.
pub const DEFAULT_TUNNEL_PORT: u16 = 80;

/// End of an HTTP head.
pub const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

// ============================================
// Responses
// ============================================

/// Fixed response head for a status code. Bodies are never sent, so
/// internal error text cannot leak to the peer.
#[must_use]
pub fn response_head(status: u16) -> &'static [u8] {
    match status {
        200 => b"HTTP/1.0 200 Connection Established\r\n\r\n",
        400 => b"HTTP/1.0 400 Bad Request\r\n\r\n",
        403 => b"HTTP/1.0 403 Forbidden\r\n\r\n",
        404 => b"HTTP/1.0 404 Not Found\r\n\r\n",
        407 => b"HTTP/1.0 407 Proxy Authorization Required\r\n\r\n",
        503 => b"HTTP/1.0 503 Service Unavailable\r\n\r\n",
        _ => b"HTTP/1.0 500 Internal Server Error\r\n\r\n",
    }
}

/// Returns the offset just past the `\r\n\r\n` head terminator.
#[must_use]
pub fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(HEAD_TERMINATOR.len())
        .position(|w| w == HEAD_TERMINATOR)
        .map(|pos| pos + HEAD_TERMINATOR.len())
}

/// Parses the status line of a response head, returning the code and the
/// literal line (kept for diagnostics).
///
/// # Errors
/// Returns `MalformedHead` if the line has no numeric status code.
pub fn parse_status_line(head: &[u8]) -> Result<(u16, String)> {
    let text = String::from_utf8_lossy(head);
    let line = text.split("\r\n").next().unwrap_or("").to_string();
    let code = line
        .split(' ')
        .nth(1)
        .and_then(|c| c.parse::<u16>().ok())
        .ok_or_else(|| CoreError::malformed_head(format!("bad status line '{line}'")))?;
    Ok((code, line))
}

// ============================================
// ConnectRequest
// ============================================

/// A parsed CONNECT request head.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    target: String,
    headers: Vec<(String, String)>,
}

impl ConnectRequest {
    /// Parses a complete head (including or excluding the terminator).
    ///
    /// # Errors
    /// - `MissingTarget` for an empty head or a request line without target
    /// - `MalformedHead` for a non-CONNECT method or a broken header line
    pub fn parse(head: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(head)
            .map_err(|_| CoreError::malformed_head("request head is not UTF-8"))?;
        let mut lines = text.split("\r\n");
        let request_line = lines.next().unwrap_or("").trim();
        if request_line.is_empty() {
            return Err(CoreError::missing_target("empty request"));
        }

        let mut parts = request_line.split_whitespace();
        let method = parts.next().unwrap_or("");
        if !method.eq_ignore_ascii_case("CONNECT") {
            return Err(CoreError::malformed_head(format!("unsupported method '{method}'")));
        }
        let target = parts
            .next()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| CoreError::missing_target("request line has no target"))?
            .to_string();

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| CoreError::malformed_head("header without ':'"))?;
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }

        Ok(Self { target, headers })
    }

    /// Raw request target (`host[:port]`).
    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Case-insensitive header lookup (first occurrence).
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// `Forwarded` header value, if present.
    #[must_use]
    pub fn forwarded(&self) -> Option<&str> {
        self.header("Forwarded")
    }

    /// Credential from `Proxy-Authorization: Basic`: the password part of
    /// the decoded value, or the whole value when it has no `:`.
    #[must_use]
    pub fn proxy_credential(&self) -> Option<Vec<u8>> {
        let value = self.header("Proxy-Authorization")?;
        let (scheme, encoded) = value.split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("Basic") {
            return None;
        }
        let decoded = BASE64.decode(encoded.trim()).ok()?;
        let credential = match decoded.iter().position(|&b| b == b':') {
            Some(pos) => decoded[pos + 1..].to_vec(),
            None => decoded,
        };
        (!credential.is_empty()).then_some(credential)
    }
}

impl fmt::Debug for ConnectRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // header values may hold credentials
        f.debug_struct("ConnectRequest")
            .field("target", &self.target)
            .field("headers", &self.headers.iter().map(|(n, _)| n).collect::<Vec<_>>())
            .finish()
    }
}

// ============================================
// TunnelTarget
// ============================================

/// Hostname suffix of a tunnel target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelSuffix {
    /// `.balena`
    Balena,
    /// `.resin` (deprecated alias)
    Resin,
    /// `.vpn` (internal form)
    Vpn,
}

/// A validated `<hex-uuid>.<suffix>[:port]` target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelTarget {
    /// Device uuid (hex digits only).
    pub uuid: DeviceUuid,
    /// Destination port on the device.
    pub port: u16,
    /// Suffix the client used.
    pub suffix: TunnelSuffix,
}

impl TunnelTarget {
    /// Parses a CONNECT authority.
    ///
    /// # Errors
    /// `MissingTarget` if empty, `InvalidHostname` on any pattern mismatch.
    ///
    /// # Example
    /// ```
    /// use vpngate_core::protocol::tunnel::{TunnelSuffix, TunnelTarget};
    ///
    /// let target = TunnelTarget::parse("deadbeef.balena:8080").unwrap();
    /// assert_eq!(target.uuid.as_str(), "deadbeef");
    /// assert_eq!(target.port, 8080);
    /// assert_eq!(target.suffix, TunnelSuffix::Balena);
    /// ```
    pub fn parse(authority: &str) -> Result<Self> {
        if authority.is_empty() {
            return Err(CoreError::missing_target("empty hostname"));
        }
        let invalid = || CoreError::invalid_hostname(authority);

        let (host, port) = match authority.split_once(':') {
            Some((host, port)) => {
                if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(invalid());
                }
                (host, port.parse::<u16>().map_err(|_| invalid())?)
            }
            None => (authority, DEFAULT_TUNNEL_PORT),
        };

        let (uuid, suffix) = host.split_once('.').ok_or_else(invalid)?;
        if uuid.is_empty() || !uuid.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(invalid());
        }
        let suffix = match suffix {
            "balena" => TunnelSuffix::Balena,
            "resin" => TunnelSuffix::Resin,
            "vpn" => TunnelSuffix::Vpn,
            _ => return Err(invalid()),
        };

        Ok(Self {
            uuid: DeviceUuid::new(uuid)?,
            port,
            suffix,
        })
    }

    /// Internal `<uuid>.vpn` host the device resolves to when local.
    #[must_use]
    pub fn vpn_host(&self) -> String {
        self.uuid.vpn_host()
    }
}

// ============================================
// TunnelRequest
// ============================================

/// Everything the router needs from one inbound CONNECT.
#[derive(Clone, PartialEq, Eq)]
pub struct TunnelRequest {
    /// Device uuid.
    pub uuid: DeviceUuid,
    /// Destination port.
    pub port: u16,
    /// Presented proxy credential, if any.
    pub credential: Option<Vec<u8>>,
    /// Incoming `Forwarded` chain.
    pub forwarded: ForwardedChain,
}

impl TunnelRequest {
    /// Builds a tunnel request from a parsed CONNECT head.
    ///
    /// # Errors
    /// Propagates [`TunnelTarget::parse`] errors.
    pub fn from_connect(request: &ConnectRequest) -> Result<Self> {
        let target = TunnelTarget::parse(request.target())?;
        if target.suffix == TunnelSuffix::Resin {
            warn!(uuid = %target.uuid, "'.resin' tld is deprecated, use '.balena'");
        }
        Ok(Self {
            uuid: target.uuid,
            port: target.port,
            credential: request.proxy_credential(),
            forwarded: ForwardedChain::parse(request.forwarded()),
        })
    }
}

impl fmt::Debug for TunnelRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelRequest")
            .field("uuid", &self.uuid)
            .field("port", &self.port)
            .field("credential", &self.credential.as_ref().map(|_| "<redacted>"))
            .field("forwarded", &self.forwarded)
            .finish()
    }
}

// ============================================
// ForwardedChain
// ============================================

/// Ordered `Forwarded` elements, one per hop. Elements are split on `,`
/// only; the `;` pairs inside an element stay together. Pairs are compared
/// whole, so `By=1` never matches `By=12`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForwardedChain {
    elements: Vec<String>,
}

impl ForwardedChain {
    /// Parses an optional header value.
    #[must_use]
    pub fn parse(header: Option<&str>) -> Self {
        let elements = header
            .unwrap_or("")
            .split(',')
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .map(str::to_string)
            .collect();
        Self { elements }
    }

    /// Signature token identifying one gateway process.
    #[must_use]
    pub fn signature(service_id: ServiceId) -> String {
        format!("By={service_id}")
    }

    /// Returns `true` if `service_id` already forwarded this request.
    #[must_use]
    pub fn contains(&self, service_id: ServiceId) -> bool {
        let signature = Self::signature(service_id);
        self.elements
            .iter()
            .flat_map(|e| e.split(';'))
            .any(|pair| pair.trim().eq_ignore_ascii_case(&signature))
    }

    /// Appends the signature of `service_id`.
    pub fn append(&mut self, service_id: ServiceId) {
        self.elements.push(Self::signature(service_id));
    }

    /// Number of hops in the chain.
    #[must_use]
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// Returns `true` if no gateway has forwarded this request yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Header value, comma separated.
    #[must_use]
    pub fn to_header_value(&self) -> String {
        self.elements.join(",")
    }
}

// ============================================
// Forward encoding
// ============================================

/// Encodes the request a gateway sends to the peer that owns a device.
///
/// # Example
/// ```
/// use vpngate_common::{DeviceUuid, ServiceId};
/// use vpngate_core::protocol::tunnel::{encode_forward_request, ForwardedChain};
///
/// let mut chain = ForwardedChain::default();
/// chain.append(ServiceId(3));
/// let uuid = DeviceUuid::new("deadbeef").unwrap();
/// let head = encode_forward_request(&uuid, 22, None, &chain);
/// assert_eq!(head, "CONNECT deadbeef.balena:22 HTTP/1.0\r\nForwarded: By=3\r\n\r\n");
/// ```
#[must_use]
pub fn encode_forward_request(
    uuid: &DeviceUuid,
    port: u16,
    credential: Option<&[u8]>,
    forwarded: &ForwardedChain,
) -> String {
    let mut head = format!("CONNECT {uuid}.balena:{port} HTTP/1.0\r\n");
    if let Some(credential) = credential {
        let mut basic = Vec::with_capacity(credential.len() + 1);
        basic.push(b':');
        basic.extend_from_slice(credential);
        head.push_str(&format!("Proxy-Authorization: Basic {}\r\n", BASE64.encode(basic)));
    }
    if !forwarded.is_empty() {
        head.push_str(&format!("Forwarded: {}\r\n", forwarded.to_header_value()));
    }
    head.push_str("\r\n");
    head
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_default_port_and_suffixes() {
        let t = TunnelTarget::parse("DEADbeef.resin").unwrap();
        assert_eq!(t.port, DEFAULT_TUNNEL_PORT);
        assert_eq!(t.suffix, TunnelSuffix::Resin);
        assert_eq!(t.vpn_host(), "DEADbeef.vpn");
        assert_eq!(TunnelTarget::parse("ab.vpn:1").unwrap().suffix, TunnelSuffix::Vpn);
    }

    #[test]
    fn test_target_rejects_bad_hostnames() {
        for host in [
            "deadbeef.com:80",
            "xyz.balena",
            ".balena",
            "deadbeef.balena:",
            "deadbeef.balena:70000",
            "deadbeef.balena:8o",
            "deadbeef.sub.balena",
            "deadbeef",
        ] {
            let err = TunnelTarget::parse(host).unwrap_err();
            assert!(matches!(err, CoreError::InvalidHostname { .. }), "{host}");
        }
        assert!(matches!(TunnelTarget::parse(""), Err(CoreError::MissingTarget { .. })));
    }

    #[test]
    fn test_connect_request_parse() {
        let head = b"CONNECT deadbeef.balena:8080 HTTP/1.1\r\nHost: x\r\nproxy-authorization: Basic dXNlcjpzZWNyZXQ=\r\nForwarded: By=3\r\n\r\n";
        let req = ConnectRequest::parse(head).unwrap();
        assert_eq!(req.target(), "deadbeef.balena:8080");
        assert_eq!(req.proxy_credential().as_deref(), Some(&b"secret"[..]));
        assert_eq!(req.forwarded(), Some("By=3"));

        let tunnel = TunnelRequest::from_connect(&req).unwrap();
        assert_eq!(tunnel.port, 8080);
        assert!(tunnel.forwarded.contains(ServiceId(3)));
    }

    #[test]
    fn test_connect_request_errors() {
        assert!(matches!(ConnectRequest::parse(b"\r\n\r\n"), Err(CoreError::MissingTarget { .. })));
        assert!(matches!(ConnectRequest::parse(b"CONNECT\r\n\r\n"), Err(CoreError::MissingTarget { .. })));
        assert!(matches!(
            ConnectRequest::parse(b"GET / HTTP/1.1\r\n\r\n"),
            Err(CoreError::MalformedHead { .. })
        ));
    }

    #[test]
    fn test_credential_without_colon() {
        let value = format!("Basic {}", BASE64.encode("apikey"));
        let head = format!("CONNECT a.balena HTTP/1.0\r\nProxy-Authorization: {value}\r\n\r\n");
        let req = ConnectRequest::parse(head.as_bytes()).unwrap();
        assert_eq!(req.proxy_credential().as_deref(), Some(&b"apikey"[..]));
    }

    #[test]
    fn test_forwarded_chain_whole_token_match() {
        let mut chain = ForwardedChain::parse(Some("By=12, for=10.0.0.1;By=4"));
        assert!(!chain.contains(ServiceId(1)));
        assert!(chain.contains(ServiceId(12)));
        assert!(chain.contains(ServiceId(4)));
        chain.append(ServiceId(1));
        assert!(chain.contains(ServiceId(1)));
        assert_eq!(chain.to_header_value(), "By=12,for=10.0.0.1;By=4,By=1");
    }

    #[test]
    fn test_forwarded_chain_keeps_element_pairs_together() {
        let chain = ForwardedChain::parse(Some("for=a;by=b"));
        assert_eq!(chain.len(), 1);
        assert_eq!(chain.to_header_value(), "for=a;by=b");

        let chain = ForwardedChain::parse(Some("for=a;By=7 , By=9"));
        assert_eq!(chain.len(), 2);
        assert!(chain.contains(ServiceId(7)));
        assert!(!chain.contains(ServiceId(79)));
    }

    #[test]
    fn test_forward_request_credential_is_readable_by_peer() {
        let uuid = DeviceUuid::new("deadbeef").unwrap();
        let head = encode_forward_request(&uuid, 80, Some(b"key"), &ForwardedChain::default());
        let req = ConnectRequest::parse(head.as_bytes()).unwrap();
        assert_eq!(req.target(), "deadbeef.balena:80");
        assert_eq!(req.proxy_credential().as_deref(), Some(&b"key"[..]));
        assert_eq!(req.forwarded(), None);
    }

    #[test]
    fn test_status_line_and_head_end() {
        let buf = b"HTTP/1.0 407 Proxy Authorization Required\r\n\r\nextra";
        let end = find_head_end(buf).unwrap();
        assert_eq!(&buf[end..], b"extra");
        let (code, line) = parse_status_line(&buf[..end]).unwrap();
        assert_eq!(code, 407);
        assert_eq!(line, "HTTP/1.0 407 Proxy Authorization Required");
        assert!(parse_status_line(b"garbage\r\n\r\n").is_err());
        assert!(response_head(503).starts_with(b"HTTP/1.0 503"));
        assert!(response_head(418).starts_with(b"HTTP/1.0 500"));
    }
}
