// ============================================
// File: crates/vpngate-core/src/protocol/management.rs
// ============================================
//! # OpenVPN Management Protocol Parser
//!
//! ## Creation Reason
//! OpenVPN reports client lifecycle, traffic counters and log lines on
//! its management console as newline-terminated text. This module turns
//! that byte stream into typed events without doing any I/O itself.
//!
//! ## Main Functionality
//! - `LineBuffer`: reassembles lines across arbitrary read boundaries
//! - `ManagementParser`: two-state machine producing `ManagementEvent`s
//! - `LogLevel`, `ClientEvent`, `ClientEventKind`: typed payloads
//!
//! ## State Machine
//! ```text
//!                 >CLIENT:<EVENT>,<cid>,<args..>
//!      ┌──────┐ ─────────────────────────────────► ┌──────────────────┐
//!      │ Idle │                                    │  CollectingEnv   │
//!      └──────┘ ◄───────────────────────────────── │ (kind,cid,args,  │
//!         ▲          >CLIENT:ENV,END  (emit)       │  env)            │
//!         │                                        └──────────────────┘
//!         │  any other line (emit, then re-feed     │      ▲
//!         └──────── the line to Idle) ◄─────────────┘      │
//!                                           >CLIENT:ENV,k=v (accumulate)
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - A line that ends collection without being the `END` terminator
//!   belongs to the next message and MUST be re-fed, otherwise the
//!   following bytecount or client header is silently lost
//! - Lines are split on `\n` only; a trailing `\r` is stripped
//! - Non-`>` lines are command responses; the console routes them away
//!   before they reach this parser
//!
//! ## Last Modified
//! v0.3.0 - Initial management parser

use std::collections::HashMap;
use std::fmt;
use std::mem;

use bytes::BytesMut;
use tracing::{debug, warn};

use vpngate_common::ClientId;

use crate::error::{CoreError, Result};

// ============================================
// Constants
// ============================================

/// Longest line kept while waiting for a newline.
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

const LOG_PREFIX: &str = ">LOG:";
const CLIENT_PREFIX: &str = ">CLIENT:";
const BYTECOUNT_PREFIX: &str = ">BYTECOUNT_CLI:";
const ENV_PREFIX: &str = ">CLIENT:ENV,";
const ENV_END: &str = ">CLIENT:ENV,END";

// ============================================
// LineBuffer
// ============================================

/// Accumulates raw reads and yields complete lines.
///
/// # Example
/// ```
/// use vpngate_core::protocol::management::LineBuffer;
///
/// let mut buf = LineBuffer::new();
/// buf.extend(b">LOG:1,I,hel");
/// assert_eq!(buf.next_line(), None);
/// buf.extend(b"lo\r\n");
/// assert_eq!(buf.next_line().as_deref(), Some(">LOG:1,I,hello"));
/// ```
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: BytesMut,
}

impl LineBuffer {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends freshly read bytes.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
        if self.buf.len() > MAX_LINE_LENGTH && !self.buf.contains(&b'\n') {
            warn!(len = self.buf.len(), "Dropping oversized management line");
            self.buf.clear();
        }
    }

    /// Pops the next complete line, without its terminator.
    pub fn next_line(&mut self) -> Option<String> {
        let pos = self.buf.iter().position(|&b| b == b'\n')?;
        let raw = self.buf.split_to(pos + 1);
        let mut line = &raw[..pos];
        if let Some(stripped) = line.strip_suffix(b"\r") {
            line = stripped;
        }
        Some(String::from_utf8_lossy(line).into_owned())
    }

    /// Number of buffered bytes not yet returned as a line.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

// ============================================
// LogLevel
// ============================================

/// Severity of a `>LOG:` line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    /// `D`
    Debug,
    /// `I`
    Info,
    /// `n`, and anything unrecognised
    Notice,
    /// `W`
    Warning,
    /// `N` (non-fatal error)
    Error,
    /// `F` (fatal)
    Emergency,
}

impl LogLevel {
    /// Maps an OpenVPN flag string to a level. Only the first character
    /// is significant.
    #[must_use]
    pub fn from_code(code: &str) -> Self {
        match code.chars().next() {
            Some('D') => Self::Debug,
            Some('I') => Self::Info,
            Some('W') => Self::Warning,
            Some('N') => Self::Error,
            Some('F') => Self::Emergency,
            _ => Self::Notice,
        }
    }

    /// Returns `true` for warning and above.
    #[must_use]
    pub fn is_warning_or_worse(self) -> bool {
        self >= Self::Warning
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Notice => "notice",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Emergency => "emerg",
        };
        f.write_str(s)
    }
}

// ============================================
// Client events
// ============================================

/// Client notifications that carry an ENV block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientEventKind {
    /// New client awaiting authorization (`--management-client-auth`).
    Connect,
    /// Client session is up.
    Established,
    /// Client was assigned a virtual address.
    Address,
    /// Client session ended.
    Disconnect,
}

impl ClientEventKind {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "CONNECT" => Some(Self::Connect),
            "ESTABLISHED" => Some(Self::Established),
            "ADDRESS" => Some(Self::Address),
            "DISCONNECT" => Some(Self::Disconnect),
            _ => None,
        }
    }

    /// Protocol name of the event.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Established => "ESTABLISHED",
            Self::Address => "ADDRESS",
            Self::Disconnect => "DISCONNECT",
        }
    }
}

/// A fully collected `>CLIENT:` notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientEvent {
    /// Which notification this is.
    pub kind: ClientEventKind,
    /// OpenVPN connection id.
    pub client_id: ClientId,
    /// Positional arguments after the client id (e.g. key id for CONNECT).
    pub args: Vec<String>,
    /// Accumulated `>CLIENT:ENV,k=v` pairs.
    pub env: HashMap<String, String>,
}

impl ClientEvent {
    /// Looks up an ENV value.
    #[must_use]
    pub fn env(&self, key: &str) -> Option<&str> {
        self.env.get(key).map(String::as_str)
    }

    /// Certificate common name, the device uuid.
    #[must_use]
    pub fn common_name(&self) -> Option<&str> {
        self.env("common_name")
    }

    /// Key id for CONNECT notifications, needed by `client-auth-nt`.
    #[must_use]
    pub fn key_id(&self) -> Option<u64> {
        self.args.first().and_then(|s| s.parse().ok())
    }
}

// ============================================
// ManagementEvent
// ============================================

/// A typed event produced by the parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagementEvent {
    /// `>LOG:<ts>,<flags>,<message>`
    Log {
        /// Unix timestamp reported by OpenVPN
        timestamp: u64,
        /// Severity
        level: LogLevel,
        /// Message text (may contain commas)
        message: String,
    },
    /// A collected `>CLIENT:` notification.
    Client(ClientEvent),
    /// `>BYTECOUNT_CLI:<cid>,<rx>,<tx>`
    ByteCount {
        /// OpenVPN connection id
        client_id: ClientId,
        /// Bytes received from the client
        bytes_received: u64,
        /// Bytes sent to the client
        bytes_sent: u64,
    },
    /// Any other real-time notification (`>INFO:`, `>HOLD:`, ...).
    Notification {
        /// Source tag without the `>` and `:`
        source: String,
        /// Remainder of the line
        payload: String,
    },
}

// ============================================
// ManagementParser
// ============================================

/// Parser state. `CollectingEnv` owns everything gathered so far.
#[derive(Debug, Default)]
enum ParserState {
    #[default]
    Idle,
    CollectingEnv {
        kind: ClientEventKind,
        client_id: ClientId,
        args: Vec<String>,
        env: HashMap<String, String>,
    },
}

/// Stateful line parser for the management console.
#[derive(Debug, Default)]
pub struct ManagementParser {
    state: ParserState,
    lines: LineBuffer,
}

impl ManagementParser {
    /// Creates an idle parser.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffers raw bytes and parses every complete line.
    pub fn feed(&mut self, data: &[u8]) -> Vec<ManagementEvent> {
        self.lines.extend(data);
        let mut events = Vec::new();
        while let Some(line) = self.lines.next_line() {
            self.feed_line_into(&line, &mut events);
        }
        events
    }

    /// Parses a single complete line.
    pub fn feed_line(&mut self, line: &str) -> Vec<ManagementEvent> {
        let mut events = Vec::new();
        self.feed_line_into(line, &mut events);
        events
    }

    /// Returns `true` while an ENV block is being collected.
    #[must_use]
    pub fn is_collecting(&self) -> bool {
        matches!(self.state, ParserState::CollectingEnv { .. })
    }

    fn feed_line_into(&mut self, line: &str, events: &mut Vec<ManagementEvent>) {
        match mem::take(&mut self.state) {
            ParserState::Idle => match parse_top_level(line) {
                Ok(Parsed::Event(event)) => events.push(event),
                Ok(Parsed::BeginClient { kind, client_id, args }) => {
                    self.state = ParserState::CollectingEnv {
                        kind,
                        client_id,
                        args,
                        env: HashMap::new(),
                    };
                }
                Ok(Parsed::Ignored) => {}
                Err(e) => debug!(line, "Skipping management line: {}", e),
            },
            ParserState::CollectingEnv {
                kind,
                client_id,
                args,
                mut env,
            } => {
                if line == ENV_END {
                    events.push(ManagementEvent::Client(ClientEvent {
                        kind,
                        client_id,
                        args,
                        env,
                    }));
                } else if let Some(pair) = line.strip_prefix(ENV_PREFIX) {
                    let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
                    env.insert(key.to_string(), value.to_string());
                    self.state = ParserState::CollectingEnv {
                        kind,
                        client_id,
                        args,
                        env,
                    };
                } else {
                    events.push(ManagementEvent::Client(ClientEvent {
                        kind,
                        client_id,
                        args,
                        env,
                    }));
                    // state is Idle again; the line starts the next message
                    self.feed_line_into(line, events);
                }
            }
        }
    }
}

enum Parsed {
    Event(ManagementEvent),
    BeginClient {
        kind: ClientEventKind,
        client_id: ClientId,
        args: Vec<String>,
    },
    Ignored,
}

fn parse_top_level(line: &str) -> Result<Parsed> {
    if let Some(rest) = line.strip_prefix(LOG_PREFIX) {
        let mut parts = rest.splitn(3, ',');
        let timestamp = parts
            .next()
            .and_then(|t| t.parse().ok())
            .ok_or_else(|| CoreError::malformed_line("LOG without timestamp"))?;
        let level = LogLevel::from_code(parts.next().unwrap_or(""));
        let message = parts.next().unwrap_or("").to_string();
        return Ok(Parsed::Event(ManagementEvent::Log {
            timestamp,
            level,
            message,
        }));
    }

    if let Some(rest) = line.strip_prefix(BYTECOUNT_PREFIX) {
        let fields: Vec<&str> = rest.split(',').collect();
        if fields.len() != 3 {
            return Err(CoreError::malformed_line("BYTECOUNT_CLI needs 3 fields"));
        }
        let client_id = fields[0].parse::<ClientId>()?;
        let bytes_received = parse_counter(fields[1])?;
        let bytes_sent = parse_counter(fields[2])?;
        return Ok(Parsed::Event(ManagementEvent::ByteCount {
            client_id,
            bytes_received,
            bytes_sent,
        }));
    }

    if let Some(rest) = line.strip_prefix(CLIENT_PREFIX) {
        let mut fields = rest.split(',');
        let name = fields.next().unwrap_or("");
        let Some(kind) = ClientEventKind::parse(name) else {
            // stray ENV lines and unhandled notifications (REAUTH, CR_RESPONSE)
            return Ok(Parsed::Ignored);
        };
        let client_id = fields
            .next()
            .ok_or_else(|| CoreError::malformed_line("CLIENT without client id"))?
            .parse::<ClientId>()?;
        let args = fields.map(str::to_string).collect();
        return Ok(Parsed::BeginClient {
            kind,
            client_id,
            args,
        });
    }

    if let Some(rest) = line.strip_prefix('>') {
        if let Some((source, payload)) = rest.split_once(':') {
            return Ok(Parsed::Event(ManagementEvent::Notification {
                source: source.to_string(),
                payload: payload.to_string(),
            }));
        }
    }

    Ok(Parsed::Ignored)
}

fn parse_counter(field: &str) -> Result<u64> {
    field
        .trim()
        .parse()
        .map_err(|_| CoreError::malformed_line(format!("invalid counter '{field}'")))
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;

    const ESTABLISHED_BLOCK: &str =
        ">CLIENT:ESTABLISHED,7\r\n>CLIENT:ENV,common_name=abc\r\n>CLIENT:ENV,END\r\n";

    #[test]
    fn test_log_line() {
        let mut parser = ManagementParser::new();
        let events = parser.feed(b">LOG:1700000000,W,link down, retrying\n");
        assert_eq!(
            events,
            vec![ManagementEvent::Log {
                timestamp: 1_700_000_000,
                level: LogLevel::Warning,
                message: "link down, retrying".into(),
            }]
        );
    }

    #[test]
    fn test_log_level_codes() {
        assert_eq!(LogLevel::from_code("D"), LogLevel::Debug);
        assert_eq!(LogLevel::from_code("I"), LogLevel::Info);
        assert_eq!(LogLevel::from_code("n"), LogLevel::Notice);
        assert_eq!(LogLevel::from_code("N"), LogLevel::Error);
        assert_eq!(LogLevel::from_code("F"), LogLevel::Emergency);
        assert_eq!(LogLevel::from_code(""), LogLevel::Notice);
        assert!(LogLevel::Error.is_warning_or_worse());
        assert!(!LogLevel::Notice.is_warning_or_worse());
    }

    #[test]
    fn test_bytecount_line() {
        let mut parser = ManagementParser::new();
        let events = parser.feed(b">BYTECOUNT_CLI:3,1024,2048\n");
        assert_eq!(
            events,
            vec![ManagementEvent::ByteCount {
                client_id: ClientId(3),
                bytes_received: 1024,
                bytes_sent: 2048,
            }]
        );
    }

    #[test]
    fn test_established_block_split_at_every_offset() {
        let bytes = ESTABLISHED_BLOCK.as_bytes();
        for offset in 0..=bytes.len() {
            let mut parser = ManagementParser::new();
            let mut events = parser.feed(&bytes[..offset]);
            events.extend(parser.feed(&bytes[offset..]));

            assert_eq!(events.len(), 1, "split at {offset}");
            let ManagementEvent::Client(event) = &events[0] else {
                panic!("expected client event at split {offset}");
            };
            assert_eq!(event.kind, ClientEventKind::Established);
            assert_eq!(event.client_id, ClientId(7));
            assert_eq!(event.common_name(), Some("abc"));
            assert!(!parser.is_collecting());
        }
    }

    #[test]
    fn test_connect_args_and_env_values_with_equals() {
        let mut parser = ManagementParser::new();
        let events = parser.feed(
            b">CLIENT:CONNECT,4,1\n>CLIENT:ENV,username=user2\n>CLIENT:ENV,password=a=b\n>CLIENT:ENV,END\n",
        );
        let ManagementEvent::Client(event) = &events[0] else {
            panic!("expected client event");
        };
        assert_eq!(event.kind, ClientEventKind::Connect);
        assert_eq!(event.key_id(), Some(1));
        assert_eq!(event.env("username"), Some("user2"));
        assert_eq!(event.env("password"), Some("a=b"));
    }

    #[test]
    fn test_unterminated_block_refeeds_next_line() {
        let mut parser = ManagementParser::new();
        let events = parser.feed(
            b">CLIENT:ADDRESS,9,10.240.0.11,1\n>BYTECOUNT_CLI:9,10,20\n",
        );
        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[0],
            ManagementEvent::Client(ClientEvent { kind: ClientEventKind::Address, args, .. })
                if args == &vec!["10.240.0.11".to_string(), "1".to_string()]
        ));
        assert!(matches!(
            events[1],
            ManagementEvent::ByteCount { client_id: ClientId(9), bytes_received: 10, bytes_sent: 20 }
        ));
    }

    #[test]
    fn test_back_to_back_client_blocks() {
        let mut parser = ManagementParser::new();
        let events = parser.feed(
            b">CLIENT:DISCONNECT,1\n>CLIENT:ENV,common_name=a\n>CLIENT:ESTABLISHED,2\n>CLIENT:ENV,common_name=b\n>CLIENT:ENV,END\n",
        );
        let names: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                ManagementEvent::Client(c) => Some((c.kind, c.common_name().unwrap_or(""))),
                _ => None,
            })
            .collect();
        assert_eq!(
            names,
            vec![(ClientEventKind::Disconnect, "a"), (ClientEventKind::Established, "b")]
        );
    }

    #[test]
    fn test_notifications_and_garbage() {
        let mut parser = ManagementParser::new();
        let events = parser.feed(
            b">INFO:OpenVPN Management Interface Version 3\n>HOLD:Waiting for hold release:0\n>LOG:oops\n>CLIENT:ENV,stray=1\n",
        );
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], ManagementEvent::Notification { source, .. } if source == "INFO"));
        assert!(matches!(&events[1], ManagementEvent::Notification { source, .. } if source == "HOLD"));
    }

    #[test]
    fn test_line_buffer_keeps_partial_tail() {
        let mut buf = LineBuffer::new();
        buf.extend(b"a\nb");
        assert_eq!(buf.next_line().as_deref(), Some("a"));
        assert_eq!(buf.next_line(), None);
        assert_eq!(buf.pending(), 1);
        buf.extend(b"\n");
        assert_eq!(buf.next_line().as_deref(), Some("b"));
    }
}
