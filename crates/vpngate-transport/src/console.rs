// ============================================
// File: crates/vpngate-transport/src/console.rs
// ============================================
//! # OpenVPN Management Console
//!
//! ## Creation Reason
//! OpenVPN multiplexes two streams on one TCP connection: replies to the
//! commands we send, and real-time notifications prefixed with `>`. This
//! module separates them so callers can `await` a command while events
//! keep flowing to the parser.
//!
//! ## Main Functionality
//! - `ManagementCommand`: every command the gateway issues
//! - `ManagementConsole`: connection + reader task + serialized `exec`
//!
//! ## Stream Split
//! ```text
//!                 TCP (127.0.0.1:<mgt port>)
//!                          │
//!                   ┌──────┴──────┐
//!                   │ reader task │ LineBuffer
//!                   └──────┬──────┘
//!          line starts '>' │ otherwise
//!            ┌─────────────┴──────────────┐
//!            ▼                            ▼
//!   ManagementParser               responses channel
//!            │                            │
//!            ▼                            ▼
//!     events (mpsc) ──► server     exec() waits for SUCCESS/ERROR/END
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - `exec` holds the command lock until the reply completes; commands
//!   are never pipelined
//! - There is no per-command timeout. A hung console is handled by the
//!   external supervisor restarting the worker
//! - Dropping the console aborts the reader task
//!
//! ## Last Modified
//! v0.3.0 - Initial management console

use std::fmt;
use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use vpngate_common::ClientId;
use vpngate_core::protocol::management::{LineBuffer, ManagementEvent, ManagementParser};

use crate::error::{Result, TransportError};

// ============================================
// Constants
// ============================================

/// Read buffer size for the console socket.
const READ_BUFFER_SIZE: usize = 8 * 1024;

// ============================================
// ManagementCommand
// ============================================

/// How OpenVPN terminates the reply to a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReplyShape {
    /// One `SUCCESS:` or `ERROR:` line.
    SingleLine,
    /// Any number of lines closed by `END` (or an early `ERROR:`).
    Block,
}

/// A command understood by the OpenVPN management interface.
#[derive(Clone, PartialEq, Eq)]
pub enum ManagementCommand {
    /// `log on all`: real-time logs plus history.
    LogOnAll,
    /// `bytecount <secs>`; zero disables reporting.
    ByteCount(u32),
    /// `hold release`
    HoldRelease,
    /// `status`
    Status,
    /// `kill <common name>`
    Kill(String),
    /// `client-auth-nt <cid> <kid>`
    ClientAuthNt {
        /// Connection id
        client_id: ClientId,
        /// Key id from the CONNECT notification
        key_id: u64,
    },
    /// `client-deny <cid> <kid> "<reason>"`
    ClientDeny {
        /// Connection id
        client_id: ClientId,
        /// Key id from the CONNECT notification
        key_id: u64,
        /// Reason written to the OpenVPN log
        reason: String,
    },
}

impl ManagementCommand {
    /// Wire form of the command, without the trailing newline.
    #[must_use]
    pub fn to_line(&self) -> String {
        match self {
            Self::LogOnAll => "log on all".to_string(),
            Self::ByteCount(secs) => format!("bytecount {secs}"),
            Self::HoldRelease => "hold release".to_string(),
            Self::Status => "status".to_string(),
            Self::Kill(common_name) => format!("kill {common_name}"),
            Self::ClientAuthNt { client_id, key_id } => {
                format!("client-auth-nt {client_id} {key_id}")
            }
            Self::ClientDeny {
                client_id,
                key_id,
                reason,
            } => {
                let reason = reason.replace('"', "'");
                format!("client-deny {client_id} {key_id} \"{reason}\"")
            }
        }
    }

    fn reply_shape(&self) -> ReplyShape {
        match self {
            Self::LogOnAll | Self::Status => ReplyShape::Block,
            _ => ReplyShape::SingleLine,
        }
    }
}

impl fmt::Debug for ManagementCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_line())
    }
}

impl fmt::Display for ManagementCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_line())
    }
}

// ============================================
// ManagementConsole
// ============================================

/// Write side of the console plus the reply stream, locked per command.
struct CommandChannel {
    writer: OwnedWriteHalf,
    replies: mpsc::UnboundedReceiver<String>,
}

/// A connected OpenVPN management console.
pub struct ManagementConsole {
    addr: SocketAddr,
    channel: Mutex<CommandChannel>,
    reader: JoinHandle<()>,
}

impl ManagementConsole {
    /// Connects to the console and starts the reader task.
    ///
    /// Parsed real-time notifications are sent on `events`. A dropped
    /// receiver is tolerated.
    ///
    /// # Errors
    /// `ConnectFailed` if the TCP connection cannot be established.
    pub async fn connect(
        addr: SocketAddr,
        events: mpsc::UnboundedSender<ManagementEvent>,
    ) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| TransportError::connect_failed(addr.to_string(), e.to_string()))?;
        stream.set_nodelay(true).ok();
        let (mut read_half, writer) = stream.into_split();
        let (replies_tx, replies) = mpsc::unbounded_channel();

        let reader = tokio::spawn(async move {
            let mut lines = LineBuffer::new();
            let mut parser = ManagementParser::new();
            let mut buf = [0u8; READ_BUFFER_SIZE];

            loop {
                let n = match read_half.read(&mut buf).await {
                    Ok(0) => {
                        debug!(%addr, "Management console closed by peer");
                        break;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        warn!(%addr, error = %e, "Management console read failed");
                        break;
                    }
                };
                lines.extend(&buf[..n]);

                while let Some(line) = lines.next_line() {
                    trace!(%addr, line = %line, "Console line");
                    if line.starts_with('>') {
                        for event in parser.feed_line(&line) {
                            let _ = events.send(event);
                        }
                    } else if replies_tx.send(line).is_err() {
                        return;
                    }
                }
            }
            if parser.is_collecting() {
                warn!(%addr, "Management console closed inside a client notification");
            }
        });

        debug!(%addr, "Management console connected");
        Ok(Self {
            addr,
            channel: Mutex::new(CommandChannel { writer, replies }),
            reader,
        })
    }

    /// Address of the console.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Sends `command` and waits for its complete reply.
    ///
    /// Returns the reply lines; `END` terminators are not included.
    ///
    /// # Errors
    /// - `CommandFailed` if OpenVPN answered `ERROR:`
    /// - `ConsoleClosed` if the connection ended before the reply did
    pub async fn exec(&self, command: &ManagementCommand) -> Result<Vec<String>> {
        let mut channel = self.channel.lock().await;
        let line = command.to_line();

        channel
            .writer
            .write_all(format!("{line}\n").as_bytes())
            .await
            .map_err(|e| TransportError::io(format!("writing '{line}'"), e))?;
        debug!(addr = %self.addr, command = %line, "Management command sent");

        let shape = command.reply_shape();
        let mut reply = Vec::new();
        loop {
            let Some(response) = channel.replies.recv().await else {
                return Err(TransportError::ConsoleClosed);
            };
            if response.starts_with("ERROR:") {
                return Err(TransportError::command_failed(line, response));
            }
            match shape {
                ReplyShape::SingleLine if response.starts_with("SUCCESS:") => {
                    reply.push(response);
                    return Ok(reply);
                }
                ReplyShape::SingleLine => {
                    trace!(addr = %self.addr, line = %response, "Ignoring unsolicited console line");
                }
                ReplyShape::Block if response == "END" => return Ok(reply),
                ReplyShape::Block => reply.push(response),
            }
        }
    }

    /// Returns `true` once the reader task has stopped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.reader.is_finished()
    }
}

impl fmt::Debug for ManagementConsole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagementConsole")
            .field("addr", &self.addr)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Drop for ManagementConsole {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    async fn fake_openvpn<F, Fut>(script: F) -> SocketAddr
    where
        F: FnOnce(BufReader<TcpStream>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            script(BufReader::new(stream)).await;
        });
        addr
    }

    async fn expect_command(conn: &mut BufReader<TcpStream>, expected: &str) {
        let mut line = String::new();
        conn.read_line(&mut line).await.unwrap();
        assert_eq!(line.trim_end(), expected);
    }

    #[test]
    fn test_command_lines() {
        assert_eq!(ManagementCommand::ByteCount(5).to_line(), "bytecount 5");
        assert_eq!(ManagementCommand::Kill("abc".into()).to_line(), "kill abc");
        assert_eq!(
            ManagementCommand::ClientDeny {
                client_id: ClientId(4),
                key_id: 1,
                reason: "say \"no\"".into(),
            }
            .to_line(),
            "client-deny 4 1 \"say 'no'\""
        );
        assert_eq!(
            ManagementCommand::ClientAuthNt {
                client_id: ClientId(4),
                key_id: 0,
            }
            .to_line(),
            "client-auth-nt 4 0"
        );
    }

    #[tokio::test]
    async fn test_exec_single_line_and_events() {
        let addr = fake_openvpn(|mut conn| async move {
            conn.get_mut()
                .write_all(b">INFO:OpenVPN Management Interface\r\n")
                .await
                .unwrap();
            expect_command(&mut conn, "bytecount 5").await;
            conn.get_mut()
                .write_all(b">BYTECOUNT_CLI:3,10,20\r\nSUCCESS: bytecount interval changed\r\n")
                .await
                .unwrap();
            expect_command(&mut conn, "hold release").await;
            conn.get_mut().write_all(b"SUCCESS: hold release succeeded\r\n").await.unwrap();
        })
        .await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let console = ManagementConsole::connect(addr, tx).await.unwrap();

        let reply = console.exec(&ManagementCommand::ByteCount(5)).await.unwrap();
        assert_eq!(reply, vec!["SUCCESS: bytecount interval changed".to_string()]);
        console.exec(&ManagementCommand::HoldRelease).await.unwrap();

        assert!(matches!(rx.recv().await, Some(ManagementEvent::Notification { .. })));
        assert!(matches!(
            rx.recv().await,
            Some(ManagementEvent::ByteCount {
                client_id: ClientId(3),
                bytes_received: 10,
                bytes_sent: 20,
            })
        ));
    }

    #[tokio::test]
    async fn test_exec_block_reply() {
        let addr = fake_openvpn(|mut conn| async move {
            expect_command(&mut conn, "status").await;
            conn.get_mut()
                .write_all(b"OpenVPN CLIENT LIST\r\nUpdated,now\r\nEND\r\n")
                .await
                .unwrap();
        })
        .await;

        let (tx, _rx) = mpsc::unbounded_channel();
        let console = ManagementConsole::connect(addr, tx).await.unwrap();
        let reply = console.exec(&ManagementCommand::Status).await.unwrap();
        assert_eq!(reply.len(), 2);
        assert_eq!(reply[0], "OpenVPN CLIENT LIST");
    }

    #[tokio::test]
    async fn test_exec_error_reply() {
        let addr = fake_openvpn(|mut conn| async move {
            expect_command(&mut conn, "kill nobody").await;
            conn.get_mut()
                .write_all(b"ERROR: common name 'nobody' not found\r\n")
                .await
                .unwrap();
        })
        .await;

        let (tx, _rx) = mpsc::unbounded_channel();
        let console = ManagementConsole::connect(addr, tx).await.unwrap();
        let err = console
            .exec(&ManagementCommand::Kill("nobody".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::CommandFailed { .. }));
    }

    #[tokio::test]
    async fn test_exec_on_closed_console() {
        let addr = fake_openvpn(|conn| async move {
            drop(conn);
        })
        .await;

        let (tx, _rx) = mpsc::unbounded_channel();
        let console = ManagementConsole::connect(addr, tx).await.unwrap();
        let err = console.exec(&ManagementCommand::Status).await.unwrap_err();
        assert!(err.is_console_error() || matches!(err, TransportError::Io { .. }));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (tx, _rx) = mpsc::unbounded_channel();
        let err = ManagementConsole::connect(addr, tx).await.unwrap_err();
        assert!(matches!(err, TransportError::ConnectFailed { .. }));
    }
}
