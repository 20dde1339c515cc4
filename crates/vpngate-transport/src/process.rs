// ============================================
// File: crates/vpngate-transport/src/process.rs
// ============================================
//! # OpenVPN Process Supervision
//!
//! ## Creation Reason
//! The gateway owns exactly one OpenVPN subprocess per worker. Before a
//! new one starts, any survivor of a previous run must be gone, or it
//! would still hold the tun device and the ports.
//!
//! ## Main Functionality
//! - `reap_orphan`: pid-file driven liveness check / SIGTERM / SIGKILL escalation
//! - `spawn_process`: spawn with piped output forwarded as events
//! - `wait_for_port`: poll-connect until the management port is open
//!
//! ## Reap Escalation
//! ```text
//! kill(0)  ──alive──► wait term_grace ──alive──► SIGTERM
//!    │                                              │
//!   dead                                  wait kill_grace ──alive──► SIGKILL
//!    │                                              │                   │
//!    ▼                                             dead        wait kill_settle
//!   Ok ◄────────────────────────────────────────────┘                   │
//!                                                          alive ─► OrphanSurvived
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - A zombie still answers signal 0. Orphans from a previous worker are
//!   re-parented to init, which reaps them; in tests the spawning test
//!   must reap its own child
//! - Pids below 2 are never signalled: 0 and -1 address process groups
//!
//! ## Last Modified
//! v0.3.0 - Initial process supervision

use std::fmt;
use std::net::SocketAddr;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use vpngate_common::time::{millis, Deadline};

use crate::error::{Result, TransportError};

// ============================================
// ReapPolicy
// ============================================

/// Grace periods for orphan reaping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReapPolicy {
    /// How long the orphan may linger before SIGTERM.
    pub term_grace: Duration,
    /// How long after SIGTERM before SIGKILL.
    pub kill_grace: Duration,
    /// How long after SIGKILL before giving up.
    pub kill_settle: Duration,
    /// Delay between signal-0 liveness checks.
    pub poll_interval: Duration,
}

impl Default for ReapPolicy {
    fn default() -> Self {
        Self {
            term_grace: Duration::from_secs(5),
            kill_grace: Duration::from_secs(5),
            kill_settle: Duration::from_secs(1),
            poll_interval: Duration::from_millis(100),
        }
    }
}

// ============================================
// Orphan Reaping
// ============================================

/// Sends `sig` (or the null signal) to `pid`.
///
/// Returns `Ok(false)` when the process does not exist.
fn signal_pid(pid: i32, sig: Option<Signal>) -> Result<bool> {
    match signal::kill(Pid::from_raw(pid), sig) {
        Ok(()) | Err(Errno::EPERM) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(e) => Err(TransportError::SignalFailed {
            pid,
            reason: e.desc().to_string(),
        }),
    }
}

/// Probes `pid` until it disappears or `grace` elapses.
///
/// Returns `true` if the process went away.
async fn wait_for_exit(pid: i32, grace: Duration, interval: Duration) -> Result<bool> {
    let deadline = Deadline::after(grace);
    loop {
        if !signal_pid(pid, None)? {
            return Ok(true);
        }
        if deadline.has_passed() {
            return Ok(false);
        }
        tokio::time::sleep(interval.min(deadline.remaining())).await;
    }
}

/// Kills a process left over from a previous run, as named by `pid_file`.
///
/// A missing pid file, an unparseable one, or a pid that no longer
/// exists all count as success. The pid file is removed afterwards.
///
/// # Errors
/// - `OrphanSurvived` if the process outlives SIGKILL plus the settle window
/// - `SignalFailed` for unexpected `kill(2)` failures
/// - `Io` if the pid file exists but cannot be read
pub async fn reap_orphan(pid_file: &Path, policy: &ReapPolicy) -> Result<()> {
    let content = match tokio::fs::read_to_string(pid_file).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            trace!(pid_file = %pid_file.display(), "No pid file, nothing to reap");
            return Ok(());
        }
        Err(e) => {
            return Err(TransportError::io(
                format!("reading pid file {}", pid_file.display()),
                e,
            ))
        }
    };

    let digits: String = content.chars().filter(char::is_ascii_digit).collect();
    let pid = match digits.parse::<i32>() {
        Ok(pid) if pid > 1 => pid,
        _ => {
            warn!(pid_file = %pid_file.display(), "Ignoring pid file without a usable pid");
            remove_pid_file(pid_file).await;
            return Ok(());
        }
    };

    let started = Deadline::after(Duration::ZERO);
    let steps = [
        (None, policy.term_grace),
        (Some(Signal::SIGTERM), policy.kill_grace),
        (Some(Signal::SIGKILL), policy.kill_settle),
    ];

    for (sig, grace) in steps {
        if let Some(sig) = sig {
            warn!(pid, signal = %sig, "Orphan OpenVPN process still alive, escalating");
            if !signal_pid(pid, Some(sig))? {
                break;
            }
        }
        if wait_for_exit(pid, grace, policy.poll_interval).await? {
            info!(pid, elapsed_ms = millis(started.elapsed()), "Orphan OpenVPN process gone");
            remove_pid_file(pid_file).await;
            return Ok(());
        }
    }

    if signal_pid(pid, None)? {
        return Err(TransportError::OrphanSurvived {
            pid,
            pid_file: pid_file.display().to_string(),
        });
    }
    remove_pid_file(pid_file).await;
    Ok(())
}

async fn remove_pid_file(pid_file: &Path) {
    if let Err(e) = tokio::fs::remove_file(pid_file).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            debug!(pid_file = %pid_file.display(), error = %e, "Failed to remove pid file");
        }
    }
}

// ============================================
// Subprocess
// ============================================

/// Which pipe a line of output came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    /// Standard output
    Stdout,
    /// Standard error
    Stderr,
}

/// How a subprocess ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    /// Exit code, if it exited normally.
    pub code: Option<i32>,
    /// Terminating signal, if it was killed.
    pub signal: Option<i32>,
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => f.write_str("unknown status"),
        }
    }
}

/// Lifecycle notifications from a supervised subprocess.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// One line of stdout or stderr.
    Output {
        /// Source pipe
        stream: OutputStream,
        /// Line without terminator
        line: String,
    },
    /// Waiting on the process failed.
    Error(String),
    /// The process is gone.
    Exited(ExitInfo),
}

/// Handle to a running subprocess.
pub struct ProcessHandle {
    program: String,
    pid: Option<u32>,
    exit: watch::Receiver<Option<ExitInfo>>,
}

impl ProcessHandle {
    /// OS pid, if the process was still alive when spawned.
    #[must_use]
    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Exit status, once the process has ended.
    #[must_use]
    pub fn exit_info(&self) -> Option<ExitInfo> {
        *self.exit.borrow()
    }

    /// Sends SIGTERM. A process that is already gone is not an error.
    ///
    /// # Errors
    /// `SignalFailed` for unexpected `kill(2)` failures.
    pub fn terminate(&self) -> Result<()> {
        self.send(Signal::SIGTERM)
    }

    /// Sends SIGKILL.
    ///
    /// # Errors
    /// `SignalFailed` for unexpected `kill(2)` failures.
    pub fn kill(&self) -> Result<()> {
        self.send(Signal::SIGKILL)
    }

    /// Waits until the process has exited.
    pub async fn wait(&mut self) -> Option<ExitInfo> {
        match self.exit.wait_for(Option::is_some).await {
            Ok(info) => *info,
            Err(_) => None,
        }
    }

    fn send(&self, sig: Signal) -> Result<()> {
        let Some(pid) = self.pid.and_then(|p| i32::try_from(p).ok()) else {
            return Ok(());
        };
        if self.exit_info().is_some() {
            return Ok(());
        }
        debug!(program = %self.program, pid, signal = %sig, "Signalling subprocess");
        signal_pid(pid, Some(sig)).map(|_| ())
    }
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("program", &self.program)
            .field("pid", &self.pid)
            .field("exit", &self.exit_info())
            .finish()
    }
}

/// Spawns `program` with `args`, forwarding its output and exit on `events`.
///
/// # Errors
/// `SpawnFailed` if the program cannot be started.
pub fn spawn_process(
    program: &str,
    args: &[String],
    events: mpsc::UnboundedSender<ProcessEvent>,
) -> Result<ProcessHandle> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| TransportError::spawn_failed(program, e.to_string()))?;

    let pid = child.id();
    info!(program, pid, "Subprocess spawned");

    let stdout_task = child
        .stdout
        .take()
        .map(|out| tokio::spawn(forward_lines(out, OutputStream::Stdout, events.clone())));
    let stderr_task = child
        .stderr
        .take()
        .map(|err| tokio::spawn(forward_lines(err, OutputStream::Stderr, events.clone())));

    let (exit_tx, exit) = watch::channel(None);
    let name = program.to_string();
    tokio::spawn(async move {
        let status = child.wait().await;
        // Flush remaining output before reporting the exit
        for task in [stdout_task, stderr_task].into_iter().flatten() {
            let _ = task.await;
        }
        let info = match status {
            Ok(status) => ExitInfo {
                code: status.code(),
                signal: status.signal(),
            },
            Err(e) => {
                let _ = events.send(ProcessEvent::Error(e.to_string()));
                ExitInfo {
                    code: None,
                    signal: None,
                }
            }
        };
        debug!(program = %name, status = %info, "Subprocess exited");
        let _ = exit_tx.send(Some(info));
        let _ = events.send(ProcessEvent::Exited(info));
    });

    Ok(ProcessHandle {
        program: program.to_string(),
        pid,
        exit,
    })
}

async fn forward_lines<R>(reader: R, stream: OutputStream, events: mpsc::UnboundedSender<ProcessEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if events.send(ProcessEvent::Output { stream, line }).is_err() {
            break;
        }
    }
}

// ============================================
// Startup Probe
// ============================================

/// Polls `addr` until a TCP connection succeeds or `timeout` elapses.
///
/// Each attempt is a fresh connection; any failure is retried after
/// `interval`.
///
/// # Errors
/// `StartupTimeout` if the port never accepted.
pub async fn wait_for_port(addr: SocketAddr, timeout: Duration, interval: Duration) -> Result<()> {
    let ready = async {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    drop(stream);
                    debug!(%addr, attempts, "Port is accepting connections");
                    return;
                }
                Err(e) => {
                    trace!(%addr, attempts, error = %e, "Port not ready");
                    tokio::time::sleep(interval).await;
                }
            }
        }
    };

    tokio::time::timeout(timeout, ready)
        .await
        .map_err(|_| TransportError::StartupTimeout {
            addr: addr.to_string(),
            waited_ms: millis(timeout),
        })
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn fast_policy() -> ReapPolicy {
        ReapPolicy {
            term_grace: Duration::from_millis(50),
            kill_grace: Duration::from_millis(2000),
            kill_settle: Duration::from_millis(500),
            poll_interval: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn test_reap_missing_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("server-1.pid");
        reap_orphan(&pid_file, &fast_policy()).await.unwrap();
    }

    #[tokio::test]
    async fn test_reap_garbage_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("server-1.pid");
        std::fs::write(&pid_file, "not a pid\n").unwrap();

        reap_orphan(&pid_file, &fast_policy()).await.unwrap();
        assert!(!pid_file.exists());
    }

    #[tokio::test]
    async fn test_reap_terminates_live_process() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("server-1.pid");

        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        std::fs::write(&pid_file, format!("{}\n", child.id())).unwrap();
        // Reap the zombie so signal 0 stops answering once it dies
        let waiter = std::thread::spawn(move || child.wait().unwrap());

        reap_orphan(&pid_file, &fast_policy()).await.unwrap();

        let status = waiter.join().unwrap();
        assert_eq!(status.signal(), Some(Signal::SIGTERM as i32));
        assert!(!pid_file.exists());
    }

    #[tokio::test]
    async fn test_reap_escalates_to_sigkill() {
        use std::io::{BufRead, BufReader};

        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("server-1.pid");

        let mut child = std::process::Command::new("sh")
            .args(["-c", "trap '' TERM; echo ready; exec sleep 60"])
            .stdout(std::process::Stdio::piped())
            .spawn()
            .unwrap();
        let mut ready = String::new();
        BufReader::new(child.stdout.take().unwrap()).read_line(&mut ready).unwrap();
        assert_eq!(ready.trim(), "ready");
        std::fs::write(&pid_file, format!("{}\n", child.id())).unwrap();
        let waiter = std::thread::spawn(move || child.wait().unwrap());

        let policy = ReapPolicy {
            kill_grace: Duration::from_millis(200),
            ..fast_policy()
        };
        reap_orphan(&pid_file, &policy).await.unwrap();

        let status = waiter.join().unwrap();
        assert_eq!(status.signal(), Some(Signal::SIGKILL as i32));
        assert!(!pid_file.exists());
    }

    #[tokio::test]
    async fn test_reap_reports_unkillable_orphan() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("server-1.pid");

        // An unreaped exited child stays a zombie: it answers signal 0
        // and no signal removes it.
        let mut child = std::process::Command::new("true").spawn().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let pid = i32::try_from(child.id()).unwrap();
        std::fs::write(&pid_file, format!("{pid}\n")).unwrap();

        let policy = ReapPolicy {
            term_grace: Duration::from_millis(20),
            kill_grace: Duration::from_millis(50),
            kill_settle: Duration::from_millis(50),
            poll_interval: Duration::from_millis(10),
        };
        let err = reap_orphan(&pid_file, &policy).await.unwrap_err();
        assert!(matches!(err, TransportError::OrphanSurvived { pid: p, .. } if p == pid));
        assert!(err.is_startup_error());
        assert!(pid_file.exists());

        child.wait().unwrap();
    }

    #[tokio::test]
    async fn test_spawn_forwards_output_and_exit() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let args = vec!["-c".to_string(), "echo hello; echo oops >&2; exit 3".to_string()];
        let mut handle = spawn_process("sh", &args, tx).unwrap();
        assert!(handle.pid().is_some());

        let exit = handle.wait().await.unwrap();
        assert_eq!(exit.code, Some(3));

        let mut outputs = Vec::new();
        while let Some(event) = rx.recv().await {
            match event {
                ProcessEvent::Output { stream, line } => outputs.push((stream, line)),
                ProcessEvent::Exited(info) => {
                    assert_eq!(info, exit);
                    break;
                }
                ProcessEvent::Error(e) => panic!("unexpected error: {e}"),
            }
        }
        assert!(outputs.contains(&(OutputStream::Stdout, "hello".to_string())));
        assert!(outputs.contains(&(OutputStream::Stderr, "oops".to_string())));
        // Signalling an exited process is a no-op
        handle.terminate().unwrap();
    }

    #[tokio::test]
    async fn test_spawn_missing_program() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = spawn_process("/nonexistent/openvpn", &[], tx).unwrap_err();
        assert!(err.is_startup_error());
    }

    #[tokio::test]
    async fn test_wait_for_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open = listener.local_addr().unwrap();
        wait_for_port(open, Duration::from_secs(2), Duration::from_millis(10))
            .await
            .unwrap();

        let closed = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap()
        };
        let err = wait_for_port(closed, Duration::from_millis(100), Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::StartupTimeout { waited_ms: 100, .. }));
    }
}
