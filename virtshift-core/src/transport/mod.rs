//! SSH transport layer.
//!
//! Remote execution drives the system OpenSSH client through
//! `tokio::process`, multiplexing every command for a host over one control
//! master socket. Connection setup retries transient failures with
//! exponential backoff; authentication and host-key failures are permanent
//! and surface immediately with remediation steps attached.

pub mod resolve;

pub use resolve::{ConnectOptions, ResolvedEndpoint};

use crate::cancel::CancelToken;
use crate::command;
use crate::config::{HostKeyPolicy, SshSection};
use crate::error::{Result, ShiftError};
use crate::paths;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, instrument, warn};

/// Connect attempts before giving up on transient failures.
const CONNECT_ATTEMPTS: u32 = 3;

/// Backoff before retry `n` (1-based): 1s, 2s, 4s.
fn backoff(attempt: u32) -> Duration {
    Duration::from_secs(1 << (attempt - 1).min(4))
}

/// Result of executing a remote command. A non-zero exit code is data for
/// the caller to interpret, not an error.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    /// Whether the remote command exited zero.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// An established session with a remote host.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Host string this connection was opened with.
    fn host(&self) -> &str;

    /// Execute a command, capturing output. `timeout` bounds the whole
    /// round trip.
    async fn execute(&self, cmd: &str, timeout: Option<Duration>) -> Result<ExecOutput>;

    /// Execute a command, forwarding each output line (split on `\n` or
    /// `\r`) to `lines` as it appears. The child is killed on cancellation.
    async fn execute_streamed(
        &self,
        cmd: &str,
        lines: mpsc::Sender<String>,
        cancel: CancelToken,
    ) -> Result<ExecOutput>;

    /// Copy a local file to the remote host.
    async fn upload(&self, local: &Path, remote: &str) -> Result<()>;

    /// Copy a remote file to the local host.
    async fn download(&self, remote: &str, local: &Path) -> Result<()>;

    /// Tear the session down. Safe to call more than once.
    async fn close(&self) -> Result<()>;
}

/// Factory for [`Connection`]s; the seam tests mock.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open (or reuse) a connection to `host`.
    async fn connect(&self, host: &str) -> Result<Arc<dyn Connection>>;

    /// Close every open connection.
    async fn close_all(&self);
}

/// OpenSSH-backed transport with per-host connection reuse.
pub struct SshTransport {
    settings: SshSection,
    explicit: ConnectOptions,
    connections: Mutex<HashMap<String, Arc<SshConnection>>>,
}

impl SshTransport {
    /// Create a transport from configuration defaults.
    pub fn new(settings: SshSection) -> Self {
        Self { settings, explicit: ConnectOptions::default(), connections: Mutex::new(HashMap::new()) }
    }

    /// Create a transport with explicit per-call overrides (CLI flags).
    pub fn with_options(settings: SshSection, explicit: ConnectOptions) -> Self {
        Self { settings, explicit, connections: Mutex::new(HashMap::new()) }
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn connect(&self, host: &str) -> Result<Arc<dyn Connection>> {
        let mut connections = self.connections.lock().await;
        if let Some(conn) = connections.get(host) {
            return Ok(conn.clone() as Arc<dyn Connection>);
        }

        let endpoint = resolve::resolve(
            host,
            &self.explicit,
            self.settings.port,
            self.settings.key_path.as_deref(),
        )?;
        let conn = Arc::new(SshConnection::establish(endpoint, &self.settings).await?);
        connections.insert(host.to_string(), conn.clone());
        Ok(conn as Arc<dyn Connection>)
    }

    async fn close_all(&self) {
        let mut connections = self.connections.lock().await;
        for (host, conn) in connections.drain() {
            if let Err(e) = conn.close().await {
                warn!(host = %host, error = %e, "Failed to close connection");
            }
        }
    }
}

/// One multiplexed OpenSSH session.
pub struct SshConnection {
    endpoint: ResolvedEndpoint,
    policy: HostKeyPolicy,
    known_hosts: Option<PathBuf>,
    connect_timeout: Duration,
    control_path: PathBuf,
}

impl SshConnection {
    /// Establish the control master, retrying transient failures.
    #[instrument(skip(settings), fields(host = %endpoint.alias))]
    async fn establish(endpoint: ResolvedEndpoint, settings: &SshSection) -> Result<Self> {
        let runtime_dir = paths::runtime_dir();
        tokio::fs::create_dir_all(&runtime_dir)
            .await
            .map_err(|e| ShiftError::Io { path: runtime_dir.clone(), source: e })?;

        // Unix socket paths are length-limited; a short digest of the
        // endpoint keeps the control path unique and small, like
        // OpenSSH's %C token.
        let control_path = runtime_dir.join(format!(
            "cm-{}.sock",
            endpoint_digest(&endpoint, std::process::id())
        ));

        let conn = Self {
            endpoint,
            policy: settings.host_key_policy,
            known_hosts: settings.known_hosts_file.clone(),
            connect_timeout: Duration::from_secs(settings.connect_timeout_secs),
            control_path,
        };

        let mut last_err = None;
        for attempt in 1..=CONNECT_ATTEMPTS {
            match conn.open_master().await {
                Ok(()) => {
                    info!(
                        host = %conn.endpoint.alias,
                        port = conn.endpoint.port,
                        "SSH connection established"
                    );
                    return Ok(conn);
                }
                Err(e) if e.is_transient() && attempt < CONNECT_ATTEMPTS => {
                    let delay = backoff(attempt);
                    warn!(
                        host = %conn.endpoint.alias,
                        attempt,
                        delay_secs = delay.as_secs(),
                        error = %e,
                        "Connect failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| ShiftError::Connection {
            host: conn.endpoint.alias.clone(),
            reason: "connect attempts exhausted".to_string(),
        }))
    }

    /// Common options for every ssh/scp invocation of this connection.
    fn base_args(&self) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ControlPath={}", self.control_path.display()),
            "-o".to_string(),
            format!("StrictHostKeyChecking={}", self.policy.ssh_option()),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs()),
        ];
        if let Some(known_hosts) = &self.known_hosts {
            args.push("-o".to_string());
            args.push(format!("UserKnownHostsFile={}", known_hosts.display()));
        }
        if let Some(identity) = &self.endpoint.identity {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }
        args
    }

    /// ssh-specific destination arguments.
    fn ssh_dest_args(&self) -> Vec<String> {
        let mut args = vec!["-p".to_string(), self.endpoint.port.to_string()];
        if let Some(user) = &self.endpoint.user {
            args.push("-l".to_string());
            args.push(user.clone());
        }
        args.push(self.endpoint.hostname.clone());
        args
    }

    /// scp remote file spec (`[user@]host:path`).
    fn scp_target(&self, remote: &str) -> String {
        match &self.endpoint.user {
            Some(user) => format!("{}@{}:{}", user, self.endpoint.hostname, remote),
            None => format!("{}:{}", self.endpoint.hostname, remote),
        }
    }

    /// Start the control master with a no-op command.
    async fn open_master(&self) -> Result<()> {
        let mut cmd = Command::new("ssh");
        cmd.args(self.base_args())
            .arg("-o")
            .arg("ControlMaster=auto")
            .arg("-o")
            .arg("ControlPersist=600")
            .args(self.ssh_dest_args())
            .arg("true")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!(host = %self.endpoint.alias, "Opening SSH control master");
        let output = tokio::time::timeout(self.connect_timeout + Duration::from_secs(5), cmd.output())
            .await
            .map_err(|_| ShiftError::Connection {
                host: self.endpoint.alias.clone(),
                reason: format!("connect timed out after {}s", self.connect_timeout.as_secs()),
            })?
            .map_err(|e| ShiftError::Connection {
                host: self.endpoint.alias.clone(),
                reason: format!("failed to spawn ssh: {}", e),
            })?;

        if output.status.success() {
            if self.policy == HostKeyPolicy::Warn {
                // With checking disabled, note that the key was not verified.
                warn!(host = %self.endpoint.alias, "Host key not verified (policy: warn)");
            }
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(self.classify_failure(&stderr))
    }

    /// Map ssh stderr to the error taxonomy. Only `Connection` is
    /// retryable.
    fn classify_failure(&self, stderr: &str) -> ShiftError {
        let host = self.endpoint.alias.clone();
        let reason = stderr
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("ssh exited with an error")
            .trim()
            .to_string();

        if stderr.contains("Permission denied")
            || stderr.contains("Too many authentication failures")
            || stderr.contains("Authentication failed")
        {
            ShiftError::Auth { host, reason }
        } else if stderr.contains("Host key verification failed")
            || stderr.contains("REMOTE HOST IDENTIFICATION HAS CHANGED")
            || stderr.contains("host key for") && stderr.contains("has changed")
        {
            ShiftError::HostKey { host, reason }
        } else {
            ShiftError::Connection { host, reason }
        }
    }
}

#[async_trait]
impl Connection for SshConnection {
    fn host(&self) -> &str {
        &self.endpoint.alias
    }

    #[instrument(skip(self, cmd), fields(host = %self.endpoint.alias))]
    async fn execute(&self, cmd: &str, timeout: Option<Duration>) -> Result<ExecOutput> {
        let mut ssh = Command::new("ssh");
        ssh.args(self.base_args())
            .args(self.ssh_dest_args())
            .arg("--")
            .arg(cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!(command = cmd, "Executing remote command");

        let output = match timeout {
            Some(t) => tokio::time::timeout(t, ssh.output()).await.map_err(|_| {
                ShiftError::Timeout { operation: "remote command".to_string(), seconds: t.as_secs() }
            })?,
            None => ssh.output().await,
        }
        .map_err(|e| ShiftError::Connection {
            host: self.endpoint.alias.clone(),
            reason: format!("failed to spawn ssh: {}", e),
        })?;

        let exit_code = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        // 255 is OpenSSH's own failure code; everything else came from the
        // remote command.
        if exit_code == 255 {
            return Err(self.classify_failure(&stderr));
        }

        Ok(ExecOutput { exit_code, stdout, stderr })
    }

    async fn execute_streamed(
        &self,
        cmd: &str,
        lines: mpsc::Sender<String>,
        cancel: CancelToken,
    ) -> Result<ExecOutput> {
        let mut ssh = Command::new("ssh");
        ssh.args(self.base_args())
            .args(self.ssh_dest_args())
            .arg("--")
            .arg(cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!(host = %self.endpoint.alias, command = cmd, "Executing streamed remote command");

        let mut child = ssh.spawn().map_err(|e| ShiftError::Connection {
            host: self.endpoint.alias.clone(),
            reason: format!("failed to spawn ssh: {}", e),
        })?;

        let stdout = child.stdout.take().expect("stdout piped");
        let mut stderr = child.stderr.take().expect("stderr piped");

        let reader = tokio::spawn(stream_lines(stdout, lines));
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        });

        let status = tokio::select! {
            status = child.wait() => status.map_err(|e| ShiftError::Connection {
                host: self.endpoint.alias.clone(),
                reason: format!("ssh wait failed: {}", e),
            })?,
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                let _ = reader.await;
                return Err(ShiftError::Cancelled { operation_id: String::new() });
            }
        };

        let collected = reader.await.unwrap_or_default();
        let stderr_buf = stderr_task.await.unwrap_or_default();
        let exit_code = status.code().unwrap_or(-1);

        if exit_code == 255 {
            return Err(self.classify_failure(&stderr_buf));
        }

        Ok(ExecOutput { exit_code, stdout: collected, stderr: stderr_buf })
    }

    async fn upload(&self, local: &Path, remote: &str) -> Result<()> {
        command::validate_path(remote, None)?;
        let mut scp = Command::new("scp");
        scp.args(self.base_args())
            .arg("-P")
            .arg(self.endpoint.port.to_string())
            .arg("-q")
            .arg(local)
            .arg(self.scp_target(remote))
            .stdin(Stdio::null());

        let output = scp.output().await.map_err(|e| ShiftError::Connection {
            host: self.endpoint.alias.clone(),
            reason: format!("failed to spawn scp: {}", e),
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ShiftError::Transfer {
                src_host: "local".to_string(),
                dest: self.endpoint.alias.clone(),
                reason: format!("upload of {} failed: {}", local.display(), stderr.trim()),
            });
        }
        Ok(())
    }

    async fn download(&self, remote: &str, local: &Path) -> Result<()> {
        command::validate_path(remote, None)?;
        let mut scp = Command::new("scp");
        scp.args(self.base_args())
            .arg("-P")
            .arg(self.endpoint.port.to_string())
            .arg("-q")
            .arg(self.scp_target(remote))
            .arg(local)
            .stdin(Stdio::null());

        let output = scp.output().await.map_err(|e| ShiftError::Connection {
            host: self.endpoint.alias.clone(),
            reason: format!("failed to spawn scp: {}", e),
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ShiftError::Transfer {
                src_host: self.endpoint.alias.clone(),
                dest: "local".to_string(),
                reason: format!("download of {} failed: {}", remote, stderr.trim()),
            });
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if !self.control_path.exists() {
            return Ok(());
        }
        let mut cmd = Command::new("ssh");
        cmd.arg("-o")
            .arg(format!("ControlPath={}", self.control_path.display()))
            .arg("-O")
            .arg("exit")
            .args(self.ssh_dest_args())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        let _ = cmd.status().await;
        debug!(host = %self.endpoint.alias, "SSH connection closed");
        Ok(())
    }
}

/// Short hex digest identifying one endpoint within one process.
fn endpoint_digest(endpoint: &ResolvedEndpoint, pid: u32) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(endpoint.hostname.as_bytes());
    hasher.update([0]);
    hasher.update(endpoint.port.to_be_bytes());
    hasher.update(endpoint.user.as_deref().unwrap_or_default().as_bytes());
    hasher.update(pid.to_be_bytes());
    let digest = hasher.finalize();
    digest[..8].iter().map(|b| format!("{:02x}", b)).collect()
}

/// Read a stream, emitting segments split on `\n` or `\r` (progress tools
/// rewrite their status line with bare carriage returns). Returns the full
/// collected output.
async fn stream_lines(
    mut reader: impl tokio::io::AsyncRead + Unpin,
    sink: mpsc::Sender<String>,
) -> String {
    let mut collected = String::new();
    let mut pending = Vec::new();
    let mut buf = [0u8; 8192];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        for &byte in &buf[..n] {
            if byte == b'\n' || byte == b'\r' {
                if !pending.is_empty() {
                    let line = String::from_utf8_lossy(&pending).to_string();
                    collected.push_str(&line);
                    collected.push('\n');
                    let _ = sink.send(line).await;
                    pending.clear();
                }
            } else {
                pending.push(byte);
            }
        }
    }
    if !pending.is_empty() {
        let line = String::from_utf8_lossy(&pending).to_string();
        collected.push_str(&line);
        let _ = sink.send(line).await;
    }
    collected
}
