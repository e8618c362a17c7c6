//! Session Runtime (C6).
//!
//! Owns one accepted `session` channel's lifecycle: `pty-req` /
//! `window-change` / `env` / `shell` / `exec` / `subsystem` (spec.md §4.3's
//! table), the PTY byte pumps, and the `close_once` teardown sequence.
//! Grounded in `local::session`'s env/resize-queue shape and
//! `original_source`'s Go session handling for the exact pump/reap
//! ordering.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use once_cell::sync::OnceCell;
use russh::{ChannelId, CryptoVec};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::warn;

/// `SSH_EXTENDED_DATA_STDERR` (RFC 4254 §5.2).
const EXTENDED_DATA_STDERR: u32 = 1;

use crate::error::{Result, ServerError};
use crate::pty::{PtyConfig, PtyHandle};
use crate::shell::Shell;

/// Bound on the resize queue (SPEC_FULL.md §3, C6).
const RESIZE_QUEUE_DEPTH: usize = 16;

/// Grace period between `SIGINT` and `SIGKILL` in the shell teardown
/// sequence (spec.md §4.3, "PTY lifecycle").
const KILL_GRACE: Duration = Duration::from_millis(100);

/// Decoded `pty-req`/`window-change` dimensions (spec.md §6).
#[derive(Debug, Clone, Copy)]
pub struct PtyDimensions {
    pub width_chars: u32,
    pub height_chars: u32,
}

/// An ordered `KEY=VALUE` environment with set-semantics on key (Data
/// Model §3): a later `env` request for an existing key replaces its
/// value in place rather than appending a duplicate.
#[derive(Default)]
pub struct OrderedEnv(parking_lot::Mutex<Vec<(String, String)>>);

impl OrderedEnv {
    pub fn upsert(&self, name: String, value: String) {
        let mut env = self.0.lock();
        match env.iter_mut().find(|(k, _)| *k == name) {
            Some((_, v)) => *v = value,
            None => env.push((name, value)),
        }
    }

    pub fn snapshot(&self) -> Vec<(String, String)> {
        self.0.lock().clone()
    }
}

/// One accepted `session` channel's mutable state (Data Model §3,
/// "Session State"): an ordered environment with set-semantics on key, a
/// bounded resize queue, and (once `shell`/`exec` runs) the spawned PTY.
pub struct SessionState {
    channel_id: ChannelId,
    handle: russh::server::Handle,
    env: OrderedEnv,
    ignore_env: bool,
    shell: Shell,
    initial_cwd: Option<PathBuf>,
    resize_tx: mpsc::Sender<[u32; 2]>,
    resize_rx: parking_lot::Mutex<Option<mpsc::Receiver<[u32; 2]>>>,
    /// Most recent size from `pty-req`/`window-change`, used as the
    /// initial `PtySize` when `shell` spawns the PTY - the resize queue
    /// itself is only drained once the PTY (and its resize consumer)
    /// exist, so the size that arrived with `pty-req` needs to survive
    /// until then.
    last_size: parking_lot::Mutex<(u16, u16)>,
    pty: OnceCell<Arc<PtyHandle>>,
    /// Stdin sink for an `exec` child (mutually exclusive with `pty` -
    /// a channel runs either `shell` or `exec`, never both).
    exec_stdin: OnceCell<mpsc::UnboundedSender<Vec<u8>>>,
    closed: Arc<OnceCell<()>>,
}

impl SessionState {
    pub fn new(
        channel_id: ChannelId,
        handle: russh::server::Handle,
        shell: Shell,
        initial_cwd: Option<PathBuf>,
        ignore_env: bool,
    ) -> Self {
        let (resize_tx, resize_rx) = mpsc::channel(RESIZE_QUEUE_DEPTH);
        Self {
            channel_id,
            handle,
            env: OrderedEnv::default(),
            ignore_env,
            shell,
            initial_cwd,
            resize_tx,
            resize_rx: parking_lot::Mutex::new(Some(resize_rx)),
            last_size: parking_lot::Mutex::new((80, 24)),
            pty: OnceCell::new(),
            exec_stdin: OnceCell::new(),
            closed: Arc::new(OnceCell::new()),
        }
    }

    /// `pty-req`: record the initial size in the resize queue, reply
    /// `true`, never spawn the PTY here (spec.md §4.3).
    pub fn handle_pty_req(&self, width_chars: u32, height_chars: u32) {
        *self.last_size.lock() = (width_chars as u16, height_chars as u16);
        let _ = self.resize_tx.try_send([width_chars, height_chars]);
    }

    /// `window-change`: push onto the resize queue. No reply required.
    pub fn handle_window_change(&self, width_chars: u32, height_chars: u32) {
        *self.last_size.lock() = (width_chars as u16, height_chars as u16);
        let _ = self.resize_tx.try_send([width_chars, height_chars]);
    }

    /// `env`: upsert into the ordered environment, set-semantics on key,
    /// unless `ignore_env` discards client-supplied env.
    pub fn handle_env(&self, name: String, value: String) {
        if self.ignore_env {
            return;
        }
        self.env.upsert(name, value);
    }

    fn env_snapshot(&self) -> Vec<(String, String)> {
        self.env.snapshot()
    }

    /// Spawns the configured shell behind a PTY and starts the resize
    /// consumer, the two byte pumps, and the independent wait-reaper
    /// (spec.md §4.3, "PTY lifecycle").
    pub async fn start_shell(self: &Arc<Self>) -> Result<()> {
        let (cols, rows) = *self.last_size.lock();
        let mut config = PtyConfig::for_shell(&self.shell, cols, rows, self.env_snapshot());
        config.cwd = self.initial_cwd.clone();

        let pty = Arc::new(PtyHandle::spawn(config).map_err(|e| {
            ServerError::ResourceExhausted(format!("pty spawn failed: {e}"))
        })?);
        self.pty
            .set(pty.clone())
            .map_err(|_| ServerError::Config("shell already started on this channel".into()))?;

        self.spawn_resize_consumer(pty.clone());
        self.spawn_byte_pumps(pty.clone());
        self.spawn_wait_reaper(pty);

        Ok(())
    }

    fn spawn_resize_consumer(self: &Arc<Self>, pty: Arc<PtyHandle>) {
        let mut rx = self
            .resize_rx
            .lock()
            .take()
            .expect("resize_rx taken twice");
        tokio::spawn(async move {
            while let Some([cols, rows]) = rx.recv().await {
                if let Err(e) = pty.resize(cols as u16, rows as u16) {
                    warn!(error = %e, "pty resize failed");
                }
            }
        });
    }

    /// Spawns the `PTY -> channel` pump task (spec.md §4.3). The other
    /// direction, `channel -> PTY`, has no task of its own: russh already
    /// delivers channel bytes to the dispatcher serially through its `data`
    /// callback, which this runtime turns straight into `write_stdin` -
    /// adding a second task to re-pump that same callback-driven stream
    /// would just be a relay with no independent failure mode to detect.
    /// `close_once` still fires from whichever side notices death first:
    /// this pump ending, or `channel_eof`/`channel_close` reaching the
    /// dispatcher (which calls [`SessionState::close_once`] directly).
    fn spawn_byte_pumps(self: &Arc<Self>, pty: Arc<PtyHandle>) {
        let channel_id = self.channel_id;
        let state = self.clone();
        let reader = pty.clone_reader();
        let pump_handle = self.handle.clone();
        tokio::spawn(async move {
            pty_to_channel(reader, channel_id, pump_handle).await;
            state.close_once().await;
        });
    }

    fn spawn_wait_reaper(self: &Arc<Self>, pty: Arc<PtyHandle>) {
        let state = self.clone();
        tokio::spawn(async move {
            let status = tokio::task::spawn_blocking(move || pty.wait()).await;
            let code = match status {
                Ok(Ok(status)) => status.exit_code(),
                _ => 1,
            };
            let _ = state.handle.exit_status_request(state.channel_id, code).await;
            state.close_once().await;
        });
    }

    /// Spawns `shell -c <command>` with no PTY, piping stdin/stdout/stderr
    /// to/from the channel (spec.md §4.3's `exec` row). Stdout is framed as
    /// ordinary channel data; stderr goes out as SSH extended data so the
    /// client can tell the streams apart the way a real terminal would.
    pub async fn start_exec(self: &Arc<Self>, command: &str) -> Result<()> {
        let mut cmd = Command::new(&self.shell.path);
        cmd.args(self.shell.exec_args(command));
        if let Some(cwd) = &self.initial_cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in self.env_snapshot() {
            cmd.env(key, value);
        }
        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| ServerError::ResourceExhausted(format!("exec spawn failed: {e}")))?;

        let stdin = child.stdin.take().expect("piped stdin");
        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");

        let (stdin_tx, mut stdin_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        self.exec_stdin
            .set(stdin_tx)
            .map_err(|_| ServerError::Config("exec already started on this channel".into()))?;

        tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(chunk) = stdin_rx.recv().await {
                if stdin.write_all(&chunk).await.is_err() {
                    break;
                }
            }
        });

        let channel_id = self.channel_id;
        let stdout_handle = self.handle.clone();
        tokio::spawn(async move {
            pump_stdout(stdout, channel_id, stdout_handle).await;
        });

        let stderr_handle = self.handle.clone();
        tokio::spawn(async move {
            pump_stderr(stderr, channel_id, stderr_handle).await;
        });

        let state = self.clone();
        tokio::spawn(async move {
            let status = child.wait().await;
            let code = match status {
                Ok(status) => status.code().unwrap_or(1) as u32,
                Err(_) => 1,
            };
            let _ = state.handle.exit_status_request(state.channel_id, code).await;
            state.close_once().await;
        });

        Ok(())
    }

    /// Routes inbound channel bytes to the PTY (or, for `exec`, to the
    /// child's stdin) once a shell/exec is running.
    pub fn write_stdin(&self, data: &[u8]) {
        if let Some(pty) = self.pty.get() {
            if let Ok(mut w) = pty.clone_writer().lock() {
                use std::io::Write;
                let _ = w.write_all(data);
            }
        } else if let Some(tx) = self.exec_stdin.get() {
            let _ = tx.send(data.to_vec());
        }
    }

    /// Closes the channel, then sends `SIGINT`, waits the grace period,
    /// then `SIGKILL`, exactly once regardless of which task (pump or
    /// reaper) observes death first (spec.md §4.3). `OnceCell::set`'s
    /// atomic win/lose outcome is the guard - whichever caller wins the
    /// race runs the teardown, everyone else returns immediately.
    pub async fn close_once(self: &Arc<Self>) {
        if self.closed.set(()).is_err() {
            return;
        }
        let _ = self.handle.close(self.channel_id).await;
        if let Some(pty) = self.pty.get().cloned() {
            pty.interrupt_then_kill(KILL_GRACE).await;
        }
    }

    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }
}

async fn pty_to_channel(
    reader: Arc<std::sync::Mutex<Box<dyn std::io::Read + Send>>>,
    channel_id: ChannelId,
    handle: russh::server::Handle,
) {
    loop {
        let reader = reader.clone();
        let read_result = tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; 8192];
            let mut guard = match reader.lock() {
                Ok(g) => g,
                Err(_) => return Ok(0),
            };
            use std::io::Read;
            guard.read(&mut buf).map(|n| (buf, n))
        })
        .await;

        match read_result {
            Ok(Ok((buf, n))) if n > 0 => {
                let data = CryptoVec::from(buf[..n].to_vec());
                if handle.data(channel_id, data).await.is_err() {
                    break;
                }
            }
            _ => break,
        }
    }
}

async fn pump_stdout(
    mut stdout: tokio::process::ChildStdout,
    channel_id: ChannelId,
    handle: russh::server::Handle,
) {
    let mut buf = [0u8; 8192];
    loop {
        match stdout.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let data = CryptoVec::from(buf[..n].to_vec());
                if handle.data(channel_id, data).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn pump_stderr(
    mut stderr: tokio::process::ChildStderr,
    channel_id: ChannelId,
    handle: russh::server::Handle,
) {
    let mut buf = [0u8; 8192];
    loop {
        match stderr.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let data = CryptoVec::from(buf[..n].to_vec());
                if handle
                    .extended_data(channel_id, EXTENDED_DATA_STDERR, data)
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
    }
}

/// Decodes an `exec` request's single length-prefixed command string
/// (spec.md §6).
pub fn decode_exec_command(payload: &[u8]) -> Result<String> {
    if payload.len() < 4 {
        return Err(ServerError::MalformedRequest("exec payload too short".into()));
    }
    let len = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize;
    let body = payload.get(4..4 + len).ok_or_else(|| {
        ServerError::MalformedRequest("exec payload length prefix out of bounds".into())
    })?;
    String::from_utf8(body.to_vec())
        .map_err(|_| ServerError::MalformedRequest("exec command is not valid utf-8".into()))
}

/// Decodes a `pty-req` payload's leading `term` string and the four
/// dimension fields (spec.md §6). Terminal modes are intentionally
/// ignored past the dimensions.
pub fn decode_pty_req(payload: &[u8]) -> Result<(String, PtyDimensions)> {
    let mut buf = BytesMut::from(payload);
    let term = read_ssh_string(&mut buf)?;
    let width_chars = read_u32(&mut buf)?;
    let height_chars = read_u32(&mut buf)?;
    let _width_px = read_u32(&mut buf)?;
    let _height_px = read_u32(&mut buf)?;
    Ok((term, PtyDimensions { width_chars, height_chars }))
}

fn read_u32(buf: &mut BytesMut) -> Result<u32> {
    if buf.len() < 4 {
        return Err(ServerError::MalformedRequest("truncated u32".into()));
    }
    let bytes = buf.split_to(4);
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn read_ssh_string(buf: &mut BytesMut) -> Result<String> {
    let len = read_u32(buf)? as usize;
    if buf.len() < len {
        return Err(ServerError::MalformedRequest("truncated string".into()));
    }
    let bytes = buf.split_to(len);
    String::from_utf8(bytes.to_vec())
        .map_err(|_| ServerError::MalformedRequest("string is not valid utf-8".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_exec_command_roundtrip() {
        let cmd = "echo helloworld";
        let mut payload = (cmd.len() as u32).to_be_bytes().to_vec();
        payload.extend_from_slice(cmd.as_bytes());
        assert_eq!(decode_exec_command(&payload).unwrap(), cmd);
    }

    #[test]
    fn decode_exec_command_rejects_truncated_payload() {
        assert!(decode_exec_command(&[0, 0, 0, 10, b'x']).is_err());
    }

    #[test]
    fn decode_pty_req_reads_dimensions() {
        let mut payload = 5u32.to_be_bytes().to_vec();
        payload.extend_from_slice(b"xterm");
        payload.extend_from_slice(&80u32.to_be_bytes());
        payload.extend_from_slice(&24u32.to_be_bytes());
        payload.extend_from_slice(&0u32.to_be_bytes());
        payload.extend_from_slice(&0u32.to_be_bytes());
        let (term, dims) = decode_pty_req(&payload).unwrap();
        assert_eq!(term, "xterm");
        assert_eq!(dims.width_chars, 80);
        assert_eq!(dims.height_chars, 24);
    }

    #[test]
    fn env_upsert_replaces_existing_key() {
        let env = OrderedEnv::default();
        env.upsert("FOO".into(), "1".into());
        env.upsert("FOO".into(), "2".into());
        assert_eq!(env.snapshot(), vec![("FOO".to_string(), "2".to_string())]);
    }

    #[test]
    fn env_upsert_preserves_insertion_order() {
        let env = OrderedEnv::default();
        env.upsert("B".into(), "1".into());
        env.upsert("A".into(), "2".into());
        assert_eq!(
            env.snapshot(),
            vec![("B".to_string(), "1".to_string()), ("A".to_string(), "2".to_string())]
        );
    }
}
