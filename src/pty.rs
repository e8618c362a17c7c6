//! PTY backend (C1).
//!
//! Wraps `portable-pty` behind a thread-safe handle, grounded in the
//! teacher's `local::pty::PtyHandle`: a `MasterPty` is not `Sync`, so every
//! operation goes through a `std::sync::Mutex` rather than trying to share
//! the trait object directly.

use std::io::{Read, Write};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use thiserror::Error;

#[cfg(unix)]
use nix::sys::signal::{kill, Signal};
#[cfg(unix)]
use nix::unistd::Pid;

use crate::shell::Shell;

#[derive(Debug, Error)]
pub enum PtyError {
    #[error("failed to create pty: {0}")]
    CreateFailed(String),

    #[error("failed to spawn shell: {0}")]
    SpawnFailed(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("pty system error: {0}")]
    PtySystemError(String),

    #[error("lock poisoned")]
    LockError,
}

/// Configuration for spawning a PTY-backed child process.
pub struct PtyConfig {
    pub cols: u16,
    pub rows: u16,
    pub argv: Vec<String>,
    pub cwd: Option<std::path::PathBuf>,
    /// Ordered, set-semantics-on-key environment (Data Model §3).
    pub env: Vec<(String, String)>,
}

impl PtyConfig {
    /// Build the argv/env for a `shell` session request: login-mode argv,
    /// `TERM` defaulted to `xterm-256color` if the caller didn't set one.
    pub fn for_shell(shell: &Shell, cols: u16, rows: u16, env: Vec<(String, String)>) -> Self {
        let mut env = env;
        if !env.iter().any(|(k, _)| k == "TERM") {
            env.push(("TERM".to_string(), "xterm-256color".to_string()));
        }
        let mut argv = vec![shell.path.to_string_lossy().to_string()];
        argv.extend(shell.login_args());
        Self {
            cols,
            rows,
            argv,
            cwd: None,
            env,
        }
    }
}

/// A live pseudoterminal and the child process attached to its slave side.
pub struct PtyHandle {
    master: StdMutex<Box<dyn MasterPty + Send>>,
    child: StdMutex<Box<dyn portable_pty::Child + Send + Sync>>,
    reader: Arc<StdMutex<Box<dyn Read + Send>>>,
    writer: Arc<StdMutex<Box<dyn Write + Send>>>,
}

// Every field is reached exclusively through its own StdMutex.
unsafe impl Sync for PtyHandle {}

impl PtyHandle {
    pub fn spawn(config: PtyConfig) -> Result<Self, PtyError> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(PtySize {
                rows: config.rows,
                cols: config.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::CreateFailed(e.to_string()))?;

        let (program, args) = config
            .argv
            .split_first()
            .ok_or_else(|| PtyError::SpawnFailed("empty argv".into()))?;
        let mut cmd = CommandBuilder::new(program);
        for arg in args {
            cmd.arg(arg);
        }
        if let Some(cwd) = &config.cwd {
            cmd.cwd(cwd);
        }
        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::PtySystemError(format!("clone reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::PtySystemError(format!("take writer: {e}")))?;

        Ok(Self {
            master: StdMutex::new(pair.master),
            child: StdMutex::new(child),
            reader: Arc::new(StdMutex::new(reader)),
            writer: Arc::new(StdMutex::new(writer)),
        })
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        let master = self.master.lock().map_err(|_| PtyError::LockError)?;
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::PtySystemError(e.to_string()))
    }

    pub fn clone_reader(&self) -> Arc<StdMutex<Box<dyn Read + Send>>> {
        self.reader.clone()
    }

    pub fn clone_writer(&self) -> Arc<StdMutex<Box<dyn Write + Send>>> {
        self.writer.clone()
    }

    /// `Ok(None)` if the child is still running, `Ok(Some(status))` if it
    /// has already exited.
    pub fn try_wait(&self) -> Result<Option<portable_pty::ExitStatus>, PtyError> {
        let mut child = self.child.lock().map_err(|_| PtyError::LockError)?;
        child
            .try_wait()
            .map_err(|e| PtyError::PtySystemError(e.to_string()))
    }

    pub fn wait(&self) -> Result<portable_pty::ExitStatus, PtyError> {
        let mut child = self.child.lock().map_err(|_| PtyError::LockError)?;
        child
            .wait()
            .map_err(|e| PtyError::PtySystemError(e.to_string()))
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.lock().ok().and_then(|c| c.process_id())
    }

    /// Send `SIGINT`, wait briefly, then `SIGKILL` - the signal-correct
    /// shell-termination sequence spec.md §4.3 requires for `shell`
    /// sessions. Errors from an already-exited process are suppressed.
    #[cfg(unix)]
    pub async fn interrupt_then_kill(&self, grace: std::time::Duration) {
        if let Some(pid) = self.pid() {
            let pid = Pid::from_raw(pid as i32);
            let _ = kill(pid, Signal::SIGINT);
            tokio::time::sleep(grace).await;
            let _ = kill(pid, Signal::SIGKILL);
        }
        if let Ok(mut child) = self.child.lock() {
            let _ = child.kill();
        }
    }

    #[cfg(not(unix))]
    pub async fn interrupt_then_kill(&self, _grace: std::time::Duration) {
        if let Ok(mut child) = self.child.lock() {
            let _ = child.kill();
        }
    }

    pub fn kill(&self) -> Result<(), PtyError> {
        let mut child = self.child.lock().map_err(|_| PtyError::LockError)?;
        child
            .kill()
            .map_err(|e| PtyError::PtySystemError(e.to_string()))
    }
}

impl Drop for PtyHandle {
    fn drop(&mut self) {
        let _ = self.kill();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn for_shell_defaults_term() {
        let shell = Shell {
            path: PathBuf::from("/bin/bash"),
        };
        let config = PtyConfig::for_shell(&shell, 80, 24, vec![]);
        assert!(config.env.iter().any(|(k, v)| k == "TERM" && v == "xterm-256color"));
        assert_eq!(config.argv, vec!["/bin/bash".to_string(), "-l".to_string()]);
    }

    #[test]
    fn for_shell_respects_caller_term() {
        let shell = Shell {
            path: PathBuf::from("/bin/dash"),
        };
        let config = PtyConfig::for_shell(&shell, 80, 24, vec![("TERM".into(), "vt100".into())]);
        let term_count = config.env.iter().filter(|(k, _)| k == "TERM").count();
        assert_eq!(term_count, 1);
    }
}
