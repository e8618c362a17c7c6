//! Listener/Acceptor (C9).
//!
//! Two transport modes - TCP and a filesystem socket - both terminating in
//! the same `russh::server::run_stream` handshake, grounded in the pack's
//! `SftpServer::run` accept loop: bind once, then loop accepting, spawning
//! one task per connection that runs the handshake and hands off to the
//! dispatcher (`ConnectionHandler`). A stale Unix socket is unlinked before
//! bind and the path is unlinked again on shutdown, in wezterm's
//! `safely_create_sock_path` style; mode is narrowed to `0600` after bind
//! since `UnixListener::bind` doesn't take a mode argument.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::net::{TcpListener, UnixListener};
use tracing::{debug, error, info, warn};

use crate::config::{ListenAddr, ServerConfig};
use crate::dispatcher::ConnectionHandler;
use crate::error::{Result, ServerError};

/// Builds the `russh::server::Config` shared by every accepted connection
/// on this listener: just the host key - everything else (auth method set,
/// rekey limits, timeouts) is `russh`'s own default, since spec.md leaves
/// those as implementation details of the underlying transport.
fn russh_config(config: &ServerConfig) -> russh::server::Config {
    russh::server::Config {
        keys: vec![config.host_identity.private_key().clone()],
        ..Default::default()
    }
}

/// Runs the accept loop for `config.listen_addr` until the process exits.
/// Each accepted transport is handed a fresh [`ConnectionHandler`] and
/// handshaken on its own task, so one slow or hostile client never blocks
/// another (spec.md §4.6).
pub async fn serve(config: Arc<ServerConfig>) -> Result<()> {
    let russh_cfg = Arc::new(russh_config(&config));
    match &config.listen_addr {
        ListenAddr::Tcp { host, port } => serve_tcp(config.clone(), russh_cfg, host, *port).await,
        ListenAddr::UnixSocket { path } => serve_unix(config.clone(), russh_cfg, path).await,
    }
}

async fn serve_tcp(
    config: Arc<ServerConfig>,
    russh_cfg: Arc<russh::server::Config>,
    host: &str,
    port: u16,
) -> Result<()> {
    let listener = TcpListener::bind((host, port))
        .await
        .map_err(|e| ServerError::Config(format!("bind {host}:{port}: {e}")))?;
    info!(host, port, "listening");

    loop {
        match listener.accept().await {
            Ok((socket, peer_addr)) => {
                let config = config.clone();
                let russh_cfg = russh_cfg.clone();
                tokio::spawn(async move {
                    let handler = ConnectionHandler::new(config, Some(peer_addr));
                    if let Err(e) = russh::server::run_stream(russh_cfg, socket, handler).await {
                        debug!(error = ?e, %peer_addr, "connection ended");
                    }
                });
            }
            Err(e) => {
                error!(error = %e, "tcp accept failed");
            }
        }
    }
}

async fn serve_unix(
    config: Arc<ServerConfig>,
    russh_cfg: Arc<russh::server::Config>,
    path: &Path,
) -> Result<()> {
    let listener = bind_unix_socket(path)?;
    info!(path = %path.display(), "listening");

    let result = accept_unix_loop(listener, config, russh_cfg).await;
    let _ = std::fs::remove_file(path);
    result
}

async fn accept_unix_loop(
    listener: UnixListener,
    config: Arc<ServerConfig>,
    russh_cfg: Arc<russh::server::Config>,
) -> Result<()> {
    loop {
        match listener.accept().await {
            Ok((socket, _addr)) => {
                let config = config.clone();
                let russh_cfg = russh_cfg.clone();
                tokio::spawn(async move {
                    let handler = ConnectionHandler::new(config, None);
                    if let Err(e) = russh::server::run_stream(russh_cfg, socket, handler).await {
                        debug!(error = ?e, "connection ended");
                    }
                });
            }
            Err(e) => {
                error!(error = %e, "unix accept failed");
            }
        }
    }
}

/// Unlinks a stale socket file, binds fresh, then narrows permissions to
/// `0600` (spec.md §4.6: "permissions 0600, user-only").
pub(crate) fn bind_unix_socket(path: &Path) -> Result<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path)
            .map_err(|e| ServerError::Config(format!("unlink stale socket {}: {e}", path.display())))?;
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).ok();
    }
    let listener = UnixListener::bind(path)
        .map_err(|e| ServerError::Config(format!("bind {}: {e}", path.display())))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(path, perms)
            .map_err(|e| ServerError::Config(format!("chmod {}: {e}", path.display())))?;
    }

    Ok(listener)
}

/// Resolves the smux control socket path: `/var/run/smux.sock`, falling
/// back to `/tmp/smux.sock` when the primary directory isn't writable
/// (spec.md §9, "Filesystem socket").
pub fn resolve_smux_socket_path() -> PathBuf {
    let primary = PathBuf::from("/var/run/smux.sock");
    if is_writable_dir(Path::new("/var/run")) {
        return primary;
    }
    warn!("/var/run is not writable, falling back to /tmp/smux.sock");
    PathBuf::from("/tmp/smux.sock")
}

fn is_writable_dir(dir: &Path) -> bool {
    let probe = dir.join(format!(".smux-write-probe-{}", std::process::id()));
    match std::fs::File::create(&probe) {
        Ok(_) => {
            let _ = std::fs::remove_file(&probe);
            true
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writable_dir_probe_succeeds_for_tmp() {
        assert!(is_writable_dir(Path::new("/tmp")));
    }

    #[test]
    fn writable_dir_probe_fails_for_missing_dir() {
        assert!(!is_writable_dir(Path::new("/no/such/directory/at/all")));
    }

    #[test]
    fn unix_socket_bind_sets_owner_only_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.sock");
        let _listener = bind_unix_socket(&path).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o600);
        }
    }

    #[test]
    fn unix_socket_bind_unlinks_stale_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.sock");
        std::fs::write(&path, b"not a socket").unwrap();
        assert!(bind_unix_socket(&path).is_ok());
    }
}
