//! Smux control plane.
//!
//! The SSH-first half of spec.md §6 ("Smux control plane"): username at
//! login selects the session name, and a `shell` request attaches the
//! channel to that named session instead of spawning an ephemeral one the
//! way [`crate::dispatcher::ConnectionHandler`] does for a plain `sshd`.
//! Grounded the same way `ConnectionHandler` is grounded (teacher's
//! `SshHandler`), trimmed to the requests smux actually needs: no exec, no
//! forwarding, no subsystem - this is a PTY multiplexer front door, not a
//! general-purpose shell host.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::OnceCell;
use parking_lot::Mutex as PLMutex;
use russh::keys::PublicKey;
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId};
use tracing::{debug, info, warn};

use crate::auth::{AuthProvider, Credential};
use crate::config::ListenAddr;
use crate::error::ServerError;
use crate::keygen::HostIdentity;
use crate::shell::Shell;
use crate::smux::fanout;
use crate::smux::registry::{NamedSession, SessionRegistry};
use crate::smux::viewer_ssh::SshViewerSink;

/// Configuration for the smux daemon binary, mirroring
/// [`crate::config::ServerConfig`]'s shape but scoped to what smux needs:
/// no handler registry, no SFTP/forwarding toggles - those are `sshd`
/// concerns.
pub struct SmuxConfig {
    pub listen_addr: ListenAddr,
    pub shell: Shell,
    pub initial_cwd: Option<PathBuf>,
    pub host_identity: HostIdentity,
    pub auth_provider: Arc<dyn AuthProvider>,
    pub keepalive_interval: std::time::Duration,
    /// Bind address for the WebSocket viewer transport. `None` disables it
    /// - the SSH control plane alone is a complete smux daemon.
    pub ws_listen_addr: Option<SocketAddr>,
    /// TTL applied to viewer auth tokens minted for the WebSocket transport
    /// (`smux::viewer_ws::validate_token`'s `validity` argument) -
    /// threaded all the way through so `SMUXD_WS_TOKEN_TTL_SECS` actually
    /// takes effect instead of a hardcoded default.
    pub ws_token_ttl: std::time::Duration,
}

/// Runs the smux SSH control-plane accept loop on `config.listen_addr`
/// until the process exits, the same one-task-per-connection shape
/// [`crate::listener::serve`] uses for plain `sshd` (spec.md §4.6 applies
/// equally here - smux's control plane is still an SSH listener).
pub async fn serve(config: Arc<SmuxConfig>, registry: Arc<SessionRegistry>) -> Result<(), ServerError> {
    let russh_cfg = Arc::new(russh::server::Config {
        keys: vec![config.host_identity.private_key().clone()],
        ..Default::default()
    });

    match &config.listen_addr {
        ListenAddr::Tcp { host, port } => {
            let listener = tokio::net::TcpListener::bind((host.as_str(), *port))
                .await
                .map_err(|e| ServerError::Config(format!("bind {host}:{port}: {e}")))?;
            info!(host, port, "smux control plane listening");
            loop {
                match listener.accept().await {
                    Ok((socket, peer_addr)) => {
                        spawn_connection(registry.clone(), config.clone(), russh_cfg.clone(), Some(peer_addr), socket);
                    }
                    Err(e) => warn!(error = %e, "smux tcp accept failed"),
                }
            }
        }
        ListenAddr::UnixSocket { path } => {
            let listener = crate::listener::bind_unix_socket(path)?;
            info!(path = %path.display(), "smux control plane listening");
            let result: Result<(), ServerError> = async {
                loop {
                    match listener.accept().await {
                        Ok((socket, _addr)) => {
                            spawn_connection(registry.clone(), config.clone(), russh_cfg.clone(), None, socket);
                        }
                        Err(e) => warn!(error = %e, "smux unix accept failed"),
                    }
                }
            }
            .await;
            let _ = std::fs::remove_file(path);
            result
        }
    }
}

fn spawn_connection<S>(
    registry: Arc<SessionRegistry>,
    config: Arc<SmuxConfig>,
    russh_cfg: Arc<russh::server::Config>,
    peer_addr: Option<SocketAddr>,
    socket: S,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let handler = SmuxHandler::new(registry, config.auth_provider.clone(), config.keepalive_interval, peer_addr);
        if let Err(e) = russh::server::run_stream(russh_cfg, socket, handler).await {
            debug!(error = ?e, "smux connection ended");
        }
    });
}

/// `user@anything` -> `user`; empty -> `next_available_id()` (spec.md §6,
/// §4.7).
pub fn resolve_session_name(login: &str, registry: &SessionRegistry) -> String {
    if login.is_empty() {
        return registry.next_available_id();
    }
    match login.split_once('@') {
        Some((name, _)) if !name.is_empty() => name.to_string(),
        _ => login.to_string(),
    }
}

struct ChannelState {
    last_size: PLMutex<(u16, u16)>,
    attached: OnceCell<(Arc<NamedSession>, tokio::task::JoinHandle<()>)>,
}

impl Default for ChannelState {
    fn default() -> Self {
        Self {
            last_size: PLMutex::new((80, 24)),
            attached: OnceCell::new(),
        }
    }
}

/// Handles one accepted smux connection: login-name resolution, and
/// attaching the `session` channel to a named, possibly-already-running
/// PTY rather than spawning a fresh one.
pub struct SmuxHandler {
    registry: Arc<SessionRegistry>,
    auth_provider: Arc<dyn AuthProvider>,
    keepalive_interval: std::time::Duration,
    peer_addr: Option<SocketAddr>,
    user: PLMutex<Option<String>>,
    channels: DashMap<ChannelId, Arc<ChannelState>>,
    keepalive_started: AtomicBool,
}

impl SmuxHandler {
    pub fn new(
        registry: Arc<SessionRegistry>,
        auth_provider: Arc<dyn AuthProvider>,
        keepalive_interval: std::time::Duration,
        peer_addr: Option<SocketAddr>,
    ) -> Self {
        Self {
            registry,
            auth_provider,
            keepalive_interval,
            peer_addr,
            user: PLMutex::new(None),
            channels: DashMap::new(),
            keepalive_started: AtomicBool::new(false),
        }
    }

    fn accept_as(&self, user: &str) {
        let mut guard = self.user.lock();
        if guard.is_none() {
            *guard = Some(user.to_string());
        }
    }

    fn current_user(&self) -> String {
        self.user.lock().clone().unwrap_or_else(|| "unknown".to_string())
    }

    /// Same heartbeat as `ConnectionHandler::maybe_start_keepalive`: one
    /// `send_keepalive` ping per interval, started once the first channel
    /// opens.
    fn maybe_start_keepalive(&self, session: &Session) {
        if self.keepalive_interval.is_zero() {
            return;
        }
        if self.keepalive_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let handle = session.handle();
        let interval = self.keepalive_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = handle.send_keepalive(true).await {
                    debug!(error = ?e, "keepalive failed, connection likely closed");
                    break;
                }
            }
        });
    }
}

impl Handler for SmuxHandler {
    type Error = ServerError;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        let decision = self
            .auth_provider
            .authenticate(user, &Credential::Password(password.to_string()))
            .await;
        if decision.accepted() {
            self.accept_as(user);
            Ok(Auth::Accept)
        } else {
            Ok(Auth::reject())
        }
    }

    async fn auth_publickey_offered(
        &mut self,
        _user: &str,
        _public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        Ok(Auth::Accept)
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        let decision = self
            .auth_provider
            .authenticate(user, &Credential::PublicKey(public_key.clone()))
            .await;
        if decision.accepted() {
            self.accept_as(user);
            Ok(Auth::Accept)
        } else {
            Ok(Auth::reject())
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.channels.insert(channel.id(), Arc::new(ChannelState::default()));
        self.maybe_start_keepalive(session);
        Ok(true)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(state) = self.channels.get(&channel) {
            *state.last_size.lock() = (col_width as u16, row_height as u16);
            session.channel_success(channel)?;
        } else {
            session.channel_failure(channel)?;
        }
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(state) = self.channels.get(&channel) {
            *state.last_size.lock() = (col_width as u16, row_height as u16);
            if let Some((named, _)) = state.attached.get() {
                named.resize(col_width as u16, row_height as u16);
            }
        }
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        _variable_name: &str,
        _variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        // A viewer's own env is irrelevant to a shared session (already
        // fixed at creation time), but the request still needs a reply.
        session.channel_success(channel)?;
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let Some(state) = self.channels.get(&channel).map(|s| s.value().clone()) else {
            session.channel_failure(channel)?;
            return Ok(());
        };

        let name = resolve_session_name(&self.current_user(), &self.registry);
        let (cols, rows) = *state.last_size.lock();

        let named = match self.registry.get(&name) {
            Some(existing) => existing,
            None => match SessionRegistry::create(&self.registry, &name, None, cols, rows) {
                Ok(created) => created,
                Err(e) => {
                    warn!(error = %e, session = name, "failed to create smux session");
                    session.channel_failure(channel)?;
                    return Ok(());
                }
            },
        };
        named.resize(cols, rows);

        let sink = SshViewerSink::new(session.handle(), channel);
        let join = fanout::attach(named.clone(), sink);
        if state.attached.set((named, join)).is_err() {
            warn!(channel = ?channel, "shell already attached on this channel");
        }

        info!(session = name, user = %self.current_user(), "viewer attached to smux session");
        session.channel_success(channel)?;
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        _data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        // smux is a PTY multiplexer, not a general exec host.
        session.channel_failure(channel)?;
        Ok(())
    }

    async fn channel_eof(&mut self, channel: ChannelId, _session: &mut Session) -> Result<(), Self::Error> {
        self.detach(channel);
        Ok(())
    }

    async fn channel_close(&mut self, channel: ChannelId, _session: &mut Session) -> Result<(), Self::Error> {
        self.channels.remove(&channel);
        Ok(())
    }

    async fn data(&mut self, channel: ChannelId, data: &[u8], _session: &mut Session) -> Result<(), Self::Error> {
        if let Some(state) = self.channels.get(&channel) {
            if let Some((named, _)) = state.attached.get() {
                named.write_stdin(data);
            }
        }
        Ok(())
    }
}

impl SmuxHandler {
    /// Stops this channel's viewer write task. The named session and its
    /// PTY are untouched - spec.md Scenario 5: a disconnecting viewer
    /// leaves the shell and any remaining viewers alive.
    fn detach(&self, channel: ChannelId) {
        if let Some(state) = self.channels.get(&channel) {
            if let Some((_, join)) = state.attached.get() {
                join.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn test_shell() -> Shell {
        Shell { path: PathBuf::from("/bin/sh") }
    }

    #[test]
    fn resolve_session_name_strips_host_suffix() {
        let registry = SessionRegistry::new(test_shell(), None);
        assert_eq!(resolve_session_name("alice@anything", &registry), "alice");
    }

    #[test]
    fn resolve_session_name_empty_login_uses_next_id() {
        let registry = SessionRegistry::new(test_shell(), None);
        assert_eq!(resolve_session_name("", &registry), "1");
    }

    #[test]
    fn resolve_session_name_plain_login_is_unchanged() {
        let registry = SessionRegistry::new(test_shell(), None);
        assert_eq!(resolve_session_name("bob", &registry), "bob");
    }
}
