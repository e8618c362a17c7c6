//! TCP-Forwarding Handler (C7).
//!
//! `direct-tcpip` (local forwarding) and `tcpip-forward`/`cancel-tcpip-
//! forward` (remote forwarding) share one bidirectional-pipe helper,
//! generalizing the teacher's `forwarding::local` `tokio::io::copy` pump to
//! a `russh` channel on one side instead of a second TCP socket.

use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use russh::Channel;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

use crate::error::{Result, ServerError};

/// A listener opened by `tcpip-forward`, owned by the connection that
/// requested it (Data Model §3, "Forward Listener"). Dropping the stop
/// signal ends the accept loop and removes the binding.
pub struct ForwardListener {
    bind_host: String,
    bind_port: u16,
    stop: tokio::sync::watch::Sender<bool>,
}

impl ForwardListener {
    pub fn bind_port(&self) -> u16 {
        self.bind_port
    }

    pub fn bind_host(&self) -> &str {
        &self.bind_host
    }

    fn stop(&self) {
        let _ = self.stop.send(true);
    }
}

/// Per-connection registry of active remote-forward listeners, keyed by
/// `(bind_host, bind_port)`. The forward-listener table never contains a
/// closed listener (Data Model §3 invariant) - `cancel` removes and stops
/// the entry atomically, and connection teardown calls
/// [`ListenerRegistry::close_all`].
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: DashMap<(String, u16), Arc<ForwardListener>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, listener: Arc<ForwardListener>) {
        self.listeners
            .insert((listener.bind_host.clone(), listener.bind_port), listener);
    }

    /// Removes and stops the listener bound to `(host, port)`. Returns
    /// `false` if no such listener was registered (spec.md §4.4: cancelling
    /// an unknown binding fails the request).
    pub fn cancel(&self, host: &str, port: u16) -> bool {
        match self.listeners.remove(&(host.to_string(), port)) {
            Some((_, listener)) => {
                listener.stop();
                true
            }
            None => false,
        }
    }

    /// Closes every listener owned by this connection (spec.md §4.4,
    /// "Cleanup").
    pub fn close_all(&self) {
        for entry in self.listeners.iter() {
            entry.value().stop();
        }
        self.listeners.clear();
    }
}

/// Dials `dest_host:dest_port` for a `direct-tcpip` channel-open request.
/// The caller accepts or rejects the channel based on the result (spec.md
/// §4.4).
pub async fn dial(dest_host: &str, dest_port: u16) -> Result<TcpStream> {
    TcpStream::connect((dest_host, dest_port))
        .await
        .map_err(|e| ServerError::ResourceExhausted(format!("connect {dest_host}:{dest_port}: {e}")))
}

/// Bidirectional byte pipe between a `russh` channel and a TCP socket,
/// shared by `direct-tcpip` and `forwarded-tcpip` (spec.md §4.4). Both
/// directions run concurrently; the pipe ends when both complete.
pub async fn pipe_channel_socket(channel: Channel<russh::server::Msg>, socket: TcpStream) {
    let channel_stream = channel.into_stream();
    let (mut sock_rd, mut sock_wr) = socket.into_split();
    let (mut chan_rd, mut chan_wr) = tokio::io::split(channel_stream);

    let to_socket = async {
        let _ = tokio::io::copy(&mut chan_rd, &mut sock_wr).await;
        let _ = sock_wr.shutdown().await;
    };
    let to_channel = async {
        let _ = tokio::io::copy(&mut sock_rd, &mut chan_wr).await;
        let _ = chan_wr.shutdown().await;
    };

    tokio::join!(to_socket, to_channel);
}

/// Handles a `tcpip-forward` global request: binds `bind_host:bind_port`
/// (port 0 picks an ephemeral one), registers the listener, and spawns its
/// accept loop. Returns the actually-bound port (spec.md §4.4, "Property
/// (remote-forward port binding)").
pub async fn start_remote_forward(
    bind_host: &str,
    bind_port: u16,
    registry: Arc<ListenerRegistry>,
    handle: russh::server::Handle,
) -> Result<u16> {
    let listener = TcpListener::bind((bind_host, bind_port))
        .await
        .map_err(|e| ServerError::ResourceExhausted(format!("bind {bind_host}:{bind_port}: {e}")))?;
    let bound_port = listener
        .local_addr()
        .map_err(|e| ServerError::ResourceExhausted(e.to_string()))?
        .port();

    let (stop_tx, mut stop_rx) = tokio::sync::watch::channel(false);
    let entry = Arc::new(ForwardListener {
        bind_host: bind_host.to_string(),
        bind_port: bound_port,
        stop: stop_tx,
    });
    registry.insert(entry);

    let bind_host = bind_host.to_string();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = stop_rx.changed() => break,
                accepted = listener.accept() => {
                    let (socket, origin) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "remote-forward accept failed");
                            continue;
                        }
                    };
                    spawn_forwarded_channel(handle.clone(), bind_host.clone(), bound_port, socket, origin);
                }
            }
        }
        debug!(host = %bind_host, port = bound_port, "remote-forward listener stopped");
    });

    Ok(bound_port)
}

fn spawn_forwarded_channel(
    handle: russh::server::Handle,
    bind_host: String,
    bind_port: u16,
    socket: TcpStream,
    origin: SocketAddr,
) {
    tokio::spawn(async move {
        let channel = handle
            .channel_open_forwarded_tcpip(
                bind_host,
                bind_port as u32,
                origin.ip().to_string(),
                origin.port() as u32,
            )
            .await;
        match channel {
            Ok(channel) => pipe_channel_socket(channel, socket).await,
            Err(e) => warn!(error = ?e, "failed to originate forwarded-tcpip channel"),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_unknown_binding_fails() {
        let registry = ListenerRegistry::new();
        assert!(!registry.cancel("127.0.0.1", 9999));
    }

    #[tokio::test]
    async fn cancel_known_binding_succeeds() {
        let registry = ListenerRegistry::new();
        let (tx, _rx) = tokio::sync::watch::channel(false);
        registry.insert(Arc::new(ForwardListener {
            bind_host: "127.0.0.1".into(),
            bind_port: 2222,
            stop: tx,
        }));
        assert!(registry.cancel("127.0.0.1", 2222));
        assert!(!registry.cancel("127.0.0.1", 2222));
    }
}
