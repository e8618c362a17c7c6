//! Named Session Registry (C10).
//!
//! Grounded in the teacher's `session::registry::SessionRegistry`: a
//! `DashMap`-backed table plus a `create_lock` held across the
//! check-then-insert so two concurrent `create`s with the same name can't
//! both win (the teacher calls this out explicitly as a TOCTOU guard).
//! Unlike the teacher's client-side registry, a session here owns a real
//! PTY and a broadcast sender (`smux::fanout`) rather than an SSH handle.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::{Result, ServerError};
use crate::pty::{PtyConfig, PtyHandle};
use crate::shell::Shell;
use crate::smux::fanout;

/// Capacity of each session's output broadcast channel (SPEC_FULL.md C11):
/// large enough that a momentarily slow viewer doesn't force a `Lagged`
/// error on the very next chunk, small enough not to buffer unbounded
/// history for a disconnected one.
const BROADCAST_CAPACITY: usize = 1024;

/// Delay between a session's PTY spawning and writing its `initial_command`
/// (spec.md §4.7: "a short bounded delay (~100ms to let the shell print its
/// first prompt)").
const PROMPT_SETTLE_DELAY: Duration = Duration::from_millis(100);

/// A live named session: one PTY, one child shell, fanned out to however
/// many viewers are currently attached.
pub struct NamedSession {
    pub name: String,
    pty: Arc<PtyHandle>,
    output_tx: broadcast::Sender<bytes::Bytes>,
    viewer_count: AtomicUsize,
    created_at: SystemTime,
}

impl NamedSession {
    pub fn pty(&self) -> &Arc<PtyHandle> {
        &self.pty
    }

    pub fn subscribe(&self) -> broadcast::Receiver<bytes::Bytes> {
        self.output_tx.subscribe()
    }

    pub fn write_stdin(&self, data: &[u8]) {
        if let Ok(mut w) = self.pty.clone_writer().lock() {
            use std::io::Write;
            let _ = w.write_all(data);
        }
    }

    /// Last-writer-wins resize (spec.md §4.8).
    pub fn resize(&self, cols: u16, rows: u16) {
        if let Err(e) = self.pty.resize(cols, rows) {
            warn!(error = %e, session = %self.name, "pty resize failed");
        }
    }

    pub fn viewer_attached(&self) {
        self.viewer_count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn viewer_detached(&self) {
        self.viewer_count.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn viewer_count(&self) -> usize {
        self.viewer_count.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub(crate) fn test_instance(
        name: String,
        pty: Arc<PtyHandle>,
        output_tx: broadcast::Sender<bytes::Bytes>,
    ) -> Self {
        Self {
            name,
            pty,
            output_tx,
            viewer_count: AtomicUsize::new(0),
            created_at: SystemTime::now(),
        }
    }
}

/// Snapshot returned by [`SessionRegistry::list`] (spec.md §4.7, `list()`).
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub name: String,
    pub created_at: SystemTime,
    pub viewer_count: usize,
}

/// The named-session table (C10), `dashmap`-backed per SPEC_FULL.md.
pub struct SessionRegistry {
    sessions: dashmap::DashMap<String, Arc<NamedSession>>,
    shell: Shell,
    initial_cwd: Option<PathBuf>,
    create_lock: parking_lot::Mutex<()>,
}

impl SessionRegistry {
    pub fn new(shell: Shell, initial_cwd: Option<PathBuf>) -> Self {
        Self {
            sessions: dashmap::DashMap::new(),
            shell,
            initial_cwd,
            create_lock: parking_lot::Mutex::new(()),
        }
    }

    /// `create(name, initial_command?)` (spec.md §4.7). Spawns the PTY with
    /// `SMUX_SESSION_NAME` set in its environment (Scenario 4), starts the
    /// single PTY-reader/broadcast task, then - if `initial_command` is
    /// non-empty - writes it after [`PROMPT_SETTLE_DELAY`]. Starts a
    /// background watcher that removes the session the moment its shell
    /// exits (spec.md §4.7, last paragraph).
    /// Takes `registry` as an explicit `&Arc<Self>` parameter rather than
    /// an `Arc<Self>` method receiver (that form needs the unstable
    /// `arbitrary_self_types` feature) - the watcher task spawned inside
    /// still needs an owned, 'static `Arc<SessionRegistry>` to remove
    /// itself from the map later.
    pub fn create(
        registry: &Arc<Self>,
        name: &str,
        initial_command: Option<&str>,
        cols: u16,
        rows: u16,
    ) -> Result<Arc<NamedSession>> {
        let _guard = registry.create_lock.lock();
        if registry.sessions.contains_key(name) {
            return Err(ServerError::AlreadyExists(name.to_string()));
        }

        let env = vec![("SMUX_SESSION_NAME".to_string(), name.to_string())];
        let mut config = PtyConfig::for_shell(&registry.shell, cols, rows, env);
        config.cwd = registry.initial_cwd.clone();

        let pty = Arc::new(
            PtyHandle::spawn(config)
                .map_err(|e| ServerError::ResourceExhausted(format!("smux pty spawn failed: {e}")))?,
        );

        let (output_tx, _rx) = broadcast::channel(BROADCAST_CAPACITY);
        let session = Arc::new(NamedSession {
            name: name.to_string(),
            pty: pty.clone(),
            output_tx: output_tx.clone(),
            viewer_count: AtomicUsize::new(0),
            created_at: SystemTime::now(),
        });

        registry.sessions.insert(name.to_string(), session.clone());
        fanout::spawn_pty_reader(pty.clone(), output_tx);
        Self::spawn_wait_watcher(registry, name.to_string(), pty.clone());

        if let Some(command) = initial_command.filter(|c| !c.is_empty()) {
            let session = session.clone();
            let command = format!("{command}\n");
            tokio::spawn(async move {
                tokio::time::sleep(PROMPT_SETTLE_DELAY).await;
                session.write_stdin(command.as_bytes());
            });
        }

        info!(session = name, "named session created");
        Ok(session)
    }

    /// Attaches a background watcher that `wait`s the child and atomically
    /// removes the session the instant it exits, so no future `get` can
    /// observe a session whose shell has already died (spec.md §4.7's
    /// invariant).
    fn spawn_wait_watcher(registry: &Arc<Self>, name: String, pty: Arc<PtyHandle>) {
        let registry = registry.clone();
        tokio::spawn(async move {
            let _ = tokio::task::spawn_blocking(move || pty.wait()).await;
            if registry.sessions.remove(&name).is_some() {
                debug!(session = %name, "named session's shell exited, removed from registry");
            }
        });
    }

    pub fn get(&self, name: &str) -> Option<Arc<NamedSession>> {
        self.sessions.get(name).map(|e| e.value().clone())
    }

    pub fn list(&self) -> Vec<SessionSnapshot> {
        self.sessions
            .iter()
            .map(|e| SessionSnapshot {
                name: e.key().clone(),
                created_at: e.value().created_at,
                viewer_count: e.value().viewer_count(),
            })
            .collect()
    }

    /// `remove(name)` (spec.md §4.7): closes the PTY, kills the child,
    /// removes from the map. Removal happens first so a concurrent `get`
    /// never observes the about-to-die session (spec.md §4.7's invariant).
    pub async fn remove(&self, name: &str) -> Result<()> {
        let Some((_, session)) = self.sessions.remove(name) else {
            return Err(ServerError::NotFound(name.to_string()));
        };
        session
            .pty
            .interrupt_then_kill(Duration::from_millis(100))
            .await;
        Ok(())
    }

    /// `next_available_id()` (spec.md §4.7): the smallest positive integer,
    /// stringified, not currently a key in the map.
    pub fn next_available_id(&self) -> String {
        let mut candidate: u64 = 1;
        loop {
            let name = candidate.to_string();
            if !self.sessions.contains_key(&name) {
                return name;
            }
            candidate += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn test_shell() -> Shell {
        Shell::resolve(PathBuf::from("/bin/sh")).unwrap_or(Shell { path: PathBuf::from("/bin/sh") })
    }

    #[test]
    fn next_available_id_fills_gaps() {
        let registry = SessionRegistry::new(test_shell(), None);
        registry.sessions.insert(
            "1".to_string(),
            Arc::new(NamedSession {
                name: "1".to_string(),
                pty: dummy_pty(),
                output_tx: broadcast::channel(1).0,
                viewer_count: AtomicUsize::new(0),
                created_at: SystemTime::now(),
            }),
        );
        registry.sessions.insert(
            "2".to_string(),
            Arc::new(NamedSession {
                name: "2".to_string(),
                pty: dummy_pty(),
                output_tx: broadcast::channel(1).0,
                viewer_count: AtomicUsize::new(0),
                created_at: SystemTime::now(),
            }),
        );
        assert_eq!(registry.next_available_id(), "3");
    }

    #[test]
    fn empty_registry_next_id_is_one() {
        let registry = SessionRegistry::new(test_shell(), None);
        assert_eq!(registry.next_available_id(), "1");
    }

    /// A `PtyHandle` that has actually spawned a trivial child, just so the
    /// struct-literal tests above don't need to touch real PTY creation
    /// semantics beyond "some process exists".
    fn dummy_pty() -> Arc<PtyHandle> {
        let config = PtyConfig::for_shell(&test_shell(), 80, 24, vec![]);
        Arc::new(PtyHandle::spawn(config).expect("spawn /bin/sh for test"))
    }
}
