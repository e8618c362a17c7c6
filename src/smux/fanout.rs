//! Viewer Fan-Out (C11).
//!
//! The mandated broadcast design (spec.md §4.8): one task reads the PTY
//! and publishes each chunk on a `tokio::sync::broadcast` channel; every
//! attached viewer gets its own subscription and its own write task, so a
//! slow viewer never steals bytes from another. Grounded in the teacher's
//! `pty_to_channel` pump shape (`session_runtime.rs`), adapted to fan a
//! single read out to N writers instead of one.
//!
//! Neither viewer transport is a plain byte stream - an SSH channel writes
//! through `Handle::data`, a WebSocket viewer writes a framed `Message` -
//! so the write side is abstracted behind [`ViewerSink`] (object-safe via
//! `async-trait`, the same pattern the dispatcher uses for its
//! `SubsystemHandler`) rather than `AsyncWrite`.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;
use tracing::debug;

use crate::pty::PtyHandle;
use crate::smux::registry::NamedSession;

/// One viewer's outgoing side. `send` returns `false` to signal the viewer
/// is gone and its write task should stop.
#[async_trait]
pub trait ViewerSink: Send + 'static {
    async fn send(&mut self, data: Bytes) -> bool;
}

/// Reads the PTY in a blocking thread (same shape as
/// `session_runtime::pty_to_channel`) and publishes each chunk. A `send`
/// error just means no receiver currently exists - normal when a session
/// has no attached viewers - and is not a reason to stop reading: the PTY
/// must keep draining or the shell blocks on a full tty buffer.
pub fn spawn_pty_reader(pty: Arc<PtyHandle>, output_tx: broadcast::Sender<Bytes>) {
    let reader = pty.clone_reader();
    tokio::spawn(async move {
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
                    let _ = output_tx.send(Bytes::copy_from_slice(&buf[..n]));
                }
                _ => break,
            }
        }
        debug!("smux pty reader stopped");
    });
}

/// Attaches one viewer's outgoing side: subscribes to the session's
/// broadcast channel and spawns a task that feeds every chunk to `sink`
/// until it signals failure, the session closes, or the viewer lags badly
/// enough to be dropped from the broadcast channel. Detaches (decrementing
/// the viewer count) when the task ends either way.
pub fn attach<S>(session: Arc<NamedSession>, mut sink: S) -> tokio::task::JoinHandle<()>
where
    S: ViewerSink,
{
    session.viewer_attached();
    let mut rx = session.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(chunk) => {
                    if !sink.send(chunk).await {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "viewer lagged behind pty output, continuing");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        session.viewer_detached();
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Mutex;

    struct CollectingSink {
        out: Arc<Mutex<Vec<u8>>>,
    }

    #[async_trait]
    impl ViewerSink for CollectingSink {
        async fn send(&mut self, data: Bytes) -> bool {
            self.out.lock().unwrap().extend_from_slice(&data);
            true
        }
    }

    #[tokio::test]
    async fn attach_forwards_broadcast_chunks_to_sink() {
        let (tx, _rx) = broadcast::channel::<Bytes>(8);
        let shell = crate::shell::Shell {
            path: PathBuf::from("/bin/sh"),
        };
        let config = crate::pty::PtyConfig::for_shell(&shell, 80, 24, vec![]);
        let pty = Arc::new(crate::pty::PtyHandle::spawn(config).expect("spawn /bin/sh"));
        let session = Arc::new(NamedSession::test_instance("t".into(), pty, tx.clone()));

        let out = Arc::new(Mutex::new(Vec::new()));
        let handle = attach(session.clone(), CollectingSink { out: out.clone() });
        tx.send(Bytes::from_static(b"hello")).unwrap();

        // give the spawned task a turn to run
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(out.lock().unwrap().as_slice(), b"hello");
        assert_eq!(session.viewer_count(), 1);

        drop(tx);
        let _ = handle.await;
        assert_eq!(session.viewer_count(), 0);
    }
}
