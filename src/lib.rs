//! sshd-core - an extensible SSH wire-protocol engine and PTY session
//! multiplexer.
//!
//! The crate is organised leaf-first, mirroring the component table in
//! `SPEC_FULL.md`:
//!
//! - [`pty`] - C1, spawn/resize/kill a child process behind a pseudoterminal.
//! - [`keygen`] - C2, deterministic host-key derivation from a seed.
//! - [`auth`] - C3, the `AuthProvider` interface and built-in descriptors.
//! - [`request`] - C4, single-reply-guaranteed SSH request wrapper.
//! - [`dispatcher`] - C5, the per-connection request/channel router.
//! - [`session_runtime`] - C6, `session`-channel lifecycle (pty/shell/exec).
//! - [`forwarding`] - C7, `direct-tcpip` and `tcpip-forward` handling.
//! - [`sftp`] - C8, the SFTP subsystem.
//! - [`listener`] - C9, TCP/filesystem-socket acceptor + handshake.
//! - [`smux`] - C10/C11, the named persistent-session daemon built on top
//!   of the engine.
//! - [`config`] - immutable server configuration and host identity.
//! - [`error`] - the error taxonomy shared by every module.
//! - [`shell`] - shell discovery/argv construction, shared by C6 and smux.

pub mod auth;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod forwarding;
pub mod keygen;
pub mod listener;
pub mod pty;
pub mod request;
pub mod session_runtime;
pub mod sftp;
pub mod shell;
pub mod smux;

pub use config::{HostIdentity, ServerConfig};
pub use dispatcher::{ChannelHandler, ConnectionContext, GlobalRequestHandler, HandlerRegistry};
pub use error::ServerError;
