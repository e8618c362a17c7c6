//! Named Session Multiplexer (smux): C10/C11 plus the control plane and
//! viewer transports built on top of them.
//!
//! - [`registry`] - C10, the named-session table.
//! - [`fanout`] - C11, PTY-output broadcast to however many viewers are
//!   attached.
//! - [`control`] - the SSH-first control plane: login name resolves a
//!   session name, `shell` attaches instead of spawning.
//! - [`viewer_ssh`] - an SSH channel as a [`fanout::ViewerSink`].
//! - [`viewer_ws`] - a WebSocket connection as a [`fanout::ViewerSink`],
//!   with its own framed protocol and token handshake.

pub mod control;
pub mod fanout;
pub mod registry;
pub mod viewer_ssh;
pub mod viewer_ws;

pub use control::{resolve_session_name, SmuxConfig, SmuxHandler};
pub use fanout::ViewerSink;
pub use registry::{NamedSession, SessionRegistry, SessionSnapshot};
