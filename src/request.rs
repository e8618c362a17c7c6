//! Request Wrapper (C4).
//!
//! Tracks whether a reply has been sent for an SSH request and guarantees
//! exactly one reply is observed when `want_reply` is true (spec.md §4.1,
//! Testable Property "reply exactness").

use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Result, ServerError};

/// A raw inbound SSH request (global or channel-scoped).
pub struct Request {
    kind: String,
    payload: Vec<u8>,
    want_reply: bool,
    replied: AtomicBool,
}

impl Request {
    pub fn new(kind: impl Into<String>, payload: Vec<u8>, want_reply: bool) -> Self {
        Self {
            kind: kind.into(),
            payload,
            want_reply,
            replied: AtomicBool::new(false),
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn want_reply(&self) -> bool {
        self.want_reply
    }

    pub fn replied(&self) -> bool {
        self.replied.load(Ordering::SeqCst)
    }

    /// Mark the request as replied. Returns `AlreadyReplied` on the second
    /// call - this is a programmer error inside a handler and is logged
    /// loudly by the caller rather than silently ignored.
    pub fn mark_replied(&self) -> Result<()> {
        if self.replied.swap(true, Ordering::SeqCst) {
            return Err(ServerError::AlreadyReplied);
        }
        Ok(())
    }
}

/// What the dispatcher should do once a handler returns, for requests
/// where `want_reply` was true and the handler never called `mark_replied`.
///
/// The dispatcher auto-replies `ok = handler_result.is_ok()` - see
/// [`crate::dispatcher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoReply {
    Ok,
    Failure,
}

impl From<bool> for AutoReply {
    fn from(ok: bool) -> Self {
        if ok {
            AutoReply::Ok
        } else {
            AutoReply::Failure
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_reply_is_rejected() {
        let req = Request::new("pty-req", vec![], true);
        assert!(req.mark_replied().is_ok());
        assert!(matches!(
            req.mark_replied(),
            Err(ServerError::AlreadyReplied)
        ));
    }

    #[test]
    fn unreplied_request_reports_not_replied() {
        let req = Request::new("env", vec![], false);
        assert!(!req.replied());
    }
}
