//! SSH channel as a smux viewer transport.
//!
//! Wraps a `russh::server::Handle` + `ChannelId` behind [`fanout::ViewerSink`]
//! so the same broadcast fan-out code in [`crate::smux::fanout`] drives both
//! this transport and the WebSocket one. Grounded in
//! `session_runtime::pty_to_channel`'s `handle.data(...)` call, the same
//! primitive an ordinary shell session's PTY pump uses.

use async_trait::async_trait;
use bytes::Bytes;
use russh::{ChannelId, CryptoVec};

use crate::smux::fanout::ViewerSink;

pub struct SshViewerSink {
    handle: russh::server::Handle,
    channel_id: ChannelId,
}

impl SshViewerSink {
    pub fn new(handle: russh::server::Handle, channel_id: ChannelId) -> Self {
        Self { handle, channel_id }
    }
}

#[async_trait]
impl ViewerSink for SshViewerSink {
    async fn send(&mut self, data: Bytes) -> bool {
        self.handle
            .data(self.channel_id, CryptoVec::from(data.to_vec()))
            .await
            .is_ok()
    }
}
