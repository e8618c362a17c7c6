//! WebSocket viewer transport.
//!
//! `bridge::server`'s frame protocol and token-auth handshake survived the
//! retrieval in usage form only - `super::protocol::{Frame, FrameCodec,
//! data_frame, error_frame, heartbeat_frame}` are imported there but their
//! defining module never made it into this tree. This module is an
//! original design built to the same shape that usage implies (four frame
//! kinds, a length-prefixed codec, free-function constructors), plus the
//! identical token generate/validate handshake, which *did* survive in
//! full and is ported faithfully.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use bytes::{Buf, Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use rand::RngCore;
use subtle::ConstantTimeEq;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::smux::fanout::{self, ViewerSink};
use crate::smux::registry::SessionRegistry;

/// Matches `HEARTBEAT_INTERVAL_SECS` in `bridge::server`.
const HEARTBEAT_INTERVAL_SECS: u64 = 30;
/// Matches `HEARTBEAT_TIMEOUT_SECS` in `bridge::server`.
const HEARTBEAT_TIMEOUT_SECS: u64 = 90;
/// Matches `WS_ACCEPT_TIMEOUT_SECS` in `bridge::server`.
const WS_ACCEPT_TIMEOUT_SECS: u64 = 60;

const TOKEN_RANDOM_LEN: usize = 32;
const TOKEN_TIMESTAMP_LEN: usize = 8;
const TOKEN_TOTAL_LEN: usize = TOKEN_RANDOM_LEN + TOKEN_TIMESTAMP_LEN;

/// Upper bound on a single frame's declared payload length: protects a
/// viewer's decoder from a malformed or hostile length prefix forcing an
/// unbounded allocation.
const MAX_FRAME_PAYLOAD: u32 = 16 * 1024 * 1024;

fn unix_timestamp_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// A fresh, opaque viewer-auth token: `Base64(random[32] || timestamp[8])`.
/// The caller hands this to whatever minted the viewer URL (out of scope
/// here); the browser echoes it back as the first WebSocket message.
pub fn generate_token() -> String {
    let mut data = [0u8; TOKEN_TOTAL_LEN];
    rand::rngs::OsRng.fill_bytes(&mut data[..TOKEN_RANDOM_LEN]);
    data[TOKEN_RANDOM_LEN..].copy_from_slice(&unix_timestamp_secs().to_be_bytes());
    URL_SAFE_NO_PAD.encode(data)
}

/// Constant-time comparison of the random portion, then an expiry check
/// against the timestamp embedded in `expected`. `validity` is the
/// operator-configured TTL (`SmuxConfig::ws_token_ttl`, default 300s per
/// `bridge::server`'s `TOKEN_VALIDITY_SECS`), not a hardcoded constant, so
/// `SMUXD_WS_TOKEN_TTL_SECS` actually takes effect.
pub fn validate_token(received: &str, expected: &str, validity: Duration) -> bool {
    let received = received.trim();
    if received.len() != expected.len() {
        return false;
    }

    let received_bytes = match URL_SAFE_NO_PAD.decode(received) {
        Ok(b) if b.len() == TOKEN_TOTAL_LEN => b,
        _ => {
            warn!("viewer token validation failed: invalid base64 or wrong length");
            return false;
        }
    };
    let expected_bytes = match URL_SAFE_NO_PAD.decode(expected) {
        Ok(b) if b.len() == TOKEN_TOTAL_LEN => b,
        _ => {
            warn!("viewer token validation failed: expected token malformed");
            return false;
        }
    };

    let random_matches: bool = received_bytes[..TOKEN_RANDOM_LEN]
        .ct_eq(&expected_bytes[..TOKEN_RANDOM_LEN])
        .into();
    if !random_matches {
        return false;
    }

    let timestamp_bytes: [u8; 8] = expected_bytes[TOKEN_RANDOM_LEN..]
        .try_into()
        .expect("timestamp slice length verified above");
    let created_at = u64::from_be_bytes(timestamp_bytes);
    let age = unix_timestamp_secs().saturating_sub(created_at);
    let limit = validity.as_secs();
    if age > limit {
        warn!(age, limit, "viewer token expired");
        return false;
    }
    true
}

/// One wire frame exchanged with a browser viewer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Raw PTY bytes, either direction.
    Data(Bytes),
    /// A viewer reporting its terminal's new dimensions.
    Resize { cols: u16, rows: u16 },
    /// A liveness ping carrying a monotonically increasing sequence number.
    Heartbeat(u32),
    /// A human-readable error preceding disconnect.
    Error(String),
}

const TAG_DATA: u8 = 0;
const TAG_RESIZE: u8 = 1;
const TAG_HEARTBEAT: u8 = 2;
const TAG_ERROR: u8 = 3;

impl Frame {
    /// `tag(1) || len(4, BE) || payload`. `Resize` and `Heartbeat` encode
    /// their fixed-size fields as the payload rather than inventing a
    /// second layout, so one decode path handles every variant.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Frame::Data(data) => {
                buf.reserve(5 + data.len());
                buf.extend_from_slice(&[TAG_DATA]);
                buf.extend_from_slice(&(data.len() as u32).to_be_bytes());
                buf.extend_from_slice(data);
            }
            Frame::Resize { cols, rows } => {
                buf.extend_from_slice(&[TAG_RESIZE]);
                buf.extend_from_slice(&4u32.to_be_bytes());
                buf.extend_from_slice(&cols.to_be_bytes());
                buf.extend_from_slice(&rows.to_be_bytes());
            }
            Frame::Heartbeat(seq) => {
                buf.extend_from_slice(&[TAG_HEARTBEAT]);
                buf.extend_from_slice(&4u32.to_be_bytes());
                buf.extend_from_slice(&seq.to_be_bytes());
            }
            Frame::Error(msg) => {
                let bytes = msg.as_bytes();
                buf.reserve(5 + bytes.len());
                buf.extend_from_slice(&[TAG_ERROR]);
                buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
                buf.extend_from_slice(bytes);
            }
        }
        buf.freeze()
    }

    fn decode_payload(tag: u8, payload: &[u8]) -> Option<Frame> {
        match tag {
            TAG_DATA => Some(Frame::Data(Bytes::copy_from_slice(payload))),
            TAG_RESIZE if payload.len() == 4 => Some(Frame::Resize {
                cols: u16::from_be_bytes([payload[0], payload[1]]),
                rows: u16::from_be_bytes([payload[2], payload[3]]),
            }),
            TAG_HEARTBEAT if payload.len() == 4 => Some(Frame::Heartbeat(u32::from_be_bytes([
                payload[0], payload[1], payload[2], payload[3],
            ]))),
            TAG_ERROR => Some(Frame::Error(String::from_utf8_lossy(payload).into_owned())),
            _ => None,
        }
    }
}

pub fn data_frame(data: Bytes) -> Frame {
    Frame::Data(data)
}

pub fn error_frame(message: impl Into<String>) -> Frame {
    Frame::Error(message.into())
}

pub fn heartbeat_frame(seq: u32) -> Frame {
    Frame::Heartbeat(seq)
}

/// Incremental decoder over a stream of WebSocket binary messages. A
/// viewer may split a logical frame across messages (or batch several into
/// one); `feed`+`decode_next` lets the caller not care which.
#[derive(Default)]
pub struct FrameCodec {
    buf: BytesMut,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Returns the next complete frame, if the buffer holds one. `Err` on a
    /// corrupt tag or an over-large declared length; the caller should
    /// treat that as fatal for the connection.
    pub fn decode_next(&mut self) -> Result<Option<Frame>, String> {
        if self.buf.len() < 5 {
            return Ok(None);
        }
        let tag = self.buf[0];
        let len = u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]);
        if len > MAX_FRAME_PAYLOAD {
            return Err(format!("frame payload {len} exceeds maximum {MAX_FRAME_PAYLOAD}"));
        }
        let total = 5 + len as usize;
        if self.buf.len() < total {
            return Ok(None);
        }
        let payload = self.buf[5..total].to_vec();
        self.buf.advance(total);
        Frame::decode_payload(tag, &payload)
            .map(Some)
            .ok_or_else(|| format!("unknown frame tag {tag}"))
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// True once the undecoded tail alone exceeds the maximum frame size,
    /// meaning no further `feed` can ever produce a valid frame.
    pub fn is_overflow(&self) -> bool {
        self.buf.len() > 5 + MAX_FRAME_PAYLOAD as usize
    }
}

/// Frame channel capacity, matching `bridge::server`'s split by platform
/// I/O throughput.
#[cfg(target_os = "windows")]
const FRAME_CHANNEL_CAPACITY: usize = 16384;
#[cfg(not(target_os = "windows"))]
const FRAME_CHANNEL_CAPACITY: usize = 4096;

/// A browser viewer's outgoing side. Rather than holding the WebSocket
/// sender directly, it feeds an mpsc channel consumed by one dedicated
/// sender task - the same funnel `bridge::server` uses so PTY output and
/// heartbeat frames share one send path instead of racing each other on
/// the socket.
pub struct WsViewerSink {
    frame_tx: tokio::sync::mpsc::Sender<Bytes>,
}

#[async_trait]
impl ViewerSink for WsViewerSink {
    async fn send(&mut self, data: Bytes) -> bool {
        self.frame_tx.send(data_frame(data).encode()).await.is_ok()
    }
}

/// Tracks the last time this viewer produced input, the way
/// `bridge::server`'s `ConnectionState` tracks `last_seen` for its
/// heartbeat timeout check.
struct ConnectionState {
    last_seen_millis: AtomicU64,
}

impl ConnectionState {
    fn new() -> Self {
        Self {
            last_seen_millis: AtomicU64::new(Self::now_millis()),
        }
    }

    fn now_millis() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }

    fn touch(&self) {
        self.last_seen_millis.store(Self::now_millis(), Ordering::Relaxed);
    }

    fn elapsed_secs(&self) -> u64 {
        (Self::now_millis() - self.last_seen_millis.load(Ordering::Relaxed)) / 1000
    }
}

/// Runs the WebSocket viewer accept loop until the process exits. Each
/// connection authenticates with `expected_token` (one token per daemon
/// instance - spec.md leaves multi-tenant token scoping out of scope),
/// resolves its target session from the request path (`/viewer/<name>`),
/// and attaches via the same [`fanout::attach`] every SSH viewer uses.
pub async fn serve(
    listen_addr: SocketAddr,
    registry: Arc<SessionRegistry>,
    expected_token: Arc<str>,
    token_ttl: Duration,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(listen_addr).await?;
    info!(%listen_addr, "smux websocket viewer listening");
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let registry = registry.clone();
                let expected_token = expected_token.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, peer, registry, expected_token, token_ttl).await {
                        debug!(%peer, error = %e, "websocket viewer connection ended");
                    }
                });
            }
            Err(e) => warn!(error = %e, "websocket accept failed"),
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    registry: Arc<SessionRegistry>,
    expected_token: Arc<str>,
    token_ttl: Duration,
) -> Result<(), String> {
    let requested_path = Arc::new(std::sync::Mutex::new(String::new()));
    let path_capture = requested_path.clone();
    let callback = move |req: &tokio_tungstenite::tungstenite::handshake::server::Request,
                          resp: tokio_tungstenite::tungstenite::handshake::server::Response| {
        *path_capture.lock().unwrap() = req.uri().path().to_string();
        Ok(resp)
    };

    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, callback)
        .await
        .map_err(|e| format!("handshake failed: {e}"))?;

    let session_name = requested_path
        .lock()
        .unwrap()
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| "no session name in request path".to_string())?;

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let first = tokio::time::timeout(Duration::from_secs(WS_ACCEPT_TIMEOUT_SECS), ws_receiver.next())
        .await
        .map_err(|_| "authentication timeout".to_string())?;

    let authenticated = match first {
        Some(Ok(Message::Text(token))) => validate_token(&token, &expected_token, token_ttl),
        Some(Ok(Message::Binary(token))) => {
            validate_token(&String::from_utf8_lossy(&token), &expected_token, token_ttl)
        }
        Some(Ok(_)) => false,
        Some(Err(e)) => return Err(format!("websocket error during authentication: {e}")),
        None => return Err("websocket closed before authentication".to_string()),
    };
    if !authenticated {
        let _ = ws_sender
            .send(Message::Binary(error_frame("invalid or expired token").encode().to_vec()))
            .await;
        return Err("invalid or expired token".to_string());
    }

    let session = registry
        .get(&session_name)
        .ok_or_else(|| format!("no such smux session: {session_name}"))?;

    info!(%peer, session = %session_name, "websocket viewer authenticated");

    let (frame_tx, mut frame_rx) = tokio::sync::mpsc::channel::<Bytes>(FRAME_CHANNEL_CAPACITY);
    let frame_tx_hb = frame_tx.clone();

    let sender_task = tokio::spawn(async move {
        while let Some(data) = frame_rx.recv().await {
            match tokio::time::timeout(Duration::from_secs(5), ws_sender.send(Message::Binary(data.to_vec()))).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!(error = %e, "websocket viewer send failed");
                    break;
                }
                Err(_) => {
                    warn!("websocket viewer send timed out, disconnecting");
                    break;
                }
            }
        }
    });

    let state = Arc::new(ConnectionState::new());
    let state_hb = state.clone();
    let heartbeat_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(HEARTBEAT_INTERVAL_SECS));
        let mut seq: u32 = 0;
        loop {
            interval.tick().await;
            if state_hb.elapsed_secs() > HEARTBEAT_TIMEOUT_SECS {
                let _ = frame_tx_hb.send(error_frame("connection timeout").encode()).await;
                break;
            }
            seq += 1;
            if frame_tx_hb.try_send(heartbeat_frame(seq).encode()).is_err() {
                break;
            }
        }
    });

    let sink = WsViewerSink { frame_tx };
    let attach_handle = fanout::attach(session.clone(), sink);

    let reader_session = session.clone();
    let reader_task = tokio::spawn(async move {
        let mut codec = FrameCodec::new();
        while let Some(msg) = ws_receiver.next().await {
            let data = match msg {
                Ok(Message::Binary(b)) => b,
                Ok(Message::Text(t)) => t.into_bytes(),
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => continue,
            };
            state.touch();
            codec.feed(&data);
            loop {
                match codec.decode_next() {
                    Ok(Some(Frame::Data(bytes))) => reader_session.write_stdin(&bytes),
                    Ok(Some(Frame::Resize { cols, rows })) => reader_session.resize(cols, rows),
                    Ok(Some(Frame::Heartbeat(_))) | Ok(Some(Frame::Error(_))) => {}
                    Ok(None) => break,
                    Err(e) => {
                        debug!(error = %e, "viewer frame decode error, closing");
                        return;
                    }
                }
            }
            if codec.is_overflow() {
                debug!("viewer frame buffer overflow, closing");
                break;
            }
        }
    });

    tokio::select! {
        _ = attach_handle => {}
        _ = reader_task => {}
        _ = heartbeat_task => {}
        _ = sender_task => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEFAULT_TTL: Duration = Duration::from_secs(300);

    #[test]
    fn token_round_trips_when_fresh() {
        let token = generate_token();
        assert!(validate_token(&token, &token, DEFAULT_TTL));
    }

    #[test]
    fn token_rejects_mismatch() {
        let a = generate_token();
        let b = generate_token();
        assert!(!validate_token(&a, &b, DEFAULT_TTL));
    }

    #[test]
    fn token_rejects_wrong_length() {
        assert!(!validate_token("short", &generate_token(), DEFAULT_TTL));
    }

    #[test]
    fn token_respects_configured_ttl() {
        let token = generate_token();
        assert!(validate_token(&token, &token, Duration::from_secs(0)));
        std::thread::sleep(Duration::from_millis(1100));
        assert!(!validate_token(&token, &token, Duration::from_secs(0)));
    }

    #[test]
    fn codec_round_trips_data_frame() {
        let mut codec = FrameCodec::new();
        let frame = Frame::Data(Bytes::from_static(b"hello"));
        codec.feed(&frame.encode());
        assert_eq!(codec.decode_next().unwrap(), Some(Frame::Data(Bytes::from_static(b"hello"))));
        assert_eq!(codec.decode_next().unwrap(), None);
    }

    #[test]
    fn codec_round_trips_resize_frame() {
        let mut codec = FrameCodec::new();
        codec.feed(&Frame::Resize { cols: 100, rows: 40 }.encode());
        assert_eq!(codec.decode_next().unwrap(), Some(Frame::Resize { cols: 100, rows: 40 }));
    }

    #[test]
    fn codec_handles_split_feeds() {
        let mut codec = FrameCodec::new();
        let encoded = Frame::Heartbeat(7).encode();
        codec.feed(&encoded[..3]);
        assert_eq!(codec.decode_next().unwrap(), None);
        codec.feed(&encoded[3..]);
        assert_eq!(codec.decode_next().unwrap(), Some(Frame::Heartbeat(7)));
    }

    #[test]
    fn codec_rejects_oversized_length_prefix() {
        let mut codec = FrameCodec::new();
        let mut bogus = vec![TAG_DATA];
        bogus.extend_from_slice(&(MAX_FRAME_PAYLOAD + 1).to_be_bytes());
        codec.feed(&bogus);
        assert!(codec.decode_next().is_err());
    }
}
