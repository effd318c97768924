//! Bidirectional translation between WebSocket frames and JSON objects, with
//! transparent `zlib-stream` decompression of inbound frames.

use crate::command::Command;
use flate2::{Decompress, FlushDecompress, Status};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde_json::Value;
use std::{
    error::Error,
    fmt::{Display, Formatter, Result as FmtResult},
};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

/// The four-byte marker `zlib-stream` appends to the end of every complete
/// compressed payload. A binary frame is buffered until the tail bytes match
/// this before the accumulated buffer is handed to the inflator.
const ZLIB_SUFFIX: [u8; 4] = [0x00, 0x00, 0xFF, 0xFF];

/// Server-documented maximum size, in bytes, of a single outbound frame.
/// Exceeding it is reported but not locally rejected — the server enforces
/// the limit authoritatively, per spec.md §4.1.
pub const MAX_OUTBOUND_FRAME_SIZE: usize = 4096;

/// A fully decoded inbound gateway frame.
#[derive(Clone, Debug)]
pub struct Frame {
    pub opcode: u8,
    pub data: Value,
    pub seq: Option<u64>,
    pub event_type: Option<Box<str>>,
}

/// Failure decoding or reading the next inbound frame.
#[derive(Debug)]
pub struct FrameError {
    kind: FrameErrorType,
    source: Option<Box<dyn Error + Send + Sync>>,
}

impl FrameError {
    /// Immutable reference to the type of error that occurred.
    pub const fn kind(&self) -> &FrameErrorType {
        &self.kind
    }

    fn new(kind: FrameErrorType) -> Self {
        Self { kind, source: None }
    }

    fn with_source(kind: FrameErrorType, source: impl Error + Send + Sync + 'static) -> Self {
        Self {
            kind,
            source: Some(Box::new(source)),
        }
    }
}

impl Display for FrameError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match &self.kind {
            FrameErrorType::ConnectionClosed { code, reason } => {
                write!(f, "the websocket connection closed (code {code:?}): {reason}")
            }
            FrameErrorType::Io => f.write_str("reading from the websocket failed"),
            FrameErrorType::TypeError => {
                f.write_str("decoded json value was not an object, or was not valid utf-8/json")
            }
            FrameErrorType::Decompress => f.write_str("zlib-stream decompression failed"),
        }
    }
}

impl Error for FrameError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.source
            .as_ref()
            .map(|source| &**source as &(dyn Error + 'static))
    }
}

/// Type of [`FrameError`] that occurred.
#[derive(Debug)]
#[non_exhaustive]
pub enum FrameErrorType {
    /// The socket closed (or returned `None`) before a full frame arrived.
    /// `code`/`reason` come from the server's close frame, when one was
    /// sent; `code` is `None` for a bare EOF with no close handshake.
    ConnectionClosed {
        code: Option<u16>,
        reason: Box<str>,
    },
    /// Reading the next message from the socket failed.
    Io,
    /// The decoded payload was not a JSON object. Per spec.md §4.1 this is
    /// `ProtocolError{TypeError}`.
    TypeError,
    /// The zlib stream could not be inflated.
    Decompress,
}

/// Bidirectional frame codec. Owns the streaming zlib inflator and the
/// receive buffer for one connection attempt; both are reconstructed on
/// every reconnect, per spec.md §5 ("the inflator and receive buffer are
/// torn down with the `FrameCodec`").
pub struct FrameCodec {
    inflator: Decompress,
    buffer: Vec<u8>,
    max_persistent_buffer_size: usize,
}

impl std::fmt::Debug for FrameCodec {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("FrameCodec")
            .field("buffer_len", &self.buffer.len())
            .field("buffer_capacity", &self.buffer.capacity())
            .field("max_persistent_buffer_size", &self.max_persistent_buffer_size)
            .finish()
    }
}

impl FrameCodec {
    /// Small starting capacity for a freshly-allocated receive buffer.
    const FRESH_BUFFER_CAPACITY: usize = 4 * 1024;

    /// Create a codec with a fresh inflator and an empty receive buffer.
    ///
    /// `max_persistent_buffer_size` is the boundary at which the receive
    /// buffer is discarded and replaced rather than cleared in place, per
    /// spec.md §3's buffer-reuse invariant.
    pub fn new(max_persistent_buffer_size: usize) -> Self {
        Self {
            inflator: Decompress::new(true),
            buffer: Vec::with_capacity(Self::FRESH_BUFFER_CAPACITY),
            max_persistent_buffer_size,
        }
    }

    /// Read WebSocket messages from `ws` until exactly one JSON frame has
    /// been decoded, then return it.
    ///
    /// A text message is parsed directly. A binary message is assumed to be
    /// a fragment of a zlib-stream payload: it is appended to the receive
    /// buffer, and only once the buffer ends with the four-byte sentinel is
    /// the accumulated buffer fed to the (never-reset) inflator.
    pub async fn decode_next<S>(&mut self, ws: &mut S) -> Result<Frame, FrameError>
    where
        S: Stream<Item = Result<Message, WsError>> + Unpin,
    {
        loop {
            let message = ws
                .next()
                .await
                .ok_or_else(|| {
                    FrameError::new(FrameErrorType::ConnectionClosed {
                        code: None,
                        reason: Box::from(""),
                    })
                })?
                .map_err(|source| FrameError::with_source(FrameErrorType::Io, source))?;

            match message {
                Message::Text(text) => {
                    return self.parse_frame(text.as_bytes());
                }
                Message::Binary(bytes) => {
                    self.buffer.extend_from_slice(&bytes);

                    if !self.buffer.ends_with(&ZLIB_SUFFIX) {
                        continue;
                    }

                    let decompressed = self.inflate()?;
                    let frame = self.parse_frame(&decompressed);
                    self.end_of_frame();

                    return frame;
                }
                Message::Close(frame) => {
                    tracing::debug!(?frame, "websocket closed while awaiting a frame");

                    let (code, reason) = match frame {
                        Some(frame) => (Some(u16::from(frame.code)), Box::from(frame.reason.as_ref())),
                        None => (None, Box::from("")),
                    };

                    return Err(FrameError::new(FrameErrorType::ConnectionClosed { code, reason }));
                }
                // Ping/Pong/raw Frame messages carry no gateway payload;
                // tungstenite already answers pings automatically.
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            }
        }
    }

    /// Feed the entire accumulated receive buffer to the inflator as one
    /// block, per spec.md §4.1. The inflator is never reset between calls,
    /// since it is a single streaming context for the connection's lifetime.
    fn inflate(&mut self) -> Result<Vec<u8>, FrameError> {
        let mut output = Vec::with_capacity(self.buffer.len() * 4);

        let status = self
            .inflator
            .decompress_vec(&self.buffer, &mut output, FlushDecompress::Sync)
            .map_err(|source| FrameError::with_source(FrameErrorType::Decompress, source))?;

        if matches!(status, Status::BufError) {
            return Err(FrameError::new(FrameErrorType::Decompress));
        }

        Ok(output)
    }

    fn parse_frame(&self, bytes: &[u8]) -> Result<Frame, FrameError> {
        // Delegates to `crate::json::from_slice` rather than reimplementing
        // the utf8-decode/parse/object-check sequence inline.
        let value: Value = crate::json::from_slice(bytes)
            .map_err(|source| FrameError::with_source(FrameErrorType::TypeError, source))?;

        let object = value
            .as_object()
            .ok_or_else(|| FrameError::new(FrameErrorType::TypeError))?;

        let opcode = object
            .get("op")
            .and_then(Value::as_u64)
            .ok_or_else(|| FrameError::new(FrameErrorType::TypeError))? as u8;

        let data = object.get("d").cloned().unwrap_or(Value::Null);
        let seq = object.get("s").and_then(Value::as_u64);
        let event_type = object
            .get("t")
            .and_then(Value::as_str)
            .map(Box::<str>::from);

        Ok(Frame {
            opcode,
            data,
            seq,
            event_type,
        })
    }

    /// Reclaim or replace the receive buffer at a decoded-frame boundary,
    /// per spec.md §3's buffer-reuse invariant.
    fn end_of_frame(&mut self) {
        if self.buffer.capacity() > self.max_persistent_buffer_size {
            self.buffer = Vec::with_capacity(Self::FRESH_BUFFER_CAPACITY);
        } else {
            self.buffer.clear();
        }
    }

    /// Serialize `command` as compact JSON and send it as a single text
    /// frame. Logs (but does not reject) payloads exceeding
    /// [`MAX_OUTBOUND_FRAME_SIZE`]; the server is the authoritative
    /// enforcer of that limit.
    ///
    /// Encoding has no dependency on the inflator or receive buffer, so this
    /// is a thin wrapper around the free function [`encode_and_send`] — the
    /// same path [`crate::engine::GatewayEngine`]'s writer task uses to send
    /// commands that didn't originate from a `decode_next` call on this
    /// codec.
    pub async fn encode_and_send<S>(&self, ws: &mut S, command: &Command) -> Result<(), FrameError>
    where
        S: Sink<Message, Error = WsError> + Unpin,
    {
        encode_and_send(ws, command).await
    }
}

/// Serialize `command` as compact JSON and send it as a single text frame.
///
/// Free function so callers without a live [`FrameCodec`] (the engine's
/// outbound writer task, which only ever sends — it never decodes) can reach
/// it without constructing one.
pub async fn encode_and_send<S>(ws: &mut S, command: &Command) -> Result<(), FrameError>
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    let bytes = crate::json::to_vec(command)
        .map_err(|source| FrameError::with_source(FrameErrorType::TypeError, source))?;

    if bytes.len() > MAX_OUTBOUND_FRAME_SIZE {
        tracing::warn!(
            size = bytes.len(),
            limit = MAX_OUTBOUND_FRAME_SIZE,
            opcode = command.opcode(),
            "outbound payload exceeds the documented per-frame limit; sending anyway"
        );
    }

    let text = String::from_utf8(bytes)
        .map_err(|source| FrameError::with_source(FrameErrorType::TypeError, source))?;

    ws.send(Message::Text(text))
        .await
        .map_err(|source| FrameError::with_source(FrameErrorType::Io, source))
}

#[cfg(test)]
mod tests {
    use super::{Frame, FrameCodec, FrameErrorType, MAX_OUTBOUND_FRAME_SIZE};
    use crate::command::Command;
    use flate2::{write::ZlibEncoder, Compression};
    use futures_util::{sink::drain, stream};
    use static_assertions::assert_impl_all;
    use std::{fmt::Debug, io::Write};
    use tokio_tungstenite::tungstenite::Message;

    assert_impl_all!(super::FrameError: std::error::Error, Send, Sync);

    fn zlib_compress(text: &str) -> Vec<u8> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(text.as_bytes()).unwrap();
        encoder.finish().unwrap()
    }

    #[tokio::test]
    async fn text_frame_decodes_directly() {
        let mut codec = FrameCodec::new(64 * 1024);
        let mut ws = stream::iter(vec![Ok(Message::Text(
            r#"{"op":10,"d":{"heartbeat_interval":1},"s":null,"t":null}"#.to_string(),
        ))]);

        let frame: Frame = codec.decode_next(&mut ws).await.unwrap();
        assert_eq!(frame.opcode, 10);
    }

    #[tokio::test]
    async fn non_object_json_is_a_type_error() {
        let mut codec = FrameCodec::new(64 * 1024);
        let mut ws = stream::iter(vec![Ok(Message::Text("[]".to_string()))]);

        let err = codec.decode_next(&mut ws).await.unwrap_err();
        assert!(matches!(err.kind(), FrameErrorType::TypeError));
    }

    #[tokio::test]
    async fn closed_socket_reports_connection_closed() {
        let mut codec = FrameCodec::new(64 * 1024);
        let mut ws = stream::iter(Vec::<Result<Message, tokio_tungstenite::tungstenite::Error>>::new());

        let err = codec.decode_next(&mut ws).await.unwrap_err();
        assert!(matches!(err.kind(), FrameErrorType::ConnectionClosed { .. }));
    }

    #[tokio::test]
    async fn zlib_stream_payload_decodes_once_sentinel_is_seen() {
        let mut codec = FrameCodec::new(64 * 1024);
        let payload = r#"{"op":10,"d":{"heartbeat_interval":1}}"#;
        let compressed = zlib_compress(payload);

        let mut ws = stream::iter(vec![Ok(Message::Binary(compressed))]);

        let frame = codec.decode_next(&mut ws).await.unwrap();
        assert_eq!(frame.opcode, 10);
    }

    #[tokio::test]
    async fn buffer_is_cleared_after_small_zlib_payload() {
        let mut codec = FrameCodec::new(64 * 1024);
        let payload = r#"{"op":11}"#;
        let compressed = zlib_compress(payload);
        let mut ws = stream::iter(vec![Ok(Message::Binary(compressed))]);

        codec.decode_next(&mut ws).await.unwrap();
        assert_eq!(codec.buffer.len(), 0);
        assert!(codec.buffer.capacity() <= 64 * 1024);
    }

    #[tokio::test]
    async fn oversized_outbound_payload_is_still_sent() {
        let codec = FrameCodec::new(64 * 1024);
        let mut sink = drain();

        let command = Command::RequestGuildMembers {
            guild_id: "1".into(),
            query: "a".repeat(MAX_OUTBOUND_FRAME_SIZE).into(),
            limit: 0,
        };

        codec.encode_and_send(&mut sink, &command).await.unwrap();
    }
}
