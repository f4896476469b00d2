use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{Result, StompError};
use crate::frame::{Command, Frame};
use crate::parser::{RawFrame, parse_frame_slice, unescape_header_value};

/// Escape a STOMP 1.2 header name or value for wire transmission.
///
/// Per STOMP 1.2, the following characters must be escaped:
/// - backslash (0x5c) → `\\`
/// - carriage return (0x0d) → `\r`
/// - line feed (0x0a) → `\n`
/// - colon (0x3a) → `\c`
pub fn escape_header_value(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '\\' => result.push_str("\\\\"),
            '\r' => result.push_str("\\r"),
            '\n' => result.push_str("\\n"),
            ':' => result.push_str("\\c"),
            _ => result.push(ch),
        }
    }
    result
}

/// Items produced or consumed by the codec.
///
/// A `StompItem` is either a decoded `Frame` or the heart-beat pseudo-frame,
/// which travels as a single EOL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StompItem {
    /// A STOMP frame (command + headers + body)
    Frame(Frame),
    /// A single heart-beat pulse (LF)
    Heartbeat,
}

/// Serialize one item into a fresh buffer.
pub fn encode(item: &StompItem) -> Result<Bytes> {
    let mut dst = BytesMut::new();
    encode_into(item, &mut dst)?;
    Ok(dst.freeze())
}

/// Serialize one item, appending to `dst`.
///
/// Headers are written in insertion order. A non-empty body always carries
/// a `content-length` equal to its byte length: a stale value is rewritten in
/// place and a missing one is appended. CONNECT and CONNECTED headers are
/// written verbatim and rejected if they contain characters that cannot be
/// sent without escaping. On error nothing is appended.
pub fn encode_into(item: &StompItem, dst: &mut BytesMut) -> Result<()> {
    let frame = match item {
        StompItem::Heartbeat => {
            dst.put_u8(b'\n');
            return Ok(());
        }
        StompItem::Frame(frame) => frame,
    };

    let escape = frame.command.escapes_headers();
    let mut out = BytesMut::with_capacity(64 + frame.body.len());
    out.extend_from_slice(frame.command.as_str().as_bytes());
    out.put_u8(b'\n');

    let mut wrote_length = false;
    for (k, v) in &frame.headers {
        if k.eq_ignore_ascii_case("content-length") {
            if wrote_length {
                continue;
            }
            wrote_length = true;
            write_header(&mut out, k, &frame.body.len().to_string(), escape, frame.command)?;
            continue;
        }
        write_header(&mut out, k, v, escape, frame.command)?;
    }
    if !wrote_length && !frame.body.is_empty() {
        write_header(
            &mut out,
            "content-length",
            &frame.body.len().to_string(),
            escape,
            frame.command,
        )?;
    }

    out.put_u8(b'\n');
    out.extend_from_slice(&frame.body);
    out.put_u8(0);
    dst.extend_from_slice(&out);
    Ok(())
}

fn write_header(
    out: &mut BytesMut,
    key: &str,
    value: &str,
    escape: bool,
    command: Command,
) -> Result<()> {
    if key.contains('\0') || value.contains('\0') {
        return Err(StompError::violation(format!(
            "NUL in {} header '{}'",
            command, key
        )));
    }
    if escape {
        out.extend_from_slice(escape_header_value(key).as_bytes());
        out.put_u8(b':');
        out.extend_from_slice(escape_header_value(value).as_bytes());
    } else {
        if key.contains([':', '\n', '\r']) || value.contains(['\n', '\r']) {
            return Err(StompError::violation(format!(
                "{} header '{}' contains characters that cannot be sent unescaped",
                command, key
            )));
        }
        out.extend_from_slice(key.as_bytes());
        out.put_u8(b':');
        out.extend_from_slice(value.as_bytes());
    }
    out.put_u8(b'\n');
    Ok(())
}

/// Decode one already-received transport message.
///
/// An empty message, or one made only of EOLs, is a heart-beat. Anything
/// else must hold a complete frame; a frame cut short (including a
/// `content-length` larger than the bytes present) is malformed rather than
/// "incomplete", because a message transport never delivers the rest later.
pub fn decode(bytes: &[u8]) -> Result<StompItem> {
    if bytes.iter().all(|&b| b == b'\n' || b == b'\r') {
        return Ok(StompItem::Heartbeat);
    }
    match parse_frame_slice(bytes) {
        Ok(Some(raw)) => {
            if bytes[raw.consumed..].iter().any(|&b| b != b'\n' && b != b'\r') {
                tracing::debug!(
                    trailing = bytes.len() - raw.consumed,
                    "ignoring bytes after frame terminator"
                );
            }
            frame_from_raw(raw).map(StompItem::Frame)
        }
        Ok(None) => Err(StompError::malformed(format!(
            "truncated frame ({} bytes)",
            bytes.len()
        ))),
        Err(e) => Err(StompError::malformed(e)),
    }
}

/// Build an owned `Frame` from parser output, resolving the command and
/// unescaping headers where the command calls for it.
pub fn frame_from_raw(raw: RawFrame) -> Result<Frame> {
    let command = std::str::from_utf8(&raw.command)
        .map_err(|e| StompError::malformed(format!("invalid utf8 in command: {}", e)))?
        .parse::<Command>()?;
    let escaped = command.escapes_headers();

    let mut headers = Vec::with_capacity(raw.headers.len());
    for (k, v) in raw.headers {
        let (k, v) = if escaped {
            (
                unescape_header_value(&k)
                    .map_err(|e| StompError::malformed(format!("header key: {}", e)))?,
                unescape_header_value(&v)
                    .map_err(|e| StompError::malformed(format!("header value: {}", e)))?,
            )
        } else {
            (k, v)
        };
        let ks = String::from_utf8(k)
            .map_err(|e| StompError::malformed(format!("invalid utf8 in header key: {}", e)))?;
        let vs = String::from_utf8(v)
            .map_err(|e| StompError::malformed(format!("invalid utf8 in header value: {}", e)))?;
        headers.push((ks, vs));
    }

    Ok(Frame {
        command,
        headers,
        body: raw.body,
    })
}

fn invalid_data(err: StompError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err.to_string())
}

/// `StompCodec` implements `tokio_util::codec::{Decoder, Encoder}` for STOMP
/// carried over a byte stream (e.g. TCP), where frame boundaries have to be
/// found in the buffered input.
///
/// Responsibilities:
/// - Decode incoming bytes into `StompItem::Frame` or `StompItem::Heartbeat`.
/// - Support both NUL-terminated frames and frames using the `content-length`
///   header for binary bodies containing NUL bytes.
/// - Encode `StompItem` back into bytes for the wire format.
#[derive(Debug, Default)]
pub struct StompCodec {}

impl StompCodec {
    pub fn new() -> Self {
        Self {}
    }
}

/// Length of a leading heart-beat EOL (`\n` or `\r\n`), if any.
fn leading_heartbeat(src: &[u8]) -> Option<usize> {
    match src {
        [b'\n', ..] => Some(1),
        [b'\r', b'\n', ..] => Some(2),
        _ => None,
    }
}

impl Decoder for StompCodec {
    type Item = StompItem;
    type Error = io::Error;

    /// Decode bytes from `src` into a `StompItem`.
    ///
    /// Returns `Ok(None)` and leaves `src` untouched when more bytes are
    /// required; consumes exactly one item's bytes otherwise.
    fn decode(&mut self, src: &mut BytesMut) -> std::result::Result<Option<Self::Item>, Self::Error> {
        if let Some(n) = leading_heartbeat(src.chunk()) {
            src.advance(n);
            return Ok(Some(StompItem::Heartbeat));
        }

        match parse_frame_slice(src.chunk()) {
            Ok(Some(raw)) => {
                src.advance(raw.consumed);
                frame_from_raw(raw)
                    .map(|f| Some(StompItem::Frame(f)))
                    .map_err(invalid_data)
            }
            Ok(None) => Ok(None),
            Err(e) => Err(invalid_data(StompError::malformed(e))),
        }
    }
}

impl Encoder<StompItem> for StompCodec {
    type Error = io::Error;

    fn encode(&mut self, item: StompItem, dst: &mut BytesMut) -> std::result::Result<(), Self::Error> {
        encode_into(&item, dst).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))
    }
}

/// Splits a byte stream into raw per-frame messages without interpreting
/// them, so stream transports can hand the session the same unit a message
/// transport would.
#[derive(Debug, Default)]
pub struct RawFrameCodec {}

impl RawFrameCodec {
    pub fn new() -> Self {
        Self {}
    }
}

impl Decoder for RawFrameCodec {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> std::result::Result<Option<Self::Item>, Self::Error> {
        if let Some(n) = leading_heartbeat(src.chunk()) {
            return Ok(Some(src.split_to(n).freeze()));
        }
        match parse_frame_slice(src.chunk()) {
            Ok(Some(raw)) => Ok(Some(src.split_to(raw.consumed).freeze())),
            Ok(None) => Ok(None),
            Err(e) => Err(invalid_data(StompError::malformed(e))),
        }
    }
}

impl Encoder<Bytes> for RawFrameCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> std::result::Result<(), Self::Error> {
        dst.extend_from_slice(&item);
        Ok(())
    }
}
