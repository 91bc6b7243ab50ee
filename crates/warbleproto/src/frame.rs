//! Engine output framing
//!
//! Everything the engine writes to stdout is a sequence of frames:
//!
//! ```text
//! ┌────────────────┬─────────────────────┬──────────────────────────────┐
//! │ length: u32 BE │ header: UTF-8 JSON  │ payload: raw bytes           │
//! │ 4 bytes        │ `length` bytes      │ `payload_bytes` (audio only) │
//! └────────────────┴─────────────────────┴──────────────────────────────┘
//! ```
//!
//! Frames follow each other with no delimiter. Only `audio` headers are
//! followed by a payload; `start`, `done` and `error` end at the header.
//!
//! ## Reassembly
//!
//! Pipe reads split and merge frames arbitrarily. [`FrameDecoder`] keeps an
//! accumulation buffer and only yields a frame once its header and full
//! payload are buffered. The stateless [`try_decode_one`] performs a single
//! step over a borrowed slice and reports how many bytes it consumed.
//!
//! ## Corruption
//!
//! A length prefix above the configured maximum drops those 4 bytes only and
//! scanning resumes at the next byte. A header that is not valid JSON (or not
//! a known frame type) drops the prefix and header, and so does an `audio`
//! header declaring more payload than [`FrameLimits::max_payload_len`]. None
//! of these abort the stream.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

/// Size of the big-endian header length prefix.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Largest header length accepted before the prefix is treated as corrupt.
pub const DEFAULT_MAX_HEADER_LEN: usize = 32 * 1024 * 1024;

/// Largest audio payload accepted before the header is treated as corrupt.
pub const DEFAULT_MAX_PAYLOAD_LEN: usize = 64 * 1024 * 1024;

/// Size limits beyond which engine output is treated as corrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLimits {
    pub max_header_len: usize,
    pub max_payload_len: usize,
}

impl Default for FrameLimits {
    fn default() -> Self {
        Self {
            max_header_len: DEFAULT_MAX_HEADER_LEN,
            max_payload_len: DEFAULT_MAX_PAYLOAD_LEN,
        }
    }
}

impl FrameLimits {
    pub fn with_max_header_len(mut self, max: usize) -> Self {
        self.max_header_len = max;
        self
    }

    pub fn with_max_payload_len(mut self, max: usize) -> Self {
        self.max_payload_len = max;
        self
    }
}

/// Errors produced while decoding engine output or encoding protocol data.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("Header length {declared} exceeds maximum of {max} bytes")]
    OversizedHeader { declared: usize, max: usize },
    #[error("Malformed frame header ({len} bytes): {source}")]
    MalformedHeader {
        len: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("Audio payload of {payload_bytes} bytes exceeds maximum of {max} bytes")]
    PayloadOverflow { payload_bytes: usize, max: usize },
    #[error("Malformed control line: {0}")]
    MalformedControl(#[source] serde_json::Error),
    #[error("JSON encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Audio stream description carried by a `start` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    /// Codec name as reported by the engine, e.g. `pcm_s16le`.
    pub format: String,
    pub sample_rate: u32,
    pub channels: u16,
}

/// JSON header of a frame, exactly as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FrameHeader {
    Start {
        session_id: String,
        format: String,
        sample_rate: u32,
        channels: u16,
    },
    Audio {
        session_id: String,
        seq: u64,
        payload_bytes: usize,
    },
    Done {
        session_id: String,
    },
    Error {
        session_id: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
}

impl FrameHeader {
    pub fn start(session_id: impl Into<String>, format: &AudioFormat) -> Self {
        FrameHeader::Start {
            session_id: session_id.into(),
            format: format.format.clone(),
            sample_rate: format.sample_rate,
            channels: format.channels,
        }
    }

    pub fn audio(session_id: impl Into<String>, seq: u64, payload_bytes: usize) -> Self {
        FrameHeader::Audio {
            session_id: session_id.into(),
            seq,
            payload_bytes,
        }
    }

    pub fn done(session_id: impl Into<String>) -> Self {
        FrameHeader::Done {
            session_id: session_id.into(),
        }
    }

    pub fn error(
        session_id: impl Into<String>,
        message: impl Into<String>,
        code: Option<String>,
    ) -> Self {
        FrameHeader::Error {
            session_id: session_id.into(),
            message: message.into(),
            code,
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            FrameHeader::Start { session_id, .. }
            | FrameHeader::Audio { session_id, .. }
            | FrameHeader::Done { session_id }
            | FrameHeader::Error { session_id, .. } => session_id,
        }
    }

    /// Number of payload bytes that trail this header on the wire.
    pub fn payload_len(&self) -> usize {
        match self {
            FrameHeader::Audio { payload_bytes, .. } => *payload_bytes,
            _ => 0,
        }
    }
}

/// A fully reassembled frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Start {
        session_id: String,
        format: AudioFormat,
    },
    /// `payload_bytes` is the declared length; `payload` is what was read.
    Audio {
        session_id: String,
        seq: u64,
        payload_bytes: usize,
        payload: Bytes,
    },
    Done {
        session_id: String,
    },
    Error {
        session_id: String,
        message: String,
        code: Option<String>,
    },
}

impl Frame {
    fn from_parts(header: FrameHeader, payload: Bytes) -> Self {
        match header {
            FrameHeader::Start {
                session_id,
                format,
                sample_rate,
                channels,
            } => Frame::Start {
                session_id,
                format: AudioFormat {
                    format,
                    sample_rate,
                    channels,
                },
            },
            FrameHeader::Audio {
                session_id,
                seq,
                payload_bytes,
            } => Frame::Audio {
                session_id,
                seq,
                payload_bytes,
                payload,
            },
            FrameHeader::Done { session_id } => Frame::Done { session_id },
            FrameHeader::Error {
                session_id,
                message,
                code,
            } => Frame::Error {
                session_id,
                message,
                code,
            },
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            Frame::Start { session_id, .. }
            | Frame::Audio { session_id, .. }
            | Frame::Done { session_id }
            | Frame::Error { session_id, .. } => session_id,
        }
    }

    /// Wire name of the frame type.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Start { .. } => "start",
            Frame::Audio { .. } => "audio",
            Frame::Done { .. } => "done",
            Frame::Error { .. } => "error",
        }
    }
}

/// Outcome of a single decode step.
#[derive(Debug)]
pub enum Decoded {
    /// A complete frame occupying the first `consumed` bytes.
    Frame { frame: Frame, consumed: usize },
    /// The first `consumed` bytes are corrupt and must be dropped.
    Skipped { error: FrameError, consumed: usize },
    /// Not enough data yet; nothing consumed.
    Incomplete,
}

impl Decoded {
    pub fn consumed(&self) -> usize {
        match self {
            Decoded::Frame { consumed, .. } | Decoded::Skipped { consumed, .. } => *consumed,
            Decoded::Incomplete => 0,
        }
    }

    pub fn into_frame(self) -> Option<Frame> {
        match self {
            Decoded::Frame { frame, .. } => Some(frame),
            _ => None,
        }
    }
}

enum Scan {
    Ready {
        header: FrameHeader,
        header_end: usize,
        total: usize,
    },
    Skip {
        error: FrameError,
        consumed: usize,
    },
    Incomplete,
}

fn scan(buf: &[u8], limits: FrameLimits) -> Scan {
    if buf.len() < LENGTH_PREFIX_LEN {
        return Scan::Incomplete;
    }

    let declared = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if declared > limits.max_header_len {
        return Scan::Skip {
            error: FrameError::OversizedHeader {
                declared,
                max: limits.max_header_len,
            },
            consumed: LENGTH_PREFIX_LEN,
        };
    }

    let header_end = LENGTH_PREFIX_LEN + declared;
    if buf.len() < header_end {
        return Scan::Incomplete;
    }

    let header: FrameHeader = match serde_json::from_slice(&buf[LENGTH_PREFIX_LEN..header_end]) {
        Ok(header) => header,
        Err(source) => {
            return Scan::Skip {
                error: FrameError::MalformedHeader {
                    len: declared,
                    source,
                },
                consumed: header_end,
            }
        }
    };

    let payload_bytes = header.payload_len();
    let total = match header_end.checked_add(payload_bytes) {
        Some(total) if payload_bytes <= limits.max_payload_len => total,
        _ => {
            return Scan::Skip {
                error: FrameError::PayloadOverflow {
                    payload_bytes,
                    max: limits.max_payload_len,
                },
                consumed: header_end,
            }
        }
    };
    if buf.len() < total {
        return Scan::Incomplete;
    }

    Scan::Ready {
        header,
        header_end,
        total,
    }
}

/// Decode at most one frame from the front of `buf`.
///
/// The payload is copied out of `buf`. [`FrameDecoder`] avoids the copy by
/// splitting its own buffer instead.
pub fn try_decode_one(buf: &[u8], limits: FrameLimits) -> Decoded {
    match scan(buf, limits) {
        Scan::Ready {
            header,
            header_end,
            total,
        } => Decoded::Frame {
            frame: Frame::from_parts(header, Bytes::copy_from_slice(&buf[header_end..total])),
            consumed: total,
        },
        Scan::Skip { error, consumed } => Decoded::Skipped { error, consumed },
        Scan::Incomplete => Decoded::Incomplete,
    }
}

/// Decode every complete frame in `buf`, returning the unconsumed remainder.
///
/// Corrupt data is logged and skipped.
pub fn decode(buf: &[u8], limits: FrameLimits) -> (Vec<Frame>, &[u8]) {
    let mut frames = Vec::new();
    let mut offset = 0;

    loop {
        match try_decode_one(&buf[offset..], limits) {
            Decoded::Frame { frame, consumed } => {
                frames.push(frame);
                offset += consumed;
            }
            Decoded::Skipped { error, consumed } => {
                warn!("skipping {} bytes of engine output: {}", consumed, error);
                offset += consumed;
            }
            Decoded::Incomplete => break,
        }
    }

    (frames, &buf[offset..])
}

/// Incremental decoder fed with raw stdout chunks.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: BytesMut,
    limits: FrameLimits,
    skipped_units: u64,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_limits(FrameLimits::default())
    }

    pub fn with_limits(limits: FrameLimits) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            limits,
            skipped_units: 0,
        }
    }

    /// Append a chunk read from the engine.
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Pop the next complete frame, skipping over corrupt data.
    pub fn next_frame(&mut self) -> Option<Frame> {
        loop {
            match scan(&self.buffer, self.limits) {
                Scan::Ready {
                    header,
                    header_end,
                    total,
                } => {
                    let unit = self.buffer.split_to(total).freeze();
                    let frame = Frame::from_parts(header, unit.slice(header_end..));
                    trace!(
                        "decoded {} frame for {} ({} bytes)",
                        frame.kind(),
                        frame.session_id(),
                        total
                    );
                    return Some(frame);
                }
                Scan::Skip { error, consumed } => {
                    warn!("skipping {} bytes of engine output: {}", consumed, error);
                    self.skipped_units += 1;
                    self.buffer.advance(consumed);
                }
                Scan::Incomplete => return None,
            }
        }
    }

    /// Append `chunk` and drain every frame that became complete.
    pub fn decode(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.extend(chunk);
        std::iter::from_fn(|| self.next_frame()).collect()
    }

    /// Bytes held back waiting for the rest of a frame.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Number of corrupt units dropped so far.
    pub fn skipped_units(&self) -> u64 {
        self.skipped_units
    }
}

/// Encode a frame the way an engine writes it.
///
/// `payload` is written verbatim after the header; callers are responsible
/// for keeping it in line with `payload_bytes`.
pub fn encode_frame(header: &FrameHeader, payload: &[u8]) -> Result<Bytes, FrameError> {
    let json = serde_json::to_vec(header)?;
    let len = u32::try_from(json.len()).map_err(|_| FrameError::OversizedHeader {
        declared: json.len(),
        max: u32::MAX as usize,
    })?;

    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_LEN + json.len() + payload.len());
    buf.put_u32(len);
    buf.put_slice(&json);
    buf.put_slice(payload);
    Ok(buf.freeze())
}
