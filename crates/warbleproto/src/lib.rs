//! warbleproto - Wire protocol between the warble host and a synthesis engine
//!
//! The engine is an opaque child process. The host talks to it over the
//! child's standard streams, and the two directions use different encodings:
//!
//! - **Control events** (host → engine, stdin) are newline-delimited JSON.
//!   See the `control` module.
//! - **Frames** (engine → host, stdout) are length-prefixed JSON headers with
//!   an optional raw binary payload for audio. See the `frame` module.
//!
//! ## Session Exchange
//!
//! ```text
//! host                                   engine
//!  │ {"type":"text","session_id":..}\n     │
//!  │──────────────────────────────────────▶│
//!  │ {"type":"end","session_id":..}\n      │
//!  │──────────────────────────────────────▶│
//!  │        [len][start header]            │
//!  │◀──────────────────────────────────────│
//!  │        [len][audio header][pcm]  x N  │
//!  │◀──────────────────────────────────────│
//!  │        [len][done header]             │
//!  │◀──────────────────────────────────────│
//! ```
//!
//! An engine may answer with an `error` frame at any point instead of
//! `done`. Stderr is free-form diagnostics and never carries frames.
//!
//! Both directions are implemented here so that engines written in Rust can
//! reuse the same types as the host.

pub mod control;
pub mod frame;

pub use control::{encode_control_event, parse_control_line, ControlEvent};
pub use frame::{
    decode, encode_frame, try_decode_one, AudioFormat, Decoded, Frame, FrameDecoder, FrameError,
    FrameHeader, FrameLimits, DEFAULT_MAX_HEADER_LEN, DEFAULT_MAX_PAYLOAD_LEN, LENGTH_PREFIX_LEN,
};
