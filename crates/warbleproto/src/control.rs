//! Host → engine control events, one JSON object per line.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::frame::FrameError;

/// A control event written to the engine's stdin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlEvent {
    /// Text to synthesize for a session.
    Text { session_id: String, text: String },
    /// No more input for this session; the engine may start producing frames.
    End { session_id: String },
}

impl ControlEvent {
    pub fn text(session_id: impl Into<String>, text: impl Into<String>) -> Self {
        ControlEvent::Text {
            session_id: session_id.into(),
            text: text.into(),
        }
    }

    pub fn end(session_id: impl Into<String>) -> Self {
        ControlEvent::End {
            session_id: session_id.into(),
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            ControlEvent::Text { session_id, .. } | ControlEvent::End { session_id } => session_id,
        }
    }
}

/// Encode a control event as a single newline-terminated line.
///
/// serde_json escapes embedded newlines, so the output never spans lines.
pub fn encode_control_event(event: &ControlEvent) -> Result<Bytes, FrameError> {
    let json = serde_json::to_vec(event)?;
    let mut buf = BytesMut::with_capacity(json.len() + 1);
    buf.put_slice(&json);
    buf.put_u8(b'\n');
    Ok(buf.freeze())
}

/// Parse one line read by an engine. Trailing `\r\n` or `\n` is ignored.
pub fn parse_control_line(line: &[u8]) -> Result<ControlEvent, FrameError> {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    serde_json::from_slice(line).map_err(FrameError::MalformedControl)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn text_event_line() {
        let line = encode_control_event(&ControlEvent::text("warble-1-0", "hello")).unwrap();
        assert_eq!(
            std::str::from_utf8(&line).unwrap(),
            "{\"type\":\"text\",\"session_id\":\"warble-1-0\",\"text\":\"hello\"}\n"
        );
    }

    #[test]
    fn end_event_line() {
        let line = encode_control_event(&ControlEvent::end("warble-1-0")).unwrap();
        assert_eq!(
            std::str::from_utf8(&line).unwrap(),
            "{\"type\":\"end\",\"session_id\":\"warble-1-0\"}\n"
        );
    }

    #[test]
    fn multiline_text_stays_on_one_line() {
        let line = encode_control_event(&ControlEvent::text("s", "one\ntwo")).unwrap();
        let newlines = line.iter().filter(|b| **b == b'\n').count();
        assert_eq!(newlines, 1);
        assert_eq!(
            parse_control_line(&line).unwrap(),
            ControlEvent::text("s", "one\ntwo")
        );
    }

    #[test]
    fn parse_tolerates_crlf() {
        let event = parse_control_line(b"{\"type\":\"end\",\"session_id\":\"x\"}\r\n").unwrap();
        assert_eq!(event.session_id(), "x");
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(matches!(
            parse_control_line(b"hello\n"),
            Err(FrameError::MalformedControl(_))
        ));
    }
}
