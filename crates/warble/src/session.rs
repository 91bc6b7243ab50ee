//! Sessions: one text submission in, one ordered audio stream out.
//!
//! A session is split in two halves:
//!
//! - [`Session`] is what the caller holds. It writes control events, awaits
//!   the metadata, and hands out the [`AudioStream`].
//! - `SessionCore` is the state machine. The registry looks it up by id to
//!   route decoded frames; the handle shares it to validate caller actions.
//!
//! ## State Machine
//!
//! ```text
//!            send_text + end           start             done
//! Created ──────────────────▶ AwaitingStart ──▶ Streaming ──────▶ Completed
//!    │                             │                │
//!    └─────────────────────────────┴────────────────┴──▶ Failed
//!       error frame, seq/length violation, process exit, cancellation
//! ```

use std::borrow::Borrow;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use warbleproto::{encode_control_event, AudioFormat, ControlEvent, Frame};

use crate::error::EngineError;
use crate::lock;
use crate::registry::SessionRegistry;

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique session identifier, `warble-<unix-millis>-<counter>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        let n = SESSION_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!(
            "warble-{}-{}",
            chrono::Utc::now().timestamp_millis(),
            n
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for SessionId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<String> for SessionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Lifecycle state of a session.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created = 0,
    AwaitingStart = 1,
    Streaming = 2,
    Completed = 3,
    Failed = 4,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Created => "created",
            SessionState::AwaitingStart => "awaiting_start",
            SessionState::Streaming => "streaming",
            SessionState::Completed => "completed",
            SessionState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a session's control events go: the engine's stdin in production.
#[async_trait]
pub trait ControlSink: Send + Sync {
    /// Write one complete line, newline included.
    async fn write_line(&self, line: Bytes) -> Result<(), EngineError>;
}

/// Unread audio a session may hold before it is failed.
pub const DEFAULT_MAX_AUDIO_BACKLOG: usize = 128 * 1024 * 1024;

type MetadataResult = Result<AudioFormat, EngineError>;
type AudioResult = Result<Bytes, EngineError>;

pub(crate) struct SessionCore {
    id: SessionId,
    state: SessionState,
    next_seq: u64,
    text_sent: bool,
    ended: bool,
    metadata_tx: Option<oneshot::Sender<MetadataResult>>,
    audio_tx: Option<mpsc::UnboundedSender<AudioResult>>,
    backlog: Arc<AtomicUsize>,
    max_backlog: usize,
}

impl SessionCore {
    pub(crate) fn id(&self) -> &SessionId {
        &self.id
    }

    fn unexpected(&self, frame: &'static str) -> EngineError {
        EngineError::UnexpectedFrame {
            frame,
            state: self.state,
        }
    }

    /// Apply a decoded frame. Returns true once the session is terminal.
    pub(crate) fn apply(&mut self, frame: Frame) -> bool {
        match frame {
            Frame::Start { format, .. } => {
                if self.state != SessionState::AwaitingStart {
                    self.fail(self.unexpected("start"));
                } else {
                    debug!(
                        "session {}: {} at {} Hz, {} channel(s)",
                        self.id, format.format, format.sample_rate, format.channels
                    );
                    if let Some(tx) = self.metadata_tx.take() {
                        let _ = tx.send(Ok(format));
                    }
                    self.state = SessionState::Streaming;
                }
            }
            Frame::Audio {
                seq,
                payload_bytes,
                payload,
                ..
            } => {
                if self.state != SessionState::Streaming {
                    self.fail(self.unexpected("audio"));
                } else if seq != self.next_seq {
                    self.fail(EngineError::SequenceGap {
                        expected: self.next_seq,
                        got: seq,
                    });
                } else if payload.len() != payload_bytes {
                    self.fail(EngineError::PayloadLength {
                        declared: payload_bytes,
                        actual: payload.len(),
                    });
                } else if let Some(buffered) = self.over_backlog(payload.len()) {
                    self.fail(EngineError::AudioBacklog {
                        buffered,
                        limit: self.max_backlog,
                    });
                } else {
                    self.next_seq += 1;
                    self.backlog.fetch_add(payload.len(), Ordering::SeqCst);
                    let delivered = self
                        .audio_tx
                        .as_ref()
                        .is_some_and(|tx| tx.send(Ok(payload)).is_ok());
                    if !delivered {
                        self.fail(EngineError::Cancelled);
                    }
                }
            }
            Frame::Done { .. } => {
                if self.state != SessionState::Streaming {
                    self.fail(self.unexpected("done"));
                } else {
                    debug!("session {}: done after {} audio frames", self.id, self.next_seq);
                    self.state = SessionState::Completed;
                    self.audio_tx = None;
                }
            }
            Frame::Error { message, code, .. } => {
                self.fail(EngineError::Engine { message, code });
            }
        }

        self.state.is_terminal()
    }

    /// Unread bytes after queuing `incoming`, if that exceeds the limit.
    ///
    /// The reader only ever shrinks the backlog, so a stale read errs high.
    fn over_backlog(&self, incoming: usize) -> Option<usize> {
        let buffered = self.backlog.load(Ordering::SeqCst).saturating_add(incoming);
        (buffered > self.max_backlog).then_some(buffered)
    }

    /// Fail the session, erroring the stream and any unresolved metadata.
    pub(crate) fn fail(&mut self, error: EngineError) {
        if self.state.is_terminal() {
            return;
        }

        match error {
            EngineError::Cancelled => debug!("session {} abandoned by its consumer", self.id),
            _ => warn!("session {} failed in state {}: {}", self.id, self.state, error),
        }

        self.state = SessionState::Failed;
        if let Some(tx) = self.metadata_tx.take() {
            let _ = tx.send(Err(error.clone()));
        }
        if let Some(tx) = self.audio_tx.take() {
            let _ = tx.send(Err(error));
        }
    }
}

enum MetadataSlot {
    Pending(oneshot::Receiver<MetadataResult>),
    Ready(MetadataResult),
}

/// Caller-facing handle for one synthesis pass.
///
/// Dropping the handle while it still owns its audio stream cancels the
/// session and frees the engine for the next caller.
///
/// Audio is queued until it is read. A session whose unread audio grows past
/// the registry's backlog limit fails with [`EngineError::AudioBacklog`].
pub struct Session {
    id: SessionId,
    core: Arc<Mutex<SessionCore>>,
    registry: Arc<SessionRegistry>,
    sink: Arc<dyn ControlSink>,
    metadata: MetadataSlot,
    audio: Option<AudioStream>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

impl Session {
    pub(crate) fn open(
        id: SessionId,
        registry: &Arc<SessionRegistry>,
        sink: Arc<dyn ControlSink>,
        max_backlog: usize,
    ) -> (Arc<Mutex<SessionCore>>, Session) {
        let (metadata_tx, metadata_rx) = oneshot::channel();
        let (audio_tx, audio_rx) = mpsc::unbounded_channel();
        let backlog = Arc::new(AtomicUsize::new(0));

        let core = Arc::new(Mutex::new(SessionCore {
            id: id.clone(),
            state: SessionState::Created,
            next_seq: 0,
            text_sent: false,
            ended: false,
            metadata_tx: Some(metadata_tx),
            audio_tx: Some(audio_tx),
            backlog: Arc::clone(&backlog),
            max_backlog,
        }));

        let audio = AudioStream {
            rx: audio_rx,
            backlog,
            guard: CancelGuard {
                id: id.clone(),
                registry: Arc::downgrade(registry),
            },
        };

        let session = Session {
            id,
            core: Arc::clone(&core),
            registry: Arc::clone(registry),
            sink,
            metadata: MetadataSlot::Pending(metadata_rx),
            audio: Some(audio),
        };

        (core, session)
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        lock(&self.core).state
    }

    /// Submit the text for this session. Valid once, before `end`.
    pub async fn send_text(&mut self, text: &str) -> Result<(), EngineError> {
        if text.is_empty() {
            return Err(EngineError::EmptyText);
        }
        {
            let mut core = lock(&self.core);
            if core.state.is_terminal() {
                return Err(EngineError::SessionClosed(core.state));
            }
            if core.text_sent {
                return Err(EngineError::TextAlreadySent);
            }
            core.text_sent = true;
        }

        debug!("session {}: sending {} bytes of text", self.id, text.len());
        self.write(ControlEvent::text(self.id.as_str(), text)).await
    }

    /// Tell the engine no more input is coming. Valid once, after `send_text`.
    pub async fn end(&mut self) -> Result<(), EngineError> {
        {
            let mut core = lock(&self.core);
            if core.state.is_terminal() {
                return Err(EngineError::SessionClosed(core.state));
            }
            if !core.text_sent {
                return Err(EngineError::EndBeforeText);
            }
            if core.ended {
                return Err(EngineError::AlreadyEnded);
            }
            // The engine answers only after reading the end line, so the
            // transition has to be in place before the write.
            core.ended = true;
            core.state = SessionState::AwaitingStart;
        }

        self.write(ControlEvent::end(self.id.as_str())).await
    }

    async fn write(&mut self, event: ControlEvent) -> Result<(), EngineError> {
        let line = encode_control_event(&event)?;
        if let Err(err) = self.sink.write_line(line).await {
            self.registry.fail_session(&self.id, err.clone());
            return Err(err);
        }
        Ok(())
    }

    /// Audio format announced by the engine's `start` frame.
    ///
    /// Resolves once; later calls return the same result.
    pub async fn metadata(&mut self) -> Result<AudioFormat, EngineError> {
        let result = match &mut self.metadata {
            MetadataSlot::Ready(result) => return result.clone(),
            MetadataSlot::Pending(rx) => rx.await.unwrap_or(Err(EngineError::NotRunning)),
        };
        self.metadata = MetadataSlot::Ready(result.clone());
        result
    }

    /// Take ownership of the audio stream.
    pub fn take_audio(&mut self) -> Result<AudioStream, EngineError> {
        self.audio.take().ok_or(EngineError::StreamTaken)
    }

    /// Drain the audio stream into a single buffer.
    pub async fn collect_audio(&mut self) -> Result<Bytes, EngineError> {
        let mut stream = self.take_audio()?;
        let mut audio = BytesMut::new();
        while let Some(chunk) = stream.next().await {
            audio.extend_from_slice(&chunk?);
        }
        Ok(audio.freeze())
    }
}

struct CancelGuard {
    id: SessionId,
    registry: Weak<SessionRegistry>,
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.abandon(&self.id);
        }
    }
}

/// Ordered PCM chunks for one session.
///
/// Yields `Ok` chunks in `seq` order, then ends on `done` or yields a single
/// `Err` on failure. Dropping it before the end cancels the session.
pub struct AudioStream {
    rx: mpsc::UnboundedReceiver<AudioResult>,
    backlog: Arc<AtomicUsize>,
    guard: CancelGuard,
}

impl AudioStream {
    pub fn session_id(&self) -> &SessionId {
        &self.guard.id
    }
}

impl Stream for AudioStream {
    type Item = Result<Bytes, EngineError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let polled = self.rx.poll_recv(cx);
        if let Poll::Ready(Some(Ok(chunk))) = &polled {
            self.backlog.fetch_sub(chunk.len(), Ordering::SeqCst);
        }
        polled
    }
}
