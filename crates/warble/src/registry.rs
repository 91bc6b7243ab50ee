//! Single-flight admission and frame routing.
//!
//! One registry exists per engine process. It owns the only active-session
//! slot, and it is the only code that clears it. Sessions leave the registry
//! when they reach a terminal state, when their consumer goes away, or when
//! the process dies underneath them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};
use warbleproto::Frame;

use crate::error::EngineError;
use crate::lock;
use crate::session::{ControlSink, Session, SessionCore, SessionId, DEFAULT_MAX_AUDIO_BACKLOG};

#[derive(Default)]
struct RegistryInner {
    sessions: HashMap<SessionId, Arc<Mutex<SessionCore>>>,
    active: Option<SessionId>,
}

impl RegistryInner {
    fn release(&mut self, id: &SessionId) {
        self.sessions.remove(id.as_str());
        if self.active.as_ref() == Some(id) {
            self.active = None;
        }
    }
}

pub struct SessionRegistry {
    inner: Mutex<RegistryInner>,
    max_audio_backlog: usize,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self {
            inner: Mutex::default(),
            max_audio_backlog: DEFAULT_MAX_AUDIO_BACKLOG,
        }
    }
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registry whose sessions fail once `max` bytes of audio sit unread.
    pub fn with_audio_backlog(max: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::default(),
            max_audio_backlog: max,
        })
    }

    /// Admit a new session, or fail with `Busy` if one is already active.
    ///
    /// There is no queue: a rejected caller has to retry on its own.
    pub fn create_session(
        self: &Arc<Self>,
        sink: Arc<dyn ControlSink>,
    ) -> Result<Session, EngineError> {
        let mut inner = lock(&self.inner);
        if let Some(active) = &inner.active {
            debug!("rejecting session, {} is active", active);
            return Err(EngineError::Busy {
                active: active.to_string(),
            });
        }

        let id = SessionId::generate();
        let (core, session) = Session::open(id.clone(), self, sink, self.max_audio_backlog);
        inner.sessions.insert(id.clone(), core);
        inner.active = Some(id.clone());
        info!("session {} admitted", id);
        Ok(session)
    }

    /// Route a decoded frame to its session.
    ///
    /// Frames for unknown or finished sessions are logged and dropped.
    pub fn dispatch(&self, frame: Frame) {
        let mut inner = lock(&self.inner);
        let Some(core) = inner.sessions.get(frame.session_id()).cloned() else {
            match frame {
                Frame::Audio { .. } => {
                    debug!("dropping audio frame for unknown session {}", frame.session_id())
                }
                _ => warn!(
                    "dropping {} frame for unknown session {}",
                    frame.kind(),
                    frame.session_id()
                ),
            }
            return;
        };

        let mut core = lock(&core);
        if core.apply(frame) {
            let id = core.id().clone();
            drop(core);
            inner.release(&id);
            info!("session {} finished", id);
        }
    }

    /// Fail one session and release its slot. Returns false if it was not tracked.
    pub fn fail_session(&self, id: &SessionId, error: EngineError) -> bool {
        let mut inner = lock(&self.inner);
        let Some(core) = inner.sessions.get(id.as_str()).cloned() else {
            return false;
        };
        lock(&core).fail(error);
        inner.release(id);
        true
    }

    /// The consumer went away before the session finished.
    ///
    /// Nothing is sent to the engine. Frames it still produces for this id
    /// are dropped as unknown.
    pub fn abandon(&self, id: &SessionId) {
        if self.fail_session(id, EngineError::Cancelled) {
            info!("session {} cancelled, slot released", id);
        }
    }

    /// Fail every tracked session with `reason` and clear the active slot.
    ///
    /// Returns how many sessions were failed.
    pub fn on_process_terminated(&self, reason: EngineError) -> usize {
        let mut inner = lock(&self.inner);
        let sessions: Vec<_> = inner.sessions.drain().collect();
        inner.active = None;
        drop(inner);

        for (_, core) in &sessions {
            lock(core).fail(reason.clone());
        }
        sessions.len()
    }

    pub fn active_session(&self) -> Option<SessionId> {
        lock(&self.inner).active.clone()
    }

    pub fn tracked(&self) -> usize {
        lock(&self.inner).sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionState;
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::StreamExt;
    use std::sync::atomic::{AtomicBool, Ordering};
    use warbleproto::{parse_control_line, AudioFormat, ControlEvent};

    #[derive(Default)]
    struct RecordingSink {
        lines: Mutex<Vec<Bytes>>,
        broken: AtomicBool,
    }

    impl RecordingSink {
        fn events(&self) -> Vec<ControlEvent> {
            self.lines
                .lock()
                .unwrap()
                .iter()
                .map(|l| parse_control_line(l).unwrap())
                .collect()
        }
    }

    #[async_trait]
    impl ControlSink for RecordingSink {
        async fn write_line(&self, line: Bytes) -> Result<(), EngineError> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(EngineError::NotRunning);
            }
            self.lines.lock().unwrap().push(line);
            Ok(())
        }
    }

    fn pcm() -> AudioFormat {
        AudioFormat {
            format: "pcm_s16le".to_string(),
            sample_rate: 24_000,
            channels: 1,
        }
    }

    fn start(id: &SessionId) -> Frame {
        Frame::Start {
            session_id: id.to_string(),
            format: pcm(),
        }
    }

    fn audio(id: &SessionId, seq: u64, payload: &'static [u8]) -> Frame {
        Frame::Audio {
            session_id: id.to_string(),
            seq,
            payload_bytes: payload.len(),
            payload: Bytes::from_static(payload),
        }
    }

    fn done(id: &SessionId) -> Frame {
        Frame::Done {
            session_id: id.to_string(),
        }
    }

    async fn streaming_session(
        registry: &Arc<SessionRegistry>,
        sink: &Arc<RecordingSink>,
    ) -> Session {
        let mut session = registry.create_session(sink.clone()).unwrap();
        session.send_text("hello").await.unwrap();
        session.end().await.unwrap();
        registry.dispatch(start(session.id()));
        session
    }

    #[tokio::test]
    async fn full_exchange() {
        let registry = SessionRegistry::new();
        let sink = Arc::new(RecordingSink::default());

        let mut session = registry.create_session(sink.clone()).unwrap();
        let id = session.id().clone();
        assert_eq!(session.state(), SessionState::Created);

        session.send_text("hello").await.unwrap();
        session.end().await.unwrap();
        assert_eq!(session.state(), SessionState::AwaitingStart);
        assert_eq!(
            sink.events(),
            vec![
                ControlEvent::text(id.as_str(), "hello"),
                ControlEvent::end(id.as_str())
            ]
        );

        registry.dispatch(start(&id));
        assert_eq!(session.metadata().await.unwrap(), pcm());
        assert_eq!(session.state(), SessionState::Streaming);

        registry.dispatch(audio(&id, 0, b"ab"));
        registry.dispatch(audio(&id, 1, b"cd"));
        registry.dispatch(audio(&id, 2, b""));
        registry.dispatch(done(&id));

        assert_eq!(session.collect_audio().await.unwrap(), Bytes::from_static(b"abcd"));
        assert_eq!(session.state(), SessionState::Completed);
        assert_eq!(registry.active_session(), None);
        assert_eq!(registry.tracked(), 0);

        // metadata stays resolved after completion
        assert_eq!(session.metadata().await.unwrap(), pcm());
    }

    #[tokio::test]
    async fn second_session_is_busy_until_first_finishes() {
        let registry = SessionRegistry::new();
        let sink = Arc::new(RecordingSink::default());

        let mut first = streaming_session(&registry, &sink).await;
        let err = registry.create_session(sink.clone()).unwrap_err();
        assert!(matches!(err, EngineError::Busy { ref active } if active == first.id().as_str()));

        registry.dispatch(done(first.id()));
        assert!(first.collect_audio().await.unwrap().is_empty());

        assert!(registry.create_session(sink.clone()).is_ok());
    }

    #[tokio::test]
    async fn ordering_errors() {
        let registry = SessionRegistry::new();
        let sink = Arc::new(RecordingSink::default());
        let mut session = registry.create_session(sink.clone()).unwrap();

        assert!(matches!(session.end().await, Err(EngineError::EndBeforeText)));
        assert!(matches!(session.send_text("").await, Err(EngineError::EmptyText)));

        session.send_text("hi").await.unwrap();
        assert!(matches!(
            session.send_text("again").await,
            Err(EngineError::TextAlreadySent)
        ));

        session.end().await.unwrap();
        assert!(matches!(session.end().await, Err(EngineError::AlreadyEnded)));
        assert_eq!(sink.events().len(), 2);
    }

    #[tokio::test]
    async fn sequence_gap_fails_session() {
        let registry = SessionRegistry::new();
        let sink = Arc::new(RecordingSink::default());
        let mut session = streaming_session(&registry, &sink).await;
        let id = session.id().clone();
        let mut stream = session.take_audio().unwrap();

        registry.dispatch(audio(&id, 0, b"ok"));
        registry.dispatch(audio(&id, 2, b"late"));
        registry.dispatch(audio(&id, 1, b"never"));

        assert_eq!(stream.next().await.unwrap().unwrap(), Bytes::from_static(b"ok"));
        match stream.next().await {
            Some(Err(EngineError::SequenceGap { expected, got })) => {
                assert_eq!((expected, got), (1, 2));
            }
            other => panic!("expected sequence gap, got {:?}", other),
        }
        assert!(stream.next().await.is_none());
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(registry.active_session(), None);
    }

    #[tokio::test]
    async fn payload_length_mismatch_fails_session() {
        let registry = SessionRegistry::new();
        let sink = Arc::new(RecordingSink::default());
        let mut session = streaming_session(&registry, &sink).await;

        registry.dispatch(Frame::Audio {
            session_id: session.id().to_string(),
            seq: 0,
            payload_bytes: 4,
            payload: Bytes::from_static(b"abc"),
        });

        let err = session.collect_audio().await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::PayloadLength {
                declared: 4,
                actual: 3
            }
        ));
    }

    #[tokio::test]
    async fn error_frame_rejects_pending_metadata() {
        let registry = SessionRegistry::new();
        let sink = Arc::new(RecordingSink::default());
        let mut session = registry.create_session(sink.clone()).unwrap();
        session.send_text("hello").await.unwrap();
        session.end().await.unwrap();

        registry.dispatch(Frame::Error {
            session_id: session.id().to_string(),
            message: "voice missing".to_string(),
            code: Some("E_VOICE".to_string()),
        });

        match session.metadata().await {
            Err(EngineError::Engine { message, code }) => {
                assert_eq!(message, "voice missing");
                assert_eq!(code.as_deref(), Some("E_VOICE"));
            }
            other => panic!("expected engine error, got {:?}", other),
        }
        assert!(matches!(
            session.collect_audio().await,
            Err(EngineError::Engine { .. })
        ));
        assert_eq!(registry.active_session(), None);
    }

    #[tokio::test]
    async fn audio_before_start_is_a_protocol_violation() {
        let registry = SessionRegistry::new();
        let sink = Arc::new(RecordingSink::default());
        let mut session = registry.create_session(sink.clone()).unwrap();
        session.send_text("hello").await.unwrap();
        session.end().await.unwrap();

        registry.dispatch(audio(session.id(), 0, b"xx"));
        assert!(matches!(
            session.metadata().await,
            Err(EngineError::UnexpectedFrame {
                frame: "audio",
                state: SessionState::AwaitingStart
            })
        ));
    }

    #[tokio::test]
    async fn frames_for_finished_sessions_are_dropped() {
        let registry = SessionRegistry::new();
        let sink = Arc::new(RecordingSink::default());
        let mut session = streaming_session(&registry, &sink).await;
        let id = session.id().clone();
        registry.dispatch(done(&id));

        // late frames must not resurrect anything
        registry.dispatch(audio(&id, 0, b"zz"));
        registry.dispatch(done(&id));
        registry.dispatch(done(&SessionId::from("nobody".to_string())));

        assert!(session.collect_audio().await.unwrap().is_empty());
        assert_eq!(session.state(), SessionState::Completed);
        assert_eq!(registry.tracked(), 0);
    }

    #[tokio::test]
    async fn process_termination_fails_everything() {
        let registry = SessionRegistry::new();
        let sink = Arc::new(RecordingSink::default());
        let mut session = streaming_session(&registry, &sink).await;
        registry.dispatch(audio(session.id(), 0, b"partial"));

        let failed = registry.on_process_terminated(EngineError::ProcessEnded {
            status: "exit code 1".to_string(),
        });
        assert_eq!(failed, 1);
        assert_eq!(registry.active_session(), None);

        let mut stream = session.take_audio().unwrap();
        assert!(stream.next().await.unwrap().is_ok());
        assert!(matches!(
            stream.next().await,
            Some(Err(EngineError::ProcessEnded { .. }))
        ));
        assert!(matches!(
            session.send_text("more").await,
            Err(EngineError::SessionClosed(SessionState::Failed))
        ));

        // Nothing is left holding the slot.
        assert_eq!(registry.tracked(), 0);
        let next = registry.create_session(sink.clone()).unwrap();
        assert_eq!(registry.active_session(), Some(next.id().clone()));
    }

    #[tokio::test]
    async fn unread_audio_is_bounded() {
        let registry = SessionRegistry::with_audio_backlog(8);
        let sink = Arc::new(RecordingSink::default());
        let mut session = streaming_session(&registry, &sink).await;
        let mut stream = session.take_audio().unwrap();

        // Reading frees room for more.
        registry.dispatch(audio(session.id(), 0, b"abcdef"));
        assert_eq!(stream.next().await.unwrap().unwrap(), Bytes::from_static(b"abcdef"));
        registry.dispatch(audio(session.id(), 1, b"ghijkl"));
        assert_eq!(session.state(), SessionState::Streaming);

        registry.dispatch(audio(session.id(), 2, b"mnop"));
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(registry.active_session(), None);

        // What was queued before the limit still arrives, then the error.
        assert_eq!(stream.next().await.unwrap().unwrap(), Bytes::from_static(b"ghijkl"));
        match stream.next().await {
            Some(Err(EngineError::AudioBacklog { buffered, limit })) => {
                assert_eq!((buffered, limit), (10, 8));
            }
            other => panic!("expected backlog error, got {:?}", other),
        }
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn dropping_the_stream_cancels() {
        let registry = SessionRegistry::new();
        let sink = Arc::new(RecordingSink::default());
        let mut session = streaming_session(&registry, &sink).await;
        let stream = session.take_audio().unwrap();

        drop(stream);
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(registry.active_session(), None);
        assert!(registry.create_session(sink.clone()).is_ok());
    }

    #[tokio::test]
    async fn dropping_an_unused_session_releases_slot() {
        let registry = SessionRegistry::new();
        let sink = Arc::new(RecordingSink::default());

        let session = registry.create_session(sink.clone()).unwrap();
        drop(session);
        assert_eq!(registry.tracked(), 0);
        assert!(registry.create_session(sink.clone()).is_ok());
    }

    #[tokio::test]
    async fn broken_sink_fails_session() {
        let registry = SessionRegistry::new();
        let sink = Arc::new(RecordingSink::default());
        sink.broken.store(true, Ordering::SeqCst);

        let mut session = registry.create_session(sink.clone()).unwrap();
        assert!(matches!(
            session.send_text("hello").await,
            Err(EngineError::NotRunning)
        ));
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(registry.active_session(), None);
    }

    #[tokio::test]
    async fn metadata_waits_for_start() {
        let registry = SessionRegistry::new();
        let sink = Arc::new(RecordingSink::default());
        let mut session = registry.create_session(sink.clone()).unwrap();
        session.send_text("hello").await.unwrap();
        session.end().await.unwrap();
        let id = session.id().clone();

        {
            let mut pending = tokio_test::task::spawn(session.metadata());
            tokio_test::assert_pending!(pending.poll());
            registry.dispatch(start(&id));
            assert!(pending.is_woken());
            tokio_test::assert_ready_ok!(pending.poll());
        }
        assert_eq!(session.state(), SessionState::Streaming);
    }
}
