//! warble - Streaming speech synthesis through an external engine process
//!
//! warble turns a synthesis engine that speaks the `warbleproto` stdio
//! protocol into a session-oriented API: submit text, get one metadata value
//! and an ordered stream of PCM bytes back.
//!
//! ## Components
//!
//! ```text
//!  caller ──▶ Engine::send / create_session
//!               │
//!               ▼
//!        SessionRegistry ──── single active slot, Busy otherwise
//!               │ Session::send_text / end
//!               ▼
//!         Supervisor ──stdin──▶ engine process ──stdout──▶ FrameDecoder
//!                                                              │
//!        SessionRegistry::dispatch ◀───────────────────────────┘
//!               │
//!               ▼
//!   Session::metadata + AudioStream
//! ```
//!
//! - [`supervisor`] owns the child process: spawn, stdio, exit, shutdown.
//! - [`registry`] admits one session at a time and routes frames.
//! - [`session`] is the caller's handle and the per-session state machine.
//! - [`engine`] ties them together and restarts the process on request.
//! - [`artifact`] writes a finished session to a WAV file.
//!
//! ## Example
//!
//! ```rust,no_run
//! use warble::{Engine, EngineOptions};
//! use warbleconf::WarbleConfig;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = WarbleConfig::load()?;
//! let engine = Engine::start(EngineOptions::from(&config.engine))?;
//!
//! let mut session = engine.send("hello there").await?;
//! let format = session.metadata().await?;
//! let pcm = session.collect_audio().await?;
//! println!("{} bytes at {} Hz", pcm.len(), format.sample_rate);
//!
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod artifact;
pub mod engine;
pub mod error;
pub mod registry;
pub mod session;
pub mod supervisor;
pub mod telemetry;

pub use artifact::{write_wav, ArtifactError, ArtifactSummary};
pub use engine::{Engine, EngineOptions, EngineState, SpeakRequest};
pub use error::{EngineError, ErrorCategory};
pub use registry::SessionRegistry;
pub use session::{
    AudioStream, ControlSink, Session, SessionId, SessionState, DEFAULT_MAX_AUDIO_BACKLOG,
};
pub use supervisor::{EngineCommand, ExitReport, ProcessEvent, ShutdownOutcome, Supervisor};
pub use warbleproto::{AudioFormat, FrameLimits};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
