//! The engine facade: one supervised process, one registry, one frame pump.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use warbleconf::EngineConfig;
use warbleproto::{FrameDecoder, FrameLimits};

use crate::error::EngineError;
use crate::lock;
use crate::registry::SessionRegistry;
use crate::session::{Session, SessionId, DEFAULT_MAX_AUDIO_BACKLOG};
use crate::supervisor::{EngineCommand, ProcessEvent, ShutdownOutcome, Supervisor};

/// Pause between stopping and starting again in [`Engine::restart`].
const RESTART_PAUSE: Duration = Duration::from_millis(500);

/// How long shutdown waits for the frame pump to settle outstanding sessions.
const PUMP_SETTLE: Duration = Duration::from_secs(1);

/// Everything needed to (re)start the engine.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub command: EngineCommand,
    pub shutdown_grace: Duration,
    pub frame_limits: FrameLimits,
    /// Unread audio bytes a session may hold before it is failed.
    pub max_audio_backlog: usize,
}

impl EngineOptions {
    pub fn new(command: EngineCommand) -> Self {
        Self {
            command,
            shutdown_grace: Duration::from_secs(2),
            frame_limits: FrameLimits::default(),
            max_audio_backlog: DEFAULT_MAX_AUDIO_BACKLOG,
        }
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_max_header_len(mut self, max: usize) -> Self {
        self.frame_limits = self.frame_limits.with_max_header_len(max);
        self
    }

    pub fn with_max_payload_len(mut self, max: usize) -> Self {
        self.frame_limits = self.frame_limits.with_max_payload_len(max);
        self
    }

    pub fn with_max_audio_backlog(mut self, max: usize) -> Self {
        self.max_audio_backlog = max;
        self
    }
}

impl From<&EngineConfig> for EngineOptions {
    fn from(config: &EngineConfig) -> Self {
        let command = EngineCommand {
            program: config.program.clone(),
            args: config.args.clone(),
            env: config.env.clone(),
        };
        EngineOptions::new(command)
            .with_shutdown_grace(config.shutdown_grace())
            .with_max_header_len(config.max_header_bytes)
            .with_max_payload_len(config.max_payload_bytes)
            .with_max_audio_backlog(config.max_audio_backlog_bytes)
    }
}

/// Coarse engine status.
#[repr(i8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Process is up and accepting sessions.
    Online = 1,
    /// Never started, or shut down on request.
    Offline = 0,
    /// Process exited without being asked to.
    Failed = -1,
}

impl EngineState {
    pub fn as_i8(self) -> i8 {
        self as i8
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EngineState::Online => "online",
            EngineState::Offline => "offline",
            EngineState::Failed => "failed",
        }
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A synthesis request. Accepts bare text or `{"text": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeakRequest {
    pub text: String,
}

impl From<&str> for SpeakRequest {
    fn from(text: &str) -> Self {
        Self {
            text: text.to_string(),
        }
    }
}

impl From<String> for SpeakRequest {
    fn from(text: String) -> Self {
        Self { text }
    }
}

struct Running {
    supervisor: Arc<Supervisor>,
    registry: Arc<SessionRegistry>,
    pump: JoinHandle<()>,
}

/// Supervised synthesis engine.
///
/// Each process generation gets its own registry, so a late exit report from
/// a previous process can never fail a session admitted after a restart.
pub struct Engine {
    options: EngineOptions,
    running: Mutex<Option<Running>>,
}

impl Engine {
    /// Spawn the engine process. Must be called from within a Tokio runtime.
    pub fn start(options: EngineOptions) -> Result<Self, EngineError> {
        let running = launch(&options)?;
        Ok(Self {
            options,
            running: Mutex::new(Some(running)),
        })
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn state(&self) -> EngineState {
        match lock(&self.running).as_ref() {
            None => EngineState::Offline,
            Some(running) if running.supervisor.is_running() => EngineState::Online,
            Some(_) => EngineState::Failed,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        lock(&self.running)
            .as_ref()
            .and_then(|running| running.supervisor.pid())
    }

    pub fn active_session(&self) -> Option<SessionId> {
        lock(&self.running)
            .as_ref()
            .and_then(|running| running.registry.active_session())
    }

    /// Admit a new session. Fails with `Busy` or `NotRunning`.
    pub fn create_session(&self) -> Result<Session, EngineError> {
        let guard = lock(&self.running);
        let running = guard.as_ref().ok_or(EngineError::NotRunning)?;
        if !running.supervisor.is_running() {
            return Err(EngineError::NotRunning);
        }
        running.registry.create_session(running.supervisor.clone())
    }

    /// Create a session, send the text and end it in one go.
    pub async fn send(&self, request: impl Into<SpeakRequest>) -> Result<Session, EngineError> {
        let request = request.into();
        if request.text.is_empty() {
            return Err(EngineError::EmptyText);
        }

        let mut session = self.create_session()?;
        session.send_text(&request.text).await?;
        session.end().await?;
        Ok(session)
    }

    /// Stop the process within the configured grace period. Idempotent.
    ///
    /// Sessions still open are failed before this returns.
    pub async fn shutdown(&self) -> ShutdownOutcome {
        let Some(running) = lock(&self.running).take() else {
            return ShutdownOutcome::NotRunning;
        };

        let outcome = running.supervisor.shutdown(self.options.shutdown_grace).await;

        if timeout(PUMP_SETTLE, running.pump).await.is_err() {
            warn!(
                "{}: frame pump did not finish, failing sessions directly",
                running.supervisor.label()
            );
        }
        let reason = match &outcome {
            ShutdownOutcome::Killed(_) => EngineError::ShutdownTimeout,
            _ => EngineError::NotRunning,
        };
        running.registry.on_process_terminated(reason);

        info!("engine shut down: {:?}", outcome);
        outcome
    }

    /// Shut down, pause briefly, and start a fresh process.
    pub async fn restart(&self) -> Result<(), EngineError> {
        let outcome = self.shutdown().await;
        debug!("restart: previous process {:?}", outcome);
        tokio::time::sleep(RESTART_PAUSE).await;

        let running = launch(&self.options)?;
        let previous = lock(&self.running).replace(running);
        if let Some(previous) = previous {
            // Someone else started it during the pause; keep the newest.
            previous.supervisor.kill();
        }
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Some(running) = lock(&self.running).take() {
            running.supervisor.kill();
        }
    }
}

fn launch(options: &EngineOptions) -> Result<Running, EngineError> {
    let (supervisor, events) = Supervisor::start(&options.command)?;
    let supervisor = Arc::new(supervisor);
    let registry = SessionRegistry::with_audio_backlog(options.max_audio_backlog);

    let pump = tokio::spawn(pump_frames(
        events,
        Arc::clone(&registry),
        FrameDecoder::with_limits(options.frame_limits),
        supervisor.label().to_string(),
    ));

    Ok(Running {
        supervisor,
        registry,
        pump,
    })
}

async fn pump_frames(
    mut events: mpsc::UnboundedReceiver<ProcessEvent>,
    registry: Arc<SessionRegistry>,
    mut decoder: FrameDecoder,
    label: String,
) {
    while let Some(event) = events.recv().await {
        match event {
            ProcessEvent::Output(chunk) => {
                for frame in decoder.decode(&chunk) {
                    registry.dispatch(frame);
                }
            }
            ProcessEvent::Exited(report) => {
                if decoder.buffered_len() > 0 {
                    warn!(
                        "{}: discarding {} bytes of unfinished frame",
                        label,
                        decoder.buffered_len()
                    );
                }
                let reason = if report.killed {
                    EngineError::ShutdownTimeout
                } else {
                    EngineError::ProcessEnded {
                        status: report.to_string(),
                    }
                };
                let failed = registry.on_process_terminated(reason);
                if failed > 0 {
                    warn!("{}: {} session(s) failed by process exit", label, failed);
                }
                break;
            }
        }
    }
    debug!(
        "{}: frame pump stopped ({} corrupt units skipped)",
        label,
        decoder.skipped_units()
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_codes() {
        assert_eq!(EngineState::Online.as_i8(), 1);
        assert_eq!(EngineState::Offline.as_i8(), 0);
        assert_eq!(EngineState::Failed.as_i8(), -1);
    }

    #[test]
    fn speak_request_accepts_text_or_object() {
        let from_str: SpeakRequest = "hi".into();
        let from_json: SpeakRequest = serde_json::from_str(r#"{"text":"hi"}"#).unwrap();
        assert_eq!(from_str, from_json);
    }

    #[test]
    fn options_from_config() {
        let mut config = EngineConfig::default();
        config.args = vec!["engine.py".to_string()];
        config.shutdown_grace_ms = 250;
        config.max_payload_bytes = 4096;

        let options = EngineOptions::from(&config);
        assert_eq!(options.command.args, vec!["engine.py".to_string()]);
        assert_eq!(options.shutdown_grace, Duration::from_millis(250));
        assert_eq!(options.frame_limits.max_payload_len, 4096);
        assert_eq!(options.max_audio_backlog, config.max_audio_backlog_bytes);
        assert_eq!(options.frame_limits.max_header_len, config.max_header_bytes);
        assert_eq!(
            options.command.env.get("PYTHONIOENCODING").map(String::as_str),
            Some("utf-8")
        );
    }

    #[tokio::test]
    async fn shutdown_without_process() {
        let engine = Engine {
            options: EngineOptions::new(EngineCommand::new("unused")),
            running: Mutex::new(None),
        };
        assert_eq!(engine.state(), EngineState::Offline);
        assert_eq!(engine.shutdown().await, ShutdownOutcome::NotRunning);
        assert!(matches!(engine.create_session(), Err(EngineError::NotRunning)));
    }
}
