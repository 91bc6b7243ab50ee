//! WAV artifacts from finished sessions.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use futures::StreamExt;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};
use warbleproto::AudioFormat;

use crate::error::EngineError;
use crate::session::{AudioStream, Session};

/// Codec names accepted as 16-bit little-endian PCM.
const PCM_FORMATS: &[&str] = &["pcm_s16le", "s16le", "pcm"];

const BYTES_PER_SAMPLE: u64 = 2;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("unsupported audio format '{0}', expected 16-bit PCM")]
    UnsupportedFormat(String),

    #[error("invalid audio format: {0}")]
    InvalidFormat(String),

    #[error("artifact I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WAV encoding failed: {0}")]
    Wav(#[from] hound::Error),

    #[error("audio stream ended in the middle of a sample")]
    DanglingByte,
}

/// What was written, suitable for `--json` output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactSummary {
    pub id: String,
    pub session_id: String,
    pub path: PathBuf,
    pub format: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub data_bytes: u64,
    pub duration_ms: u64,
}

fn artifact_id() -> String {
    format!("tts_{}", uuid::Uuid::new_v4().simple())
}

fn wav_spec(format: &AudioFormat) -> Result<hound::WavSpec, ArtifactError> {
    if !PCM_FORMATS.contains(&format.format.as_str()) {
        return Err(ArtifactError::UnsupportedFormat(format.format.clone()));
    }
    if format.sample_rate == 0 {
        return Err(ArtifactError::InvalidFormat("sample_rate must be at least 1".into()));
    }
    if format.channels == 0 {
        return Err(ArtifactError::InvalidFormat("channels must be at least 1".into()));
    }
    Ok(hound::WavSpec {
        channels: format.channels,
        sample_rate: format.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    })
}

fn duration_ms(data_bytes: u64, format: &AudioFormat) -> u64 {
    let frames = data_bytes / (BYTES_PER_SAMPLE * u64::from(format.channels));
    frames * 1000 / u64::from(format.sample_rate)
}

/// Stream a session's audio into `<dir>/<id>.wav`.
///
/// The session must still own its audio stream. On any failure the partial
/// file is removed.
pub async fn write_wav(session: &mut Session, dir: &Path) -> Result<ArtifactSummary, ArtifactError> {
    let format = session.metadata().await?;
    let spec = wav_spec(&format)?;
    let mut stream = session.take_audio()?;

    std::fs::create_dir_all(dir)?;
    let id = artifact_id();
    let path = dir.join(format!("{}.wav", id));
    let writer = hound::WavWriter::create(&path, spec)?;

    let data_bytes = match copy_samples(&mut stream, writer).await {
        Ok(bytes) => bytes,
        Err(e) => {
            if let Err(rm) = std::fs::remove_file(&path) {
                warn!("failed to remove partial artifact {}: {}", path.display(), rm);
            }
            return Err(e);
        }
    };

    let summary = ArtifactSummary {
        id,
        session_id: session.id().to_string(),
        path,
        format: format.format.clone(),
        sample_rate: format.sample_rate,
        channels: format.channels,
        data_bytes,
        duration_ms: duration_ms(data_bytes, &format),
    };
    info!(
        "artifact {} written: {} bytes, {} ms",
        summary.id, summary.data_bytes, summary.duration_ms
    );
    Ok(summary)
}

async fn copy_samples(
    stream: &mut AudioStream,
    mut writer: hound::WavWriter<BufWriter<File>>,
) -> Result<u64, ArtifactError> {
    let mut data_bytes = 0u64;
    let mut carry: Option<u8> = None;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        data_bytes += chunk.len() as u64;
        write_samples(&mut writer, &mut carry, &chunk)?;
    }
    if carry.is_some() {
        return Err(ArtifactError::DanglingByte);
    }
    writer.finalize()?;
    Ok(data_bytes)
}

/// Write little-endian samples, holding back a trailing odd byte for the next chunk.
fn write_samples(
    writer: &mut hound::WavWriter<BufWriter<File>>,
    carry: &mut Option<u8>,
    chunk: &[u8],
) -> Result<(), ArtifactError> {
    let mut rest = chunk;
    if let Some(low) = carry.take() {
        match rest.split_first() {
            Some((&high, tail)) => {
                writer.write_sample(i16::from_le_bytes([low, high]))?;
                rest = tail;
            }
            None => {
                *carry = Some(low);
                return Ok(());
            }
        }
    }

    let mut pairs = rest.chunks_exact(2);
    for pair in &mut pairs {
        writer.write_sample(i16::from_le_bytes([pair[0], pair[1]]))?;
    }
    if let [odd] = pairs.remainder() {
        *carry = Some(*odd);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SessionRegistry;
    use crate::session::ControlSink;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::Arc;
    use warbleproto::Frame;

    struct NullSink;

    #[async_trait]
    impl ControlSink for NullSink {
        async fn write_line(&self, _line: Bytes) -> Result<(), EngineError> {
            Ok(())
        }
    }

    fn format(name: &str, sample_rate: u32, channels: u16) -> AudioFormat {
        AudioFormat {
            format: name.to_string(),
            sample_rate,
            channels,
        }
    }

    /// Run a complete exchange through a registry and return the session.
    async fn finished_session(format: AudioFormat, chunks: &[&'static [u8]]) -> Session {
        let registry = SessionRegistry::new();
        let mut session = registry.create_session(Arc::new(NullSink)).unwrap();
        session.send_text("hi").await.unwrap();
        session.end().await.unwrap();

        let id = session.id().to_string();
        registry.dispatch(Frame::Start {
            session_id: id.clone(),
            format,
        });
        for (seq, chunk) in chunks.iter().enumerate() {
            registry.dispatch(Frame::Audio {
                session_id: id.clone(),
                seq: seq as u64,
                payload_bytes: chunk.len(),
                payload: Bytes::from_static(chunk),
            });
        }
        registry.dispatch(Frame::Done { session_id: id });
        session
    }

    fn wav_files(dir: &Path) -> Vec<PathBuf> {
        std::fs::read_dir(dir)
            .map(|entries| entries.map(|e| e.unwrap().path()).collect())
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn writes_samples_across_odd_chunk_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        // 1, -2, 300 split so that two samples straddle chunk edges
        let mut session = finished_session(
            format("pcm_s16le", 8000, 1),
            &[&[0x01], &[0x00, 0xfe, 0xff, 0x2c], &[0x01]],
        )
        .await;

        let summary = write_wav(&mut session, dir.path()).await.unwrap();
        assert_eq!(summary.data_bytes, 6);
        assert_eq!(summary.sample_rate, 8000);
        assert!(summary.id.starts_with("tts_"));
        assert_eq!(summary.path, dir.path().join(format!("{}.wav", summary.id)));

        let mut reader = hound::WavReader::open(&summary.path).unwrap();
        assert_eq!(reader.spec().bits_per_sample, 16);
        let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(samples, vec![1, -2, 300]);
    }

    #[tokio::test]
    async fn duration_counts_frames_not_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let stereo_second = vec![0u8; 2 * 2 * 100];
        let chunk: &'static [u8] = Box::leak(stereo_second.into_boxed_slice());
        let mut session = finished_session(format("s16le", 100, 2), &[chunk]).await;

        let summary = write_wav(&mut session, dir.path()).await.unwrap();
        assert_eq!(summary.duration_ms, 1000);
        assert_eq!(summary.channels, 2);
    }

    #[tokio::test]
    async fn rejects_non_pcm_formats() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = finished_session(format("mp3", 24_000, 1), &[&[0, 0]]).await;

        let err = write_wav(&mut session, dir.path()).await.unwrap_err();
        assert!(matches!(err, ArtifactError::UnsupportedFormat(ref f) if f == "mp3"));
        assert!(wav_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn rejects_zero_sample_rate() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = finished_session(format("pcm", 0, 1), &[]).await;

        let err = write_wav(&mut session, dir.path()).await.unwrap_err();
        assert!(matches!(err, ArtifactError::InvalidFormat(_)));
    }

    #[tokio::test]
    async fn dangling_byte_removes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = finished_session(format("pcm_s16le", 8000, 1), &[&[1, 0, 2]]).await;

        let err = write_wav(&mut session, dir.path()).await.unwrap_err();
        assert!(matches!(err, ArtifactError::DanglingByte));
        assert!(wav_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn engine_error_is_passed_through() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new();
        let mut session = registry.create_session(Arc::new(NullSink)).unwrap();
        session.send_text("hi").await.unwrap();
        session.end().await.unwrap();
        registry.dispatch(Frame::Error {
            session_id: session.id().to_string(),
            message: "model not loaded".to_string(),
            code: None,
        });

        let err = write_wav(&mut session, dir.path()).await.unwrap_err();
        assert!(matches!(
            err,
            ArtifactError::Engine(EngineError::Engine { ref message, .. }) if message == "model not loaded"
        ));
        assert!(wav_files(dir.path()).is_empty());
    }
}
