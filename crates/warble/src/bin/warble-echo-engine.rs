//! warble-echo-engine - a reference engine for the warble stdio protocol
//!
//! Reads `text`/`end` control lines on stdin and answers each ended session
//! with `start`, a run of `audio` frames and `done` on stdout. Every byte of
//! the submitted text becomes one 16-bit sample (`byte * 64`), so callers can
//! predict the exact PCM they should receive.
//!
//! Flags bend the behaviour to exercise host error paths:
//! - `--fail` answers every session with an `error` frame
//! - `--skip-seq` numbers audio frames 0, 2, 4, ...
//! - `--exit-mid-stream` exits after the first audio frame
//! - `--garbage` writes corrupt units before each session's frames
//! - `--ignore-eof` keeps running after stdin closes
//! - `--chunk-size N` splits every stdout write into N-byte pieces

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdout};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use warbleproto::{encode_frame, parse_control_line, AudioFormat, ControlEvent, FrameHeader};

/// Exit code used by `--exit-mid-stream`.
const MID_STREAM_EXIT: i32 = 3;

#[derive(Parser, Debug)]
#[command(name = "warble-echo-engine")]
#[command(about = "Reference engine speaking the warble stdio protocol")]
#[command(version)]
struct Args {
    /// Answer every session with an error frame
    #[arg(long)]
    fail: bool,

    /// Skip every other audio sequence number
    #[arg(long)]
    skip_seq: bool,

    /// Exit after writing the first audio frame
    #[arg(long)]
    exit_mid_stream: bool,

    /// Write corrupt units before each session's frames
    #[arg(long)]
    garbage: bool,

    /// Keep running after stdin reaches EOF
    #[arg(long)]
    ignore_eof: bool,

    /// Split stdout writes into pieces of this many bytes (0 = unsplit)
    #[arg(long, default_value = "0")]
    chunk_size: usize,

    /// Sample rate announced in start frames
    #[arg(long, default_value = "24000")]
    sample_rate: u32,

    /// Samples per audio frame
    #[arg(long, default_value = "4")]
    frame_samples: usize,

    /// Pause between audio frames, in milliseconds
    #[arg(long, default_value = "0")]
    frame_delay_ms: u64,
}

struct Output {
    stdout: Stdout,
    chunk_size: usize,
}

impl Output {
    async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        if self.chunk_size == 0 {
            self.stdout.write_all(bytes).await?;
        } else {
            for piece in bytes.chunks(self.chunk_size) {
                self.stdout.write_all(piece).await?;
                self.stdout.flush().await?;
            }
        }
        self.stdout.flush().await?;
        Ok(())
    }

    async fn frame(&mut self, header: &FrameHeader, payload: &[u8]) -> Result<()> {
        let frame = encode_frame(header, payload)?;
        self.write(&frame).await
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    info!("echo engine ready {:?}", args);

    let mut output = Output {
        stdout: tokio::io::stdout(),
        chunk_size: args.chunk_size,
    };
    let mut texts: HashMap<String, String> = HashMap::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        if line.trim().is_empty() {
            continue;
        }
        match parse_control_line(line.as_bytes()) {
            Ok(ControlEvent::Text { session_id, text }) => {
                debug!("text for {}: {} bytes", session_id, text.len());
                texts.entry(session_id).or_default().push_str(&text);
            }
            Ok(ControlEvent::End { session_id }) => {
                let text = texts.remove(&session_id).unwrap_or_default();
                synthesize(&args, &mut output, &session_id, &text).await?;
            }
            Err(e) => warn!("ignoring control line: {}", e),
        }
    }

    if args.ignore_eof {
        info!("stdin closed, staying up as asked");
        std::future::pending::<()>().await;
    }
    info!("stdin closed, exiting");
    Ok(())
}

async fn synthesize(args: &Args, output: &mut Output, session_id: &str, text: &str) -> Result<()> {
    if args.garbage {
        let junk = b"{]";
        let mut unit = (junk.len() as u32).to_be_bytes().to_vec();
        unit.extend_from_slice(junk);
        unit.extend_from_slice(&u32::MAX.to_be_bytes());
        output.write(&unit).await?;
    }

    if args.fail || text.is_empty() {
        let (message, code) = if args.fail {
            ("synthesis failed", "ECHO_FAIL")
        } else {
            ("no text received", "EMPTY_TEXT")
        };
        return output
            .frame(&FrameHeader::error(session_id, message, Some(code.to_string())), &[])
            .await;
    }

    let format = AudioFormat {
        format: "pcm_s16le".to_string(),
        sample_rate: args.sample_rate,
        channels: 1,
    };
    output.frame(&FrameHeader::start(session_id, &format), &[]).await?;

    let pcm: Vec<u8> = text
        .bytes()
        .flat_map(|b| (i16::from(b) * 64).to_le_bytes())
        .collect();
    let step = if args.skip_seq { 2 } else { 1 };

    for (index, payload) in pcm.chunks(args.frame_samples.max(1) * 2).enumerate() {
        let seq = index as u64 * step;
        output
            .frame(&FrameHeader::audio(session_id, seq, payload.len()), payload)
            .await?;

        if args.exit_mid_stream {
            warn!("exiting mid-stream as asked");
            std::process::exit(MID_STREAM_EXIT);
        }
        if args.frame_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(args.frame_delay_ms)).await;
        }
    }

    output.frame(&FrameHeader::done(session_id), &[]).await?;
    info!("{}: {} bytes of audio", session_id, pcm.len());
    Ok(())
}
