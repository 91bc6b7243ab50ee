//! warble - speak text through a supervised synthesis engine
//!
//! Subcommands:
//! - `warble speak <text>` - Synthesize text into a WAV artifact
//! - `warble config` - Print the resolved configuration

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use warble::{write_wav, ArtifactSummary, Engine, EngineOptions, SpeakRequest};
use warbleconf::WarbleConfig;

#[derive(Parser)]
#[command(name = "warble")]
#[command(about = "Streaming speech synthesis through an external engine")]
#[command(version)]
struct Cli {
    /// Config file to use instead of ./warble.toml
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Synthesize text and write it to a WAV file
    Speak {
        /// Text to speak, or a JSON object like {"text": "..."}
        text: String,

        /// Directory for the WAV file (default: output.artifact_dir)
        #[arg(short, long)]
        out_dir: Option<PathBuf>,

        /// Print the artifact summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the resolved configuration
    Config {
        /// Also list which files and env vars contributed
        #[arg(long)]
        sources: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (config, sources) = WarbleConfig::load_with_sources_from(cli.config.as_deref())
        .context("Failed to load configuration")?;

    warble::telemetry::init(&config.telemetry.log_level)?;

    match cli.command {
        Commands::Speak {
            text,
            out_dir,
            json,
        } => speak(&config, parse_request(text), out_dir, json).await,
        Commands::Config { sources: show } => {
            if show {
                for file in &sources.files {
                    println!("# file: {}", file.display());
                }
                for var in &sources.env_overrides {
                    println!("# env: {}", var);
                }
            }
            print!("{}", config.to_toml());
            Ok(())
        }
    }
}

/// A JSON object with a `text` field is taken as a request; anything else is plain text.
fn parse_request(text: String) -> SpeakRequest {
    if text.trim_start().starts_with('{') {
        if let Ok(request) = serde_json::from_str::<SpeakRequest>(&text) {
            return request;
        }
    }
    SpeakRequest::from(text)
}

async fn speak(
    config: &WarbleConfig,
    request: SpeakRequest,
    out_dir: Option<PathBuf>,
    json: bool,
) -> Result<()> {
    let out_dir = out_dir.unwrap_or_else(|| config.output.artifact_dir.clone());

    let engine = Engine::start(EngineOptions::from(&config.engine))
        .context("Failed to start engine")?;
    tracing::info!("engine {} is {}", engine.pid().unwrap_or_default(), engine.state());

    let result: Result<ArtifactSummary> = async {
        let mut session = engine.send(request).await.context("Failed to submit text")?;
        write_wav(&mut session, &out_dir)
            .await
            .context("Synthesis failed")
    }
    .await;

    let outcome = engine.shutdown().await;
    tracing::debug!("engine shutdown: {:?}", outcome);

    let summary = result?;
    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!(
            "{} ({} ms, {} Hz, {} ch)",
            summary.path.display(),
            summary.duration_ms,
            summary.sample_rate,
            summary.channels
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_requests_are_unwrapped() {
        assert_eq!(parse_request(r#"{"text":"hi"}"#.to_string()).text, "hi");
        assert_eq!(parse_request("{not json".to_string()).text, "{not json");
        assert_eq!(parse_request("plain".to_string()).text, "plain");
    }
}
