//! Audio transcoder
//!
//! Transcodes the best audio stream of an input file or URL into an output
//! file whose container is picked from the output extension.
//!
//! Usage: `audio-transcoder <input> <output> [config.toml]`

use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use audio_transcoder::{
    transcode_file, InterruptToken, LoggingConfig, Result, TracingObserver, TranscodeConfig,
};

/// Application version
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
const APP_NAME: &str = "audio-transcoder";

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        eprintln!("usage: {} <input> <output> [config.toml]", APP_NAME);
        std::process::exit(2);
    }

    let (config, config_error) = load_config(args.get(3).map(String::as_str));
    init_logging(&config.logging);
    if let Some(e) = config_error {
        tracing::warn!("{}. Using defaults.", e);
    }

    if let Err(e) = run(&args[1], &args[2], &config) {
        tracing::error!(error = %e, class = ?e.class(), "Transcode failed");
        std::process::exit(1);
    }
}

fn run(input: &str, output: &str, config: &TranscodeConfig) -> Result<()> {
    tracing::info!("{} v{} starting", APP_NAME, VERSION);
    tracing::info!("FFmpeg version: {}", audio_transcoder::ffmpeg_version_info());

    audio_transcoder::init()?;
    audio_transcoder::install_log_filter();

    let summary = transcode_file(
        input,
        output,
        config,
        InterruptToken::new(),
        Arc::new(TracingObserver),
    )?;

    tracing::info!(
        input,
        output,
        decoder = summary.decoder,
        input_format = ?summary.input_format.map(|f| f.to_string()),
        output_format = ?summary.output_format.map(|f| f.to_string()),
        packets = summary.packets_read,
        frames = summary.frames_decoded,
        malformed = summary.malformed_packets,
        format_changes = summary.format_changes,
        encoded_frames = summary.writer.encoder_frames,
        packets_written = summary.writer.packets_written,
        elapsed_ms = summary.elapsed.as_millis() as u64,
        "Transcode finished"
    );
    Ok(())
}

/// Load the configuration file, falling back to defaults. Logging is not up
/// yet, so a load error is handed back to be reported later.
fn load_config(path: Option<&str>) -> (TranscodeConfig, Option<String>) {
    let Some(path) = path else {
        return (TranscodeConfig::default(), None);
    };
    if !std::path::Path::new(path).exists() {
        return (
            TranscodeConfig::default(),
            Some(format!("Config file {} not found", path)),
        );
    }
    match TranscodeConfig::from_file(path) {
        Ok(config) => (config, None),
        Err(e) => (
            TranscodeConfig::default(),
            Some(format!("Failed to load config file {}: {}", path, e)),
        ),
    }
}

/// Initialize logging with tracing
fn init_logging(config: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("audio_transcoder={},ffmpeg=warn", config.level).into());

    if config.format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_missing_config_falls_back() {
        let (config, error) = load_config(Some("/nonexistent/transcoder.toml"));
        assert!(error.is_some());
        assert_eq!(config.playback.sample_rate, 44100);

        let (_, error) = load_config(None);
        assert!(error.is_none());
    }

    #[test]
    fn test_invalid_config_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "reader = 5").unwrap();
        let (config, error) = load_config(path.to_str());
        assert!(error.unwrap().contains("Failed to load"));
        assert_eq!(config.reader.max_buffered_bytes, 4 * 1024 * 1024);
    }
}
