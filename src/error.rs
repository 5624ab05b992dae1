//! Error types for the radio engine.
//!
//! Configuration and channel-mix errors are fatal at the call site, per
//! spec.md's error handling design: they are returned, never logged and
//! swallowed. Reload/metadata/decode failures are handled closer to where
//! they happen and never reach these types.

use std::path::PathBuf;

/// Errors raised while loading or validating a station definition file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown key '{key}' in definition file {file}")]
    UnknownKey { key: String, file: PathBuf },

    #[error("missing required field '{field}' for music entry in {file}")]
    MissingMusicField { field: String, file: PathBuf },

    #[error("invalid timestamp '{value}' in {file}")]
    BadTimestamp { value: String, file: PathBuf },

    #[error("intro '{path}' in {file} matches no music entry (or is ambiguous)")]
    UnmatchedIntro { path: String, file: PathBuf },

    #[error("include cycle detected: {0} includes itself (directly or transitively)")]
    IncludeCycle(PathBuf),

    #[error("unknown output type '{0}'")]
    UnknownOutputType(String),

    #[error("failed to parse YAML in {file}: {source}")]
    Yaml {
        file: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("could not read {file}: {source}")]
    Io {
        file: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Raised when no channel-mix is defined between two channel counts.
#[derive(Debug, thiserror::Error)]
#[error("cannot mix {from} channel{} to {to} channel{}", if *from == 1 { "" } else { "s" }, if *to == 1 { "" } else { "s" })]
pub struct ChannelMixError {
    pub from: usize,
    pub to: usize,
}

/// Errors raised while opening or writing to an output sink.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to open output device: {0}")]
    Device(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("failed to spawn ffmpeg: {0}")]
    Spawn(std::io::Error),
}

/// Top-level error type returned from the CLI entry points.
#[derive(Debug, thiserror::Error)]
pub enum RadioError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    ChannelMix(#[from] ChannelMixError),

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("failed to decode audio file {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}
