//! Engine error types

use std::path::PathBuf;

use thiserror::Error;

use crate::audio::AudioError;

/// Errors produced while parsing or validating a mix document
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MixError {
    #[error("json empty!")]
    EmptyJson,

    #[error("invalid mix json: {0}")]
    Json(String),

    #[error("id cannot be empty")]
    EmptyId,

    #[error("Duplicate id found: {0}")]
    DuplicateId(String),

    /// A time field that must be non-negative was negative
    #[error("`{field}` < 0 (track {id})")]
    Negative { id: String, field: &'static str },
}

/// Errors opening or reading a track source
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("unable to read path: {path:?}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unsupported audio format {path:?}: {reason}")]
    Unsupported { path: PathBuf, reason: String },

    #[error("no audio track found in {0:?}")]
    NoAudioTrack(PathBuf),

    #[error("resampling failed: {0}")]
    Resample(String),
}

/// Errors creating or writing an output file
#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("unsupported file extension: {0:?}")]
    UnsupportedExtension(PathBuf),

    #[error("failed to create {path:?}: {reason}")]
    Create { path: PathBuf, reason: String },

    #[error("Failed to write file: {0}")]
    Write(String),
}

/// Errors returned by engine operations
#[derive(Error, Debug)]
pub enum EngineError {
    /// Operation rejected because an export is running
    #[error("{0} is not supported while exporting")]
    Exporting(&'static str),

    #[error("Export not supported while playing/recording")]
    Busy,

    #[error("Duration is 0")]
    EmptyMix,

    #[error("stop recorder first")]
    RecorderActive,

    #[error("prepare not called")]
    RecorderNotPrepared,

    #[error("deviceSampleRate is 0")]
    NoDevice,

    #[error("engine has been disposed")]
    Disposed,

    #[error("failed to start worker threads: {0}")]
    Spawn(String),

    #[error(transparent)]
    Mix(#[from] MixError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Audio(#[from] AudioError),
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
