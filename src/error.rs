use std::path::PathBuf;

use thiserror::Error;

/// Failure of a single track's matching attempt.
///
/// Everything except [`MatchError::Cache`] is local to the track: the caller
/// logs it, treats the track as unmatched and moves on to the next one.
#[derive(Debug, Error)]
pub enum MatchError {
    #[error("remote matcher answered {status} for track '{track}': {body}")]
    RemoteStatus {
        track: String,
        status: u16,
        body: String,
    },
    #[error("request for track '{track}' failed: {message}")]
    Transport { track: String, message: String },
    #[error("failed to encode match request for track '{track}': {source}")]
    Request {
        track: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("malformed matcher response for track '{track}': {source}")]
    MalformedResponse {
        track: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("point pre-fitting failed for track '{track}': {message}")]
    Prefit { track: String, message: String },
    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl MatchError {
    /// Cache failures are shared by all tracks and abort the whole batch.
    pub fn is_fatal(&self) -> bool {
        matches!(self, MatchError::Cache(_))
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache file {path:?} is not a valid JSON object: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("cache file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize cache contents: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum TrackError {
    #[error("track '{name}' has {points} points but {timestamps} timestamps")]
    LengthMismatch {
        name: String,
        points: usize,
        timestamps: usize,
    },
    #[error("failed to parse GPX file {path:?}: {message}")]
    Gpx { path: PathBuf, message: String },
    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
