//! Error taxonomy shared by the pipeline stages.
//!
//! Only `ValidationError` is meant to reach callers as a hard error. Provider
//! and persistence failures are absorbed by the stage that sees them (fail
//! closed, textual narration, log and continue).

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Malformed input: a programming or integration bug, never environmental.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("embedding length mismatch: {left} vs {right}")]
    LengthMismatch { left: usize, right: usize },

    #[error("embedding has zero norm")]
    ZeroNorm,

    #[error("cannot average an empty set of embeddings")]
    NoEmbeddings,

    #[error("clock went backwards: {now} is before previous update {previous}")]
    ClockWentBackwards {
        now: DateTime<Utc>,
        previous: DateTime<Utc>,
    },

    #[error("score {score} for class '{class}' is outside [0, 1]")]
    InvalidScore { class: String, score: f32 },

    #[error("detection with empty class name")]
    EmptyClass,
}

/// An external collaborator (detector, embedder, narrator) failed.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{provider} request failed: {source}")]
    Http {
        provider: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{provider} HTTP {status}: {body}")]
    Status {
        provider: &'static str,
        status: u16,
        body: String,
    },

    #[error("unexpected {provider} response: {detail}")]
    Malformed {
        provider: &'static str,
        detail: String,
    },

    #[error("no {0} provider available")]
    Unavailable(&'static str),

    #[error("{provider} input error: {detail}")]
    Input {
        provider: &'static str,
        detail: String,
    },
}

/// The scene store could not be read or written.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("scene store request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("scene store HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("scene record {0} not found")]
    NotFound(i64),

    #[error("scene store lock poisoned")]
    Poisoned,
}

/// Errors surfaced by `DetectionPipeline::process_frame`.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("detector failed: {0}")]
    Detector(#[source] ProviderError),
}

/// Shorten a response body before it lands in an error or a log line.
pub(crate) fn truncate_body(body: &str) -> String {
    body.chars().take(300).collect()
}
