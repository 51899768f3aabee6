//! Error types for the poemscribe library.
//!
//! Two distinct error types reflect two distinct layers:
//!
//! * [`PoemError`] — the caller-facing taxonomy. Every variant is recoverable:
//!   the process never crashes over one of these, and each variant tells the
//!   front end whether the session's uploaded images survived
//!   ([`PoemError::images_preserved`]) so the user is never left guessing.
//!
//! * [`ModelError`] — transport-level failure of a single language-model call
//!   (HTTP status, timeout, unparseable output). Always wrapped into
//!   [`PoemError::ExtractionFailure`] together with the pipeline stage that
//!   was running, so logs and user messages can say *which* step died.

use std::path::PathBuf;

use thiserror::Error;

use crate::artifact::PipelineStage;
use crate::session::SessionState;

/// All errors surfaced by the poemscribe library.
#[derive(Debug, Error)]
pub enum PoemError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// The uploaded bytes are not one of the accepted raster formats.
    #[error(
        "Unsupported image format ({detail}).\nSend the page as JPEG, PNG or WebP."
    )]
    UnsupportedFormat { detail: String },

    /// The session batch is already at the configured maximum.
    #[error(
        "This session already holds {limit} pages, the configured maximum.\n\
         Finalize it or reset it before sending more images."
    )]
    CapacityExceeded { limit: usize },

    // ── Session errors ────────────────────────────────────────────────────
    /// Finalize was triggered before any image arrived.
    #[error("Nothing to process: no page images have been added to this session.")]
    EmptySession,

    /// The operation is illegal in the session's current state.
    #[error("Cannot {operation} while the session is {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    /// The caller's session handle no longer matches the live session.
    #[error("Session '{request}' is gone (reset or replaced); start again")]
    StaleSession { request: String },

    // ── Pipeline errors ───────────────────────────────────────────────────
    /// A language-model call failed (network, timeout, bad output).
    #[error("Extraction failed during {stage}: {source}\nYour images are preserved; trigger finalize again.")]
    ExtractionFailure {
        stage: PipelineStage,
        #[source]
        source: ModelError,
    },

    /// The validation loop never reached a structurally valid document.
    #[error(
        "Validation did not converge after {attempts} repair attempt(s).\n\
         Last issues: {}\nYour images are preserved; retry or reset.",
        format_issues(.issues)
    )]
    ValidationExhausted {
        attempts: u32,
        issues: Vec<String>,
    },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Spooling an image to session storage failed.
    #[error("Failed to store page image: {source}")]
    Storage {
        #[source]
        source: std::io::Error,
    },

    /// Reading or writing the saved-poem collection failed.
    #[error("Failed to access poem collection '{path}': {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PoemError {
    /// Whether the session's uploaded images are still in place after this
    /// error. Front ends use this to choose between "try finalizing again"
    /// and "re-send your images" wording.
    pub fn images_preserved(&self) -> bool {
        match self {
            // Rejected synchronously, session untouched.
            PoemError::UnsupportedFormat { .. }
            | PoemError::CapacityExceeded { .. }
            | PoemError::EmptySession
            | PoemError::InvalidState { .. } => true,
            // The orchestrator aborts back to ACCUMULATING on these.
            PoemError::ExtractionFailure { .. } | PoemError::ValidationExhausted { .. } => true,
            // The handle points at nothing; there is nothing left to preserve.
            PoemError::StaleSession { .. } => false,
            PoemError::Storage { .. } | PoemError::Persistence { .. } => true,
            PoemError::InvalidConfig(_) | PoemError::Internal(_) => true,
        }
    }
}

fn format_issues(issues: &[String]) -> String {
    if issues.is_empty() {
        "(none reported)".to_string()
    } else {
        issues.join("; ")
    }
}

/// Transport-level failure of a single model call.
///
/// Produced by [`crate::pipeline::client::ChatModel`] implementations and by
/// the capability wrappers when the model's text output cannot be parsed.
#[derive(Debug, Error)]
pub enum ModelError {
    /// The endpoint returned a non-success HTTP status.
    #[error("model endpoint returned HTTP {status}: {body}")]
    ApiStatus { status: u16, body: String },

    /// The call exceeded the configured per-request timeout.
    #[error("model call timed out after {secs}s")]
    Timeout { secs: u64 },

    /// Connection-level failure (DNS, refused, TLS).
    #[error("could not reach model endpoint at {endpoint}: {detail}")]
    Unreachable { endpoint: String, detail: String },

    /// Any other reqwest-level failure.
    #[error("model request failed: {0}")]
    Network(String),

    /// The response body did not have the expected shape.
    #[error("model returned output that could not be parsed: {detail}")]
    Malformed { detail: String },
}
