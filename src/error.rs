use std::fmt;

use thiserror::Error;

/// Where a failed lookup looked.
///
/// A miss inside a loaded subset is reported as `LoadedSubset` so callers can
/// tell "filtered out" apart from "not in the corpus at all".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupScope {
    Corpus,
    LoadedSubset,
}

impl fmt::Display for LookupScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LookupScope::Corpus => f.write_str("corpus"),
            LookupScope::LoadedSubset => f.write_str("loaded subset"),
        }
    }
}

/// Typed error hierarchy for the corpus reader.
#[derive(Debug, Error)]
pub enum SporcError {
    #[error("Not found in {scope}: {what}")]
    NotFound { what: String, scope: LookupScope },

    #[error("Size unknown: streaming source has no known record total")]
    SizeUnknown,

    #[error("Invalid window parameters: {0}")]
    InvalidWindowParameters(String),

    #[error("Offset index unavailable for {0}: source is not a local seekable file")]
    IndexUnavailable(String),

    #[error("Turns not loaded for episode {0}")]
    TurnsNotLoaded(String),

    #[error("Malformed record at {location}: {reason}")]
    MalformedRecord { location: String, reason: String },

    #[error("`{operation}` is not available in {mode} mode")]
    ModeMismatch {
        operation: &'static str,
        mode: &'static str,
    },

    #[error("A subset is already loaded; selective mode cannot be re-scoped")]
    SubsetAlreadyLoaded,

    #[error("Stale turn index: {0}")]
    StaleIndex(String),

    #[error("Turn index build failed: {0}")]
    IndexBuild(String),

    #[error("Dataset access error: {0}")]
    DatasetAccess(String),

    #[error("Turn text index not built at {}", .0.display())]
    TextIndexMissing(std::path::PathBuf),

    #[error("Invalid text query: {0}")]
    InvalidQuery(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Database(#[from] rusqlite::Error),

    #[error(transparent)]
    Remote(#[from] reqwest::Error),
}

impl SporcError {
    pub fn not_found(what: impl Into<String>, scope: LookupScope) -> Self {
        SporcError::NotFound {
            what: what.into(),
            scope,
        }
    }

    pub fn malformed(location: impl Into<String>, reason: impl Into<String>) -> Self {
        SporcError::MalformedRecord {
            location: location.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T, E = SporcError> = std::result::Result<T, E>;
