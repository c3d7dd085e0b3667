// =============================================================================
// error.rs — Engine error taxonomy
// =============================================================================

use std::path::PathBuf;

use thiserror::Error;

/// Every failure the core can report. Nothing here is printed by the crate;
/// the orchestration layer decides how to render it.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed header, directory or tensor structure. Load-time only.
    #[error("format error: {0}")]
    Format(String),

    /// The model file could not be opened or mapped.
    #[error("i/o error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Out-of-range layer / row / position / code access.
    #[error("index out of range: {what} {index} >= {len}")]
    Index {
        what: &'static str,
        index: usize,
        len: usize,
    },

    /// Accelerator unavailable or pipeline build failure.
    #[error("device error: {0}")]
    Device(String),

    /// Internal numeric invariant broken (bad scale, NaN/Inf, empty softmax).
    #[error("numeric error: {0}")]
    Numeric(String),

    #[error("shape mismatch for {what}: expected {expected}, got {got}")]
    Shape {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    /// The KV-Cache hard ceiling was reached; positions never wrap.
    #[error("context full: all {capacity} cache positions are in use")]
    ContextFull { capacity: usize },

    #[error("session is closed")]
    SessionClosed,

    #[error("generation cancelled")]
    Cancelled,

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl EngineError {
    pub(crate) fn index(what: &'static str, index: usize, len: usize) -> Self {
        Self::Index { what, index, len }
    }

    pub(crate) fn shape(what: &'static str, expected: usize, got: usize) -> Self {
        Self::Shape {
            what,
            expected,
            got,
        }
    }

    /// Errors after which the same session (or a CPU fallback) can carry on.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Device(_) | Self::ContextFull { .. } | Self::Cancelled
        )
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
