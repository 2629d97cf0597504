use http::StatusCode;
use thiserror::Error;

/// Rejections raised while resolving a test configuration, before any stream starts.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Invalid server URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Unsupported URL scheme {0:?}, only plain http is supported")]
    UnsupportedScheme(String),

    #[error("{name} must be a finite, non-negative number of seconds (got {value})")]
    NegativeDuration { name: &'static str, value: f64 },

    #[error("{name} of {value}s is too large to schedule")]
    DurationOutOfRange { name: &'static str, value: f64 },

    #[error("Grace time ({grace_time}s) must be shorter than the test duration ({test_duration}s)")]
    GraceExceedsDuration { grace_time: f64, test_duration: f64 },

    #[error("Overhead compensation factor must be finite and positive (got {0})")]
    InvalidOverhead(f64),

    #[error("ckSize must be at least 1")]
    ZeroChunkSize,
}

/// Why a single request attempt ended without completing.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("server answered {0}")]
    Status(StatusCode),

    #[error("received an empty or late chunk")]
    ChunkRejected,

    #[error("request cancelled")]
    Cancelled,
}

impl FetchError {
    /// Cancelled attempts are normal shutdown, everything else is retried after a backoff.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<hyper_util::client::legacy::Error> for FetchError {
    fn from(e: hyper_util::client::legacy::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

impl From<hyper::Error> for FetchError {
    fn from(e: hyper::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

impl From<http::Error> for FetchError {
    fn from(e: http::Error) -> Self {
        Self::Transport(e.to_string())
    }
}
