// Error handling for the NVT live vehicle service
use thiserror::Error;

/// Every failure the ingestion core can report.
///
/// Upstream variants carry the source *name* only; source URLs embed API
/// keys and must stay out of logs.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NVTError {
    #[error("Upstream {upstream} unreachable{}: {message}", status_suffix(.status))]
    UpstreamUnreachable {
        upstream: String,
        status: Option<u16>,
        message: String,
    },

    #[error("Real-time feed unavailable, all sources failed: {}", .attempts.join("; "))]
    FeedUnavailable { attempts: Vec<String> },

    #[error("Static dataset unavailable, all sources failed: {}", .attempts.join("; "))]
    StaticDatasetUnavailable { attempts: Vec<String> },

    #[error("Failed to decode feed from {upstream}: {message}")]
    DecodeError { upstream: String, message: String },

    #[error("{resource} not found in static archive")]
    MissingResource { resource: String },

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

fn status_suffix(status: &Option<u16>) -> String {
    match status {
        Some(code) => format!(" (HTTP {})", code),
        None => String::new(),
    }
}

impl NVTError {
    /// One-line summary used when collecting fallback attempts.
    pub fn attempt_summary(&self) -> String {
        match self {
            NVTError::UpstreamUnreachable { upstream, status: Some(code), .. } => {
                format!("{}: HTTP {}", upstream, code)
            }
            NVTError::UpstreamUnreachable { upstream, message, .. } => {
                format!("{}: {}", upstream, message)
            }
            NVTError::DecodeError { upstream, message } => {
                format!("{}: undecodable payload ({})", upstream, message)
            }
            other => other.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, NVTError>;
