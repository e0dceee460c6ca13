use thiserror::Error;
use tokio::sync::AcquireError;

#[derive(Debug, Clone, Error)]
pub enum StreamwatchError {
    #[error("transient fetch error: {0}")]
    TransientFetch(String),

    #[error("streamer not found")]
    NotFound,

    #[error("could not resolve a media playlist url within budget: {0}")]
    ResolveError(String),

    #[error("transcoder error: {0}")]
    TranscodeError(String),

    #[error("invalid range: {0}")]
    InvalidRange(String),

    #[error("invalid job transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("upload failed: {0}")]
    UploadError(String),

    #[error("job stalled")]
    Stalled,

    #[error("job cancelled")]
    Cancelled,

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("unknown platform: {0}")]
    UnknownPlatform(String),

    #[error("browser unavailable: {0}")]
    BrowserUnavailable(String),

    #[error("configuration error: {0}")]
    ConfigurationError(String),

    #[error("io error: {0}")]
    IoError(String),

    #[error("serialization error: {0}")]
    SerializationError(String),
}

impl StreamwatchError {
    /// Whether the next poll cycle or a client retry is reasonably expected to succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StreamwatchError::TransientFetch(_) | StreamwatchError::BrowserUnavailable(_)
        )
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            StreamwatchError::NotFound => ErrorSeverity::Low,
            StreamwatchError::InvalidRange(_) => ErrorSeverity::Low,
            StreamwatchError::InvalidTransition { .. } => ErrorSeverity::Low,
            StreamwatchError::ConfigurationError(_) => ErrorSeverity::High,
            StreamwatchError::TranscodeError(_) => ErrorSeverity::Medium,
            StreamwatchError::ResolveError(_) => ErrorSeverity::Medium,
            StreamwatchError::UploadError(_) => ErrorSeverity::Medium,
            StreamwatchError::Stalled => ErrorSeverity::Medium,
            _ => ErrorSeverity::Low,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
}

impl From<AcquireError> for StreamwatchError {
    fn from(err: AcquireError) -> Self {
        StreamwatchError::BrowserUnavailable(err.to_string())
    }
}

impl From<std::io::Error> for StreamwatchError {
    fn from(err: std::io::Error) -> Self {
        StreamwatchError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for StreamwatchError {
    fn from(err: serde_json::Error) -> Self {
        StreamwatchError::SerializationError(err.to_string())
    }
}

impl From<reqwest::Error> for StreamwatchError {
    fn from(err: reqwest::Error) -> Self {
        StreamwatchError::TransientFetch(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(StreamwatchError::TransientFetch("timeout".into()).is_retryable());
        assert!(!StreamwatchError::NotFound.is_retryable());
        assert!(!StreamwatchError::InvalidRange("bad".into()).is_retryable());
    }
}
