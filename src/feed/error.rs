use thiserror::Error;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("Network error: {0}")]
    NetworkError(String),
    #[error("Request timed out after {0} ms")]
    TimeoutError(u64),
    #[error("Feed returned HTTP {0}")]
    StatusError(u16),
    #[error("Feed response too large: {0} bytes")]
    ResponseTooLarge(usize),
    #[error("Protobuf decode error: {0}")]
    ProtobufError(#[from] prost::DecodeError),
    #[error("JSON decode error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl FeedError {
    /// Whether a retry of the same request could plausibly succeed.
    ///
    /// Server-side trouble (5xx, 429) and transport failures are transient;
    /// other statuses and undecodable bodies are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            FeedError::NetworkError(_) | FeedError::TimeoutError(_) => true,
            FeedError::StatusError(status) => *status >= 500 || *status == 429,
            FeedError::ResponseTooLarge(_)
            | FeedError::ProtobufError(_)
            | FeedError::JsonError(_) => false,
        }
    }

    /// HTTP status code, when the upstream answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            FeedError::StatusError(status) => Some(*status),
            _ => None,
        }
    }
}
