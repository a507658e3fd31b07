use shared::error::ApiError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    /// Rejected locally before any request was sent.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected response ({status}): {body}")]
    UnexpectedResponse { status: u16, body: String },
}

impl ClientError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Api(err) => err.code.is_retryable(),
            ClientError::Transport(err) => err.is_connect() || err.is_timeout(),
            ClientError::InvalidInput(_) | ClientError::UnexpectedResponse { .. } => false,
        }
    }
}
