use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("frame is not valid JSON: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("invalid channel url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("credential cannot be sent as a header: {0}")]
    InvalidCredentials(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("transport error: {0}")]
    Transport(String),
}

impl ChannelError {
    pub fn connect(err: impl std::fmt::Display) -> Self {
        ChannelError::Connect(err.to_string())
    }

    pub fn transport(err: impl std::fmt::Display) -> Self {
        ChannelError::Transport(err.to_string())
    }
}
