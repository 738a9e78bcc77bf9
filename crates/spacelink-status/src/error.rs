use thiserror::Error;

/// Status endpoint errors
#[derive(Debug, Error)]
pub enum StatusError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unexpected status {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },

    #[error("Malformed status response: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Status server reported error: {0}")]
    Rejected(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
