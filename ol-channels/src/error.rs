use thiserror::Error;

pub type DispatchResult<T> = std::result::Result<T, DispatchError>;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("dispatch timed out: {0}")]
    Timeout(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("relay unavailable (status {status}): {message}")]
    Unavailable { status: u16, message: String },

    #[error("relay rejected send (status {status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("invalid recipient: {0}")]
    InvalidRecipient(String),
}

impl DispatchError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::Network(_) | Self::Unavailable { .. }
        )
    }

    pub(crate) fn from_status(status: u16, message: String) -> Self {
        if status == 429 || (500..=599).contains(&status) {
            Self::Unavailable { status, message }
        } else {
            Self::Rejected { status, message }
        }
    }
}

impl From<reqwest::Error> for DispatchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout(e.to_string())
        } else {
            Self::Network(e.to_string())
        }
    }
}
