use thiserror::Error;

/// Failure while fetching a reading snapshot from the telemetry provider
#[derive(Debug, Error)]
pub enum FetchError {
    /// Connection refused, DNS failure, timeout, broken body, etc.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("provider returned HTTP {status}")]
    Status { status: u16 },

    /// The provider refused our credentials or token
    #[error("authentication rejected: {message}")]
    Auth { message: String },

    /// The provider answered but flagged the request as unsuccessful
    #[error("provider rejected request: {message}")]
    Api { message: String },

    #[error("unexpected response body: {0}")]
    Decode(String),
}

impl FetchError {
    /// Whether retrying the same request later could reasonably succeed
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Transport(_) => true,
            FetchError::Status { status } => *status == 429 || *status >= 500,
            FetchError::Auth { .. } | FetchError::Api { .. } | FetchError::Decode(_) => false,
        }
    }
}

/// Failure while setting a characteristic value on the accessory
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PublishError {
    #[error("{characteristic} value {value} outside of {min}..={max}")]
    OutOfRange {
        characteristic: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("{characteristic} value is not a finite number")]
    NotFinite { characteristic: &'static str },
}
