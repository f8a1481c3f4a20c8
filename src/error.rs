use thiserror::Error;

/// Result type for OBEGRÄNSAD operations
pub type Result<T> = std::result::Result<T, ObegransadError>;

/// Errors that can occur when talking to an OBEGRÄNSAD device
#[derive(Error, Debug)]
pub enum ObegransadError {
    /// HTTP transport error (connection refused, timeout, DNS failure)
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Device answered with a non-success status code
    #[error("API error {status} from {url}: {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Requested URL
        url: String,
        /// Response body, possibly empty
        body: String,
    },

    /// Invalid or unexpected response from the device
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Input rejected before any request was made
    #[error("Validation error: {0}")]
    Validation(String),

    /// No plugin with the given name is known to the device
    #[error("Unknown plugin: {0}")]
    UnknownPlugin(String),

    /// Operation has no REST endpoint, or needs a channel that is disabled
    #[error("Not supported: {0}")]
    NotSupported(&'static str),

    /// Connection was closed unexpectedly
    #[error("Connection closed")]
    ConnectionClosed,

    /// Configuration could not be loaded
    #[error("Config error: {0}")]
    Config(#[from] ::config::ConfigError),

    /// The first refresh failed, so the device cannot be set up
    #[error("Setup failed: {0}")]
    Setup(Box<ObegransadError>),
}

impl ObegransadError {
    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}
