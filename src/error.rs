//! Error types for VarunaIO

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// VarunaIO error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Vehicle endpoint did not answer within the connect timeout
    #[error("link unreachable: {0}")]
    LinkUnreachable(String),

    /// No connected link available for transmission
    #[error("link unavailable")]
    LinkUnavailable,

    /// Command rejected before any network interaction
    #[error("invalid command: {0}")]
    InvalidCommand(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Wire serialization failure
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Generic error with message
    #[error("{0}")]
    Other(String),
}
