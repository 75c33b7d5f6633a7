//! Error types for the Vesper voice core

use thiserror::Error;

/// Result type alias for Vesper operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the voice session core
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Another session already holds the credential upstream
    #[error("session conflict: {0}")]
    Conflict(String),

    /// Network or protocol failure on the upstream stream
    #[error("transport error: {0}")]
    Transport(String),

    /// Audio device I/O failure
    #[error("audio device error: {0}")]
    Device(String),

    /// Tool execution failure
    #[error("tool error: {0}")]
    Tool(String),

    /// All connection attempts exhausted; caller must decide to give up
    #[error("connection failed after {attempts} attempts: {reason}")]
    ConnectionFailed {
        /// Number of attempts made before giving up
        attempts: u32,
        /// Last underlying failure
        reason: String,
    },

    /// Session is not in a state that allows the requested operation
    #[error("session error: {0}")]
    Session(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Whether a connection attempt hitting this error is worth retrying.
    ///
    /// Conflicts and transport failures are transient; everything else is
    /// surfaced immediately.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Conflict(_) | Self::Transport(_))
    }
}
