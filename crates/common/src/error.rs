//! Error types for Steeplechase

use thiserror::Error;

/// Result type alias using Steeplechase Error
pub type Result<T> = std::result::Result<T, Error>;

/// Steeplechase error types
///
/// Every variant is terminal for the run: nothing in the harness retries.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Error fetching test manifest: {0}")]
    Fetch(String),

    #[error("Error loading signaling client library: {0}")]
    Load(String),

    #[error("Signaling connection failed: {0}")]
    Connect(String),

    #[error("Too many clients connected: {clients}")]
    RoomOverCapacity { clients: u32 },

    #[error("Failed to launch test {path}: {reason}")]
    ContextLaunch { path: String, reason: String },

    #[error("{0}")]
    ProtocolMismatch(String),

    #[error("Uncaught error in {path}: {message}")]
    UncaughtTest { path: String, message: String },

    #[error("Preference error: {0}")]
    Pref(String),

    #[error("Signaling channel closed: {0}")]
    ChannelClosed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Short machine-friendly name of the error kind
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Fetch(_) => "fetch",
            Error::Load(_) => "load",
            Error::Connect(_) => "connect",
            Error::RoomOverCapacity { .. } => "room_over_capacity",
            Error::ContextLaunch { .. } => "context_launch",
            Error::ProtocolMismatch(_) => "protocol_mismatch",
            Error::UncaughtTest { .. } => "uncaught_test",
            Error::Pref(_) => "pref",
            Error::ChannelClosed(_) => "channel_closed",
            Error::Io(_) => "io",
            Error::Serialization(_) => "serialization",
        }
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Pref(e.to_string())
    }
}
