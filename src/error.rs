//! Error types for relay-io

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// relay-io error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid or absent input
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Service or host did not resolve to a usable address
    #[error("Address error: {0}")]
    Address(String),

    /// No candidate address could be bound
    #[error("Bind failed for service {service}: {source}")]
    Bind {
        /// Service the server was asked to listen on
        service: String,
        /// Last error seen while trying candidates
        #[source]
        source: std::io::Error,
    },

    /// No candidate address accepted the connection
    #[error("Connect failed to {address}: {source}")]
    Connect {
        /// Address the client was asked to connect to
        address: String,
        /// Last error seen while trying candidates
        #[source]
        source: std::io::Error,
    },

    /// Poll, waker, thread or log file could not be created
    #[error("Resource error: {0}")]
    Resource(String),

    /// Operation on a server that is not running
    #[error("Server not running")]
    NotRunning,

    /// No data arrived within the receive timeout
    #[error("No data available")]
    NoData,

    /// Short read: the receive returned fewer bytes than one record
    #[error("Malformed message: expected {expected} bytes, got {actual}")]
    MalformedMessage {
        /// Bytes requested
        expected: usize,
        /// Bytes received
        actual: usize,
    },

    /// Peer closed the connection
    #[error("Connection closed by peer")]
    Disconnected,

    /// Configuration file could not be parsed
    #[error("Config error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<toml::ser::Error> for Error {
    fn from(e: toml::ser::Error) -> Self {
        Error::Config(e.to_string())
    }
}
