//! Error types for the parameter server

use thiserror::Error;

/// Result type alias for parameter server operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur while pushing, pulling or serving parameters
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// A key, preValue or value could not be encoded
    #[error("Encode error: {0}")]
    Encode(String),

    /// A payload or envelope could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),

    /// A hash resolved to no known server or partition
    #[error("Routing error: {0}")]
    Routing(String),

    /// Sending to an endpoint or queue failed
    #[error("Network error: {0}")]
    Network(String),

    /// A pull received no reply in time
    #[error("Operation timed out")]
    Timeout,

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The server or one of its partitions has been shut down
    #[error("Server is stopped")]
    ServerStopped,

    /// A partition thread panicked
    #[error("Partition {0} panicked")]
    PartitionPanicked(usize),

    /// Other error
    #[error("Error: {0}")]
    Other(String),
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Decode(err.to_string())
    }
}

impl<T> From<flume::SendError<T>> for Error {
    fn from(err: flume::SendError<T>) -> Self {
        Error::Network(err.to_string())
    }
}

impl From<flume::RecvError> for Error {
    fn from(err: flume::RecvError) -> Self {
        Error::Network(err.to_string())
    }
}

impl From<flume::RecvTimeoutError> for Error {
    fn from(err: flume::RecvTimeoutError) -> Self {
        match err {
            flume::RecvTimeoutError::Timeout => Error::Timeout,
            flume::RecvTimeoutError::Disconnected => {
                Error::Network("Channel disconnected".to_string())
            }
        }
    }
}
