use thiserror::Error;

use crate::endpoint::ConnectionId;

/// Centralized error type for udpmux.
#[derive(Error, Debug)]
pub enum Error {
    /// A parameter was missing, had the wrong type, was unknown, or the
    /// manager was asked to do something its current state does not allow.
    #[error("Invalid parameter or internal error: {0}")]
    Internal(String),

    /// Opening an endpoint failed: resolution, socket creation, binding,
    /// or a mandatory configuration step did not succeed.
    #[error("Connection rejected: {0}")]
    Rejected(String),

    /// A send failed with an unrecoverable error. The endpoint has been
    /// shut down and will report `Closing` on the next loop iteration.
    #[error("Connection closed")]
    Closed,

    /// The given connection id is not registered with this manager.
    #[error("Connection {0} not found")]
    NotFound(ConnectionId),

    /// The socket for an outgoing endpoint could not be created.
    #[error("Could not create socket: {0}")]
    Disconnect(#[source] std::io::Error),
}

/// Helper alias for `Result<T, udpmux::Error>`
pub type Result<T> = std::result::Result<T, Error>;
