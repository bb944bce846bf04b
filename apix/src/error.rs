//! Error types for bus operations.

use crate::conn::Handle;

/// Alias for `Result<T, apix::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by the bus, its transports and the client.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A sink with the same name is already registered on this bus.
    #[error("sink `{0}` is already registered")]
    DuplicateSink(String),

    /// No sink with this name is registered.
    #[error("no sink named `{0}`")]
    UnknownSink(String),

    /// No open connection has this handle.
    #[error("no connection with handle {0}")]
    UnknownHandle(Handle),

    /// A transport handed out a handle that is already tracked.
    #[error("handle {0} is already in use")]
    HandleInUse(Handle),

    /// The sink does not implement this operation.
    #[error("`{op}` is not supported by sink `{sink}`")]
    Unsupported {
        /// Sink name.
        sink: String,
        /// Operation name.
        op: &'static str,
    },

    /// The address string could not be understood by the sink.
    #[error("invalid address `{0}`")]
    InvalidAddress(String),

    /// The peer closed the connection.
    #[error("connection closed by peer")]
    Closed,

    /// The bus answered with something other than a status body.
    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),

    /// A frame could not be encoded.
    #[error(transparent)]
    Proto(#[from] apix_proto::Error),

    /// An I/O error from a transport or the client.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
