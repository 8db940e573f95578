use std::net::AddrParseError;

use thiserror::Error;

/// Errors surfaced across the public API.
///
/// Background failures (a peer closing its socket, a handler panicking)
/// never reach this type directly; they are reported as `exited`
/// notifications or log records instead. `Error` is for calls that fail
/// synchronously against caller-supplied input.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid pid `{0}`")]
    InvalidPid(String),

    #[error("process `{0}` is not a valid target for this operation")]
    InvalidProcess(String),

    #[error("invalid http method `{0}`")]
    InvalidMethod(String),

    #[error("process `{0}` has not been bound to a context")]
    UnboundProcess(String),

    #[error("socket error: {0}")]
    SocketError(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    ConfigError(String),
}

impl From<AddrParseError> for Error {
    fn from(e: AddrParseError) -> Self {
        Error::InvalidPid(e.to_string())
    }
}

/// Errors from the wire codec, kept distinct from the public `Error`
/// taxonomy since malformed bytes on the wire are a transport-layer concern
/// handled internally (the connection is dropped), not surfaced to callers.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("truncated request")]
    Truncated,

    #[error("malformed request line `{0}`")]
    MalformedRequestLine(String),

    #[error("malformed header `{0}`")]
    MalformedHeader(String),

    #[error("missing or invalid content-length")]
    BadContentLength,

    #[error("unsupported http version `{0}`")]
    UnsupportedVersion(String),
}
