//! Error types for geogate.

use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

/// Error type for geogate operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The GeoIP database could not be opened
    #[error("can't open GeoIP database {path:?}: {reason}")]
    DatabaseOpen { path: PathBuf, reason: String },

    /// Policy action is neither `allow` nor `block`
    #[error("invalid action {0:?}: supported values are: allow, block")]
    InvalidAction(String),

    /// Invalid country code
    #[error("invalid country code (must be 2 letters): {0:?}")]
    InvalidCountryCode(String),

    /// Invalid listen address
    #[error("invalid listen address: {0:?}")]
    InvalidListenAddress(String),

    /// Invalid duration value
    #[error("invalid duration: {0}")]
    InvalidDuration(String),

    /// The HTTP listener could not be bound
    #[error("can't bind HTTP listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Unrecoverable HTTP server fault
    #[error("http server error: {0}")]
    Server(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Lookup error
    #[error(transparent)]
    Lookup(#[from] LookupError),
}

/// Result type alias for geogate operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for a single IP lookup.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LookupError {
    /// The provider was closed before or while it was being read
    #[error("GeoIP database already closed")]
    UseAfterClose,

    /// The database is corrupt or unreadable for this address
    #[error("GeoIP lookup failed: {0}")]
    Database(String),
}
