//! Probe error types

use super::record::Direction;
use crate::net::Target;

/// Errors terminating a probe
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("Connection to {target} failed: {source}")]
    Connection {
        target: Target,
        #[source]
        source: std::io::Error,
    },

    #[error("Handshake with {target} failed: {cause}")]
    Handshake { target: Target, cause: String },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Invalid TLS version: {0}")]
    InvalidVersion(String),

    #[error("OpenSSL error: {0}")]
    OpenSsl(#[from] openssl::error::ErrorStack),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProbeError {
    /// Target the error refers to, if any
    pub fn target(&self) -> Option<&Target> {
        match self {
            ProbeError::Connection { target, .. } | ProbeError::Handshake { target, .. } => {
                Some(target)
            }
            _ => None,
        }
    }
}

/// Failure of one relay worker
///
/// Relay errors never fail the probe. They are collected and attached to the
/// report.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("{direction} relay I/O error: {source}")]
    Io {
        direction: Direction,
        #[source]
        source: std::io::Error,
    },

    #[error("{direction} relay hit EOF inside a record ({got} of {expected} bytes)")]
    Truncated {
        direction: Direction,
        expected: usize,
        got: usize,
    },

    #[error("{direction} relay worker panicked")]
    Panicked { direction: Direction },
}

impl RelayError {
    /// Direction of the worker that failed
    pub fn direction(&self) -> Direction {
        match self {
            RelayError::Io { direction, .. }
            | RelayError::Truncated { direction, .. }
            | RelayError::Panicked { direction } => *direction,
        }
    }
}
