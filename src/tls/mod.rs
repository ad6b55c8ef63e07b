//! Diagnostic TLS handshake support
//!
//! The handshake itself is performed by OpenSSL through the `openssl` crate.
//! This module wraps it with the pieces a diagnostic probe needs:
//!
//! 1. `HandshakeConfig` describes what to offer (versions, ciphers, ALPN,
//!    trust anchors) and whether to capture records
//! 2. `HandshakeEngine` runs the client handshake with a verify callback that
//!    records the peer certificates and verification errors but always lets
//!    the handshake continue
//! 3. `RecordRelay` sits between OpenSSL and the socket when capture is on,
//!    framing traffic into TLS records and logging each one unmodified
//! 4. `HandshakeReport` collects the negotiated parameters, certificates and
//!    captured records
//!
//! # Record capture
//!
//! ```text
//!   OpenSSL  <-> local endpoint (UnixStream pair) <-> relay workers <-> TcpStream
//!                                                        |
//!                                                   capture log
//! ```

pub mod cert;
pub mod config;
pub mod error;
pub mod handshake;
pub mod record;
pub mod relay;
pub mod report;

pub use cert::{CertInfo, CertificateInfo, VerificationStatus};
pub use config::{
    CipherPolicy, HandshakeConfig, HandshakeConfigBuilder, ProtocolConstraint, TlsVersion,
};
pub use error::{ProbeError, RelayError};
pub use handshake::{HandshakeEngine, HandshakeState, Negotiated};
pub use record::{ContentType, Direction, Record, RecordHeader};
pub use relay::{RecordRelay, RelayOptions};
pub use report::HandshakeReport;

/// Result type for probe operations
pub type Result<T> = std::result::Result<T, ProbeError>;
