//! tlsprobe - diagnostic TLS handshakes
//!
//! This crate performs a TLS client handshake against a remote endpoint and
//! reports what was negotiated: protocol version, cipher suite, key strength,
//! the peer certificate chain and how it fared against verification. When
//! capture is enabled, every TLS record exchanged during the handshake is
//! recorded byte-for-byte by a relay spliced between OpenSSL and the socket.
//!
//! # Examples
//!
//! ```no_run
//! use tlsprobe::{probe, HandshakeConfig, Target};
//!
//! let target = Target::parse("example.com").unwrap();
//! let config = HandshakeConfig::builder().capture(true).build().unwrap();
//!
//! let report = probe(&target, &config).unwrap();
//! println!("{}", report);
//! for record in &report.packets {
//!     println!("{}", record);
//! }
//! ```

pub mod net;
pub mod probe;
pub mod tls;

pub use net::Target;
pub use probe::{probe, Probe};
pub use tls::{
    CertificateInfo, Direction, HandshakeConfig, HandshakeReport, ProbeError, ProtocolConstraint,
    Record, RelayError, TlsVersion, VerificationStatus,
};
