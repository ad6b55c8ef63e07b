//! Handshake configuration
//!
//! This module provides the probe configuration and its builder, and turns a
//! configuration into an OpenSSL client context.

use super::error::ProbeError;
use super::relay::{RelayOptions, DEFAULT_POLL_INTERVAL};
use openssl::ssl::{SslContext, SslContextBuilder, SslMethod, SslVerifyMode, SslVersion};
use openssl::x509::X509;
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Default TCP connect timeout
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for a single read or write during the handshake
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(10);

/// TLS version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TlsVersion {
    /// SSL 3.0 (deprecated, rarely used)
    Ssl3,
    /// TLS 1.0
    Tls10,
    /// TLS 1.1
    Tls11,
    /// TLS 1.2
    Tls12,
    /// TLS 1.3
    Tls13,
}

impl TlsVersion {
    /// All versions, oldest first
    pub const ALL: [TlsVersion; 5] = [
        TlsVersion::Ssl3,
        TlsVersion::Tls10,
        TlsVersion::Tls11,
        TlsVersion::Tls12,
        TlsVersion::Tls13,
    ];

    /// Get OpenSSL protocol version constant
    pub fn to_openssl_version(&self) -> SslVersion {
        match self {
            TlsVersion::Ssl3 => SslVersion::SSL3,
            TlsVersion::Tls10 => SslVersion::TLS1,
            TlsVersion::Tls11 => SslVersion::TLS1_1,
            TlsVersion::Tls12 => SslVersion::TLS1_2,
            TlsVersion::Tls13 => SslVersion::TLS1_3,
        }
    }

    /// Get version as string, matching OpenSSL's `SSL_get_version`
    pub fn as_str(&self) -> &'static str {
        match self {
            TlsVersion::Ssl3 => "SSLv3",
            TlsVersion::Tls10 => "TLSv1",
            TlsVersion::Tls11 => "TLSv1.1",
            TlsVersion::Tls12 => "TLSv1.2",
            TlsVersion::Tls13 => "TLSv1.3",
        }
    }

    /// Legacy wire version (e.g. 0x0303 for TLS 1.2)
    pub fn wire_version(&self) -> u16 {
        match self {
            TlsVersion::Ssl3 => 0x0300,
            TlsVersion::Tls10 => 0x0301,
            TlsVersion::Tls11 => 0x0302,
            TlsVersion::Tls12 => 0x0303,
            TlsVersion::Tls13 => 0x0304,
        }
    }
}

impl FromStr for TlsVersion {
    type Err = ProbeError;

    /// Parse TLS version from string (case-insensitive)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "SSLV3" | "SSL3" => Ok(TlsVersion::Ssl3),
            "TLSV1.0" | "TLS1.0" | "TLSV1" | "TLS1" => Ok(TlsVersion::Tls10),
            "TLSV1.1" | "TLS1.1" => Ok(TlsVersion::Tls11),
            "TLSV1.2" | "TLS1.2" => Ok(TlsVersion::Tls12),
            "TLSV1.3" | "TLS1.3" => Ok(TlsVersion::Tls13),
            _ => Err(ProbeError::InvalidVersion(s.to_string())),
        }
    }
}

impl fmt::Display for TlsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which protocol versions the client offers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtocolConstraint {
    /// Whatever the local OpenSSL enables by default
    #[default]
    Auto,
    /// Exactly one version
    Only(TlsVersion),
}

impl FromStr for ProtocolConstraint {
    type Err = ProbeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("auto") {
            Ok(ProtocolConstraint::Auto)
        } else {
            s.parse().map(ProtocolConstraint::Only)
        }
    }
}

impl fmt::Display for ProtocolConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolConstraint::Auto => f.write_str("auto"),
            ProtocolConstraint::Only(version) => write!(f, "{}", version),
        }
    }
}

/// Cipher-suite selection in OpenSSL syntax
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CipherPolicy {
    /// Cipher list for TLS 1.2 and below (e.g. `ECDHE+AESGCM`)
    pub cipher_list: Option<String>,
    /// Cipher suites for TLS 1.3 (e.g. `TLS_AES_128_GCM_SHA256`)
    pub ciphersuites: Option<String>,
}

impl CipherPolicy {
    /// Policy restricting TLS 1.2-and-below ciphers
    pub fn cipher_list(ciphers: impl Into<String>) -> Self {
        CipherPolicy {
            cipher_list: Some(ciphers.into()),
            ciphersuites: None,
        }
    }

    /// Policy restricting TLS 1.3 cipher suites
    pub fn ciphersuites(suites: impl Into<String>) -> Self {
        CipherPolicy {
            cipher_list: None,
            ciphersuites: Some(suites.into()),
        }
    }
}

/// Probe configuration (immutable after building)
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    pub(crate) protocol: ProtocolConstraint,
    pub(crate) cipher_policy: Option<CipherPolicy>,
    pub(crate) capture: bool,
    pub(crate) servername: Option<String>,
    pub(crate) alpn: Vec<String>,
    pub(crate) trust_anchors: Vec<X509>,
    pub(crate) use_default_trust: bool,
    pub(crate) connect_timeout: Duration,
    pub(crate) io_timeout: Duration,
    pub(crate) poll_interval: Duration,
}

impl HandshakeConfig {
    /// Create a new configuration builder
    pub fn builder() -> HandshakeConfigBuilder {
        HandshakeConfigBuilder::new()
    }

    /// Requested protocol constraint
    pub fn protocol(&self) -> ProtocolConstraint {
        self.protocol
    }

    /// Requested cipher policy
    pub fn cipher_policy(&self) -> Option<&CipherPolicy> {
        self.cipher_policy.as_ref()
    }

    /// Whether records are captured
    pub fn capture(&self) -> bool {
        self.capture
    }

    /// SNI override
    pub fn servername(&self) -> Option<&str> {
        self.servername.as_deref()
    }

    /// TCP connect timeout
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Per-operation handshake I/O timeout
    pub fn io_timeout(&self) -> Duration {
        self.io_timeout
    }

    /// Relay options derived from this configuration
    pub fn relay_options(&self) -> RelayOptions {
        RelayOptions {
            poll_interval: self.poll_interval,
            write_timeout: Some(self.io_timeout),
        }
    }

    /// Build the OpenSSL client context
    ///
    /// Verification is requested in `PEER` mode so that OpenSSL runs chain
    /// and name checks; the verify callback installed by the handshake
    /// engine decides the outcome.
    pub fn ssl_context(&self) -> Result<SslContext, ProbeError> {
        let mut ctx = SslContextBuilder::new(SslMethod::tls_client())?;

        if let ProtocolConstraint::Only(version) = self.protocol {
            ctx.set_min_proto_version(Some(version.to_openssl_version()))?;
            ctx.set_max_proto_version(Some(version.to_openssl_version()))?;
            if version <= TlsVersion::Tls11 {
                // Legacy protocols need the lowest security level to be offered at all
                ctx.set_security_level(0);
            }
        }

        if let Some(policy) = &self.cipher_policy {
            if let Some(list) = &policy.cipher_list {
                ctx.set_cipher_list(list)?;
            }
            if let Some(suites) = &policy.ciphersuites {
                ctx.set_ciphersuites(suites)?;
            }
        }

        if !self.alpn.is_empty() {
            ctx.set_alpn_protos(&encode_alpn(&self.alpn)?)?;
        }

        if self.use_default_trust {
            ctx.set_default_verify_paths()?;
        }
        for anchor in &self.trust_anchors {
            ctx.cert_store_mut().add_cert(anchor.clone())?;
        }

        ctx.set_verify(SslVerifyMode::PEER);

        Ok(ctx.build())
    }
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        HandshakeConfig {
            protocol: ProtocolConstraint::Auto,
            cipher_policy: None,
            capture: false,
            servername: None,
            alpn: Vec::new(),
            trust_anchors: Vec::new(),
            use_default_trust: true,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            io_timeout: DEFAULT_IO_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Encode ALPN protocols (length-prefixed)
fn encode_alpn(protocols: &[String]) -> Result<Vec<u8>, ProbeError> {
    let mut alpn_bytes = Vec::new();
    for proto in protocols {
        let len = u8::try_from(proto.len())
            .ok()
            .filter(|len| *len > 0)
            .ok_or_else(|| ProbeError::Config(format!("invalid ALPN protocol: {:?}", proto)))?;
        alpn_bytes.push(len);
        alpn_bytes.extend_from_slice(proto.as_bytes());
    }
    Ok(alpn_bytes)
}

/// Configuration builder
pub struct HandshakeConfigBuilder {
    config: HandshakeConfig,
}

impl HandshakeConfigBuilder {
    fn new() -> Self {
        HandshakeConfigBuilder {
            config: HandshakeConfig::default(),
        }
    }

    /// Set the protocol constraint
    pub fn protocol(mut self, protocol: ProtocolConstraint) -> Self {
        self.config.protocol = protocol;
        self
    }

    /// Offer exactly one TLS version
    pub fn version(self, version: TlsVersion) -> Self {
        self.protocol(ProtocolConstraint::Only(version))
    }

    /// Set the cipher policy
    pub fn cipher_policy(mut self, policy: CipherPolicy) -> Self {
        self.config.cipher_policy = Some(policy);
        self
    }

    /// Enable/disable record capture
    pub fn capture(mut self, capture: bool) -> Self {
        self.config.capture = capture;
        self
    }

    /// Override the SNI servername (defaults to the target host)
    pub fn servername(mut self, name: impl Into<String>) -> Self {
        self.config.servername = Some(name.into());
        self
    }

    /// Set ALPN protocols to offer
    pub fn alpn(mut self, protocols: &[&str]) -> Self {
        self.config.alpn = protocols.iter().map(|p| p.to_string()).collect();
        self
    }

    /// Trust an additional certificate authority
    pub fn trust_anchor(mut self, cert: X509) -> Self {
        self.config.trust_anchors.push(cert);
        self
    }

    /// Trust every certificate in a PEM file
    pub fn ca_file<P: AsRef<Path>>(mut self, path: P) -> Result<Self, ProbeError> {
        let path: PathBuf = path.as_ref().to_path_buf();
        let mut pem = Vec::new();
        File::open(&path)?.read_to_end(&mut pem)?;

        let certs = X509::stack_from_pem(&pem)?;
        if certs.is_empty() {
            return Err(ProbeError::Config(format!(
                "no certificates in {}",
                path.display()
            )));
        }

        self.config.trust_anchors.extend(certs);
        Ok(self)
    }

    /// Use the system trust store (default: true)
    pub fn default_trust(mut self, enabled: bool) -> Self {
        self.config.use_default_trust = enabled;
        self
    }

    /// Set the TCP connect timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Set the per-operation handshake I/O timeout
    pub fn io_timeout(mut self, timeout: Duration) -> Self {
        self.config.io_timeout = timeout;
        self
    }

    /// Set how often relay workers check for cancellation while idle
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    /// Build the configuration
    ///
    /// The OpenSSL context is built once here so that invalid cipher strings
    /// or ALPN names are rejected before any connection is made.
    pub fn build(self) -> Result<HandshakeConfig, ProbeError> {
        let config = self.config;

        if config.poll_interval.is_zero() {
            return Err(ProbeError::Config("poll interval must be non-zero".to_string()));
        }
        if config.io_timeout.is_zero() || config.connect_timeout.is_zero() {
            return Err(ProbeError::Config("timeouts must be non-zero".to_string()));
        }

        config.ssl_context()?;
        Ok(config)
    }
}
