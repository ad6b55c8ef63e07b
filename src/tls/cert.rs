//! Certificate capture and summaries
//!
//! The handshake engine installs a verify callback that feeds every
//! verification step into a `CertCapture`. The capture records the leaf, the
//! chain OpenSSL built and which classes of policy error occurred. The
//! callback itself always accepts, so the outcome is reported rather than
//! enforced.

use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::ssl::SslRef;
use openssl::x509::{X509NameRef, X509Ref, X509StoreContextRef, X509};
use std::fmt;

// OpenSSL X509_V_ERR_* codes for identity checks (x509_vfy.h)
const X509_V_ERR_HOSTNAME_MISMATCH: i32 = 62;
const X509_V_ERR_EMAIL_MISMATCH: i32 = 63;
const X509_V_ERR_IP_ADDRESS_MISMATCH: i32 = 64;

/// Certificate verification outcome
///
/// A set of policy error flags. The empty set means the certificate was
/// valid for the target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct VerificationStatus(u8);

impl VerificationStatus {
    /// No policy errors
    pub const NONE: VerificationStatus = VerificationStatus(0);

    /// Chain building or validation failed (untrusted, expired, ...)
    pub const CHAIN_ERRORS: VerificationStatus = VerificationStatus(0x1);

    /// Certificate does not match the target name
    pub const NAME_MISMATCH: VerificationStatus = VerificationStatus(0x2);

    /// The server presented no certificate
    pub const CERTIFICATE_NOT_AVAILABLE: VerificationStatus = VerificationStatus(0x4);

    /// Get raw u8 value
    pub fn bits(&self) -> u8 {
        self.0
    }

    /// Set the flags in `other`
    pub fn insert(&mut self, other: VerificationStatus) {
        self.0 |= other.0;
    }

    /// Check if all flags in `other` are set
    pub fn contains(&self, other: VerificationStatus) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Check if there are no policy errors
    pub fn is_none(&self) -> bool {
        self.0 == 0
    }

    /// Names of the set flags
    pub fn names(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.contains(Self::CHAIN_ERRORS) {
            names.push("ChainErrors");
        }
        if self.contains(Self::NAME_MISMATCH) {
            names.push("NameMismatch");
        }
        if self.contains(Self::CERTIFICATE_NOT_AVAILABLE) {
            names.push("CertificateNotAvailable");
        }
        names
    }

    fn classify(error_code: i32) -> VerificationStatus {
        match error_code {
            X509_V_ERR_HOSTNAME_MISMATCH
            | X509_V_ERR_EMAIL_MISMATCH
            | X509_V_ERR_IP_ADDRESS_MISMATCH => Self::NAME_MISMATCH,
            _ => Self::CHAIN_ERRORS,
        }
    }
}

impl std::ops::BitOr for VerificationStatus {
    type Output = VerificationStatus;

    fn bitor(self, rhs: VerificationStatus) -> VerificationStatus {
        VerificationStatus(self.0 | rhs.0)
    }
}

impl fmt::Display for VerificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            f.write_str("None")
        } else {
            f.write_str(&self.names().join(", "))
        }
    }
}

/// Summary of one X.509 certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertInfo {
    /// Certificate subject (Common Name)
    pub subject: String,
    /// Certificate issuer (Common Name)
    pub issuer: String,
    /// Subject Alternative Names (DNS names and IP addresses)
    pub subject_alt_names: Vec<String>,
    /// Start of validity
    pub not_before: String,
    /// End of validity
    pub not_after: String,
    /// SHA-256 fingerprint, colon-separated uppercase hex
    pub fingerprint_sha256: String,
}

impl CertInfo {
    /// Extract certificate information from an X.509 certificate
    pub fn from_x509(cert: &X509Ref) -> Self {
        CertInfo {
            subject: Self::get_cn(cert.subject_name()),
            issuer: Self::get_cn(cert.issuer_name()),
            subject_alt_names: Self::get_subject_alt_names(cert),
            not_before: cert.not_before().to_string(),
            not_after: cert.not_after().to_string(),
            fingerprint_sha256: Self::get_fingerprint(cert),
        }
    }

    /// Get Common Name from X509_NAME
    fn get_cn(name: &X509NameRef) -> String {
        name.entries_by_nid(Nid::COMMONNAME)
            .next()
            .and_then(|entry| entry.data().as_utf8().ok())
            .map(|s| s.to_string())
            .unwrap_or_else(|| "<undef>".to_string())
    }

    /// Get Subject Alternative Names
    fn get_subject_alt_names(cert: &X509Ref) -> Vec<String> {
        let mut names = Vec::new();

        if let Some(san_ext) = cert.subject_alt_names() {
            for name in san_ext {
                if let Some(dns) = name.dnsname() {
                    names.push(format!("DNS:{}", dns));
                } else if let Some(ip) = name.ipaddress() {
                    if let Ok(v4) = <[u8; 4]>::try_from(ip) {
                        names.push(format!("IP:{}", std::net::Ipv4Addr::from(v4)));
                    } else if let Ok(v6) = <[u8; 16]>::try_from(ip) {
                        names.push(format!("IP:{}", std::net::Ipv6Addr::from(v6)));
                    }
                }
            }
        }

        names
    }

    fn get_fingerprint(cert: &X509Ref) -> String {
        cert.digest(MessageDigest::sha256())
            .map(|digest| {
                digest
                    .iter()
                    .map(|b| format!("{:02X}", b))
                    .collect::<Vec<_>>()
                    .join(":")
            })
            .unwrap_or_else(|_| "<undef>".to_string())
    }
}

/// Peer certificate, chain and verification outcome
#[derive(Debug, Clone, Default)]
pub struct CertificateInfo {
    /// Leaf certificate presented by the server
    pub leaf: Option<X509>,
    /// Chain as built during verification (index 0 is the leaf)
    pub chain: Vec<X509>,
    /// Classified verification outcome
    pub status: VerificationStatus,
    /// OpenSSL verification errors, in the order they were reported
    pub verify_errors: Vec<String>,
}

impl CertificateInfo {
    /// Summary of the leaf certificate
    pub fn leaf_info(&self) -> Option<CertInfo> {
        self.leaf.as_deref().map(CertInfo::from_x509)
    }

    /// Summaries of the chain, leaf first
    pub fn chain_info(&self) -> Vec<CertInfo> {
        self.chain.iter().map(|cert| CertInfo::from_x509(cert)).collect()
    }
}

/// State written by the verify callback during one handshake
#[derive(Debug, Default)]
pub struct CertCapture {
    leaf: Option<X509>,
    chain: Vec<X509>,
    status: VerificationStatus,
    errors: Vec<String>,
    calls: usize,
}

impl CertCapture {
    /// Create an empty capture
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the verify callback has run at least once
    pub fn requested(&self) -> bool {
        self.calls > 0
    }

    /// Record one verify callback invocation
    pub fn observe(&mut self, preverify_ok: bool, ctx: &X509StoreContextRef) {
        self.calls += 1;
        let depth = ctx.error_depth();

        if depth == 0 {
            if let Some(cert) = ctx.current_cert() {
                self.leaf = Some(cert.to_owned());
            }
        }

        if let Some(chain) = ctx.chain() {
            if chain.len() >= self.chain.len() {
                self.chain = chain.iter().map(|cert| cert.to_owned()).collect();
            }
        }

        if !preverify_ok {
            let error = ctx.error();
            self.status.insert(VerificationStatus::classify(error.as_raw()));

            let message = format!("depth {}: {}", depth, error.error_string());
            if !self.errors.contains(&message) {
                tracing::debug!(%message, "certificate verification error");
                self.errors.push(message);
            }
        }
    }

    /// Finalize against the established connection
    ///
    /// Falls back to the certificates recorded on the session when the
    /// callback never saw them (e.g. a resumed session).
    pub fn finish(mut self, ssl: &SslRef) -> CertificateInfo {
        if self.leaf.is_none() {
            self.leaf = ssl.peer_certificate();
        }

        if self.chain.is_empty() {
            if let Some(chain) = ssl.peer_cert_chain() {
                self.chain = chain.iter().map(|cert| cert.to_owned()).collect();
            }
        }

        if self.leaf.is_none() {
            self.status.insert(VerificationStatus::CERTIFICATE_NOT_AVAILABLE);
        }

        CertificateInfo {
            leaf: self.leaf,
            chain: self.chain,
            status: self.status,
            verify_errors: self.errors,
        }
    }
}
