//! Handshake report
//!
//! A report is produced only for a completed handshake. Besides the typed
//! fields, values can be looked up by dotted name (`tls.cipher`,
//! `tls.cert1.issuer`, ...) for scripted checks.

use super::cert::{CertInfo, CertificateInfo, VerificationStatus};
use super::error::RelayError;
use super::handshake::Negotiated;
use super::record::{Direction, Record};
use crate::net::Target;
use std::fmt;

/// Result of a successful probe
#[derive(Debug)]
pub struct HandshakeReport {
    /// Probed target
    pub target: Target,
    /// Negotiated protocol version (e.g. "TLSv1.3")
    pub protocol: String,
    /// Negotiated cipher suite
    pub cipher: String,
    /// Secret bits of the negotiated cipher
    pub key_strength: u32,
    /// Negotiated ALPN protocol
    pub alpn: Option<String>,
    /// SNI servername sent
    pub servername: Option<String>,
    /// Whether the session was resumed
    pub session_reused: bool,
    /// Peer certificate, chain and verification outcome
    pub certificate: CertificateInfo,
    /// Captured records in append order (empty unless capture was enabled)
    pub packets: Vec<Record>,
    /// Relay worker failures observed during capture
    pub relay_errors: Vec<RelayError>,
}

impl HandshakeReport {
    /// Assemble a report from a completed handshake and its capture
    pub fn new(
        target: Target,
        negotiated: Negotiated,
        packets: Vec<Record>,
        relay_errors: Vec<RelayError>,
    ) -> Self {
        HandshakeReport {
            target,
            protocol: negotiated.protocol,
            cipher: negotiated.cipher,
            key_strength: negotiated.key_strength,
            alpn: negotiated.alpn,
            servername: negotiated.servername,
            session_reused: negotiated.session_reused,
            certificate: negotiated.certificate,
            packets,
            relay_errors,
        }
    }

    /// Verification outcome
    pub fn verification(&self) -> VerificationStatus {
        self.certificate.status
    }

    /// Captured records travelling in one direction, in order
    pub fn packets_in(&self, direction: Direction) -> impl Iterator<Item = &Record> {
        self.packets.iter().filter(move |r| r.direction == direction)
    }

    /// Concatenated wire bytes for one direction
    pub fn wire_bytes(&self, direction: Direction) -> Vec<u8> {
        self.packets_in(direction)
            .flat_map(|r| r.data.iter().copied())
            .collect()
    }

    /// Get a value by dotted name
    pub fn get(&self, name: &str) -> Option<String> {
        match name {
            "tls.version" => Some(self.protocol.clone()),
            "tls.cipher" => Some(self.cipher.clone()),
            "tls.key_strength" => Some(self.key_strength.to_string()),
            "tls.servername" => self.servername.clone().or(Some("<undef>".to_string())),
            "tls.alpn" => self.alpn.clone().or(Some("<undef>".to_string())),
            "tls.sess_reused" => Some(self.session_reused.to_string()),
            "tls.verification" => Some(self.certificate.status.to_string()),
            "tls.packets" => Some(self.packets.len().to_string()),
            _ => {
                if name.starts_with("tls.cert") {
                    self.get_cert_var(name)
                } else {
                    None
                }
            }
        }
    }

    /// Get certificate variable
    fn get_cert_var(&self, name: &str) -> Option<String> {
        // Parse tls.cert[N].field or tls.cert.field (N=0 implicit)
        let remaining = name.strip_prefix("tls.cert")?;

        let (index, field) = if let Some(field) = remaining.strip_prefix('.') {
            (0, field)
        } else {
            let (index_str, field) = remaining.split_once('.')?;
            (index_str.parse::<usize>().ok()?, field.trim())
        };

        let x509 = match self.certificate.chain.get(index) {
            Some(cert) => cert,
            None if index == 0 => self.certificate.leaf.as_ref()?,
            None => return None,
        };
        let cert = CertInfo::from_x509(x509);

        match field {
            "subject" => Some(cert.subject),
            "issuer" => Some(cert.issuer),
            "not_before" => Some(cert.not_before),
            "not_after" => Some(cert.not_after),
            "fingerprint" => Some(cert.fingerprint_sha256),
            "subject_alt_names" => {
                if cert.subject_alt_names.is_empty() {
                    Some("<undef>".to_string())
                } else {
                    Some(cert.subject_alt_names.join(", "))
                }
            }
            _ => None,
        }
    }
}

impl fmt::Display for HandshakeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Target:        {}", self.target)?;
        writeln!(f, "Protocol:      {}", self.protocol)?;
        writeln!(f, "Cipher:        {} ({} bits)", self.cipher, self.key_strength)?;
        if let Some(alpn) = &self.alpn {
            writeln!(f, "ALPN:          {}", alpn)?;
        }
        writeln!(f, "Verification:  {}", self.certificate.status)?;
        for error in &self.certificate.verify_errors {
            writeln!(f, "  {}", error)?;
        }

        for (i, cert) in self.certificate.chain_info().iter().enumerate() {
            writeln!(f, "Certificate {}: {} (issuer {})", i, cert.subject, cert.issuer)?;
            writeln!(f, "  valid {} .. {}", cert.not_before, cert.not_after)?;
            if !cert.subject_alt_names.is_empty() {
                writeln!(f, "  {}", cert.subject_alt_names.join(", "))?;
            }
        }

        if !self.packets.is_empty() {
            writeln!(f, "Records:       {}", self.packets.len())?;
            for record in &self.packets {
                writeln!(f, "  {}", record)?;
            }
        }

        for error in &self.relay_errors {
            writeln!(f, "Relay error:   {}", error)?;
        }

        Ok(())
    }
}
