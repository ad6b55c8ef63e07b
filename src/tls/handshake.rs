//! TLS client handshake
//!
//! The actual handshake is performed by the `openssl` crate's
//! `Ssl::connect()`. This module prepares the connection (SNI, identity
//! checks, verify callback), runs it over any byte stream and extracts the
//! negotiated parameters.

use super::cert::{CertCapture, CertificateInfo};
use super::config::HandshakeConfig;
use super::error::ProbeError;
use super::Result;
use crate::net::Target;
use openssl::error::ErrorStack;
use openssl::ssl::{HandshakeError, NameType, Ssl, SslContext, SslRef, SslStream, SslVerifyMode};
use parking_lot::Mutex;
use std::fmt;
use std::io::{Read, Write};
use std::sync::Arc;

/// Progress of a single handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Not started
    Idle,
    /// ClientHello sent, waiting on the server
    Connecting,
    /// The server presented a certificate and it was inspected
    RequestedCert,
    /// Handshake finished; parameters are available
    Complete,
    /// Handshake failed; only an error is available
    Failed,
}

impl HandshakeState {
    /// Whether `next` is a legal successor of this state
    pub fn can_advance_to(self, next: HandshakeState) -> bool {
        use HandshakeState::*;
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Connecting, RequestedCert)
                | (Connecting, Complete)
                | (Connecting, Failed)
                | (RequestedCert, Complete)
                | (RequestedCert, Failed)
        )
    }

    /// Whether no further transitions are possible
    pub fn is_terminal(self) -> bool {
        matches!(self, HandshakeState::Complete | HandshakeState::Failed)
    }
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandshakeState::Idle => "idle",
            HandshakeState::Connecting => "connecting",
            HandshakeState::RequestedCert => "requested-cert",
            HandshakeState::Complete => "complete",
            HandshakeState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Parameters negotiated by a completed handshake
#[derive(Debug, Clone)]
pub struct Negotiated {
    /// Protocol version (e.g. "TLSv1.3")
    pub protocol: String,
    /// Cipher suite name as reported by OpenSSL
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
}

impl Negotiated {
    fn from_ssl(ssl: &SslRef, capture: CertCapture) -> Self {
        let cipher = ssl.current_cipher();

        Negotiated {
            protocol: ssl.version_str().to_string(),
            cipher: cipher
                .map(|c| c.name().to_string())
                .unwrap_or_else(|| "<undef>".to_string()),
            key_strength: cipher
                .map(|c| c.bits().secret.max(0) as u32)
                .unwrap_or(0),
            alpn: ssl
                .selected_alpn_protocol()
                .map(|p| String::from_utf8_lossy(p).to_string()),
            servername: ssl.servername(NameType::HOST_NAME).map(|s| s.to_string()),
            session_reused: ssl.session_reused(),
            certificate: capture.finish(ssl),
        }
    }
}

/// Client handshake driver for one target
pub struct HandshakeEngine {
    target: Target,
    ctx: SslContext,
    servername: Option<String>,
    state: HandshakeState,
}

impl HandshakeEngine {
    /// Prepare a handshake against `target`
    pub fn new(target: &Target, config: &HandshakeConfig) -> Result<Self> {
        Ok(HandshakeEngine {
            target: target.clone(),
            ctx: config.ssl_context()?,
            servername: config.servername().map(str::to_string),
            state: HandshakeState::Idle,
        })
    }

    /// Current state
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    fn advance(&mut self, next: HandshakeState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "illegal handshake transition {} -> {}",
            self.state,
            next
        );
        tracing::debug!(target = %self.target, from = %self.state, to = %next, "handshake state");
        self.state = next;
    }

    /// Run the client handshake over `stream`
    ///
    /// `stream` is either the TCP connection or the relay's local endpoint.
    /// Certificate problems never abort the handshake; they are reported in
    /// `Negotiated::certificate`.
    pub fn run<S>(&mut self, stream: S) -> Result<(SslStream<S>, Negotiated)>
    where
        S: Read + Write + fmt::Debug,
    {
        if self.state != HandshakeState::Idle {
            return Err(ProbeError::Config("handshake engine already used".to_string()));
        }
        self.advance(HandshakeState::Connecting);

        let capture = Arc::new(Mutex::new(CertCapture::new()));

        let ssl = match self.prepare(Arc::clone(&capture)) {
            Ok(ssl) => ssl,
            Err(e) => {
                self.advance(HandshakeState::Failed);
                return Err(e);
            }
        };

        let outcome = ssl.connect(stream);

        if capture.lock().requested() {
            self.advance(HandshakeState::RequestedCert);
        }

        match outcome {
            Ok(stream) => {
                let capture = std::mem::take(&mut *capture.lock());
                let negotiated = Negotiated::from_ssl(stream.ssl(), capture);
                self.advance(HandshakeState::Complete);

                tracing::info!(
                    target = %self.target,
                    protocol = %negotiated.protocol,
                    cipher = %negotiated.cipher,
                    verification = %negotiated.certificate.status,
                    "handshake complete"
                );

                Ok((stream, negotiated))
            }
            Err(e) => {
                self.advance(HandshakeState::Failed);
                let cause = handshake_failure_cause(e);
                tracing::info!(target = %self.target, %cause, "handshake failed");

                Err(ProbeError::Handshake {
                    target: self.target.clone(),
                    cause,
                })
            }
        }
    }

    /// Create the connection with SNI, identity checks and the verify hook
    fn prepare(&self, capture: Arc<Mutex<CertCapture>>) -> Result<Ssl> {
        let mut ssl = Ssl::new(&self.ctx)?;

        match (&self.servername, self.target.ip()) {
            (Some(name), _) => {
                ssl.set_hostname(name)?;
                ssl.param_mut().set_host(name)?;
            }
            (None, Some(ip)) => {
                // SNI must not carry IP literals (RFC 6066 Section 3)
                ssl.param_mut().set_ip(ip)?;
            }
            (None, None) => {
                ssl.set_hostname(&self.target.host)?;
                ssl.param_mut().set_host(&self.target.host)?;
            }
        }

        ssl.set_verify_callback(SslVerifyMode::PEER, move |preverify_ok, x509_ctx| {
            capture.lock().observe(preverify_ok, x509_ctx);
            true
        });

        Ok(ssl)
    }
}

/// Most specific description of a handshake failure
fn handshake_failure_cause<S>(err: HandshakeError<S>) -> String {
    match err {
        HandshakeError::SetupFailure(stack) => innermost_cause(&stack),
        HandshakeError::WouldBlock(mid) => {
            format!("timed out waiting for peer ({})", innermost_cause(mid.error()))
        }
        HandshakeError::Failure(mid) => innermost_cause(mid.error()),
    }
}

/// Walk `source()` to the innermost error and describe it
///
/// For an OpenSSL error stack the first entry is the one raised deepest in
/// the library; its reason string is used.
pub fn innermost_cause(err: &(dyn std::error::Error + 'static)) -> String {
    let mut current = err;
    while let Some(next) = current.source() {
        current = next;
    }

    if let Some(stack) = current.downcast_ref::<ErrorStack>() {
        if let Some(first) = stack.errors().first() {
            return first
                .reason()
                .map(|reason| reason.to_string())
                .unwrap_or_else(|| first.to_string());
        }
    }

    current.to_string()
}
