//! Probe orchestration
//!
//! A probe connects to the target, optionally splices in the record relay,
//! runs the handshake, stops the relay once the handshake has settled and
//! assembles the report.
//!
//! Teardown order is the same on every path. After a completed handshake
//! close_notify is sent first, while the relay is still forwarding. Then the
//! relay workers are joined, and the local endpoint and TCP connection are
//! closed last. The relay's end of the local pair therefore stays open for
//! as long as the engine can write to it.

use crate::net::{self, Target};
use crate::tls::{HandshakeConfig, HandshakeEngine, HandshakeReport, RecordRelay, Result};
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};

/// A configured probe against one target
#[derive(Debug, Clone)]
pub struct Probe {
    target: Target,
    config: HandshakeConfig,
}

impl Probe {
    /// Create a probe
    pub fn new(target: Target, config: HandshakeConfig) -> Self {
        Probe { target, config }
    }

    /// Target of this probe
    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Configuration of this probe
    pub fn config(&self) -> &HandshakeConfig {
        &self.config
    }

    /// Run the probe
    ///
    /// Returns a report for a completed handshake. Connection and handshake
    /// failures are returned as errors; relay failures are attached to the
    /// report instead.
    pub fn run(&self) -> Result<HandshakeReport> {
        let mut engine = HandshakeEngine::new(&self.target, &self.config)?;

        let transport = Transport::connect(&self.target, &self.config)?;

        if self.config.capture() {
            self.run_captured(&mut engine, &transport)
        } else {
            self.run_direct(&mut engine, &transport)
        }
    }

    fn run_direct(
        &self,
        engine: &mut HandshakeEngine,
        transport: &Transport,
    ) -> Result<HandshakeReport> {
        let (tls, negotiated) = engine.run(&transport.stream)?;

        let report = HandshakeReport::new(self.target.clone(), negotiated, Vec::new(), Vec::new());
        close_tls(tls);

        Ok(report)
    }

    fn run_captured(
        &self,
        engine: &mut HandshakeEngine,
        transport: &Transport,
    ) -> Result<HandshakeReport> {
        let (relay, local) = RecordRelay::start(&transport.stream, &self.config.relay_options())?;
        local.set_read_timeout(Some(self.config.io_timeout()))?;
        local.set_write_timeout(Some(self.config.io_timeout()))?;

        // close_notify goes out before the relay stops so the server sees it
        let outcome = engine.run(&local).map(|(tls, negotiated)| {
            close_tls(tls);
            negotiated
        });

        let (packets, relay_errors) = relay.stop();
        tracing::debug!(
            target = %self.target,
            records = packets.len(),
            relay_errors = relay_errors.len(),
            "relay stopped"
        );

        let negotiated = outcome?;

        Ok(HandshakeReport::new(
            self.target.clone(),
            negotiated,
            packets,
            relay_errors,
        ))
    }
}

/// Probe `target` once
pub fn probe(target: &Target, config: &HandshakeConfig) -> Result<HandshakeReport> {
    Probe::new(target.clone(), config.clone()).run()
}

/// Send close_notify without waiting for the peer's reply
fn close_tls<S: Read + Write>(mut tls: openssl::ssl::SslStream<S>) {
    if let Err(e) = tls.shutdown() {
        tracing::debug!(error = %e, "close_notify not sent");
    }
}

/// TCP connection that is shut down when dropped
struct Transport {
    target: Target,
    stream: TcpStream,
}

impl Transport {
    fn connect(target: &Target, config: &HandshakeConfig) -> Result<Self> {
        let stream = net::connect(target, config.connect_timeout())?;
        stream.set_read_timeout(Some(config.io_timeout()))?;
        stream.set_write_timeout(Some(config.io_timeout()))?;

        Ok(Transport {
            target: target.clone(),
            stream,
        })
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            if e.kind() != std::io::ErrorKind::NotConnected {
                tracing::debug!(target = %self.target, error = %e, "transport shutdown failed");
            }
        }
    }
}
