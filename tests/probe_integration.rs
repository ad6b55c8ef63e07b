//! End-to-end probes against an in-process OpenSSL server

mod common;

use common::{generate_pki, init_tracing, ServerOptions, TestServer};
use openssl::ssl::SslVersion;
use std::io::Write;
use std::time::{Duration, Instant};
use tlsprobe::tls::{CipherPolicy, HandshakeConfigBuilder};
use tlsprobe::{
    probe, Direction, HandshakeConfig, ProbeError, ProtocolConstraint, Target, TlsVersion,
    VerificationStatus,
};

fn base_config() -> HandshakeConfigBuilder {
    HandshakeConfig::builder()
        .default_trust(false)
        .io_timeout(Duration::from_secs(3))
        .poll_interval(Duration::from_millis(20))
}

fn local(port: u16) -> Target {
    Target::new("127.0.0.1", port)
}

#[test]
fn test_valid_certificate_without_capture() {
    init_tracing();
    let pki = generate_pki();
    let server = TestServer::spawn(ServerOptions::from_pki(&pki));

    let config = base_config()
        .trust_anchor(pki.ca_cert.clone())
        .build()
        .unwrap();
    let report = probe(&local(server.port), &config).unwrap();

    assert!(report.verification().is_none(), "{}", report);
    assert!(report.packets.is_empty());
    assert!(report.protocol.starts_with("TLSv1"));
    assert!(!report.cipher.is_empty());
    assert!(report.key_strength > 0);
    assert_eq!(report.servername, None);

    let leaf = report.certificate.leaf_info().unwrap();
    assert_eq!(leaf.subject, "localhost");
    assert_eq!(leaf.issuer, "tlsprobe test CA");
    assert!(leaf.subject_alt_names.contains(&"IP:127.0.0.1".to_string()));
    assert_eq!(report.certificate.chain.len(), 2);
    assert_eq!(report.get("tls.cert1.subject"), Some("tlsprobe test CA".to_string()));

    let wire = server.finish();
    assert!(wire.handshake_ok);
    assert!(wire.close_notify);
}

#[test]
fn test_capture_matches_wire_traffic() {
    init_tracing();
    let pki = generate_pki();
    let server = TestServer::spawn(ServerOptions::from_pki(&pki));

    let config = base_config()
        .trust_anchor(pki.ca_cert.clone())
        .capture(true)
        .build()
        .unwrap();
    let report = probe(&local(server.port), &config).unwrap();

    assert!(report.verification().is_none());
    assert!(report.relay_errors.is_empty(), "{:?}", report.relay_errors);
    assert!(!report.packets.is_empty());

    // Append order across directions is a race; only per-direction order holds
    let client_hello = report.packets_in(Direction::Outgoing).next().unwrap();
    assert_eq!(client_hello.content_type, 22);
    assert!(report.packets.iter().all(|r| r.is_consistent()));
    assert!(report.packets_in(Direction::Incoming).count() > 0);

    let wire = server.finish();
    assert!(wire.handshake_ok);
    assert!(wire.close_notify);

    // close_notify was relayed while capture was running
    let last = report.packets_in(Direction::Outgoing).last().unwrap();
    assert_eq!(last.content_type, 21);

    // Everything the client sent went through the relay and was logged
    assert_eq!(report.wire_bytes(Direction::Outgoing), wire.received);

    // The log may end before late server records (e.g. session tickets)
    let incoming = report.wire_bytes(Direction::Incoming);
    assert!(!incoming.is_empty());
    assert!(wire.sent.starts_with(&incoming));
}

#[test]
fn test_self_signed_certificate_is_reported() {
    init_tracing();
    let server = TestServer::spawn(ServerOptions::fixture());

    let config = base_config().build().unwrap();
    let report = probe(&local(server.port), &config).unwrap();

    let status = report.verification();
    assert!(status.contains(VerificationStatus::CHAIN_ERRORS));
    assert!(status.contains(VerificationStatus::NAME_MISMATCH));
    assert!(!status.contains(VerificationStatus::CERTIFICATE_NOT_AVAILABLE));
    assert!(!report.certificate.verify_errors.is_empty());
    assert_eq!(report.certificate.leaf_info().unwrap().subject, "example.com");

    server.finish();
}

#[test]
fn test_servername_override_drives_name_check() {
    init_tracing();
    let pki = generate_pki();

    let server = TestServer::spawn(ServerOptions::from_pki(&pki));
    let config = base_config()
        .trust_anchor(pki.ca_cert.clone())
        .servername("localhost")
        .build()
        .unwrap();
    let report = probe(&local(server.port), &config).unwrap();
    assert!(report.verification().is_none());
    assert_eq!(report.servername.as_deref(), Some("localhost"));
    server.finish();

    let server = TestServer::spawn(ServerOptions::from_pki(&pki));
    let config = base_config()
        .trust_anchor(pki.ca_cert.clone())
        .servername("wrong.example")
        .build()
        .unwrap();
    let report = probe(&local(server.port), &config).unwrap();
    assert_eq!(report.verification(), VerificationStatus::NAME_MISMATCH);
    server.finish();
}

#[test]
fn test_unsupported_protocol_fails() {
    init_tracing();
    let pki = generate_pki();

    for capture in [false, true] {
        let mut options = ServerOptions::from_pki(&pki);
        options.max_version = Some(SslVersion::TLS1_2);
        let server = TestServer::spawn(options);

        let config = base_config()
            .trust_anchor(pki.ca_cert.clone())
            .protocol(ProtocolConstraint::Only(TlsVersion::Tls13))
            .capture(capture)
            .build()
            .unwrap();

        let target = local(server.port);
        let start = Instant::now();
        let err = probe(&target, &config).unwrap_err();

        match &err {
            ProbeError::Handshake { target: t, cause } => {
                assert_eq!(t, &target);
                assert!(!cause.is_empty());
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(start.elapsed() < Duration::from_secs(5));

        assert!(!server.finish().handshake_ok);
    }
}

#[test]
fn test_pinned_tls12_with_cipher_list() {
    init_tracing();
    let pki = generate_pki();
    let server = TestServer::spawn(ServerOptions::from_pki(&pki));

    let config = base_config()
        .trust_anchor(pki.ca_cert.clone())
        .version(TlsVersion::Tls12)
        .cipher_policy(CipherPolicy::cipher_list("ECDHE-ECDSA-AES128-GCM-SHA256"))
        .capture(true)
        .build()
        .unwrap();
    let report = probe(&local(server.port), &config).unwrap();

    assert_eq!(report.protocol, "TLSv1.2");
    assert_eq!(report.cipher, "ECDHE-ECDSA-AES128-GCM-SHA256");
    assert_eq!(report.key_strength, 128);

    // ChangeCipherSpec is visible in the clear under TLS 1.2
    assert!(report
        .packets_in(Direction::Outgoing)
        .any(|r| r.content_type == 20));

    server.finish();
}

#[test]
fn test_tls13_ciphersuite() {
    init_tracing();
    let pki = generate_pki();
    let server = TestServer::spawn(ServerOptions::from_pki(&pki));

    let config = base_config()
        .trust_anchor(pki.ca_cert.clone())
        .version(TlsVersion::Tls13)
        .cipher_policy(CipherPolicy::ciphersuites("TLS_AES_128_GCM_SHA256"))
        .build()
        .unwrap();
    let report = probe(&local(server.port), &config).unwrap();

    assert_eq!(report.protocol, "TLSv1.3");
    assert_eq!(report.cipher, "TLS_AES_128_GCM_SHA256");
    assert_eq!(report.key_strength, 128);
    assert_eq!(report.get("tls.version"), Some("TLSv1.3".to_string()));

    server.finish();
}

#[test]
fn test_trust_from_ca_file() {
    init_tracing();
    let pki = generate_pki();
    let server = TestServer::spawn(ServerOptions::from_pki(&pki));

    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&pki.ca_cert.to_pem().unwrap()).unwrap();
    file.flush().unwrap();

    let config = base_config()
        .ca_file(file.path())
        .unwrap()
        .build()
        .unwrap();
    let report = probe(&local(server.port), &config).unwrap();
    assert!(report.verification().is_none());

    server.finish();
}

#[test]
fn test_untrusted_ca_is_chain_error() {
    init_tracing();
    let pki = generate_pki();
    let other = generate_pki();
    let server = TestServer::spawn(ServerOptions::from_pki(&pki));

    let config = base_config()
        .trust_anchor(other.ca_cert.clone())
        .build()
        .unwrap();
    let report = probe(&local(server.port), &config).unwrap();

    // Name matches; only the chain is at fault
    assert_eq!(report.verification(), VerificationStatus::CHAIN_ERRORS);

    server.finish();
}
