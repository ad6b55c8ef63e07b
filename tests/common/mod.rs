//! Shared helpers for integration tests
//!
//! Provides an in-process OpenSSL server that records every byte it reads
//! from and writes to the wire, and a small generated PKI (CA + leaf for
//! `localhost` / `127.0.0.1`).

#![allow(dead_code)]

use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::ssl::{
    select_next_proto, AlpnError, ShutdownState, Ssl, SslContextBuilder, SslMethod, SslVersion,
};
use openssl::x509::extension::{
    BasicConstraints, ExtendedKeyUsage, KeyUsage, SubjectAlternativeName,
};
use openssl::x509::{X509Builder, X509NameBuilder, X509};
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Self-signed RSA certificate and key for CN=example.com
pub const FIXTURE_PEM: &str = include_str!("../fixtures/example.com.pem");

/// Install a test-writer subscriber once
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Certificate authority and a leaf issued by it
pub struct TestPki {
    pub ca_cert: X509,
    pub ca_key: PKey<Private>,
    pub leaf_cert: X509,
    pub leaf_key: PKey<Private>,
}

fn ec_key() -> PKey<Private> {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
    PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap()
}

fn name(cn: &str) -> openssl::x509::X509Name {
    let mut builder = X509NameBuilder::new().unwrap();
    builder.append_entry_by_nid(Nid::COMMONNAME, cn).unwrap();
    builder.build()
}

fn serial(n: u32) -> openssl::asn1::Asn1Integer {
    BigNum::from_u32(n).unwrap().to_asn1_integer().unwrap()
}

/// Generate a CA and a leaf valid for `localhost` and `127.0.0.1`
pub fn generate_pki() -> TestPki {
    let ca_key = ec_key();
    let ca_name = name("tlsprobe test CA");

    let mut ca = X509Builder::new().unwrap();
    ca.set_version(2).unwrap();
    ca.set_serial_number(&serial(1)).unwrap();
    ca.set_subject_name(&ca_name).unwrap();
    ca.set_issuer_name(&ca_name).unwrap();
    ca.set_pubkey(&ca_key).unwrap();
    ca.set_not_before(&Asn1Time::days_from_now(0).unwrap()).unwrap();
    ca.set_not_after(&Asn1Time::days_from_now(30).unwrap()).unwrap();
    ca.append_extension(BasicConstraints::new().critical().ca().build().unwrap())
        .unwrap();
    ca.append_extension(
        KeyUsage::new()
            .critical()
            .key_cert_sign()
            .crl_sign()
            .build()
            .unwrap(),
    )
    .unwrap();
    ca.sign(&ca_key, MessageDigest::sha256()).unwrap();
    let ca_cert = ca.build();

    let leaf_key = ec_key();
    let mut leaf = X509Builder::new().unwrap();
    leaf.set_version(2).unwrap();
    leaf.set_serial_number(&serial(2)).unwrap();
    leaf.set_subject_name(&name("localhost")).unwrap();
    leaf.set_issuer_name(ca_cert.subject_name()).unwrap();
    leaf.set_pubkey(&leaf_key).unwrap();
    leaf.set_not_before(&Asn1Time::days_from_now(0).unwrap()).unwrap();
    leaf.set_not_after(&Asn1Time::days_from_now(30).unwrap()).unwrap();
    leaf.append_extension(BasicConstraints::new().build().unwrap())
        .unwrap();
    leaf.append_extension(
        KeyUsage::new()
            .critical()
            .digital_signature()
            .build()
            .unwrap(),
    )
    .unwrap();
    leaf.append_extension(ExtendedKeyUsage::new().server_auth().build().unwrap())
        .unwrap();
    let san = SubjectAlternativeName::new()
        .dns("localhost")
        .ip("127.0.0.1")
        .build(&leaf.x509v3_context(Some(&ca_cert), None))
        .unwrap();
    leaf.append_extension(san).unwrap();
    leaf.sign(&ca_key, MessageDigest::sha256()).unwrap();

    TestPki {
        ca_cert,
        ca_key,
        leaf_cert: leaf.build(),
        leaf_key,
    }
}

/// Server configuration
pub struct ServerOptions {
    pub cert: X509,
    pub key: PKey<Private>,
    pub chain: Vec<X509>,
    pub max_version: Option<SslVersion>,
    pub alpn: Option<&'static [u8]>,
    /// Write application data non-stop once the handshake is done
    pub stream_after_accept: bool,
}

impl ServerOptions {
    /// Serve the generated leaf with its CA in the chain
    pub fn from_pki(pki: &TestPki) -> Self {
        ServerOptions {
            cert: pki.leaf_cert.clone(),
            key: pki.leaf_key.clone(),
            chain: vec![pki.ca_cert.clone()],
            max_version: None,
            alpn: None,
            stream_after_accept: false,
        }
    }

    /// Serve the bundled self-signed example.com certificate
    pub fn fixture() -> Self {
        ServerOptions {
            cert: X509::from_pem(FIXTURE_PEM.as_bytes()).unwrap(),
            key: PKey::private_key_from_pem(FIXTURE_PEM.as_bytes()).unwrap(),
            chain: Vec::new(),
            max_version: None,
            alpn: None,
            stream_after_accept: false,
        }
    }
}

/// Bytes seen by the server, in wire order
#[derive(Debug, Default)]
pub struct WireLog {
    pub received: Vec<u8>,
    pub sent: Vec<u8>,
    pub handshake_ok: bool,
    pub close_notify: bool,
}

/// TCP stream that records raw traffic
#[derive(Debug)]
struct RecordingStream {
    inner: TcpStream,
    log: Arc<Mutex<WireLog>>,
}

impl Read for RecordingStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.log.lock().unwrap().received.extend_from_slice(&buf[..n]);
        Ok(n)
    }
}

impl Write for RecordingStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.log.lock().unwrap().sent.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// One-connection TLS server
pub struct TestServer {
    pub port: u16,
    handle: JoinHandle<()>,
    log: Arc<Mutex<WireLog>>,
}

impl TestServer {
    /// Accept one connection on 127.0.0.1 and serve it
    pub fn spawn(options: ServerOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let log = Arc::new(Mutex::new(WireLog::default()));
        let server_log = Arc::clone(&log);

        let mut ctx = SslContextBuilder::new(SslMethod::tls_server()).unwrap();
        ctx.set_certificate(&options.cert).unwrap();
        ctx.set_private_key(&options.key).unwrap();
        for cert in options.chain {
            ctx.add_extra_chain_cert(cert).unwrap();
        }
        if let Some(version) = options.max_version {
            ctx.set_max_proto_version(Some(version)).unwrap();
        }
        if let Some(protos) = options.alpn {
            ctx.set_alpn_select_callback(move |_ssl, client_protos| {
                select_next_proto(protos, client_protos).ok_or(AlpnError::NOACK)
            });
        }
        let ctx = ctx.build();
        let stream_after_accept = options.stream_after_accept;

        let handle = thread::spawn(move || {
            let (tcp, _) = listener.accept().unwrap();
            tcp.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
            tcp.set_write_timeout(Some(Duration::from_secs(5))).unwrap();

            let stream = RecordingStream {
                inner: tcp,
                log: Arc::clone(&server_log),
            };

            let ssl = Ssl::new(&ctx).unwrap();
            if let Ok(mut tls) = ssl.accept(stream) {
                server_log.lock().unwrap().handshake_ok = true;

                if stream_after_accept {
                    // Until the client goes away
                    let chunk = [0x5au8; 4096];
                    while tls.write_all(&chunk).is_ok() {}
                } else {
                    // Wait for the client to go away
                    let mut buf = [0u8; 256];
                    while let Ok(n) = tls.read(&mut buf) {
                        if n == 0 {
                            break;
                        }
                    }
                }

                let received = tls.get_shutdown().contains(ShutdownState::RECEIVED);
                server_log.lock().unwrap().close_notify = received;
            }
        });

        TestServer { port, handle, log }
    }

    /// Wait for the connection to finish and return the wire log
    pub fn finish(self) -> WireLog {
        self.handle.join().unwrap();
        let mut log = self.log.lock().unwrap();
        std::mem::take(&mut *log)
    }
}
