//! Network plumbing for the probe
//!
//! This module resolves and connects to the probe target and defines the
//! `Endpoint` abstraction used by the record relay. An endpoint is a byte
//! stream backed by a file descriptor, which lets the relay wait for
//! readability with a bounded `poll(2)` instead of an unbounded blocking read.

use crate::tls::ProbeError;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{IpAddr, Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::time::Duration;

/// Default TLS port
pub const DEFAULT_PORT: u16 = 443;

/// Probe target (host and port)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    /// Host name or IP literal
    pub host: String,
    /// TCP port
    pub port: u16,
}

impl Target {
    /// Create a new target
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Target {
            host: host.into(),
            port,
        }
    }

    /// Parse `host`, `host:port`, `[v6]` or `[v6]:port`
    ///
    /// The port defaults to 443 when absent.
    pub fn parse(s: &str) -> Result<Self, ProbeError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ProbeError::Config("empty target".to_string()));
        }

        if let Some(rest) = s.strip_prefix('[') {
            let end = rest
                .find(']')
                .ok_or_else(|| ProbeError::Config(format!("unterminated IPv6 literal: {}", s)))?;
            let host = &rest[..end];
            let port = match &rest[end + 1..] {
                "" => DEFAULT_PORT,
                tail => Self::parse_port(tail.strip_prefix(':').unwrap_or(tail), s)?,
            };
            return Ok(Target::new(host, port));
        }

        // A bare IPv6 literal has more than one colon
        if s.matches(':').count() > 1 {
            return Ok(Target::new(s, DEFAULT_PORT));
        }

        match s.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => {
                Ok(Target::new(host, Self::parse_port(port, s)?))
            }
            Some(_) => Err(ProbeError::Config(format!("missing host: {}", s))),
            None => Ok(Target::new(s, DEFAULT_PORT)),
        }
    }

    fn parse_port(port: &str, whole: &str) -> Result<u16, ProbeError> {
        port.parse::<u16>()
            .map_err(|_| ProbeError::Config(format!("invalid port in target: {}", whole)))
    }

    /// The host as an IP address, if it is an IP literal
    pub fn ip(&self) -> Option<IpAddr> {
        self.host.parse().ok()
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Resolve the target and open a TCP connection
///
/// Every resolved address is tried in order. The last connect error is
/// reported if none succeeds.
pub fn connect(target: &Target, timeout: Duration) -> Result<TcpStream, ProbeError> {
    let addrs: Vec<SocketAddr> = (target.host.as_str(), target.port)
        .to_socket_addrs()
        .map_err(|e| ProbeError::Connection {
            target: target.clone(),
            source: e,
        })?
        .collect();

    let mut last_err = io::Error::new(io::ErrorKind::NotFound, "no addresses resolved");

    for addr in addrs {
        match connect_addr(&addr, timeout) {
            Ok(stream) => {
                tracing::info!(%target, %addr, "connected");
                return Ok(stream);
            }
            Err(e) => {
                tracing::debug!(%target, %addr, error = %e, "connect attempt failed");
                last_err = e;
            }
        }
    }

    Err(ProbeError::Connection {
        target: target.clone(),
        source: last_err,
    })
}

fn connect_addr(addr: &SocketAddr, timeout: Duration) -> io::Result<TcpStream> {
    let socket = Socket::new(Domain::for_address(*addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.connect_timeout(&SockAddr::from(*addr), timeout)?;
    socket.set_nodelay(true)?;
    Ok(socket.into())
}

/// A file-descriptor backed byte stream usable by the relay
pub trait Endpoint: Read + Write + AsRawFd + Send {
    /// Stop sending on this endpoint so the peer observes EOF
    fn shutdown_write(&self) -> io::Result<()>;

    /// Bound blocking writes
    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

    /// Wait until the endpoint is readable or the timeout elapses
    ///
    /// Returns true if a read would not block (data, EOF or error pending).
    /// A wait interrupted by a signal reports false.
    fn wait_readable(&self, timeout: Duration) -> io::Result<bool> {
        poll_readable(self.as_raw_fd(), timeout)
    }
}

impl Endpoint for TcpStream {
    fn shutdown_write(&self) -> io::Result<()> {
        self.shutdown(Shutdown::Write)
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_write_timeout(self, timeout)
    }
}

impl Endpoint for UnixStream {
    fn shutdown_write(&self) -> io::Result<()> {
        self.shutdown(Shutdown::Write)
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        UnixStream::set_write_timeout(self, timeout)
    }
}

fn poll_readable(fd: RawFd, timeout: Duration) -> io::Result<bool> {
    use libc::{poll, pollfd, POLLIN};

    let mut pfd = pollfd {
        fd,
        events: POLLIN,
        revents: 0,
    };

    let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;

    let result = unsafe { poll(&mut pfd as *mut pollfd, 1, timeout_ms) };

    if result < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(err);
    }

    Ok(result > 0)
}
