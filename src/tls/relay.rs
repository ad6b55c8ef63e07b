//! Record-capturing relay
//!
//! The relay is spliced between the handshake engine and the real socket.
//! OpenSSL talks to one end of a `UnixStream` pair; two worker threads move
//! bytes between the other end and the `TcpStream`, one per direction. Each
//! worker frames its traffic into TLS records, forwards every record
//! unmodified and appends a copy to a shared capture log.
//!
//! Workers never block indefinitely. Reads are preceded by a `poll(2)` bounded
//! by the configured interval and writes are issued in slices of the same
//! length, so the cancel flag is seen within one interval. Once cancelled, a
//! worker keeps draining bytes that are already readable for at most one more
//! interval, then exits. Bytes written by the engine before the relay was
//! stopped are therefore forwarded even if the peer never goes quiet.

use super::error::RelayError;
use super::record::{Direction, Record, RecordHeader, RECORD_HEADER_SIZE};
use super::Result;
use crate::net::Endpoint;
use parking_lot::Mutex;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Default wait between cancellation checks
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Shared append-only capture log
pub type CaptureLog = Arc<Mutex<Vec<Record>>>;

static ACTIVE_WORKERS: AtomicUsize = AtomicUsize::new(0);

/// Relay timing options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayOptions {
    /// Upper bound on a single wait for readable data
    pub poll_interval: Duration,
    /// How long a write may make no progress before failing (`None` = until cancelled)
    pub write_timeout: Option<Duration>,
}

impl Default for RelayOptions {
    fn default() -> Self {
        RelayOptions {
            poll_interval: DEFAULT_POLL_INTERVAL,
            write_timeout: Some(Duration::from_secs(10)),
        }
    }
}

/// Running relay with its two forwarding workers
pub struct RecordRelay {
    cancel: Arc<AtomicBool>,
    log: CaptureLog,
    workers: Vec<(Direction, JoinHandle<std::result::Result<(), RelayError>>)>,
}

impl RecordRelay {
    /// Splice a relay onto a connected transport
    ///
    /// Returns the relay and the local endpoint the handshake engine must use
    /// in place of `transport`.
    pub fn start(transport: &TcpStream, options: &RelayOptions) -> Result<(Self, UnixStream)> {
        let (local, relay_end) = UnixStream::pair()?;

        let relay = Self::splice(
            transport.try_clone()?,
            transport.try_clone()?,
            relay_end.try_clone()?,
            relay_end,
            options,
        )?;

        Ok((relay, local))
    }

    /// Start workers over explicit endpoint handles
    ///
    /// `transport_rx`/`transport_tx` and `local_rx`/`local_tx` are handles to
    /// the same underlying stream, one per worker.
    pub fn splice<T, L>(
        transport_rx: T,
        transport_tx: T,
        local_rx: L,
        local_tx: L,
        options: &RelayOptions,
    ) -> Result<Self>
    where
        T: Endpoint + 'static,
        L: Endpoint + 'static,
    {
        // Each blocking write returns after one interval so cancellation is seen
        transport_tx.set_write_timeout(Some(options.poll_interval))?;
        local_tx.set_write_timeout(Some(options.poll_interval))?;

        let mut relay = RecordRelay {
            cancel: Arc::new(AtomicBool::new(false)),
            log: Arc::new(Mutex::new(Vec::new())),
            workers: Vec::with_capacity(2),
        };

        // If the second spawn fails, Drop stops the first worker
        relay.spawn(Direction::Outgoing, local_rx, transport_tx, options)?;
        relay.spawn(Direction::Incoming, transport_rx, local_tx, options)?;

        Ok(relay)
    }

    fn spawn<R, W>(
        &mut self,
        direction: Direction,
        source: R,
        sink: W,
        options: &RelayOptions,
    ) -> Result<()>
    where
        R: Endpoint + 'static,
        W: Endpoint + 'static,
    {
        let worker = Worker {
            direction,
            source,
            sink,
            cancel: Arc::clone(&self.cancel),
            log: Arc::clone(&self.log),
            poll_interval: options.poll_interval,
            write_timeout: options.write_timeout,
            drain_deadline: None,
        };

        let guard = WorkerGuard::new();
        let handle = thread::Builder::new()
            .name(format!("tlsprobe-relay-{}", direction))
            .spawn(move || {
                let _guard = guard;
                worker.run()
            })?;

        self.workers.push((direction, handle));
        Ok(())
    }

    /// Whether any worker is still running
    pub fn is_running(&self) -> bool {
        self.workers.iter().any(|(_, handle)| !handle.is_finished())
    }

    /// Number of relay workers alive in this process
    pub fn active_workers() -> usize {
        ACTIVE_WORKERS.load(Ordering::Acquire)
    }

    /// Cancel both workers, wait for them and return the capture
    ///
    /// Worker failures are returned alongside the records, never as an error.
    pub fn stop(mut self) -> (Vec<Record>, Vec<RelayError>) {
        let errors = self.shutdown();
        let records = std::mem::take(&mut *self.log.lock());
        (records, errors)
    }

    fn shutdown(&mut self) -> Vec<RelayError> {
        self.cancel.store(true, Ordering::Release);

        let mut errors = Vec::new();
        for (direction, handle) in self.workers.drain(..) {
            let outcome = match handle.join() {
                Ok(outcome) => outcome,
                Err(_) => Err(RelayError::Panicked { direction }),
            };

            if let Err(e) = outcome {
                tracing::warn!(%direction, error = %e, "relay worker failed");
                errors.push(e);
            }
        }

        errors
    }
}

impl Drop for RecordRelay {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            self.shutdown();
        }
    }
}

/// Keeps `ACTIVE_WORKERS` in step with live worker threads, panics included
struct WorkerGuard;

impl WorkerGuard {
    fn new() -> Self {
        ACTIVE_WORKERS.fetch_add(1, Ordering::AcqRel);
        WorkerGuard
    }
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        ACTIVE_WORKERS.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Outcome of filling a buffer from a source
enum Fill {
    Complete,
    Cancelled,
    Eof(usize),
}

/// Outcome of forwarding bytes to the sink
enum Sent {
    Complete,
    Cancelled,
}

/// One forwarding direction
struct Worker<R, W> {
    direction: Direction,
    source: R,
    sink: W,
    cancel: Arc<AtomicBool>,
    log: CaptureLog,
    poll_interval: Duration,
    write_timeout: Option<Duration>,
    drain_deadline: Option<Instant>,
}

impl<R: Endpoint, W: Endpoint> Worker<R, W> {
    fn run(mut self) -> std::result::Result<(), RelayError> {
        let outcome = self.relay_records();
        if outcome.is_err() {
            // Let the opposite side see EOF instead of waiting on a dead worker
            let _ = self.sink.shutdown_write();
        }
        outcome
    }

    fn relay_records(&mut self) -> std::result::Result<(), RelayError> {
        let direction = self.direction;
        let mut header = [0u8; RECORD_HEADER_SIZE];
        let mut payload = Vec::new();

        loop {
            match self.fill(&mut header)? {
                Fill::Complete => {}
                Fill::Cancelled => return Ok(()),
                Fill::Eof(0) => {
                    tracing::debug!(%direction, "relay source closed");
                    let _ = self.sink.shutdown_write();
                    return Ok(());
                }
                Fill::Eof(got) => {
                    return Err(self.truncated(&header[..got], RECORD_HEADER_SIZE));
                }
            }

            let parsed = RecordHeader::decode(&header);
            payload.clear();
            payload.resize(parsed.payload_len(), 0);

            match self.fill(&mut payload)? {
                Fill::Complete => {}
                Fill::Cancelled => return Ok(()),
                Fill::Eof(got) => {
                    let mut partial = header.to_vec();
                    partial.extend_from_slice(&payload[..got]);
                    return Err(self.truncated(&partial, parsed.record_len()));
                }
            }

            let record = Record::assemble(direction, parsed, &payload);

            match self.forward(&record.data)? {
                Sent::Complete => {}
                Sent::Cancelled => return Ok(()),
            }

            tracing::debug!(record = %record, "captured record");
            self.log.lock().push(record);
        }
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    /// Whether the post-cancellation drain window has closed
    fn drain_expired(&mut self) -> bool {
        if !self.cancelled() {
            return false;
        }
        let poll_interval = self.poll_interval;
        let deadline = *self
            .drain_deadline
            .get_or_insert_with(|| Instant::now() + poll_interval);
        Instant::now() >= deadline
    }

    /// Read until `buf` is full, the source closes, or cancellation is seen
    ///
    /// After cancellation only bytes that are already readable are taken.
    fn fill(&mut self, buf: &mut [u8]) -> std::result::Result<Fill, RelayError> {
        let mut filled = 0;

        while filled < buf.len() {
            if self.drain_expired() {
                return Ok(Fill::Cancelled);
            }

            let wait = if self.cancelled() {
                Duration::ZERO
            } else {
                self.poll_interval
            };
            let readable = self
                .source
                .wait_readable(wait)
                .map_err(|e| self.io_error(e))?;

            if !readable {
                if self.cancelled() {
                    return Ok(Fill::Cancelled);
                }
                continue;
            }

            match self.source.read(&mut buf[filled..]) {
                Ok(0) => return Ok(Fill::Eof(filled)),
                Ok(n) => filled += n,
                Err(e)
                    if e.kind() == io::ErrorKind::Interrupted
                        || e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(self.io_error(e)),
            }
        }

        Ok(Fill::Complete)
    }

    /// Write all of `bytes`, giving up quietly once cancelled
    ///
    /// The sink's write timeout is one poll interval; each expiry is a chance
    /// to observe cancellation. A write failure after cancellation is part of
    /// shutting down and not reported.
    fn forward(&mut self, bytes: &[u8]) -> std::result::Result<Sent, RelayError> {
        let mut written = 0;
        let mut stalled = Duration::ZERO;

        while written < bytes.len() {
            match self.sink.write(&bytes[written..]) {
                Ok(0) => return Err(self.io_error(io::ErrorKind::WriteZero.into())),
                Ok(n) => {
                    written += n;
                    stalled = Duration::ZERO;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    if self.cancelled() {
                        return Ok(Sent::Cancelled);
                    }
                    stalled += self.poll_interval;
                    if self.write_timeout.map_or(false, |limit| stalled >= limit) {
                        return Err(self.io_error(e));
                    }
                }
                Err(_) if self.cancelled() => return Ok(Sent::Cancelled),
                Err(e) => return Err(self.io_error(e)),
            }
        }

        match self.sink.flush() {
            Ok(()) => Ok(Sent::Complete),
            Err(_) if self.cancelled() => Ok(Sent::Cancelled),
            Err(e) => Err(self.io_error(e)),
        }
    }

    /// Pass a partial record through and close the opposite side
    fn truncated(&mut self, partial: &[u8], expected: usize) -> RelayError {
        let _ = self.forward(partial);
        let _ = self.sink.shutdown_write();

        RelayError::Truncated {
            direction: self.direction,
            expected,
            got: partial.len(),
        }
    }

    fn io_error(&self, source: io::Error) -> RelayError {
        RelayError::Io {
            direction: self.direction,
            source,
        }
    }
}
