//! Byte transports and the buffered link the session reads replies through.
//!
//! A [`Transport`] only moves bytes. Framing (line delimiters and
//! definite-length blocks) is layered on top by `Link`, which keeps any
//! bytes received past the end of one reply for the next read.

use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use crate::error::VnaError;

/// Raw SCPI socket port used by most LAN instruments
pub const DEFAULT_SCPI_PORT: u16 = 5025;

const SCRATCH_SIZE: usize = 64 * 1024;

/// A duplex byte channel to the instrument.
///
/// `receive` follows the conventions of [`std::io::Read`] on a socket with a
/// read timeout: `Ok(0)` means the peer closed the connection, and an error of
/// kind [`io::ErrorKind::TimedOut`] or [`io::ErrorKind::WouldBlock`] means
/// nothing arrived within `timeout`.
pub trait Transport {
    fn send(&mut self, data: &[u8]) -> io::Result<()>;

    fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;

    /// Largest write the transport accepts in one call, if it has a limit
    fn max_frame_size(&self) -> Option<usize> {
        None
    }

    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send(&mut self, data: &[u8]) -> io::Result<()> {
        (**self).send(data)
    }

    fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        (**self).receive(buf, timeout)
    }

    fn max_frame_size(&self) -> Option<usize> {
        (**self).max_frame_size()
    }

    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }
}

/// Timeouts for establishing and writing to a TCP connection.
///
/// Read deadlines are per operation and come from
/// [`SessionConfig`](crate::SessionConfig).
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub connect_timeout: Duration,
    pub write_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
        }
    }
}

/// Raw SCPI socket transport (LAN)
pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    pub fn connect(address: &str, port: u16, config: &ConnectionConfig) -> Result<Self, VnaError> {
        let socket_addr = (address, port)
            .to_socket_addrs()
            .map_err(|_| VnaError::InvalidAddress(format!("{address}:{port}")))?
            .next()
            .ok_or_else(|| VnaError::InvalidAddress(format!("{address}:{port}")))?;

        debug!("Connecting to instrument at {socket_addr}");

        let stream = TcpStream::connect_timeout(&socket_addr, config.connect_timeout).map_err(|e| {
            warn!("Failed to connect to {socket_addr}: {e}");
            if e.kind() == io::ErrorKind::TimedOut {
                VnaError::Timeout(config.connect_timeout)
            } else {
                VnaError::Io {
                    source: e,
                    context: format!("Failed to connect to {socket_addr}"),
                }
            }
        })?;

        let io_err = |source| VnaError::Io {
            source,
            context: "Configuring socket".to_string(),
        };
        stream.set_write_timeout(Some(config.write_timeout)).map_err(io_err)?;
        stream.set_nodelay(true).map_err(io_err)?;

        Ok(Self { stream })
    }
}

impl Transport for TcpTransport {
    fn send(&mut self, data: &[u8]) -> io::Result<()> {
        self.stream.write_all(data)?;
        self.stream.flush()
    }

    fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        // A zero read timeout is rejected by the socket API
        self.stream
            .set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;
        self.stream.read(buf)
    }

    fn close(&mut self) -> io::Result<()> {
        self.stream.shutdown(std::net::Shutdown::Both)
    }
}

/// Absolute deadline for one operation, remembering the budget it was given
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
    budget: Duration,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
            budget,
        }
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// Time left, or `None` once the deadline has passed
    pub fn remaining(&self) -> Option<Duration> {
        let now = Instant::now();
        if now >= self.at {
            None
        } else {
            Some(self.at - now)
        }
    }
}

/// Why a read stopped before it was satisfied
#[derive(Debug)]
pub(crate) enum ReadFailure {
    TimedOut,
    Closed,
    /// More than this many bytes arrived without a delimiter
    Overflow(usize),
    Io(io::Error),
}

/// A read that ended early, with the number of bytes that did arrive
#[derive(Debug)]
pub(crate) struct ShortRead {
    pub got: usize,
    pub cause: ReadFailure,
}

/// A write that ended early, with the number of bytes already handed over
#[derive(Debug)]
pub(crate) struct ShortWrite {
    pub sent: usize,
    pub source: io::Error,
}

/// Buffered, delimiter-aware view over a transport
pub(crate) struct Link<T: Transport> {
    transport: T,
    delimiter: Vec<u8>,
    max_line: usize,
    rx: Vec<u8>,
    scratch: Vec<u8>,
}

impl<T: Transport> Link<T> {
    pub fn new(transport: T, delimiter: Vec<u8>, max_line: usize) -> Self {
        Self {
            transport,
            delimiter,
            max_line,
            rx: Vec::new(),
            scratch: vec![0u8; SCRATCH_SIZE],
        }
    }

    pub fn delimiter(&self) -> &[u8] {
        &self.delimiter
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Write all of `data`, split into frames when the transport has a limit.
    /// Returns the number of bytes handed to the transport.
    pub fn send(&mut self, data: &[u8]) -> Result<usize, ShortWrite> {
        let frame = self
            .transport
            .max_frame_size()
            .filter(|&n| n > 0)
            .unwrap_or(data.len().max(1));

        let mut sent = 0;
        for chunk in data.chunks(frame) {
            if let Err(source) = self.transport.send(chunk) {
                return Err(ShortWrite { sent, source });
            }
            sent += chunk.len();
        }
        trace!("Sent {} bytes in frames of {}", sent, frame);
        Ok(sent)
    }

    /// Pull at least one more byte into the receive buffer.
    ///
    /// Only reports `TimedOut` once the deadline has actually passed, even if
    /// the transport gives up early.
    fn fill(&mut self, deadline: &Deadline) -> Result<(), ReadFailure> {
        loop {
            let remaining = deadline.remaining().ok_or(ReadFailure::TimedOut)?;
            match self.transport.receive(&mut self.scratch, remaining) {
                Ok(0) => return Err(ReadFailure::Closed),
                Ok(n) => {
                    trace!(
                        "Received {} bytes: {:02x?}",
                        n,
                        &self.scratch[..n.min(32)]
                    );
                    self.rx.extend_from_slice(&self.scratch[..n]);
                    return Ok(());
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::TimedOut
                            | io::ErrorKind::WouldBlock
                            | io::ErrorKind::Interrupted
                    ) =>
                {
                    continue
                }
                Err(e) => return Err(ReadFailure::Io(e)),
            }
        }
    }

    /// Read one delimiter-terminated reply, without the delimiter.
    ///
    /// Gives up with `Overflow` on a line longer than `max_line` bytes,
    /// without waiting for its delimiter.
    pub fn read_line(&mut self, deadline: &Deadline) -> Result<Vec<u8>, ReadFailure> {
        let mut searched = 0;
        loop {
            if let Some(pos) = find(&self.rx[searched..], &self.delimiter).map(|p| p + searched) {
                if pos > self.max_line {
                    self.rx.clear();
                    return Err(ReadFailure::Overflow(self.max_line));
                }
                let rest = self.rx.split_off(pos + self.delimiter.len());
                let mut line = std::mem::replace(&mut self.rx, rest);
                line.truncate(pos);
                return Ok(line);
            }
            if self.rx.len() >= self.max_line + self.delimiter.len() {
                self.rx.clear();
                return Err(ReadFailure::Overflow(self.max_line));
            }
            // The delimiter may straddle the next read
            searched = self.rx.len().saturating_sub(self.delimiter.len().saturating_sub(1));
            self.fill(deadline)?;
        }
    }

    /// Read exactly `n` bytes regardless of their content
    pub fn read_exact(&mut self, n: usize, deadline: &Deadline) -> Result<Vec<u8>, ShortRead> {
        while self.rx.len() < n {
            if let Err(cause) = self.fill(deadline) {
                // What arrived is dropped; a short block is never handed out
                let got = self.rx.len();
                self.rx.clear();
                return Err(ShortRead { got, cause });
            }
        }
        let rest = self.rx.split_off(n);
        Ok(std::mem::replace(&mut self.rx, rest))
    }

    pub fn close(&mut self) -> io::Result<()> {
        self.rx.clear();
        self.transport.close()
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
