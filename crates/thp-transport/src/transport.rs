//! Transport trait abstraction for packet links to a device.
//!
//! A [`Transport`] moves fixed-size chunks (64 bytes on USB HID and the
//! emulator's UDP port) in both directions. It never retries or backs off;
//! the channel layer above owns all reliability.

use std::io;
use std::time::Duration;

/// Chunk size of USB HID reports and the emulator UDP link.
pub const DEFAULT_CHUNK_SIZE: usize = 64;

/// Transport layer errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// I/O error from underlying transport
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// No chunk arrived within the read timeout
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Transport is closed
    #[error("Transport is closed")]
    Closed,

    /// Chunk does not have the transport's fixed size
    #[error("Invalid chunk size: expected {expected}, got {actual}")]
    InvalidChunkSize {
        /// Fixed chunk size of the transport
        expected: usize,
        /// Size of the offending chunk
        actual: usize,
    },

    /// Transport-specific error
    #[error("Transport error: {0}")]
    Other(String),
}

impl TransportError {
    /// Whether this error is a read timeout.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Blocking chunk transport.
///
/// `open` and `close` are nestable: every `open` must be paired with a
/// `close`, and the link is only released when the last scope closes.
///
/// # Examples
///
/// ```no_run
/// use thp_transport::{Transport, UdpTransport};
/// use std::time::Duration;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let mut transport = UdpTransport::new("127.0.0.1:21324".parse()?);
/// transport.open()?;
/// transport.write_chunk(&[0u8; 64])?;
/// let chunk = transport.read_chunk(Some(Duration::from_millis(500)))?;
/// assert_eq!(chunk.len(), transport.chunk_size());
/// transport.close()?;
/// # Ok(())
/// # }
/// ```
pub trait Transport {
    /// Fixed size of every chunk written or read.
    fn chunk_size(&self) -> usize;

    /// Enter a connection scope.
    ///
    /// # Errors
    /// Returns `TransportError` if the link cannot be opened
    fn open(&mut self) -> TransportResult<()>;

    /// Leave a connection scope.
    ///
    /// # Errors
    /// Returns `TransportError` if releasing the link fails
    fn close(&mut self) -> TransportResult<()>;

    /// Write one chunk of exactly [`Transport::chunk_size`] bytes.
    ///
    /// # Errors
    /// Returns `TransportError` if the write fails
    fn write_chunk(&mut self, chunk: &[u8]) -> TransportResult<()>;

    /// Read one chunk, blocking for at most `timeout` (`None` blocks
    /// indefinitely).
    ///
    /// # Errors
    /// Returns [`TransportError::Timeout`] if nothing arrives in time
    fn read_chunk(&mut self, timeout: Option<Duration>) -> TransportResult<Vec<u8>>;

    /// Get transport statistics (optional).
    fn stats(&self) -> TransportStats {
        TransportStats::default()
    }
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn chunk_size(&self) -> usize {
        (**self).chunk_size()
    }

    fn open(&mut self) -> TransportResult<()> {
        (**self).open()
    }

    fn close(&mut self) -> TransportResult<()> {
        (**self).close()
    }

    fn write_chunk(&mut self, chunk: &[u8]) -> TransportResult<()> {
        (**self).write_chunk(chunk)
    }

    fn read_chunk(&mut self, timeout: Option<Duration>) -> TransportResult<Vec<u8>> {
        (**self).read_chunk(timeout)
    }

    fn stats(&self) -> TransportStats {
        (**self).stats()
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn chunk_size(&self) -> usize {
        (**self).chunk_size()
    }

    fn open(&mut self) -> TransportResult<()> {
        (**self).open()
    }

    fn close(&mut self) -> TransportResult<()> {
        (**self).close()
    }

    fn write_chunk(&mut self, chunk: &[u8]) -> TransportResult<()> {
        (**self).write_chunk(chunk)
    }

    fn read_chunk(&mut self, timeout: Option<Duration>) -> TransportResult<Vec<u8>> {
        (**self).read_chunk(timeout)
    }

    fn stats(&self) -> TransportStats {
        (**self).stats()
    }
}

/// Reference count for nestable `open`/`close` scopes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct OpenCount(usize);

impl OpenCount {
    /// Enter a scope. Returns `true` when this is the outermost one and the
    /// link must actually be opened.
    pub fn enter(&mut self) -> bool {
        self.0 += 1;
        self.0 == 1
    }

    /// Leave a scope. Returns `true` when the last scope closed and the link
    /// must actually be released. Unbalanced calls saturate at zero.
    pub fn leave(&mut self) -> bool {
        match self.0 {
            0 => false,
            n => {
                self.0 = n - 1;
                self.0 == 0
            }
        }
    }

    /// Whether any scope is open.
    #[must_use]
    pub fn is_open(self) -> bool {
        self.0 > 0
    }
}

/// Transport statistics
#[derive(Debug, Clone, Default)]
pub struct TransportStats {
    /// Total bytes sent
    pub bytes_sent: u64,
    /// Total bytes received
    pub bytes_received: u64,
    /// Total chunks sent
    pub chunks_sent: u64,
    /// Total chunks received
    pub chunks_received: u64,
    /// Reads that ended in a timeout
    pub timeouts: u64,
}

impl TransportStats {
    /// Create new empty statistics
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful send
    pub fn record_send(&mut self, bytes: usize) {
        self.bytes_sent += bytes as u64;
        self.chunks_sent += 1;
    }

    /// Record a successful receive
    pub fn record_recv(&mut self, bytes: usize) {
        self.bytes_received += bytes as u64;
        self.chunks_received += 1;
    }

    /// Record a read timeout
    pub fn record_timeout(&mut self) {
        self.timeouts += 1;
    }
}
