//! UDP transport to the device emulator.
//!
//! The emulator exposes its USB interface as a UDP endpoint where every
//! datagram carries exactly one 64-byte chunk. The socket is bound on the
//! first `open` and released on the last `close`.

use crate::transport::{
    DEFAULT_CHUNK_SIZE, OpenCount, Transport, TransportError, TransportResult, TransportStats,
};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

/// Default emulator address.
pub const DEFAULT_EMULATOR_ADDR: &str = "127.0.0.1:21324";

/// Shortest read timeout handed to the socket; zero means "block" to the OS.
const MIN_READ_TIMEOUT: Duration = Duration::from_millis(1);

/// UDP chunk transport.
pub struct UdpTransport {
    device: SocketAddr,
    socket: Option<UdpSocket>,
    chunk_size: usize,
    open_count: OpenCount,
    recv_buf: Vec<u8>,
    stats: TransportStats,
}

impl UdpTransport {
    /// Create a transport for the device listening at `device`.
    #[must_use]
    pub fn new(device: SocketAddr) -> Self {
        Self::with_chunk_size(device, DEFAULT_CHUNK_SIZE)
    }

    /// Create a transport with a non-default chunk size.
    #[must_use]
    pub fn with_chunk_size(device: SocketAddr, chunk_size: usize) -> Self {
        Self {
            device,
            socket: None,
            chunk_size,
            open_count: OpenCount::default(),
            // One spare byte detects oversized datagrams
            recv_buf: vec![0u8; chunk_size + 1],
            stats: TransportStats::new(),
        }
    }

    /// Address of the device endpoint.
    #[must_use]
    pub fn device_addr(&self) -> SocketAddr {
        self.device
    }

    /// Local address, if the socket is bound.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    fn bind(&self) -> io::Result<UdpSocket> {
        let domain = if self.device.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let local: SocketAddr = if self.device.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };

        let socket2 = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket2.bind(&local.into())?;
        socket2.connect(&self.device.into())?;

        let socket: UdpSocket = socket2.into();
        Ok(socket)
    }

    fn socket(&self) -> TransportResult<&UdpSocket> {
        self.socket.as_ref().ok_or(TransportError::Closed)
    }
}

impl Transport for UdpTransport {
    fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn open(&mut self) -> TransportResult<()> {
        if self.open_count.enter() {
            let socket = self.bind().inspect_err(|_| {
                self.open_count.leave();
            })?;
            tracing::debug!("UDP transport open: {} -> {}", socket.local_addr()?, self.device);
            self.socket = Some(socket);
        }
        Ok(())
    }

    fn close(&mut self) -> TransportResult<()> {
        if self.open_count.leave() {
            tracing::debug!("UDP transport closed: {}", self.device);
            self.socket = None;
        }
        Ok(())
    }

    fn write_chunk(&mut self, chunk: &[u8]) -> TransportResult<()> {
        if chunk.len() != self.chunk_size {
            return Err(TransportError::InvalidChunkSize {
                expected: self.chunk_size,
                actual: chunk.len(),
            });
        }
        let sent = self.socket()?.send(chunk)?;
        if sent != chunk.len() {
            return Err(TransportError::Other(format!(
                "short write: {sent} of {} bytes",
                chunk.len()
            )));
        }
        self.stats.record_send(sent);
        Ok(())
    }

    fn read_chunk(&mut self, timeout: Option<Duration>) -> TransportResult<Vec<u8>> {
        let read_timeout = timeout.map(|t| t.max(MIN_READ_TIMEOUT));
        let socket = self.socket.as_ref().ok_or(TransportError::Closed)?;
        socket.set_read_timeout(read_timeout)?;

        match socket.recv(&mut self.recv_buf) {
            Ok(n) if n == self.chunk_size => {
                self.stats.record_recv(n);
                Ok(self.recv_buf[..n].to_vec())
            }
            Ok(n) => Err(TransportError::InvalidChunkSize {
                expected: self.chunk_size,
                actual: n,
            }),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) =>
            {
                self.stats.record_timeout();
                Err(TransportError::Timeout(timeout.unwrap_or_default()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn stats(&self) -> TransportStats {
        self.stats.clone()
    }
}
