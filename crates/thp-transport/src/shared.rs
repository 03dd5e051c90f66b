//! One device link shared by several channels.
//!
//! Channels are not thread-safe and each exclusively owns its transport.
//! [`SharedTransport`] hands out clones of a single link so several channels
//! (possibly on different threads) can talk to the same device. Every
//! individual chunk operation holds the lock, so chunks never interleave
//! mid-write; contention between whole messages is resolved by the device
//! answering `TRANSPORT_BUSY` and the channel backing off.

use crate::transport::{Transport, TransportError, TransportResult, TransportStats};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Cloneable handle to a transport behind a mutex.
pub struct SharedTransport<T> {
    inner: Arc<Mutex<T>>,
    chunk_size: usize,
}

impl<T: Transport> SharedTransport<T> {
    /// Wrap `transport` for sharing.
    pub fn new(transport: T) -> Self {
        let chunk_size = transport.chunk_size();
        Self {
            inner: Arc::new(Mutex::new(transport)),
            chunk_size,
        }
    }

    fn lock(&self) -> TransportResult<MutexGuard<'_, T>> {
        self.inner
            .lock()
            .map_err(|_| TransportError::Other("shared transport lock poisoned".into()))
    }
}

impl<T> Clone for SharedTransport<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            chunk_size: self.chunk_size,
        }
    }
}

impl<T: Transport> Transport for SharedTransport<T> {
    fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn open(&mut self) -> TransportResult<()> {
        self.lock()?.open()
    }

    fn close(&mut self) -> TransportResult<()> {
        self.lock()?.close()
    }

    fn write_chunk(&mut self, chunk: &[u8]) -> TransportResult<()> {
        self.lock()?.write_chunk(chunk)
    }

    fn read_chunk(&mut self, timeout: Option<Duration>) -> TransportResult<Vec<u8>> {
        self.lock()?.read_chunk(timeout)
    }

    fn stats(&self) -> TransportStats {
        self.lock().map(|t| t.stats()).unwrap_or_default()
    }
}
