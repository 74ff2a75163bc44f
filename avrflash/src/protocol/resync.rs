//! Acknowledgment scanning with resynchronization-by-discard.
//!
//! STK500v1 responses carry no length or checksum, so the only defence
//! against stray bytes (line noise, partial echoes, a late answer to an
//! earlier attempt) is to slide a two-byte window over the incoming stream
//! and drop one byte at a time until the acknowledgment sits at the front.
//!
//! ```text
//! pending: 00 14 14 10 AA
//!          ^^ ^^            no match, drop 00
//!             ^^ ^^         no match, drop 14
//!                ^^ ^^      match, consume both -> pending: AA
//! ```

use std::collections::VecDeque;
use std::io::{ErrorKind, Read};
use std::sync::{Arc, Mutex, TryLockError};
use std::time::{Duration, Instant};

use log::trace;

use crate::error::{Error, Result};
use crate::port::Port;
use crate::protocol::hex_bytes;
use crate::protocol::stk500::ACK;

/// Bytes requested from the port per read.
const READ_CHUNK: usize = 64;

/// Owns the transport's read side and the bytes received but not yet
/// consumed.
///
/// `read_acknowledgment` takes `&mut self`, so two reads can never overlap
/// on the same buffer. Use [`SharedResyncBuffer`] when the buffer has to be
/// reachable from more than one thread.
pub struct ResyncBuffer<P: Port> {
    port: P,
    pending: VecDeque<u8>,
}

impl<P: Port> ResyncBuffer<P> {
    /// Wrap an opened port.
    pub fn new(port: P) -> Self {
        Self {
            port,
            pending: VecDeque::new(),
        }
    }

    /// Get a reference to the underlying port.
    pub fn port(&self) -> &P {
        &self.port
    }

    /// Get a mutable reference to the underlying port (for writes).
    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    /// Consume the buffer and return the port. Pending bytes are dropped.
    pub fn into_port(self) -> P {
        self.port
    }

    /// Number of received bytes not yet consumed.
    pub fn pending_len(&self) -> usize {
        self.pending
            .len()
    }

    /// Drop every pending byte, returning how many were dropped.
    pub fn discard_pending(&mut self) -> usize {
        let n = self
            .pending
            .len();
        if n > 0 {
            trace!("Dropping {n} stale byte(s): {}", hex_bytes(self.pending.make_contiguous()));
        }
        self.pending
            .clear();
        n
    }

    /// Wait for the next acknowledgment (`14 10`) in the byte stream.
    ///
    /// Bytes in front of the acknowledgment are discarded one at a time.
    /// Bytes after it stay pending for the next call.
    ///
    /// # Errors
    ///
    /// - [`Error::Timeout`] if no acknowledgment is found within `timeout`
    /// - [`Error::StreamClosed`] if the port reports end-of-stream
    /// - [`Error::Io`] for any other transport failure
    pub fn read_acknowledgment(&mut self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            if self.scan() {
                return Ok(());
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout(timeout));
            }

            self.port
                .set_timeout(remaining)?;
            match self
                .port
                .read(&mut chunk)
            {
                Ok(0) => return Err(Error::StreamClosed),
                Ok(n) => {
                    trace!("RX: {}", hex_bytes(&chunk[..n]));
                    self.pending
                        .extend(&chunk[..n]);
                },
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                    ) => {},
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }

    /// Slide over the pending bytes. Returns `true` once an acknowledgment
    /// has been consumed; otherwise leaves at most one byte pending.
    fn scan(&mut self) -> bool {
        while self.pending.len() >= 2 {
            if self.pending[0] == ACK[0] && self.pending[1] == ACK[1] {
                self.pending
                    .drain(..2);
                trace!("Matched acknowledgment");
                return true;
            }
            if let Some(byte) = self
                .pending
                .pop_front()
            {
                trace!("Discarding byte: {byte:02X}");
            }
        }
        false
    }
}

/// A [`ResyncBuffer`] shared between threads.
///
/// Only one acknowledgment read may be outstanding at a time. A second
/// caller does not wait for the first: it fails immediately with
/// [`Error::ReadInProgress`], leaving the running read untouched.
pub struct SharedResyncBuffer<P: Port> {
    inner: Arc<Mutex<ResyncBuffer<P>>>,
}

impl<P: Port> Clone for SharedResyncBuffer<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: Port> SharedResyncBuffer<P> {
    /// Share an existing buffer.
    pub fn new(buffer: ResyncBuffer<P>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(buffer)),
        }
    }

    /// Wait for the next acknowledgment, failing fast if another read holds
    /// the buffer.
    pub fn read_acknowledgment(&self, timeout: Duration) -> Result<()> {
        let mut guard = match self
            .inner
            .try_lock()
        {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return Err(Error::ReadInProgress),
            // Pending bytes stay in arrival order even if a reader panicked
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };
        guard.read_acknowledgment(timeout)
    }

    /// Recover the buffer once every other handle has been dropped.
    pub fn try_unwrap(self) -> std::result::Result<ResyncBuffer<P>, Self> {
        match Arc::try_unwrap(self.inner) {
            Ok(mutex) => Ok(mutex
                .into_inner()
                .unwrap_or_else(std::sync::PoisonError::into_inner)),
            Err(inner) => Err(Self { inner }),
        }
    }
}
