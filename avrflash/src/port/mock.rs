//! In-memory port used by the unit tests.
//!
//! Each `write` call pops the next scripted reply (if any) into the read
//! buffer, so a test can describe a bootloader as "answer the Nth command
//! with these bytes". An empty reply means the device stays silent, and
//! `reply_delay` holds each reply back like a slow bootloader would.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::port::Port;

pub(crate) const ACK: [u8; 2] = [0x14, 0x10];

pub(crate) struct MockPort {
    read_buf: VecDeque<u8>,
    replies: VecDeque<Vec<u8>>,
    /// Every write, in order.
    pub(crate) writes: Vec<Vec<u8>>,
    /// DTR/RTS transitions, in order.
    pub(crate) signals: Vec<(&'static str, bool)>,
    /// Return `Ok(0)` instead of timing out once the read buffer is empty.
    pub(crate) eof_when_empty: bool,
    /// Upper bound on bytes handed out per read, to exercise partial reads.
    pub(crate) max_chunk: usize,
    pub(crate) clear_count: usize,
    /// Time between a write and its reply becoming readable.
    pub(crate) reply_delay: Duration,
    /// Make `clear_buffers` fail.
    pub(crate) fail_clear: bool,
    reply_at: Option<Instant>,
    timeout: Duration,
}

impl MockPort {
    pub(crate) fn new() -> Self {
        Self {
            read_buf: VecDeque::new(),
            replies: VecDeque::new(),
            writes: Vec::new(),
            signals: Vec::new(),
            eof_when_empty: false,
            max_chunk: usize::MAX,
            clear_count: 0,
            reply_delay: Duration::ZERO,
            fail_clear: false,
            reply_at: None,
            timeout: Duration::from_millis(10),
        }
    }

    /// Port with bytes already waiting to be read.
    pub(crate) fn with_input(bytes: &[u8]) -> Self {
        let mut port = Self::new();
        port.read_buf
            .extend(bytes);
        port
    }

    /// Port that answers every command with an acknowledgment.
    pub(crate) fn always_ack(commands: usize) -> Self {
        let mut port = Self::new();
        for _ in 0..commands {
            port.push_reply(&ACK);
        }
        port
    }

    pub(crate) fn push_reply(&mut self, bytes: &[u8]) {
        self.replies
            .push_back(bytes.to_vec());
    }

    pub(crate) fn pending(&self) -> usize {
        self.read_buf
            .len()
    }
}

impl Read for MockPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(at) = self.reply_at {
            let now = Instant::now();
            if now < at {
                let wait = at - now;
                if wait > self.timeout {
                    thread::sleep(self.timeout);
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "reply pending"));
                }
                thread::sleep(wait);
            }
            self.reply_at = None;
        }
        if self.read_buf.is_empty() {
            if self.eof_when_empty {
                return Ok(0);
            }
            thread::sleep(self.timeout);
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
        }
        let n = buf
            .len()
            .min(self.read_buf.len())
            .min(self.max_chunk);
        for b in buf.iter_mut().take(n) {
            *b = self
                .read_buf
                .pop_front()
                .unwrap();
        }
        Ok(n)
    }
}

impl Write for MockPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writes
            .push(buf.to_vec());
        if let Some(reply) = self.replies.pop_front() {
            self.read_buf
                .extend(reply);
            if !self.reply_delay.is_zero() {
                self.reply_at = Some(Instant::now() + self.reply_delay);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Port for MockPort {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn clear_buffers(&mut self) -> Result<()> {
        self.clear_count += 1;
        if self.fail_clear {
            return Err(Error::Io(io::Error::other("clear failed")));
        }
        self.read_buf
            .clear();
        Ok(())
    }

    fn name(&self) -> &str {
        "mock"
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        self.signals
            .push(("dtr", level));
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> Result<()> {
        self.signals
            .push(("rts", level));
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
