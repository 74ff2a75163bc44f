//! Port abstraction for serial communication with the bootloader.
//!
//! The protocol layer never opens or configures a port itself. It consumes
//! an already-opened [`Port`], which supplies:
//!
//! - a blocking `read` bounded by the port timeout,
//! - `write` of a byte sequence,
//! - buffer clearing and modem-control lines for the auto-reset pulse.
//!
//! ```text
//! +-------------------+
//! |  Flasher / Stk500 |
//! +---------+---------+
//!           |
//!           v
//! +---------+---------+
//! |    Port trait     |
//! +---------+---------+
//!           |
//!           v
//! +---------+---------+
//! | NativePort        |
//! |   (serialport)    |
//! +-------------------+
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use avrflash::port::Port;
//!
//! fn example<P: Port>(port: &mut P) -> avrflash::Result<()> {
//!     port.write_all_bytes(&[0x30, 0x20])?;
//!
//!     let mut buf = [0u8; 32];
//!     let n = port.read(&mut buf)?;
//!     println!("Received: {:?}", &buf[..n]);
//!
//!     Ok(())
//! }
//! ```

#[cfg(feature = "native")]
pub mod native;

#[cfg(test)]
pub(crate) mod mock;

use std::io::{Read, Write};
use std::time::Duration;

use crate::error::Result;

/// Default baud rate of the classic Arduino STK500v1 bootloader.
pub const DEFAULT_BAUD: u32 = 57600;

/// Serial port configuration.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyUSB0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Initial read/write timeout.
    pub timeout: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: DEFAULT_BAUD,
            timeout: Duration::from_millis(500),
        }
    }
}

impl SerialConfig {
    /// Create a new configuration with port name and baud rate.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// Set the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Transport capability consumed by the protocol engine.
///
/// `read` must block for at most the current timeout. A timed-out read is
/// reported as an `io::ErrorKind::TimedOut` error; `Ok(0)` means the stream
/// has ended.
pub trait Port: Read + Write + Send {
    /// Set the read/write timeout.
    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;

    /// Get the current timeout.
    fn timeout(&self) -> Duration;

    /// Clear input/output buffers.
    fn clear_buffers(&mut self) -> Result<()>;

    /// Get the port name/path.
    fn name(&self) -> &str;

    /// Set DTR (Data Terminal Ready) pin state.
    fn set_dtr(&mut self, level: bool) -> Result<()>;

    /// Set RTS (Request To Send) pin state.
    fn set_rts(&mut self, level: bool) -> Result<()>;

    /// Close the port and release resources.
    ///
    /// After calling this method, the port cannot be used for further I/O.
    fn close(&mut self) -> Result<()>;

    /// Write all bytes, blocking until complete.
    fn write_all_bytes(&mut self, buf: &[u8]) -> Result<()> {
        std::io::Write::write_all(self, buf)?;
        std::io::Write::flush(self)?;
        Ok(())
    }
}
