//! STK500v1 bootloader protocol.
//!
//! Only the subset needed to write application flash is implemented. Every
//! command is a short byte sequence terminated by `CRC_EOP` (`0x20`), and
//! every successful command is answered with the same two bytes:
//!
//! ```text
//! +-----------+---------------------+------+        +------+------+
//! |  Command  |      Arguments      | 0x20 |  --->  | 0x14 | 0x10 |
//! +-----------+---------------------+------+  <---  +------+------+
//!                                                   INSYNC   OK
//! ```
//!
//! | Command                 | Bytes                              |
//! |-------------------------|------------------------------------|
//! | get sync                | `30 20`                            |
//! | enter programming mode  | `50 20`                            |
//! | load address            | `55 lo hi 20` (16-bit word address)|
//! | program page            | `64 size_hi size_lo 46 data.. 20`  |
//! | leave programming mode  | `51 20`                            |

use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use log::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::port::Port;
use crate::protocol::hex_bytes;
use crate::protocol::resync::ResyncBuffer;

/// `Resp_STK_INSYNC`.
pub const STK_INSYNC: u8 = 0x14;

/// `Resp_STK_OK`.
pub const STK_OK: u8 = 0x10;

/// Acknowledgment sent by the bootloader after every successful command.
pub const ACK: [u8; 2] = [STK_INSYNC, STK_OK];

/// `Sync_CRC_EOP`, terminates every command.
pub const CRC_EOP: u8 = 0x20;

/// Memory type selector for flash in the program-page command.
pub const MEMTYPE_FLASH: u8 = b'F';

/// Largest payload a single program-page command can describe.
pub const MAX_PAGE_DATA: usize = u16::MAX as usize;

/// Fraction (in percent) of the program-page budget above which a round
/// trip is reported as slow.
const SLOW_PAGE_PERCENT: u32 = 90;

/// STK500v1 commands used by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    /// `Cmnd_STK_GET_SYNC`.
    GetSync = 0x30,
    /// `Cmnd_STK_ENTER_PROGMODE`.
    EnterProgMode = 0x50,
    /// `Cmnd_STK_LEAVE_PROGMODE`.
    LeaveProgMode = 0x51,
    /// `Cmnd_STK_LOAD_ADDRESS`.
    LoadAddress = 0x55,
    /// `Cmnd_STK_PROG_PAGE`.
    ProgramPage = 0x64,
}

impl Command {
    /// Opcode byte.
    pub fn opcode(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::GetSync => "sync",
            Self::EnterProgMode => "enter programming mode",
            Self::LeaveProgMode => "leave programming mode",
            Self::LoadAddress => "load address",
            Self::ProgramPage => "program page",
        };
        f.write_str(name)
    }
}

/// Build the bytes for a command without arguments.
pub fn encode_simple(command: Command) -> Vec<u8> {
    vec![command.opcode(), CRC_EOP]
}

/// Build a load-address command. `word_address` is the byte address / 2.
pub fn encode_load_address(word_address: u16) -> Vec<u8> {
    let mut field = [0u8; 2];
    LittleEndian::write_u16(&mut field, word_address);

    let mut buf = Vec::with_capacity(4);
    buf.push(Command::LoadAddress.opcode());
    buf.extend_from_slice(&field);
    buf.push(CRC_EOP);
    buf
}

/// Build a program-page command for flash memory.
pub fn encode_program_page(data: &[u8]) -> Result<Vec<u8>> {
    if data.is_empty() {
        return Err(Error::Protocol("program page with no data".into()));
    }
    let size = u16::try_from(data.len()).map_err(|_| {
        Error::Protocol(format!(
            "page of {} bytes exceeds the {MAX_PAGE_DATA}-byte limit",
            data.len()
        ))
    })?;

    let mut field = [0u8; 2];
    BigEndian::write_u16(&mut field, size);

    let mut buf = Vec::with_capacity(data.len() + 5);
    buf.push(Command::ProgramPage.opcode());
    buf.extend_from_slice(&field);
    buf.push(MEMTYPE_FLASH);
    buf.extend_from_slice(data);
    buf.push(CRC_EOP);
    Ok(buf)
}

/// Per-command acknowledgment budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Timeouts {
    /// One sync attempt.
    pub sync: Duration,
    /// Enter programming mode.
    pub enter: Duration,
    /// Load address.
    pub load_address: Duration,
    /// Program page (includes the device's flash write time).
    pub program_page: Duration,
    /// Leave programming mode.
    pub leave: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            sync: Duration::from_millis(500),
            enter: Duration::from_millis(500),
            load_address: Duration::from_millis(500),
            program_page: Duration::from_millis(1000),
            leave: Duration::from_millis(500),
        }
    }
}

/// Retry policy for the sync handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SyncPolicy {
    /// Number of sync attempts before giving up.
    pub retries: u32,
    /// Pause between attempts.
    pub delay: Duration,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            retries: 6,
            delay: Duration::from_millis(250),
        }
    }
}

/// STK500v1 protocol engine.
///
/// Every operation is "write the command, then expect one acknowledgment
/// within a bounded time". Only [`Stk500::sync`] retries.
pub struct Stk500<P: Port> {
    buffer: ResyncBuffer<P>,
    timeouts: Timeouts,
    sync_policy: SyncPolicy,
}

impl<P: Port> Stk500<P> {
    /// Create an engine on an opened port with default timing.
    pub fn new(port: P) -> Self {
        Self::with_timing(port, Timeouts::default(), SyncPolicy::default())
    }

    /// Create an engine with explicit timing.
    pub fn with_timing(port: P, timeouts: Timeouts, sync_policy: SyncPolicy) -> Self {
        Self {
            buffer: ResyncBuffer::new(port),
            timeouts,
            sync_policy,
        }
    }

    /// Get a reference to the underlying port.
    pub fn port(&self) -> &P {
        self.buffer
            .port()
    }

    /// Get a mutable reference to the underlying port.
    pub fn port_mut(&mut self) -> &mut P {
        self.buffer
            .port_mut()
    }

    /// Consume the engine and return the underlying port.
    pub fn into_port(self) -> P {
        self.buffer
            .into_port()
    }

    /// Current timeouts.
    pub fn timeouts(&self) -> &Timeouts {
        &self.timeouts
    }

    /// Synchronize with the bootloader.
    ///
    /// Sends `GET_SYNC` up to `retries` times, pausing `delay` between
    /// attempts. Any failed attempt is logged and retried; the first
    /// acknowledgment ends the loop.
    ///
    /// # Errors
    ///
    /// [`Error::SyncFailed`] once every attempt went unanswered. A failure
    /// to clear the port buffers between attempts is logged, not returned.
    pub fn sync(&mut self) -> Result<()> {
        let SyncPolicy { retries, delay } = self.sync_policy;
        let command = encode_simple(Command::GetSync);

        for attempt in 1..=retries {
            debug!("Sync attempt {attempt}/{retries}");

            match self.round_trip(&command, self.timeouts.sync) {
                Ok(()) => {
                    info!("Bootloader in sync");
                    return Ok(());
                },
                Err(e) => {
                    warn!("Sync attempt {attempt}/{retries} failed: {e}");
                },
            }

            if attempt < retries {
                thread::sleep(delay);
                self.buffer
                    .discard_pending();
                if let Err(e) = self
                    .buffer
                    .port_mut()
                    .clear_buffers()
                {
                    warn!("Could not clear port buffers before sync attempt {}: {e}", attempt + 1);
                }
            }
        }

        Err(Error::SyncFailed { attempts: retries })
    }

    /// Enter programming mode.
    pub fn enter_programming_mode(&mut self) -> Result<()> {
        self.execute(
            Command::EnterProgMode,
            &encode_simple(Command::EnterProgMode),
            self.timeouts.enter,
        )
    }

    /// Set the word address (byte address / 2) for the next page write.
    pub fn load_address(&mut self, word_address: u16) -> Result<()> {
        trace!("Load address 0x{word_address:04X} (byte 0x{:05X})", u32::from(word_address) * 2);
        self.execute(
            Command::LoadAddress,
            &encode_load_address(word_address),
            self.timeouts.load_address,
        )
    }

    /// Write one page of flash at the last loaded address.
    ///
    /// Returns the round-trip time. A round trip above 90% of the budget is
    /// logged as a warning: under auto-reset timing the bootloader may be
    /// about to give up and start the application.
    pub fn program_page(&mut self, data: &[u8]) -> Result<Duration> {
        let command = encode_program_page(data)?;
        let budget = self.timeouts.program_page;

        let start = Instant::now();
        self.execute(Command::ProgramPage, &command, budget)?;
        let elapsed = start.elapsed();

        debug!(
            "Programmed {} bytes in {} ms",
            data.len(),
            elapsed.as_millis()
        );
        if is_slow_page(elapsed, budget) {
            warn!(
                "Program page took {} ms of a {} ms budget; the bootloader may be close to exiting",
                elapsed.as_millis(),
                budget.as_millis()
            );
        }

        Ok(elapsed)
    }

    /// Leave programming mode; the bootloader then starts the application.
    pub fn leave_programming_mode(&mut self) -> Result<()> {
        self.execute(
            Command::LeaveProgMode,
            &encode_simple(Command::LeaveProgMode),
            self.timeouts.leave,
        )
    }

    /// Single attempt of a non-sync command.
    fn execute(&mut self, command: Command, bytes: &[u8], timeout: Duration) -> Result<()> {
        self.round_trip(bytes, timeout)
            .map_err(|e| e.in_command(command))
    }

    /// Write `bytes` and wait for one acknowledgment.
    fn round_trip(&mut self, bytes: &[u8], timeout: Duration) -> Result<()> {
        if bytes.len() <= 8 {
            trace!("TX: {}", hex_bytes(bytes));
        } else {
            trace!("TX: {} ... ({} bytes)", hex_bytes(&bytes[..4]), bytes.len());
        }
        self.buffer
            .port_mut()
            .write_all_bytes(bytes)?;
        self.buffer
            .read_acknowledgment(timeout)
    }
}

/// A page round trip that used more than 90% of its budget.
fn is_slow_page(elapsed: Duration, budget: Duration) -> bool {
    elapsed > budget * SLOW_PAGE_PERCENT / 100
}
