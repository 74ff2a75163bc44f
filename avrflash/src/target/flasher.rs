//! Flash session orchestration.
//!
//! A session runs the STK500v1 commands in a fixed order:
//!
//! ```text
//!   Idle
//!    |  (optional DTR/RTS reset pulse)
//!    v
//!   Syncing ---------------- sync x N ------------------> Failed
//!    |
//!    v
//!   ProgrammingModeEntered -- enter programming mode ---> Failed
//!    |
//!    v
//!   Flashing { page, total } -- load address + program page per page
//!    |                            (on error: leave, then Failed)
//!    v
//!   Done <------------------ leave programming mode
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use avrflash::{FlashConfig, Flasher, NativePort, SerialConfig};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let hex = std::fs::read_to_string("blink.hex")?;
//!     let port = NativePort::open(&SerialConfig::new("/dev/ttyUSB0", 57600))?;
//!
//!     let mut flasher = Flasher::new(port, FlashConfig::default());
//!     let summary = flasher.flash_hex(&hex, |percent| println!("{percent}%"))?;
//!     println!("Wrote {} bytes", summary.bytes);
//!
//!     Ok(())
//! }
//! ```

use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::error::{Error, Result};
use crate::image::{FlashPlan, ihex};
use crate::port::Port;
use crate::protocol::stk500::{MAX_PAGE_DATA, Stk500};
use crate::target::config::{FlashConfig, RESET_PULSE, RESET_SETTLE};

/// Where a flash session currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashState {
    /// Nothing sent yet.
    Idle,
    /// Waiting for the bootloader to answer the sync handshake.
    Syncing,
    /// The bootloader accepted the enter-programming-mode command.
    ProgrammingModeEntered,
    /// Writing page `page` (1-based) of `total`.
    Flashing {
        /// Current page, 1-based.
        page: usize,
        /// Number of pages in the plan.
        total: usize,
    },
    /// Every page was written and programming mode was left.
    Done,
    /// The session stopped on an error.
    Failed,
}

impl FlashState {
    /// Whether the session is over.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl fmt::Display for FlashState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Syncing => write!(f, "syncing"),
            Self::ProgrammingModeEntered => write!(f, "in programming mode"),
            Self::Flashing { page, total } => write!(f, "flashing page {page}/{total}"),
            Self::Done => write!(f, "done"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Statistics of a successful session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FlashSummary {
    /// Pages written.
    pub pages: usize,
    /// Bytes written.
    pub bytes: usize,
    /// Wall-clock time of the whole session.
    pub elapsed: Duration,
    /// Longest program-page round trip.
    pub slowest_page: Duration,
}

/// Percentage reported after page `index` (0-based) of `total`.
///
/// Rounds up rather than to nearest: 3 pages give 34, 67, 100 and 7 pages
/// give 15, 29, 43, 58, 72, 86, 100. The last page always reports 100 and no
/// page reports 0.
fn progress_percent(index: usize, total: usize) -> u8 {
    let percent = (100 * (index + 1)).div_ceil(total).min(100);
    u8::try_from(percent).unwrap_or(100)
}

/// Writes Intel HEX images through an STK500v1 bootloader.
///
/// One `Flasher` runs one session. Once it reaches [`FlashState::Done`] or
/// [`FlashState::Failed`], reuse the port through [`Flasher::into_port`].
pub struct Flasher<P: Port> {
    engine: Stk500<P>,
    config: FlashConfig,
    state: FlashState,
}

impl<P: Port> Flasher<P> {
    /// Create a flasher on an opened port.
    pub fn new(port: P, config: FlashConfig) -> Self {
        let engine = Stk500::with_timing(port, config.timeouts, config.sync);
        Self {
            engine,
            config,
            state: FlashState::Idle,
        }
    }

    /// Session configuration.
    pub fn config(&self) -> &FlashConfig {
        &self.config
    }

    /// Current session state.
    pub fn state(&self) -> FlashState {
        self.state
    }

    /// Get a reference to the underlying port.
    pub fn port(&self) -> &P {
        self.engine
            .port()
    }

    /// Consume the flasher and return the underlying port.
    pub fn into_port(self) -> P {
        self.engine
            .into_port()
    }

    /// Parse `hex` and flash it.
    ///
    /// The image is parsed and checked against the bootloader region before
    /// anything is sent, so a bad image never touches the device. A rejected
    /// configuration or image still ends the session in
    /// [`FlashState::Failed`]. `on_progress` receives 1..=100 after every page.
    pub fn flash_hex<F>(&mut self, hex: &str, on_progress: F) -> Result<FlashSummary>
    where
        F: FnMut(u8),
    {
        self.ensure_idle()?;
        let plan = self
            .config
            .validate()
            .and_then(|()| ihex::parse(hex, self.config.page_size, self.config.bootloader_start))
            .inspect_err(|e| self.reject(e))?;
        info!("Flash plan: {plan}");
        self.flash_plan(&plan, on_progress)
    }

    /// Flash an already computed plan.
    ///
    /// Any failure ends the session. Pages written before the failure are
    /// not rolled back: the device is left partially programmed and the
    /// application will most likely not run until a full flash succeeds.
    /// Leaving programming mode is still attempted after a failed page.
    pub fn flash_plan<F>(&mut self, plan: &FlashPlan, mut on_progress: F) -> Result<FlashSummary>
    where
        F: FnMut(u8),
    {
        self.ensure_idle()?;
        check_plan(plan).inspect_err(|e| self.reject(e))?;

        let start = Instant::now();
        match self.run(plan, &mut on_progress) {
            Ok(mut summary) => {
                summary.elapsed = start.elapsed();
                self.state = FlashState::Done;
                info!(
                    "Wrote {} bytes in {} page(s) in {:.2}s",
                    summary.bytes,
                    summary.pages,
                    summary
                        .elapsed
                        .as_secs_f64()
                );
                Ok(summary)
            },
            Err(e) => {
                debug!("Session failed while {}: {e}", self.state);
                self.state = FlashState::Failed;
                Err(e)
            },
        }
    }

    fn ensure_idle(&self) -> Result<()> {
        if self.state == FlashState::Idle {
            Ok(())
        } else {
            Err(Error::Protocol(format!(
                "flash session already used (state: {})",
                self.state
            )))
        }
    }

    /// Fail the session before any byte reaches the device.
    fn reject(&mut self, e: &Error) {
        debug!("Session rejected before device contact: {e}");
        self.state = FlashState::Failed;
    }

    fn run<F>(&mut self, plan: &FlashPlan, on_progress: &mut F) -> Result<FlashSummary>
    where
        F: FnMut(u8),
    {
        if self.config.reset_on_connect {
            self.reset_board()?;
        }

        self.state = FlashState::Syncing;
        self.engine
            .sync()?;

        self.engine
            .enter_programming_mode()?;
        self.state = FlashState::ProgrammingModeEntered;
        debug!("Entered programming mode");

        let summary = match self.write_pages(plan, on_progress) {
            Ok(summary) => summary,
            Err(e) => {
                if let Err(cleanup) = self
                    .engine
                    .leave_programming_mode()
                {
                    warn!("Could not leave programming mode after failure: {cleanup}");
                }
                return Err(e);
            },
        };

        self.engine
            .leave_programming_mode()?;
        debug!("Left programming mode");
        Ok(summary)
    }

    fn write_pages<F>(&mut self, plan: &FlashPlan, on_progress: &mut F) -> Result<FlashSummary>
    where
        F: FnMut(u8),
    {
        let total = plan.len();
        let mut summary = FlashSummary::default();

        for (index, page) in plan
            .pages()
            .iter()
            .enumerate()
        {
            self.state = FlashState::Flashing {
                page: index + 1,
                total,
            };

            // Checked by check_plan
            let word_address = page
                .word_address()
                .unwrap_or_default();
            debug!(
                "Page {}/{total}: {} bytes at 0x{:04X}",
                index + 1,
                page.len(),
                page.address
            );

            self.engine
                .load_address(word_address)?;
            let elapsed = self
                .engine
                .program_page(&page.data)?;

            summary.pages += 1;
            summary.bytes += page.len();
            summary.slowest_page = summary
                .slowest_page
                .max(elapsed);

            on_progress(progress_percent(index, total));
        }

        Ok(summary)
    }

    /// Pulse DTR and RTS to reset an auto-reset board into its bootloader.
    fn reset_board(&mut self) -> Result<()> {
        debug!("Resetting board via DTR/RTS");
        let port = self
            .engine
            .port_mut();
        port.set_dtr(false)?;
        port.set_rts(false)?;
        thread::sleep(RESET_PULSE);
        port.set_dtr(true)?;
        port.set_rts(true)?;
        thread::sleep(RESET_SETTLE);
        port.clear_buffers()
    }
}

/// Reject pages the protocol cannot address before talking to the device.
fn check_plan(plan: &FlashPlan) -> Result<()> {
    for page in plan.pages() {
        if page.word_address().is_none() {
            return Err(Error::Protocol(format!(
                "page at 0x{:X} is beyond the 16-bit word address range",
                page.address
            )));
        }
        if page.is_empty() || page.len() > MAX_PAGE_DATA {
            return Err(Error::Protocol(format!(
                "page at 0x{:04X} has invalid length {}",
                page.address,
                page.len()
            )));
        }
        if page.address % 2 != 0 {
            warn!(
                "Page at odd address 0x{:04X} will be written at 0x{:04X}",
                page.address,
                page.address - 1
            );
        }
    }
    Ok(())
}

#[cfg(feature = "native")]
impl Flasher<crate::port::native::NativePort> {
    /// Open a serial port and create a flasher on it.
    pub fn open(serial: &crate::port::SerialConfig, config: FlashConfig) -> Result<Self> {
        let port = crate::port::native::NativePort::open_with_retry(serial)?;
        Ok(Self::new(port, config))
    }
}
