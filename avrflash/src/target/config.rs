//! Flash session configuration and board presets.

use std::fmt;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::port::DEFAULT_BAUD;
pub use crate::protocol::stk500::{SyncPolicy, Timeouts};

/// Default flash page size in bytes (ATmega328P/168).
pub const DEFAULT_PAGE_SIZE: usize = 128;

/// Default start of the protected bootloader region (2 KiB bootloader on a
/// 32 KiB part).
pub const DEFAULT_BOOTLOADER_START: u32 = 0x7800;

/// Pulse length of the DTR/RTS auto-reset.
pub const RESET_PULSE: Duration = Duration::from_millis(100);

/// Time the bootloader needs after reset before it listens.
pub const RESET_SETTLE: Duration = Duration::from_millis(50);

/// Configuration of one flash session.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FlashConfig {
    /// Bytes per program-page command.
    pub page_size: usize,
    /// First byte address of the bootloader; nothing at or above it is written.
    pub bootloader_start: u32,
    /// Sync handshake retry policy.
    pub sync: SyncPolicy,
    /// Per-command acknowledgment budgets.
    pub timeouts: Timeouts,
    /// Pulse DTR/RTS before syncing to reset the board into its bootloader.
    pub reset_on_connect: bool,
}

impl Default for FlashConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            bootloader_start: DEFAULT_BOOTLOADER_START,
            sync: SyncPolicy::default(),
            timeouts: Timeouts::default(),
            reset_on_connect: true,
        }
    }
}

impl FlashConfig {
    /// Set the page size.
    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Set the bootloader start address.
    #[must_use]
    pub fn with_bootloader_start(mut self, address: u32) -> Self {
        self.bootloader_start = address;
        self
    }

    /// Set the sync retry policy.
    #[must_use]
    pub fn with_sync_policy(mut self, sync: SyncPolicy) -> Self {
        self.sync = sync;
        self
    }

    /// Set the per-command timeouts.
    #[must_use]
    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Enable or disable the auto-reset pulse.
    #[must_use]
    pub fn with_reset_on_connect(mut self, reset: bool) -> Self {
        self.reset_on_connect = reset;
        self
    }

    /// Check the values for consistency.
    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 {
            return Err(Error::Config("page size must be non-zero".into()));
        }
        if self.page_size % 2 != 0 {
            return Err(Error::Config(format!(
                "page size {} is not a whole number of words",
                self.page_size
            )));
        }
        if self.page_size > usize::from(u16::MAX) {
            return Err(Error::Config(format!(
                "page size {} exceeds {}",
                self.page_size,
                u16::MAX
            )));
        }
        if self.sync.retries == 0 {
            return Err(Error::Config("sync retries must be at least 1".into()));
        }
        let Timeouts {
            sync,
            enter,
            load_address,
            program_page,
            leave,
        } = self.timeouts;
        for (name, budget) in [
            ("sync", sync),
            ("enter", enter),
            ("load address", load_address),
            ("program page", program_page),
            ("leave", leave),
        ] {
            if budget.is_zero() {
                return Err(Error::Config(format!("{name} timeout must be non-zero")));
            }
        }
        Ok(())
    }
}

/// Boards with a known STK500v1 bootloader layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum Board {
    /// Arduino Uno (optiboot, 512-byte bootloader).
    Uno,
    /// Older Arduino Nano / Duemilanove with ATmega328P (2 KiB bootloader).
    NanoOld,
    /// ATmega168 boards (Diecimila, older Nano).
    Atmega168,
    /// Unknown board using the defaults.
    #[default]
    Generic,
}

impl Board {
    /// Every preset, in display order.
    pub const ALL: [Board; 4] = [Self::Uno, Self::NanoOld, Self::Atmega168, Self::Generic];

    /// Look up a board by name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name
            .to_lowercase()
            .as_str()
        {
            "uno" | "optiboot" => Some(Self::Uno),
            "nano-old" | "nano_old" | "duemilanove" => Some(Self::NanoOld),
            "atmega168" | "m168" | "diecimila" => Some(Self::Atmega168),
            "generic" => Some(Self::Generic),
            _ => None,
        }
    }

    /// Command-line name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Uno => "uno",
            Self::NanoOld => "nano-old",
            Self::Atmega168 => "atmega168",
            Self::Generic => "generic",
        }
    }

    /// Baud rate the bootloader listens at.
    #[must_use]
    pub fn default_baud(&self) -> u32 {
        match self {
            Self::Uno => 115_200,
            Self::Atmega168 => 19_200,
            Self::NanoOld | Self::Generic => DEFAULT_BAUD,
        }
    }

    /// Start of the bootloader region.
    #[must_use]
    pub fn bootloader_start(&self) -> u32 {
        match self {
            Self::Uno => 0x7E00,
            Self::Atmega168 => 0x3800,
            Self::NanoOld | Self::Generic => DEFAULT_BOOTLOADER_START,
        }
    }

    /// Flash configuration for this board.
    pub fn config(&self) -> FlashConfig {
        FlashConfig::default()
            .with_page_size(DEFAULT_PAGE_SIZE)
            .with_bootloader_start(self.bootloader_start())
    }
}

impl fmt::Display for Board {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
