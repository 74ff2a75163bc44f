//! # avrflash
//!
//! A library for flashing AVR microcontrollers through an STK500v1 serial
//! bootloader (Arduino Uno, Nano, Duemilanove and friends).
//!
//! This crate provides:
//!
//! - Intel HEX parsing into page-aligned flash plans, with a guard that
//!   keeps images out of the bootloader region
//! - the STK500v1 command subset needed to write flash
//! - acknowledgment scanning that resynchronizes after line noise
//! - a flash session driver with progress reporting
//!
//! ## Supported Boards
//!
//! Any board running an STK500v1 bootloader; presets exist for the Uno
//! (optiboot), older ATmega328P Nanos and ATmega168 boards.
//!
//! ## Features
//!
//! - `native` (default): serial port support via the `serialport` crate
//! - `serde`: Serialization support for data types
//!
//! ## Example
//!
//! ```rust,no_run
//! use avrflash::{Board, Flasher, SerialConfig};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let hex = std::fs::read_to_string("blink.hex")?;
//!
//!     #[cfg(feature = "native")]
//!     {
//!         let board = Board::Uno;
//!         let serial = SerialConfig::new("/dev/ttyACM0", board.default_baud());
//!         let mut flasher = Flasher::open(&serial, board.config())?;
//!
//!         flasher.flash_hex(&hex, |percent| {
//!             println!("Flashing: {percent}%");
//!         })?;
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod device;
pub mod error;
pub mod image;
pub mod port;
pub mod protocol;
pub mod target;

// Re-exports for convenience
#[cfg(feature = "native")]
pub use port::native::NativePort;
pub use {
    device::{DetectedPort, DeviceKind, auto_detect_port, detect_ports},
    error::{Error, Result},
    image::{FlashPlan, MemoryRange, Page, ihex::parse as parse_hex},
    port::{Port, SerialConfig},
    protocol::{Command, ResyncBuffer, SharedResyncBuffer, Stk500, SyncPolicy, Timeouts},
    target::{Board, FlashConfig, FlashState, FlashSummary, Flasher},
};
