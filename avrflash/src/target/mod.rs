//! Flash sessions and target configuration.

pub mod config;
pub mod flasher;

pub use config::{Board, FlashConfig};
pub use flasher::{FlashState, FlashSummary, Flasher};
