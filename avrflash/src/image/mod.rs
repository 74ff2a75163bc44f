//! Firmware image formats.

pub mod ihex;

pub use self::ihex::{FlashPlan, MemoryRange, Page};
