//! Command implementations.
//!
//! Each subcommand is implemented in its own module. Settings shared by
//! `flash` and `info` are resolved here.

pub(crate) mod completions;
pub(crate) mod flash;
pub(crate) mod info;
pub(crate) mod ports;

use anyhow::{Context, Result};
use avrflash::{Board, FlashConfig, FlashPlan, SyncPolicy};
use log::debug;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::config::Config;
use crate::{Cli, CliError, ImageArgs};

/// Effective settings after merging flags, environment and config files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Settings {
    pub board: Board,
    pub baud: u32,
    pub flash: FlashConfig,
}

/// Resolve the session settings.
///
/// Flags win over the configuration file, which wins over the board preset.
pub(crate) fn resolve_settings(
    cli: &Cli,
    config: &Config,
    image: &ImageArgs,
    no_reset: bool,
) -> Result<Settings> {
    let board = match (cli.board, &config.flash.board) {
        (Some(arg), _) => Board::from(arg),
        (None, Some(name)) => Board::from_name(name).ok_or_else(|| {
            CliError::Config(format!(
                "Unknown board '{name}' in configuration (expected one of: {})",
                Board::ALL
                    .map(|b| b.name())
                    .join(", ")
            ))
        })?,
        (None, None) => Board::default(),
    };

    let baud = cli
        .baud
        .or(config.port.connection.baud)
        .unwrap_or_else(|| board.default_baud());

    let mut flash = board.config();
    if let Some(start) = image
        .bootloader_start
        .or(config.flash.bootloader_start)
    {
        flash = flash.with_bootloader_start(start);
    }
    if let Some(page_size) = image
        .page_size
        .or(config.flash.page_size)
    {
        flash = flash.with_page_size(page_size);
    }
    let sync = SyncPolicy {
        retries: config
            .flash
            .sync_retries
            .unwrap_or(flash.sync.retries),
        delay: config
            .flash
            .sync_delay_ms
            .map_or(flash.sync.delay, Duration::from_millis),
    };
    let timeouts = config
        .flash
        .timeouts
        .apply(flash.timeouts);
    flash = flash
        .with_sync_policy(sync)
        .with_timeouts(timeouts)
        .with_reset_on_connect(!(no_reset || config.flash.no_reset));

    flash
        .validate()
        .context("Invalid flash settings")?;

    debug!("Resolved settings: board={board}, baud={baud}, {flash:?}");
    Ok(Settings { board, baud, flash })
}

/// Read an Intel HEX file and turn it into a flash plan.
pub(crate) fn load_plan(path: &Path, flash: &FlashConfig) -> Result<FlashPlan> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    avrflash::parse_hex(&text, flash.page_size, flash.bootloader_start)
        .with_context(|| format!("Invalid image {}", path.display()))
}
