//! Flash command implementation.

use anyhow::{Context, Result};
use avrflash::{Flasher, SerialConfig};
use console::style;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::warn;
use std::path::Path;

use super::{load_plan, resolve_settings};
use crate::config::Config;
use crate::{Cli, ImageArgs, get_port, use_fancy_output};

/// Flash command implementation.
pub(crate) fn cmd_flash(
    cli: &Cli,
    config: &mut Config,
    firmware: &Path,
    image: &ImageArgs,
    no_reset: bool,
) -> Result<()> {
    let settings = resolve_settings(cli, config, image, no_reset)?;

    if !cli.quiet {
        eprintln!(
            "{} Loading {}",
            style("📦").cyan(),
            firmware.display()
        );
    }

    // Parse before touching the port so a bad image never reaches the board
    let plan = load_plan(firmware, &settings.flash)?;

    if !cli.quiet {
        eprintln!(
            "{} {} (board: {}, bootloader at 0x{:04X})",
            style("ℹ").blue(),
            plan,
            settings.board,
            settings.flash.bootloader_start
        );
    }

    let port = get_port(cli, config)?;
    if !cli.quiet {
        eprintln!(
            "{} Using {} at {} baud",
            style("🔌").cyan(),
            port,
            settings.baud
        );
    }

    let serial = SerialConfig::new(&port, settings.baud);
    let mut flasher = Flasher::open(&serial, settings.flash)
        .with_context(|| format!("Failed to open {port}"))?;

    let pb = if cli.quiet || !use_fancy_output() {
        ProgressBar::hidden()
    } else {
        let pb = ProgressBar::new(100);
        #[allow(clippy::unwrap_used)] // Static template string
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")
                .unwrap()
                .progress_chars("#>-"),
        );
        pb.set_draw_target(ProgressDrawTarget::stderr());
        pb.set_message("Syncing");
        pb
    };

    let mut written = 0u8;
    let result = flasher.flash_plan(&plan, |percent| {
        if written == 0 {
            pb.set_message("Writing");
        }
        written = percent;
        pb.set_position(u64::from(percent));
    });

    let summary = match result {
        Ok(summary) => summary,
        Err(err) => {
            pb.abandon();
            if written > 0 {
                warn!(
                    "Flashing stopped at {written}%: the board is partially programmed, flash it again before use"
                );
            }
            return Err(err).context("Flashing failed");
        },
    };

    pb.finish_with_message("Done");

    if !cli.quiet {
        eprintln!(
            "\n{} Wrote {} bytes in {} page(s) in {:.2}s (slowest page {} ms)",
            style("🎉")
                .green()
                .bold(),
            summary.bytes,
            summary.pages,
            summary
                .elapsed
                .as_secs_f64(),
            summary
                .slowest_page
                .as_millis()
        );
    }

    Ok(())
}
