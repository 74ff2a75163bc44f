//! Image info command implementation.

use {
    super::{Settings, load_plan, resolve_settings},
    crate::{Cli, ImageArgs, config::Config},
    anyhow::Result,
    avrflash::FlashPlan,
    console::style,
    std::path::Path,
};

/// Info command implementation.
pub(crate) fn cmd_info(
    cli: &Cli,
    config: &Config,
    firmware: &Path,
    image: &ImageArgs,
    json: bool,
) -> Result<()> {
    let settings = resolve_settings(cli, config, image, false)?;
    let plan = load_plan(firmware, &settings.flash)?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&info_json(firmware, &settings, &plan))?
        );
        return Ok(());
    }

    eprintln!(
        "{}",
        style("Image")
            .bold()
            .underlined()
    );
    eprintln!("  File:             {}", firmware.display());
    eprintln!("  Board:            {}", settings.board);
    eprintln!("  Page size:        {} bytes", settings.flash.page_size);
    eprintln!(
        "  Bootloader start: 0x{:04X}",
        settings.flash.bootloader_start
    );
    eprintln!("  Pages:            {}", plan.len());
    eprintln!("  Bytes:            {}", plan.total_bytes());
    match plan.span() {
        Some((start, end)) => eprintln!("  Span:             0x{start:04X}..0x{end:04X}"),
        None => eprintln!("  Span:             {}", style("empty image").dim()),
    }

    if !plan.is_empty() {
        eprintln!(
            "\n{}",
            style("Pages")
                .bold()
                .underlined()
        );
        for (i, page) in plan
            .pages()
            .iter()
            .enumerate()
        {
            eprintln!(
                "  [{:3}] 0x{:04X} {:4} bytes",
                i,
                page.address,
                page.len()
            );
        }
    }

    Ok(())
}

/// JSON document printed by `info --json`.
fn info_json(firmware: &Path, settings: &Settings, plan: &FlashPlan) -> serde_json::Value {
    let pages: Vec<serde_json::Value> = plan
        .pages()
        .iter()
        .map(|page| {
            serde_json::json!({
                "address": format!("0x{:04X}", page.address),
                "length": page.len(),
            })
        })
        .collect();

    let span = plan
        .span()
        .map(|(start, end)| format!("0x{start:04X}..0x{end:04X}"));

    serde_json::json!({
        "ok": true,
        "data": {
            "file": firmware.display().to_string(),
            "board": settings.board.name(),
            "page_size": settings.flash.page_size,
            "bootloader_start": format!("0x{:04X}", settings.flash.bootloader_start),
            "pages": plan.len(),
            "bytes": plan.total_bytes(),
            "span": span,
            "page_list": pages,
        }
    })
}
