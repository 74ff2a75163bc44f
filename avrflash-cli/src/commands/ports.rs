//! Port listing command implementation.

use {
    anyhow::Result,
    avrflash::{DetectedPort, auto_detect_port, detect_ports},
    console::style,
};

/// List ports command implementation.
pub(crate) fn cmd_list_ports(json: bool) -> Result<()> {
    let detected = detect_ports();

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&ports_json(&detected))?
        );
        return Ok(());
    }

    eprintln!(
        "{}",
        style("Serial ports")
            .bold()
            .underlined()
    );

    if detected.is_empty() {
        eprintln!("  {}", style("No serial ports found").dim());
        return Ok(());
    }

    for port in &detected {
        let device_type = if port
            .device
            .is_known()
        {
            format!(
                " [{}]",
                style(
                    port.device
                        .name()
                )
                .yellow()
            )
        } else {
            String::new()
        };

        let vid_pid = match (port.vid, port.pid) {
            (Some(vid), Some(pid)) => format!(" ({vid:04X}:{pid:04X})"),
            _ => String::new(),
        };

        let product = port
            .product
            .as_deref()
            .map(|p| format!(" - {}", style(p).dim()))
            .unwrap_or_default();

        eprintln!(
            "  {} {}{device_type}{vid_pid}{product}",
            style("•").green(),
            style(&port.name).cyan(),
        );
    }

    if let Ok(auto_port) = auto_detect_port() {
        eprintln!(
            "\n{} Auto-detected board port: {}",
            style("→")
                .green()
                .bold(),
            style(&auto_port.name)
                .cyan()
                .bold()
        );
    }

    Ok(())
}

/// JSON document printed by `list-ports --json`.
fn ports_json(detected: &[DetectedPort]) -> serde_json::Value {
    let ports: Vec<serde_json::Value> = detected
        .iter()
        .map(|p| {
            serde_json::json!({
                "name": p.name,
                "device": p.device.name(),
                "known": p.device.is_known(),
                "vid": p.vid,
                "pid": p.pid,
                "manufacturer": p.manufacturer,
                "product": p.product,
                "serial": p.serial,
            })
        })
        .collect();

    serde_json::json!({
        "ok": true,
        "data": {
            "ports": ports,
        }
    })
}
