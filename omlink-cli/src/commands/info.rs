//! Firmware info and port listing command implementations.

use {
    anyhow::{Context, Result},
    console::style,
    omlink::{FirmwareImage, NativePortEnumerator, PortEnumerator},
    std::path::Path,
};

/// List ports command implementation.
pub(crate) fn cmd_list_ports(json: bool) -> Result<()> {
    let ports = NativePortEnumerator::list_ports()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&ports)?);
        return Ok(());
    }

    eprintln!("{}", style("Serial ports").bold().underlined());
    if ports.is_empty() {
        eprintln!("  {}", style("No serial ports found").dim());
    }
    for port in &ports {
        eprintln!("  {} {}", style("•").green(), port);
    }
    Ok(())
}

fn load(firmware: &Path) -> Result<FirmwareImage> {
    FirmwareImage::from_file(firmware)
        .with_context(|| format!("failed to load firmware {}", firmware.display()))
}

/// Info command implementation.
pub(crate) fn cmd_info(firmware: &Path, json: bool) -> Result<()> {
    let image = load(firmware)?;
    let trailer = image.trailer();
    let verdict = image.validate();

    if json {
        let output = serde_json::json!({
            "file": firmware.display().to_string(),
            "trailer": trailer,
            "payload_size": trailer.payload_size(),
            "crc_hex": format!("0x{:08X}", trailer.crc),
            "valid": verdict.is_ok(),
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    let yes_no = |b: bool| {
        if b {
            style("yes").green()
        } else {
            style("no").red()
        }
    };

    eprintln!("{}", style("Firmware image").bold().underlined());
    eprintln!("  File:            {}", firmware.display());
    eprintln!("  File size:       {} bytes", trailer.file_size);
    eprintln!("  Firmware size:   {} bytes", trailer.firmware_size);
    eprintln!("  Payload size:    {} bytes", trailer.payload_size());
    eprintln!("  CRC:             0x{:08X}", trailer.crc);
    eprintln!("  CRC trailer:     {}", yes_no(trailer.crc_matched));
    eprintln!("  Size word:       {}", yes_no(trailer.size_matched));
    match verdict {
        Ok(()) => eprintln!("\n{} Image can be uploaded", style("✓").green()),
        Err(e) => eprintln!("\n{} {e}", style("✗").red()),
    }
    Ok(())
}
