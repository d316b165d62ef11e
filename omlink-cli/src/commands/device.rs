//! Application-level device commands.

use anyhow::{Context, Result};
use console::style;

use super::{done, print_flash_info};
use crate::config::Config;
use crate::{Cli, confirm, connect};

/// Status command implementation.
pub(crate) fn cmd_status(cli: &Cli, config: &mut Config, json: bool) -> Result<()> {
    let session = connect(cli, config)?;
    let client = &session.client;

    let version = client
        .firmware_version()
        .context("reading firmware version")?;
    let manufacturer = client
        .manufacturer_id()
        .context("reading manufacturer id")?;
    let device_id = client.device_id().context("reading device id")?;
    let region = client
        .current_region()
        .context("reading current region")?;
    let control = client
        .read_control_block()
        .context("reading bootloader control block")?;

    if json {
        let output = serde_json::json!({
            "port": session.port,
            "firmware_version": version.to_string(),
            "manufacturer_id": manufacturer,
            "device_id": device_id,
            "current_region": region,
            "control_block": control,
            "state": control.state().to_string(),
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    eprintln!("{}", style("Module").bold().underlined());
    eprintln!("  Firmware:        {}", style(version).cyan());
    eprintln!("  Manufacturer id: {manufacturer}");
    eprintln!("  Device id:       {device_id}");
    eprintln!("  Current region:  {region}");
    eprintln!("\n{}", style("Bootloader").bold().underlined());
    print_flash_info(&control);
    Ok(())
}

/// Reboot command implementation.
pub(crate) fn cmd_reboot(cli: &Cli, config: &mut Config) -> Result<()> {
    let session = connect(cli, config)?;
    session.client.force_reboot()?;
    done(cli.quiet, "Reboot requested");
    Ok(())
}

/// Set-id command implementation.
pub(crate) fn cmd_set_id(cli: &Cli, config: &mut Config, id: u8) -> Result<()> {
    let session = connect(cli, config)?;
    confirm(cli, &format!("Change the module address to {id}?"))?;
    session.client.set_device_id(id)?;
    done(cli.quiet, &format!("Module address set to {id}"));
    Ok(())
}
