//! Single bootloader command implementations.

use anyhow::Result;
use console::style;
use omlink::Bank;

use super::{done, print_flash_info};
use crate::config::Config;
use crate::{Cli, confirm, connect};

fn report(cli: &Cli, message: &str, info: &omlink::FlashInfo) {
    done(cli.quiet, message);
    if !cli.quiet {
        print_flash_info(info);
    }
}

/// Check-valid command implementation.
pub(crate) fn cmd_check_valid(cli: &Cli, config: &mut Config, bank: Bank) -> Result<()> {
    let session = connect(cli, config)?;
    let info = session.client.check_image_valid(bank)?;
    report(cli, &format!("Bank {bank} is valid"), &info);
    Ok(())
}

/// Fix-valid command implementation.
pub(crate) fn cmd_fix_valid(cli: &Cli, config: &mut Config, bank: Bank) -> Result<()> {
    let session = connect(cli, config)?;
    confirm(cli, &format!("Force the valid flag on bank {bank}?"))?;
    let info = session.client.fix_valid_image(bank)?;
    report(cli, &format!("Bank {bank} marked valid"), &info);
    Ok(())
}

/// Set-pref command implementation.
pub(crate) fn cmd_set_pref(cli: &Cli, config: &mut Config, bank: Bank) -> Result<()> {
    let session = connect(cli, config)?;
    let info = session.client.set_preferred_bank(bank)?;
    report(cli, &format!("Bank {bank} preferred for next boot"), &info);
    Ok(())
}

/// Erase-sector command implementation.
pub(crate) fn cmd_erase_sector(cli: &Cli, config: &mut Config, sector: u8) -> Result<()> {
    let session = connect(cli, config)?;
    confirm(cli, &format!("Erase flash sector {sector}?"))?;
    if !cli.quiet {
        eprintln!("{} Erasing sector {sector}...", style("⏳").yellow());
    }
    let info = session.client.erase_sector(sector)?;
    report(cli, &format!("Sector {sector} erased"), &info);
    Ok(())
}

/// Erase-half command implementation.
pub(crate) fn cmd_erase_half(cli: &Cli, config: &mut Config) -> Result<()> {
    let session = connect(cli, config)?;
    confirm(cli, "Erase the second half of flash?")?;
    if !cli.quiet {
        eprintln!("{} Erasing second half...", style("⏳").yellow());
    }
    let info = session.client.erase_second_half()?;
    report(cli, "Second half erased", &info);
    Ok(())
}

/// Restart command implementation.
pub(crate) fn cmd_restart(cli: &Cli, config: &mut Config) -> Result<()> {
    let session = connect(cli, config)?;
    session.client.restart()?;
    done(cli.quiet, "Bootloader restart requested");
    Ok(())
}
