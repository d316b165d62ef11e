//! Firmware upload, CRC check and copy-and-go command implementations.

use anyhow::{Context, Result};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use omlink::{Bank, FirmwareImage, FirmwareUploader};
use std::path::Path;

use super::{done, print_flash_info};
use crate::config::Config;
use crate::{Cli, confirm, connect, use_fancy_output};

fn load_valid(cli: &Cli, firmware: &Path) -> Result<FirmwareImage> {
    if !cli.quiet {
        eprintln!(
            "{} Loading firmware from {}",
            style("📦").cyan(),
            firmware.display()
        );
    }
    let image = FirmwareImage::from_file(firmware)
        .with_context(|| format!("failed to load firmware {}", firmware.display()))?;
    image.validate()?;

    if !cli.quiet {
        let trailer = image.trailer();
        eprintln!(
            "{} {} bytes, firmware {} bytes, CRC 0x{:08X}",
            style("ℹ").blue(),
            image.len(),
            trailer.payload_size(),
            trailer.crc
        );
    }
    Ok(image)
}

fn progress_bar(cli: &Cli, total: usize) -> ProgressBar {
    if cli.quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(total as u64);
    #[allow(clippy::unwrap_used)] // Static template string
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );
    pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
    pb
}

/// Upload command implementation.
pub(crate) fn cmd_upload(cli: &Cli, config: &mut Config, bank: Bank, firmware: &Path) -> Result<()> {
    let image = load_valid(cli, firmware)?;
    let session = connect(cli, config)?;
    confirm(cli, &format!("Write {} to bank {bank}?", firmware.display()))?;

    let pb = progress_bar(cli, image.len());
    pb.set_message(format!("bank {bank}"));

    let uploader = FirmwareUploader::with_config(&session.client, config.upload_config());
    let result = uploader.upload(bank, &image, |written, _total| {
        pb.set_position(written as u64);
    });

    match result {
        Ok(info) => {
            pb.finish_with_message("done");
            done(cli.quiet, &format!("Bank {bank} written and CRC verified"));
            if !cli.quiet {
                print_flash_info(&info);
            }
            Ok(())
        },
        Err(e) => {
            pb.abandon();
            Err(e).with_context(|| format!("upload to bank {bank} failed"))
        },
    }
}

/// Check-crc command implementation.
pub(crate) fn cmd_check_crc(cli: &Cli, config: &mut Config, bank: Bank, firmware: &Path) -> Result<()> {
    let image = load_valid(cli, firmware)?;
    let session = connect(cli, config)?;
    let info = session.client.check_image_crc(bank, &image)?;
    done(cli.quiet, &format!("Bank {bank} matches {}", firmware.display()));
    if !cli.quiet {
        print_flash_info(&info);
    }
    Ok(())
}

/// Copy-and-go command implementation.
pub(crate) fn cmd_copy_and_go(cli: &Cli, config: &mut Config, firmware: &Path) -> Result<()> {
    let image = load_valid(cli, firmware)?;
    let session = connect(cli, config)?;
    confirm(cli, "Copy the staged image over the active bank and start it?")?;
    session.client.copy_and_go(&image)?;
    done(cli.quiet, "Copy-and-go sent");
    Ok(())
}
