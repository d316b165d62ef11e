//! Command implementations.
//!
//! Each group of subcommands is implemented in its own module.

pub(crate) mod boot;
pub(crate) mod completions;
pub(crate) mod device;
pub(crate) mod info;
pub(crate) mod upload;

use console::style;
use omlink::FlashInfo;

/// Print a control block read back from the bootloader.
pub(crate) fn print_flash_info(info: &FlashInfo) {
    eprintln!("  Status:          {:#04x} ({})", info.status, info.state());
    eprintln!("  Current bank:    {}", info.current_block);
    eprintln!("  Preferred bank:  {}", info.pref_block);
    eprintln!("  Reset source:    {:#04x}", info.reset_src);
}

/// Print a one-line success message unless quiet.
pub(crate) fn done(quiet: bool, message: &str) {
    if !quiet {
        eprintln!("{} {message}", style("✓").green());
    }
}
