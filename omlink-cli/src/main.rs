//! omlink CLI - command-line tool for OM sensor modules.
//!
//! ## Features
//!
//! - Inspect raw firmware images offline
//! - Query firmware version, identity and bootloader state
//! - Upload firmware into the inactive bank with per-block verification
//! - Drive individual bootloader commands
//! - Shell completion generation
//! - Environment variable and config file support

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use console::style;
use dialoguer::{Confirm, theme::ColorfulTheme};
use env_logger::Env;
use log::debug;
use omlink::{Bank, ClientConfig, ModbusRtu, OmClient, SerialConfig, Worker, port::DEFAULT_BAUD_RATE};
use std::env;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

mod commands;
mod config;
mod serial;

use config::Config;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if emoji/animations should be used (TTY and colors enabled).
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether Ctrl-C was pressed.
pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

/// Errors classified for the exit code.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Bad invocation or missing setup; exit code 2.
    #[error("{0}")]
    Usage(String),
    /// Declined prompt or Ctrl-C; exit code 130.
    #[error("{0}")]
    Cancelled(String),
}

/// omlink - query and update OM sensor modules over Modbus RTU.
///
/// Environment variables:
///   OMLINK_PORT    - Default serial port
///   OMLINK_BAUD    - Default baud rate (default: 500000)
///   OMLINK_TARGET  - Modbus address of the module (default: 1)
#[derive(Parser)]
#[command(name = "omlink")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub(crate) struct Cli {
    /// Serial port to use (prompted for if not specified).
    #[arg(short, long, global = true, env = "OMLINK_PORT")]
    pub(crate) port: Option<String>,

    /// Baud rate.
    #[arg(short, long, global = true, env = "OMLINK_BAUD")]
    pub(crate) baud: Option<u32>,

    /// Modbus address of the module.
    #[arg(short, long, global = true, env = "OMLINK_TARGET")]
    pub(crate) target: Option<u8>,

    /// Request timeout in milliseconds.
    #[arg(long, global = true, value_name = "MS", default_value = "5000")]
    pub(crate) timeout: u64,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub(crate) verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    pub(crate) quiet: bool,

    /// Answer yes to confirmations; never prompt.
    #[arg(short = 'y', long, global = true)]
    pub(crate) yes: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    pub(crate) config_path: Option<PathBuf>,

    #[command(subcommand)]
    pub(crate) command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Scan a firmware image and show its trailer.
    Info {
        /// Path to the raw firmware image.
        firmware: PathBuf,

        /// Output information as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// List available serial ports.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Show firmware version, identity and bootloader state.
    Status {
        /// Output status as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Upload a firmware image into a bank and verify its CRC.
    Upload {
        /// Bank to write (0/main or 1/reserve).
        #[arg(long, value_parser = parse_bank)]
        image: Bank,

        /// Path to the raw firmware image.
        firmware: PathBuf,
    },

    /// Check the CRC of a bank against a firmware image.
    CheckCrc {
        /// Bank to check.
        #[arg(long, value_parser = parse_bank)]
        image: Bank,

        /// Path to the raw firmware image.
        firmware: PathBuf,
    },

    /// Run the validity check on a bank.
    CheckValid {
        /// Bank to check.
        #[arg(long, value_parser = parse_bank)]
        image: Bank,
    },

    /// Force the valid flag on a bank.
    FixValid {
        /// Bank to mark valid.
        #[arg(long, value_parser = parse_bank)]
        image: Bank,
    },

    /// Select the bank booted next.
    SetPref {
        /// Bank to prefer (0/main or 1/reserve).
        #[arg(value_parser = parse_bank)]
        bank: Bank,
    },

    /// Erase one flash sector.
    EraseSector {
        /// Sector index (0-7).
        #[arg(value_parser = clap::value_parser!(u8).range(0..8))]
        sector: u8,
    },

    /// Erase the second half of flash.
    EraseHalf,

    /// Soft-reset the bootloader.
    Restart,

    /// Copy a staged image over the active bank and jump to it.
    CopyAndGo {
        /// Firmware image that was staged.
        firmware: PathBuf,
    },

    /// Reboot the module application.
    Reboot,

    /// Assign a new Modbus address to the module.
    SetId {
        /// New address.
        #[arg(value_parser = clap::value_parser!(u8).range(1..=247))]
        id: u8,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type.
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Parse a bank given as index or name.
fn parse_bank(s: &str) -> Result<Bank, String> {
    match s.trim().to_ascii_lowercase().as_str() {
        "0" | "main" => Ok(Bank::Main),
        "1" | "reserve" => Ok(Bank::Reserve),
        other => Err(format!("invalid bank '{other}', expected 0, 1, main or reserve")),
    }
}

/// Exit code for a failed command.
fn exit_code(err: &anyhow::Error) -> i32 {
    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        return match cli_err {
            CliError::Usage(_) => 2,
            CliError::Cancelled(_) => 130,
        };
    }
    match err.downcast_ref::<omlink::Error>() {
        Some(omlink::Error::Interrupted) => 130,
        _ => 1,
    }
}

fn main() {
    // --- NO_COLOR and TTY detection (clig.dev best practice) ---
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();

    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!(
        "omlink v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    if let Err(e) = ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::Relaxed)) {
        debug!("Ctrl-C handler not installed: {e}");
    }
    omlink::set_interrupt_checker(was_interrupted);

    if let Err(err) = run(&cli) {
        eprintln!("{} {err:#}", style("Error:").red().bold());
        std::process::exit(exit_code(&err));
    }
}

fn run(cli: &Cli) -> Result<()> {
    let mut config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::Info { firmware, json } => commands::info::cmd_info(firmware, *json),
        Commands::ListPorts { json } => commands::info::cmd_list_ports(*json),
        Commands::Status { json } => commands::device::cmd_status(cli, &mut config, *json),
        Commands::Upload { image, firmware } => {
            commands::upload::cmd_upload(cli, &mut config, *image, firmware)
        },
        Commands::CheckCrc { image, firmware } => {
            commands::upload::cmd_check_crc(cli, &mut config, *image, firmware)
        },
        Commands::CheckValid { image } => commands::boot::cmd_check_valid(cli, &mut config, *image),
        Commands::FixValid { image } => commands::boot::cmd_fix_valid(cli, &mut config, *image),
        Commands::SetPref { bank } => commands::boot::cmd_set_pref(cli, &mut config, *bank),
        Commands::EraseSector { sector } => {
            commands::boot::cmd_erase_sector(cli, &mut config, *sector)
        },
        Commands::EraseHalf => commands::boot::cmd_erase_half(cli, &mut config),
        Commands::Restart => commands::boot::cmd_restart(cli, &mut config),
        Commands::CopyAndGo { firmware } => {
            commands::upload::cmd_copy_and_go(cli, &mut config, firmware)
        },
        Commands::Reboot => commands::device::cmd_reboot(cli, &mut config),
        Commands::SetId { id } => commands::device::cmd_set_id(cli, &mut config, *id),
        Commands::Completions { shell } => {
            commands::completions::cmd_completions(*shell);
            Ok(())
        },
    }
}

/// An open link to one module. The worker stops when this is dropped.
pub(crate) struct Session {
    pub(crate) client: OmClient,
    pub(crate) port: String,
    _worker: Worker,
}

/// Open the serial link and start the worker.
pub(crate) fn connect(cli: &Cli, config: &mut Config) -> Result<Session> {
    let port = serial::select_serial_port(cli.port.as_deref(), config, cli.yes)?;
    let baud = cli
        .baud
        .or(config.connection.baud)
        .unwrap_or(DEFAULT_BAUD_RATE);
    let target = cli
        .target
        .or(config.connection.target)
        .unwrap_or(1);

    let client_config = ClientConfig::default()
        .with_target_id(target)
        .with_request_timeout(Duration::from_millis(cli.timeout));
    let serial_config =
        SerialConfig::new(port.clone(), baud).with_timeout(client_config.read_timeout);

    let rtu = ModbusRtu::open(&serial_config).with_context(|| format!("cannot open {port}"))?;
    let worker = Worker::spawn(rtu).context("cannot start worker thread")?;
    let client = OmClient::new(worker.handle(), client_config);

    if !cli.quiet {
        eprintln!(
            "{} Using {} at {} baud, target {}",
            style("🔌").cyan(),
            style(&port).cyan(),
            baud,
            target
        );
    }
    Ok(Session {
        client,
        port,
        _worker: worker,
    })
}

/// Ask before a command that changes flash or identity.
pub(crate) fn confirm(cli: &Cli, prompt: &str) -> Result<()> {
    if cli.yes {
        return Ok(());
    }
    if !(std::io::stdin().is_terminal() && std::io::stderr().is_terminal()) {
        return Err(CliError::Usage(format!("{prompt}: confirmation required, pass --yes")).into());
    }
    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(false)
        .interact_opt()
        .map_err(|e| CliError::Usage(format!("prompt failed: {e}")))?
        .unwrap_or(false);
    if confirmed {
        Ok(())
    } else {
        Err(CliError::Cancelled("aborted".to_string()).into())
    }
}
