//! Serial port selection.
//!
//! An explicit `--port` (or `OMLINK_PORT`) wins, then the configured port.
//! Otherwise a single present port is used as is and several ports are
//! offered in a prompt, which requires a terminal.

use {
    crate::{CliError, config::Config},
    anyhow::Result,
    console::style,
    dialoguer::{Confirm, Error as DialoguerError, Select, theme::ColorfulTheme},
    log::{debug, info},
    omlink::{NativePortEnumerator, PortEnumerator, PortInfo},
    std::io::IsTerminal,
};

/// Pick the port to open.
pub fn select_serial_port(explicit: Option<&str>, config: &mut Config, assume_yes: bool) -> Result<String> {
    if let Some(port) = explicit {
        return Ok(port.to_string());
    }
    if let Some(port) = &config.connection.port {
        debug!("Using port from config: {port}");
        return Ok(port.clone());
    }

    let ports = NativePortEnumerator::list_ports()?;
    let port = choose(ports, assume_yes)?;
    if !assume_yes && is_interactive() {
        ask_remember_port(&port, config)?;
    }
    Ok(port)
}

fn choose(mut ports: Vec<PortInfo>, assume_yes: bool) -> Result<String> {
    match ports.len() {
        0 => Err(CliError::Usage("no serial ports found, use --port".to_string()).into()),
        1 => {
            let port = ports.remove(0);
            info!("Auto-selected port: {port}");
            Ok(port.name)
        },
        _ if assume_yes || !is_interactive() => Err(CliError::Usage(
            "multiple serial ports found, use --port to pick one".to_string(),
        )
        .into()),
        _ => select_port_interactive(ports),
    }
}

fn is_interactive() -> bool {
    std::io::stdin().is_terminal() && std::io::stderr().is_terminal()
}

fn map_prompt_error(err: DialoguerError) -> anyhow::Error {
    match err {
        DialoguerError::IO(io_err) if io_err.kind() == std::io::ErrorKind::Interrupted => {
            CliError::Cancelled("port selection cancelled".to_string()).into()
        },
        DialoguerError::IO(io_err) => CliError::Usage(format!("prompt failed: {io_err}")).into(),
    }
}

fn select_port_interactive(ports: Vec<PortInfo>) -> Result<String> {
    eprintln!(
        "{} {} serial ports found",
        style("ℹ").blue(),
        ports.len()
    );

    let term_width = console::Term::stderr()
        .size()
        .1 as usize;
    let labels: Vec<String> = ports
        .iter()
        .map(|p| console::truncate_str(&p.to_string(), term_width.saturating_sub(4), "\u{2026}").into_owned())
        .collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select the serial port of the module")
        .items(&labels)
        .default(0)
        .interact_opt()
        .map_err(map_prompt_error)?;

    match selection.and_then(|index| ports.into_iter().nth(index)) {
        Some(port) => Ok(port.name),
        None => Err(CliError::Cancelled("port selection cancelled".to_string()).into()),
    }
}

fn ask_remember_port(port: &str, config: &mut Config) -> Result<()> {
    let remember = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("Remember {port} in ./omlink.toml?"))
        .default(false)
        .interact_opt()
        .map_err(map_prompt_error)?
        .unwrap_or(false);
    if remember {
        config.save_port(port)?;
    }
    Ok(())
}
