//! rgahead CLI - drive a residual gas analyzer head from the command line.
//!
//! ## Features
//!
//! - Walk the head through its power-up lifecycle
//! - Run analog scans and export spectra as TSV or JSON
//! - Simulated head for trying things out without hardware
//! - Shell completion generation
//! - Environment variable and config file support

use anyhow::Result;
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use console::style;
use env_logger::Env;
use log::debug;
use rgahead::ScanSettings;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};

mod commands;
mod config;
mod serial;

use config::Config;
use serial::{Session, SessionOptions};

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

/// Errors with a dedicated exit code.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Bad invocation or missing setup (exit code 2).
    #[error("{0}")]
    Usage(String),
    /// Interrupted by the user (exit code 130).
    #[error("{0}")]
    Cancelled(String),
}

impl CliError {
    fn exit_code(&self) -> u8 {
        match self {
            Self::Usage(_) => 2,
            Self::Cancelled(_) => 130,
        }
    }
}

/// rgahead - drive a residual gas analyzer head over RS-232.
///
/// Environment variables:
///   RGAHEAD_PORT            - Default serial port
///   RGAHEAD_BAUD            - Baud rate (default: 28800)
///   RGAHEAD_SIMULATE        - Use the simulated head
///   RGAHEAD_START_AMU       - First AMU of a scan
///   RGAHEAD_END_AMU         - Last AMU of a scan
///   RGAHEAD_POINTS_PER_AMU  - Steps per AMU
#[derive(Parser)]
#[command(name = "rgahead")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub(crate) struct Cli {
    /// Serial port to use (auto-detected if not specified).
    #[arg(short, long, global = true, env = "RGAHEAD_PORT")]
    port: Option<String>,

    /// Baud rate [default: 28800].
    #[arg(short, long, global = true, env = "RGAHEAD_BAUD")]
    baud: Option<u32>,

    /// Talk to a simulated head instead of a serial port.
    #[arg(long, global = true, env = "RGAHEAD_SIMULATE")]
    simulate: bool,

    /// First AMU of a scan.
    #[arg(long, global = true, env = "RGAHEAD_START_AMU")]
    start_amu: Option<u32>,

    /// Last AMU of a scan.
    #[arg(long, global = true, env = "RGAHEAD_END_AMU")]
    end_amu: Option<u32>,

    /// Steps per AMU.
    #[arg(long, global = true, env = "RGAHEAD_POINTS_PER_AMU")]
    points_per_amu: Option<u32>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// List available serial ports.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Power the head up and print its identification and status.
    Identify {
        /// Output as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Run scans and export each spectrum.
    Scan {
        /// Number of scans to take.
        #[arg(short = 'n', long, default_value = "1", value_parser = clap::value_parser!(u32).range(1..))]
        count: u32,

        /// Write spectra to this file instead of stdout.
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,

        /// Write JSON instead of tab-separated values.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type (detected from $SHELL if not specified).
        #[arg(value_enum)]
        shell: Option<Shell>,
    },
}

impl Cli {
    fn session_options(&self) -> SessionOptions {
        SessionOptions {
            port: self.port.clone(),
            baud: self.baud,
            simulate: self.simulate,
        }
    }

    /// Scan settings from the config file with command-line overrides.
    fn scan_settings(&self, config: &Config) -> ScanSettings {
        let mut settings = config.scan.settings();
        if let Some(start) = self.start_amu {
            settings.start_amu = start;
        }
        if let Some(end) = self.end_amu {
            settings.end_amu = end;
        }
        if let Some(ppa) = self.points_per_amu {
            settings.points_per_amu = ppa;
        }
        settings
    }
}

/// Open a head using the global options.
pub(crate) fn open_session(cli: &Cli, config: &Config) -> Result<Session> {
    Session::open(
        &cli.session_options(),
        config,
        cli.scan_settings(config),
        config.timing.head_config(),
    )
}

fn init_logging(cli: &Cli) {
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
}

fn install_interrupt_handler() {
    if let Err(e) = ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::Relaxed)) {
        debug!("Failed to install Ctrl-C handler: {e}");
    }
}

fn run(cli: &Cli) -> Result<()> {
    let config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::ListPorts { json } => commands::ports::cmd_list_ports(*json),
        Commands::Identify { json } => {
            install_interrupt_handler();
            commands::identify::cmd_identify(cli, &config, *json)
        },
        Commands::Scan {
            count,
            output,
            json,
        } => {
            install_interrupt_handler();
            let options = commands::scan::ScanOptions {
                count: *count,
                output: output.as_deref(),
                json: *json,
            };
            commands::scan::cmd_scan(cli, &config, &options)
        },
        Commands::Completions { shell } => commands::completions::cmd_completions(*shell),
    }
}

fn main() -> ExitCode {
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();
    init_logging(&cli);

    debug!(
        "rgahead v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {err:#}", style("Error:").red().bold());
            let code = err.downcast_ref::<CliError>().map_or(1, CliError::exit_code);
            ExitCode::from(code)
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_scan_overrides_config() {
        let cli = Cli::parse_from(["rgahead", "--start-amu", "29", "--end-amu", "200", "scan"]);
        let mut config = Config::default();
        config.scan.start_amu = Some(2);
        config.scan.points_per_amu = Some(25);

        let settings = cli.scan_settings(&config);
        assert_eq!(settings.start_amu, 29);
        assert_eq!(settings.end_amu, 200);
        assert_eq!(settings.points_per_amu, 25);
    }

    #[test]
    fn test_scan_count_must_be_positive() {
        assert!(Cli::try_parse_from(["rgahead", "scan", "--count", "0"]).is_err());
        assert!(Cli::try_parse_from(["rgahead", "scan", "-n", "3"]).is_ok());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(CliError::Usage(String::new()).exit_code(), 2);
        assert_eq!(CliError::Cancelled(String::new()).exit_code(), 130);
    }
}
