//! avrflash CLI - Command-line tool for flashing AVR boards.
//!
//! ## Features
//!
//! - Flash Intel HEX images through an STK500v1 bootloader
//! - Inspect the flash plan of an image without a device
//! - Interactive serial port selection
//! - Shell completion generation
//! - Environment variable and config file support

use anyhow::Result;
use avrflash::Board;
use clap::{Args, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use console::style;
use env_logger::Env;
use log::debug;
use std::env;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(true);

/// Check if emoji/animations should be used (TTY and colors enabled).
fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(std::sync::atomic::Ordering::Relaxed) && console::colors_enabled_stderr()
}

mod commands;
mod config;
mod serial;

use config::Config;
use serial::{SerialOptions, ask_remember_port, select_serial_port};

/// Error classes with their own exit codes.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Invalid invocation or a prompt that could not be shown (exit 2).
    #[error("{0}")]
    Usage(String),
    /// Unreadable or inconsistent configuration (exit 3).
    #[error("{0}")]
    Config(String),
    /// No usable port or no bootloader on it (exit 4).
    #[error("{0}")]
    Device(String),
}

/// Exit code for a failed run.
fn exit_code(err: &anyhow::Error) -> u8 {
    for cause in err.chain() {
        if let Some(cli_err) = cause.downcast_ref::<CliError>() {
            return match cli_err {
                CliError::Usage(_) => 2,
                CliError::Config(_) => 3,
                CliError::Device(_) => 4,
            };
        }
        if let Some(lib_err) = cause.downcast_ref::<avrflash::Error>() {
            return match lib_err {
                avrflash::Error::Config(_) => 3,
                avrflash::Error::Serial(_) => 4,
                e if e.is_unreachable() => 4,
                _ => 1,
            };
        }
    }
    1
}

/// avrflash - Flash AVR boards through their STK500v1 serial bootloader.
///
/// Environment variables:
///   AVRFLASH_PORT              - Default serial port
///   AVRFLASH_BAUD              - Baud rate (default: board preset)
///   AVRFLASH_BOARD             - Board preset (uno, nano-old, atmega168, generic)
///   AVRFLASH_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "avrflash")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[allow(clippy::struct_excessive_bools)]
pub(crate) struct Cli {
    /// Serial port to use (auto-detected if not specified).
    #[arg(short, long, global = true, env = "AVRFLASH_PORT")]
    port: Option<String>,

    /// Baud rate of the bootloader (default: board preset).
    #[arg(short, long, global = true, env = "AVRFLASH_BAUD")]
    baud: Option<u32>,

    /// Board preset (bootloader start, page size, baud rate).
    #[arg(long, global = true, env = "AVRFLASH_BOARD")]
    board: Option<BoardArg>,

    /// Verbose output level (-v, -vv, -vvv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "AVRFLASH_NON_INTERACTIVE")]
    non_interactive: bool,

    /// Confirm port selection even for auto-detected ports.
    #[arg(long, global = true)]
    confirm_port: bool,

    /// List all available ports (including unknown types).
    #[arg(long, global = true)]
    list_all_ports: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Supported board presets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub(crate) enum BoardArg {
    /// Arduino Uno (optiboot, 115200 baud).
    Uno,
    /// Older Nano / Duemilanove with ATmega328P (57600 baud).
    NanoOld,
    /// ATmega168 boards (19200 baud).
    Atmega168,
    /// Generic ATmega328P layout (57600 baud).
    Generic,
}

impl From<BoardArg> for Board {
    fn from(board: BoardArg) -> Self {
        match board {
            BoardArg::Uno => Board::Uno,
            BoardArg::NanoOld => Board::NanoOld,
            BoardArg::Atmega168 => Board::Atmega168,
            BoardArg::Generic => Board::Generic,
        }
    }
}

/// Image layout options shared by `flash` and `info`.
#[derive(Args, Debug, Clone, Default)]
pub(crate) struct ImageArgs {
    /// Start of the protected bootloader region (e.g. 0x7E00).
    #[arg(long, value_parser = parse_address)]
    bootloader_start: Option<u32>,

    /// Flash page size in bytes.
    #[arg(long)]
    page_size: Option<usize>,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Flash an Intel HEX image.
    Flash {
        /// Path to the Intel HEX file.
        firmware: PathBuf,

        #[command(flatten)]
        image: ImageArgs,

        /// Do not pulse DTR/RTS to reset the board before syncing.
        #[arg(long)]
        no_reset: bool,
    },

    /// Show the flash plan of an Intel HEX image.
    Info {
        /// Path to the Intel HEX file.
        firmware: PathBuf,

        #[command(flatten)]
        image: ImageArgs,

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

    /// Generate shell completion scripts.
    Completions {
        /// Shell type for completions (auto-detected if not specified with --install).
        #[arg(value_enum)]
        shell: Option<Shell>,

        /// Automatically install completions to your shell configuration.
        #[arg(long)]
        install: bool,
    },
}

/// Parse an address: `0x` prefix for hex, decimal otherwise. Underscores are
/// allowed as separators.
fn parse_address(s: &str) -> Result<u32, String> {
    let s: String = s
        .trim()
        .chars()
        .filter(|c| *c != '_')
        .collect();
    let parsed = match s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
    {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("Invalid address '{s}': {e}"))
}

fn main() -> ExitCode {
    // --- NO_COLOR and TTY detection (clig.dev best practice) ---
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, std::sync::atomic::Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();
    init_logging(&cli);

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {err:#}", style("Error:").red().bold());
            ExitCode::from(exit_code(&err))
        },
    }
}

/// Setup logging based on verbosity.
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

    debug!(
        "avrflash v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );
}

fn run(cli: &Cli) -> Result<()> {
    // Load configuration
    let mut config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)?
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::Flash {
            firmware,
            image,
            no_reset,
        } => commands::flash::cmd_flash(cli, &mut config, firmware, image, *no_reset),
        Commands::Info {
            firmware,
            image,
            json,
        } => commands::info::cmd_info(cli, &config, firmware, image, *json),
        Commands::ListPorts { json } => commands::ports::cmd_list_ports(*json),
        Commands::Completions { shell, install } => {
            if *install {
                commands::completions::cmd_completions_install(*shell)
            } else {
                let shell = shell.ok_or_else(|| {
                    CliError::Usage(
                        "specify a shell type, e.g.: avrflash completions bash \
                         (or use `avrflash completions --install`)"
                            .to_string(),
                    )
                })?;
                commands::completions::cmd_completions(shell);
                Ok(())
            }
        },
    }
}

/// Get serial port from CLI args, config or interactive selection.
pub(crate) fn get_port(cli: &Cli, config: &mut Config) -> Result<String> {
    let options = SerialOptions {
        port: cli
            .port
            .clone(),
        list_all_ports: cli.list_all_ports,
        non_interactive: cli.non_interactive,
        confirm_port: cli.confirm_port,
    };

    let selected = select_serial_port(&options, config)?;

    // Ask to remember if not a known device and interactive mode
    if !selected.is_known
        && !cli.non_interactive
        && selected.port.vid.is_some()
        && std::io::stdin().is_terminal()
    {
        ask_remember_port(&selected.port, config)?;
    }

    Ok(selected
        .port
        .name)
}

#[cfg(test)]
mod cli_tests {
    use super::*;
    use clap::CommandFactory;

    // ---- clap validation ----

    #[test]
    fn test_cli_command_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_parse_flash() {
        let cli = Cli::try_parse_from([
            "avrflash",
            "--port",
            "/dev/ttyUSB0",
            "--baud",
            "115200",
            "flash",
            "blink.hex",
        ])
        .unwrap();
        assert_eq!(cli.port.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(cli.baud, Some(115200));
        assert!(matches!(cli.command, Commands::Flash { .. }));
    }

    #[test]
    fn test_cli_parse_flash_with_all_options() {
        let cli = Cli::try_parse_from([
            "avrflash",
            "--board",
            "nano-old",
            "flash",
            "blink.hex",
            "--bootloader-start",
            "0x7E00",
            "--page-size",
            "64",
            "--no-reset",
        ])
        .unwrap();
        assert_eq!(cli.board, Some(BoardArg::NanoOld));
        match cli.command {
            Commands::Flash {
                firmware,
                image,
                no_reset,
            } => {
                assert_eq!(firmware, PathBuf::from("blink.hex"));
                assert_eq!(image.bootloader_start, Some(0x7E00));
                assert_eq!(image.page_size, Some(64));
                assert!(no_reset);
            },
            _ => panic!("expected flash command"),
        }
    }

    #[test]
    fn test_cli_parse_info_json() {
        let cli = Cli::try_parse_from(["avrflash", "info", "blink.hex", "--json"]).unwrap();
        assert!(matches!(cli.command, Commands::Info { json: true, .. }));
    }

    #[test]
    fn test_cli_rejects_unknown_board() {
        assert!(Cli::try_parse_from(["avrflash", "--board", "mega2560", "list-ports"]).is_err());
    }

    #[test]
    fn test_cli_flash_requires_firmware() {
        assert!(Cli::try_parse_from(["avrflash", "flash"]).is_err());
    }

    #[test]
    fn test_cli_verbose_count() {
        let cli = Cli::try_parse_from(["avrflash", "-vvv", "list-ports"]).unwrap();
        assert_eq!(cli.verbose, 3);
    }

    #[test]
    fn test_board_arg_conversion() {
        assert_eq!(Board::from(BoardArg::Uno), Board::Uno);
        assert_eq!(Board::from(BoardArg::Atmega168), Board::Atmega168);
    }

    // ---- address parsing ----

    #[test]
    fn test_parse_address() {
        assert_eq!(parse_address("0x7800"), Ok(0x7800));
        assert_eq!(parse_address("0X7e00"), Ok(0x7E00));
        assert_eq!(parse_address("30720"), Ok(0x7800));
        assert_eq!(parse_address("0x00_78_00"), Ok(0x7800));
        assert!(parse_address("0xZZ").is_err());
        assert!(parse_address("").is_err());
    }

    // ---- exit codes ----

    #[test]
    fn test_exit_code_cli_errors() {
        assert_eq!(exit_code(&CliError::Usage("x".into()).into()), 2);
        assert_eq!(exit_code(&CliError::Config("x".into()).into()), 3);
        assert_eq!(exit_code(&CliError::Device("x".into()).into()), 4);
    }

    #[test]
    fn test_exit_code_library_errors() {
        let unreachable = anyhow::Error::from(avrflash::Error::SyncFailed { attempts: 6 });
        assert_eq!(exit_code(&unreachable), 4);

        let config = anyhow::Error::from(avrflash::Error::Config("bad".into()));
        assert_eq!(exit_code(&config), 3);

        let parse = anyhow::Error::from(avrflash::Error::ImageParse {
            line: 1,
            reason: "bad".into(),
        });
        assert_eq!(exit_code(&parse), 1);
    }

    #[test]
    fn test_exit_code_sees_through_context() {
        let err = anyhow::Error::from(avrflash::Error::DeviceNotFound).context("while flashing");
        assert_eq!(exit_code(&err), 4);
        assert_eq!(exit_code(&anyhow::anyhow!("boom")), 1);
    }
}
