//! Argument surface of the `reef` binary.

pub mod app;
pub mod error;

use std::path::PathBuf;

use bytes::Bytes;
use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::config::ReefConfig;
use crate::telemetry::logging::{LogConfig, LogLevel};

use self::error::CliError;

#[derive(Parser, Debug)]
#[command(
    name = "reef",
    about = "Inspect and edit large files through a remote editing service",
    version
)]
pub struct Cli {
    #[arg(
        long,
        global = true,
        value_name = "PATH",
        env = "REEF_CONFIG",
        help = "Config file (defaults to <config dir>/reef/config.toml)"
    )]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, help = "Editing service host")]
    pub host: Option<String>,

    #[arg(long, global = true, help = "Editing service port")]
    pub port: Option<u16>,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = Backend::Http,
        help = "Talk to a service over HTTP, or edit in process"
    )]
    pub backend: Backend,

    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    /// CLI flags are the top layer over file and environment settings.
    pub fn apply_overrides(&self, config: &mut ReefConfig) {
        if let Some(host) = self.host.as_deref().map(str::trim).filter(|h| !h.is_empty()) {
            config.host = host.to_string();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    Http,
    Memory,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        global = true,
        value_enum,
        env = "REEF_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        global = true,
        value_name = "PATH",
        env = "REEF_LOG_FILE",
        help = "Write logs to the specified file instead of stderr"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Verify the service is up and print its version and one heartbeat sample
    Info,
    /// Print a hexdump of one window of a file
    View(ViewArgs),
    /// Print the offsets of every match of a pattern
    Search(SearchArgs),
    /// Replace every match of a pattern, then save
    Replace(ReplaceArgs),
    /// Overwrite bytes at an offset, then save
    Edit(EditArgs),
}

#[derive(Args, Debug)]
pub struct ViewArgs {
    pub file: PathBuf,

    #[arg(long, default_value_t = 0)]
    pub offset: u64,

    #[arg(long, help = "Window length (defaults to the configured viewport capacity)")]
    pub length: Option<u64>,
}

#[derive(Args, Debug, Clone)]
pub struct PatternArgs {
    #[arg(short = 'i', long = "ignore-case", help = "ASCII case-insensitive match")]
    pub ignore_case: bool,

    #[arg(long, help = "Patterns are hex strings rather than text")]
    pub hex: bool,
}

#[derive(Args, Debug)]
pub struct SearchArgs {
    pub file: PathBuf,
    pub pattern: String,

    #[command(flatten)]
    pub pattern_args: PatternArgs,

    #[arg(long, default_value_t = 0)]
    pub offset: u64,

    #[arg(long, default_value_t = 0, help = "Bytes to search (0 = to end)")]
    pub length: u64,

    #[arg(long, default_value_t = 0, help = "Maximum matches (0 = unlimited)")]
    pub limit: u64,
}

#[derive(Args, Debug, Clone)]
pub struct SaveArgs {
    #[arg(long = "save-as", value_name = "PATH", help = "Write to PATH instead of the input file")]
    pub save_as: Option<PathBuf>,

    #[arg(short = 'y', long, help = "Overwrite without asking if the file changed on disk")]
    pub yes: bool,
}

#[derive(Args, Debug)]
pub struct ReplaceArgs {
    pub file: PathBuf,
    pub pattern: String,
    pub replacement: String,

    #[command(flatten)]
    pub pattern_args: PatternArgs,

    #[command(flatten)]
    pub save: SaveArgs,
}

#[derive(Args, Debug)]
pub struct EditArgs {
    pub file: PathBuf,
    pub offset: u64,

    #[arg(help = "Replacement bytes as hex, e.g. \"de ad be ef\"")]
    pub bytes: String,

    #[command(flatten)]
    pub save: SaveArgs,
}

/// Text is taken as UTF-8; hex may contain whitespace between bytes.
pub fn parse_bytes(raw: &str, hex: bool) -> Result<Bytes, CliError> {
    if !hex {
        return Ok(Bytes::copy_from_slice(raw.as_bytes()));
    }
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    hex::decode(&compact)
        .map(Bytes::from)
        .map_err(|err| CliError::InvalidArgument(format!("invalid hex {raw:?}: {err}")))
}
