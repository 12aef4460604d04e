use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Subcommand};
use modemlink_frame::{channel_name, FMT_0, PDP_0};
use modemlink_link::LinkConfig;

use crate::exit::{io_error, CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod decode;
pub mod encode;
pub mod loopback;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Frame a payload for one channel.
    Encode(EncodeArgs),
    /// Decode an SIPC5 byte stream.
    Decode(DecodeArgs),
    /// Round-trip messages through a simulated modem.
    Loopback(LoopbackArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, config: LinkConfig, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Encode(args) => encode::run(args, &config, format),
        Command::Decode(args) => decode::run(args, &config, format),
        Command::Loopback(args) => loopback::run(args, config, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct EncodeArgs {
    /// Channel id or name (e.g. 235, fmt, pdp).
    #[arg(long, short = 'c', default_value_t = FMT_0, value_parser = parse_channel)]
    pub channel: u8,
    /// Text payload.
    #[arg(long, conflicts_with_all = ["hex", "file"])]
    pub data: Option<String>,
    /// Hex payload.
    #[arg(long, conflicts_with_all = ["data", "file"])]
    pub hex: Option<String>,
    /// Read payload from file.
    #[arg(long, conflicts_with_all = ["data", "hex"])]
    pub file: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct DecodeArgs {
    /// Hex-encoded stream. Reads raw bytes from --file or stdin when absent.
    pub hex: Option<String>,
    /// Read the raw stream from file.
    #[arg(long, conflicts_with = "hex")]
    pub file: Option<PathBuf>,
    /// Print individual frames instead of reassembled messages.
    #[arg(long)]
    pub frames: bool,
}

#[derive(Args, Debug)]
pub struct LoopbackArgs {
    /// Number of messages to round-trip.
    #[arg(long, default_value = "10")]
    pub count: usize,
    /// Channel id or name to send on.
    #[arg(long, short = 'c', default_value_t = PDP_0, value_parser = parse_channel)]
    pub channel: u8,
    /// Payload size in bytes.
    #[arg(long, default_value = "64")]
    pub size: usize,
    /// Use legacy DPRAM queue sizes.
    #[arg(long)]
    pub dpram: bool,
    /// Give up on a round trip after this long (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

/// Accept a numeric id or a channel class name.
pub fn parse_channel(input: &str) -> Result<u8, String> {
    if let Ok(id) = input.parse::<u8>() {
        return Ok(id);
    }
    (0..=u8::MAX)
        .find(|&id| channel_name(id).eq_ignore_ascii_case(input))
        .ok_or_else(|| format!("unknown channel: {input}"))
}

pub fn parse_hex(input: &str) -> CliResult<Vec<u8>> {
    let cleaned: String = input
        .trim()
        .trim_start_matches("0x")
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .collect();
    hex::decode(&cleaned).map_err(|err| CliError::new(USAGE, format!("invalid hex: {err}")))
}

pub fn read_file(path: &std::path::Path) -> CliResult<Vec<u8>> {
    std::fs::read(path).map_err(|err| io_error(&format!("reading {}", path.display()), err))
}

pub fn parse_timeout(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    let (number, millis) = match input.strip_suffix("ms") {
        Some(number) => (number, true),
        None => (input.strip_suffix('s').unwrap_or(input), false),
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid timeout value: {input}")))?;
    if value == 0 {
        return Err(CliError::new(USAGE, "timeout must be greater than zero"));
    }
    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}
