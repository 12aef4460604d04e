use modemlink_frame::{channel_name, FrameWriter};
use modemlink_link::LinkConfig;
use serde::Serialize;
use tracing::debug;

use crate::cmd::{parse_hex, read_file, EncodeArgs};
use crate::exit::{frame_error, CliError, CliResult, SUCCESS, USAGE};
use crate::output::{print_json, print_raw, OutputFormat};

#[derive(Serialize)]
struct EncodeOutput<'a> {
    channel: u8,
    channel_name: &'a str,
    payload_size: usize,
    frames: usize,
    wire_size: usize,
    hex: String,
}

pub fn run(args: EncodeArgs, config: &LinkConfig, format: OutputFormat) -> CliResult<i32> {
    let payload = match (&args.data, &args.hex, &args.file) {
        (Some(text), _, _) => text.as_bytes().to_vec(),
        (_, Some(hex), _) => parse_hex(hex)?,
        (_, _, Some(path)) => read_file(path)?,
        _ => {
            return Err(CliError::new(
                USAGE,
                "one of --data, --hex or --file is required",
            ))
        }
    };

    let mut writer = FrameWriter::with_config(Vec::new(), &config.frame);
    let frames = writer
        .send(args.channel, &payload)
        .map_err(|err| frame_error("encode", err))?;
    let wire = writer.into_inner();
    debug!(channel = args.channel, frames, len = wire.len(), "encoded payload");

    match format {
        OutputFormat::Raw => print_raw(&wire),
        OutputFormat::Json => print_json(&EncodeOutput {
            channel: args.channel,
            channel_name: channel_name(args.channel),
            payload_size: payload.len(),
            frames,
            wire_size: wire.len(),
            hex: hex::encode(&wire),
        }),
        OutputFormat::Table | OutputFormat::Pretty => {
            println!(
                "channel={} ({}) frames={} wire_size={}",
                args.channel,
                channel_name(args.channel),
                frames,
                wire.len()
            );
            println!("{}", hex::encode(&wire));
        }
    }
    Ok(SUCCESS)
}
