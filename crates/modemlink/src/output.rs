use std::io::{IsTerminal, Write};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use modemlink_frame::{channel_name, Frame};
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

/// One decoded frame or reassembled message.
#[derive(Debug, Serialize)]
pub struct FrameRow {
    pub channel: u8,
    pub channel_name: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_id: Option<u8>,
    pub more: bool,
    pub payload_size: usize,
    pub payload: String,
}

impl FrameRow {
    pub fn new(frame: &Frame) -> Self {
        Self {
            channel: frame.channel,
            channel_name: channel_name(frame.channel),
            frame_id: frame.frame_id(),
            more: frame.more(),
            payload_size: frame.payload.len(),
            payload: payload_preview(&frame.payload),
        }
    }
}

pub fn print_json<T: Serialize>(value: &T) {
    println!(
        "{}",
        serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
    );
}

pub fn print_frames(rows: &[FrameRow], format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            for row in rows {
                print_json(row);
            }
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["CHANNEL", "NAME", "ID", "MORE", "SIZE", "PAYLOAD"]);
            for row in rows {
                table.add_row(vec![
                    row.channel.to_string(),
                    row.channel_name.to_string(),
                    row.frame_id.map(|id| id.to_string()).unwrap_or_default(),
                    row.more.to_string(),
                    row.payload_size.to_string(),
                    row.payload.clone(),
                ]);
            }
            println!("{table}");
        }
        OutputFormat::Pretty => {
            for row in rows {
                println!(
                    "channel={} ({}) size={} payload={}",
                    row.channel, row.channel_name, row.payload_size, row.payload
                );
            }
        }
        OutputFormat::Raw => {
            for row in rows {
                println!("{}", row.payload);
            }
        }
    }
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

/// Text payloads print as-is, anything else as hex.
pub fn payload_preview(payload: &[u8]) -> String {
    match std::str::from_utf8(payload) {
        Ok(text) if !text.chars().any(char::is_control) => text.to_string(),
        _ => format!("0x{}", hex::encode(payload)),
    }
}
