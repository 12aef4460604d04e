use std::fs::File;
use std::io::{Cursor, Read};

use modemlink_frame::{Frame, FrameConfig, FrameError, FrameReader};
use modemlink_link::LinkConfig;
use tracing::warn;

use crate::cmd::{parse_hex, DecodeArgs};
use crate::exit::{frame_error, io_error, CliError, CliResult, DATA_INVALID, SUCCESS};
use crate::output::{print_frames, FrameRow, OutputFormat};

pub fn run(args: DecodeArgs, config: &LinkConfig, format: OutputFormat) -> CliResult<i32> {
    let source: Box<dyn Read> = match (&args.hex, &args.file) {
        (Some(hex), _) => Box::new(Cursor::new(parse_hex(hex)?)),
        (_, Some(path)) => Box::new(
            File::open(path)
                .map_err(|err| io_error(&format!("opening {}", path.display()), err))?,
        ),
        _ => Box::new(std::io::stdin().lock()),
    };

    let decoded = decode_stream(source, &config.frame, args.frames)?;
    if decoded.frames.is_empty() && (decoded.skipped > 0 || decoded.trailing > 0) {
        return Err(CliError::new(DATA_INVALID, "no frames found in input"));
    }
    if decoded.skipped > 0 {
        warn!(skipped = decoded.skipped, "skipped bytes outside frames");
    }
    if decoded.trailing > 0 {
        warn!(trailing = decoded.trailing, "stream ends inside a frame");
    }

    let rows: Vec<FrameRow> = decoded.frames.iter().map(FrameRow::new).collect();
    print_frames(&rows, format);
    Ok(SUCCESS)
}

struct Decoded {
    frames: Vec<Frame>,
    skipped: u64,
    trailing: usize,
}

/// Read `source` to its end. With `split`, every wire frame is kept;
/// otherwise FMT fragments are joined into messages.
fn decode_stream<R: Read>(source: R, config: &FrameConfig, split: bool) -> CliResult<Decoded> {
    let mut reader = FrameReader::with_config(source, config);
    let mut frames = Vec::new();
    loop {
        let next = if split {
            reader.read_frame_resync()
        } else {
            reader.read_message()
        };
        match next {
            Ok(frame) => frames.push(frame),
            Err(FrameError::ConnectionClosed) => break,
            Err(err) => return Err(frame_error("decode", err)),
        }
    }
    Ok(Decoded {
        frames,
        skipped: reader.skipped(),
        trailing: reader.buffered(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use modemlink_frame::{FrameWriter, FMT_0, PDP_0};

    fn small_frames() -> FrameConfig {
        FrameConfig {
            max_frame_size: 16,
            ..FrameConfig::default()
        }
    }

    #[test]
    fn split_mode_shows_each_fragment() {
        let config = small_frames();
        let mut writer = FrameWriter::with_config(Vec::new(), &config);
        let count = writer.send(FMT_0, &[7u8; 30]).unwrap();
        assert!(count > 1);
        let wire = writer.into_inner();

        let split = decode_stream(wire.as_slice(), &config, true).unwrap();
        assert_eq!(split.frames.len(), count);
        assert!(split.frames[0].more());
        assert!(!split.frames[count - 1].more());

        let joined = decode_stream(wire.as_slice(), &config, false).unwrap();
        assert_eq!(joined.frames.len(), 1);
        assert_eq!(joined.frames[0].payload.len(), 30);
    }

    #[test]
    fn noise_is_skipped_and_counted() {
        let mut writer = FrameWriter::new(vec![0x00u8, 0x11]);
        writer.send(PDP_0, b"ok").unwrap();
        let mut wire = writer.into_inner();
        wire.push(0x80);

        let decoded = decode_stream(wire.as_slice(), &FrameConfig::default(), true).unwrap();
        assert_eq!(decoded.frames.len(), 1);
        assert_eq!(decoded.skipped, 2);
        assert_eq!(decoded.trailing, 1);
    }
}
