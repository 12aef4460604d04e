//! SIPC5 channel ids.
//!
//! Ids `0..=214` carry raw data (packet data, video call, loopback).
//! Ids from [`BOOT_0`] upward are reserved for boot, dump, formatted
//! control messages and the remote file system.

/// Reserved raw channel.
pub const RAW_0: u8 = 0;
/// Circuit-switched video call data.
pub const CS_VT_DATA: u8 = 1;
/// Circuit-switched video call control.
pub const CS_VT_CONTROL: u8 = 2;
/// Circuit-switched video call audio.
pub const CS_VT_AUDIO: u8 = 3;
/// Circuit-switched video call video.
pub const CS_VT_VIDEO: u8 = 4;
/// CDMA data.
pub const CDMA_DATA: u8 = 7;
/// PCM audio data.
pub const PCM_DATA: u8 = 8;
/// First packet data (PDP context) channel.
pub const PDP_0: u8 = 10;
/// Last packet data (PDP context) channel.
pub const PDP_14: u8 = 24;
/// Bluetooth dial-up networking.
pub const BT_DUN: u8 = 25;
/// Loopback test channel.
pub const LOOPBACK: u8 = 30;

/// First boot (firmware download) channel.
pub const BOOT_0: u8 = 215;
/// First crash-dump channel.
pub const DUMP_0: u8 = 225;
/// First formatted (control message) channel.
pub const FMT_0: u8 = 235;
/// Second formatted channel.
pub const FMT_1: u8 = 236;
/// First remote file system channel.
pub const RFS_0: u8 = 245;
/// Second remote file system channel.
pub const RFS_1: u8 = 246;

/// Traffic class a channel id belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelClass {
    /// Raw data: packet data, video call, loopback.
    Raw,
    /// Firmware download.
    Boot,
    /// Crash dump upload.
    Dump,
    /// Formatted control messages (multi-frame capable).
    Fmt,
    /// Remote file system.
    Rfs,
}

impl ChannelClass {
    /// Classify a channel id.
    pub fn of(id: u8) -> Self {
        match id {
            BOOT_0..DUMP_0 => ChannelClass::Boot,
            DUMP_0..FMT_0 => ChannelClass::Dump,
            FMT_0..RFS_0 => ChannelClass::Fmt,
            RFS_0..=u8::MAX => ChannelClass::Rfs,
            _ => ChannelClass::Raw,
        }
    }

    /// Formatted channels are the only ones that carry multi-frame messages.
    pub fn reassembles(self) -> bool {
        self == ChannelClass::Fmt
    }
}

/// Returns a human-readable name for a channel id.
pub fn channel_name(id: u8) -> &'static str {
    match id {
        CS_VT_DATA..=CS_VT_VIDEO => "CS_VT",
        CDMA_DATA => "CDMA",
        PCM_DATA => "PCM",
        PDP_0..=PDP_14 => "PDP",
        BT_DUN => "BT_DUN",
        LOOPBACK => "LOOPBACK",
        _ => match ChannelClass::of(id) {
            ChannelClass::Boot => "BOOT",
            ChannelClass::Dump => "DUMP",
            ChannelClass::Fmt => "FMT",
            ChannelClass::Rfs => "RFS",
            ChannelClass::Raw => "RAW",
        },
    }
}

/// Returns true for channels used by the firmware download and dump protocols.
pub fn is_boot(id: u8) -> bool {
    matches!(ChannelClass::of(id), ChannelClass::Boot | ChannelClass::Dump)
}

/// Returns true for formatted control channels.
pub fn is_fmt(id: u8) -> bool {
    ChannelClass::of(id) == ChannelClass::Fmt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_reserved_ranges() {
        assert_eq!(ChannelClass::of(PDP_0), ChannelClass::Raw);
        assert_eq!(ChannelClass::of(214), ChannelClass::Raw);
        assert_eq!(ChannelClass::of(BOOT_0), ChannelClass::Boot);
        assert_eq!(ChannelClass::of(DUMP_0), ChannelClass::Dump);
        assert_eq!(ChannelClass::of(FMT_1), ChannelClass::Fmt);
        assert_eq!(ChannelClass::of(RFS_1), ChannelClass::Rfs);
        assert_eq!(ChannelClass::of(u8::MAX), ChannelClass::Rfs);
    }

    #[test]
    fn names_and_predicates() {
        assert_eq!(channel_name(PDP_0 + 3), "PDP");
        assert_eq!(channel_name(FMT_0), "FMT");
        assert_eq!(channel_name(100), "RAW");
        assert!(is_boot(DUMP_0 + 1));
        assert!(!is_boot(FMT_0));
        assert!(is_fmt(FMT_1));
        assert!(ChannelClass::Fmt.reassembles());
        assert!(!ChannelClass::Rfs.reassembles());
    }
}
