//! 16-bit interrupt mailbox words.
//!
//! A word with [`INT_VALID`] set either carries per-queue data bits
//! (REQ_ACK / RES_ACK / SEND) or, when [`INT_COMMAND`] is also set, a 4-bit
//! command code.

use std::fmt;

pub const INT_VALID: u16 = 0x0080;
pub const INT_COMMAND: u16 = 0x0040;
pub const INT_CMD_MASK: u16 = 0x000F;
pub const INT_DATA_MASK: u16 = 0x003F;

pub const INT_MASK_REQ_ACK_F: u16 = 0x0020;
pub const INT_MASK_REQ_ACK_R: u16 = 0x0010;
pub const INT_MASK_RES_ACK_F: u16 = 0x0008;
pub const INT_MASK_RES_ACK_R: u16 = 0x0004;
pub const INT_MASK_SEND_F: u16 = 0x0002;
pub const INT_MASK_SEND_R: u16 = 0x0001;

/// Commands exchanged through the mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    InitStart,
    InitEnd,
    ReqActive,
    ResActive,
    ReqTimeSync,
    CrashReset,
    PhoneStart,
    CrashExit,
    PhoneDeepSleep,
    NvRebuilding,
    EmerDown,
    PifInitDone,
    SilentNvRebuilding,
    NormalPowerOff,
}

impl Command {
    pub fn code(self) -> u16 {
        match self {
            Command::InitStart => 0x1,
            Command::InitEnd => 0x2,
            Command::ReqActive => 0x3,
            Command::ResActive => 0x4,
            Command::ReqTimeSync => 0x5,
            Command::CrashReset => 0x7,
            Command::PhoneStart => 0x8,
            Command::CrashExit => 0x9,
            Command::PhoneDeepSleep => 0xA,
            Command::NvRebuilding => 0xB,
            Command::EmerDown => 0xC,
            Command::PifInitDone => 0xD,
            Command::SilentNvRebuilding => 0xE,
            Command::NormalPowerOff => 0xF,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        Some(match code {
            0x1 => Command::InitStart,
            0x2 => Command::InitEnd,
            0x3 => Command::ReqActive,
            0x4 => Command::ResActive,
            0x5 => Command::ReqTimeSync,
            0x7 => Command::CrashReset,
            0x8 => Command::PhoneStart,
            0x9 => Command::CrashExit,
            0xA => Command::PhoneDeepSleep,
            0xB => Command::NvRebuilding,
            0xC => Command::EmerDown,
            0xD => Command::PifInitDone,
            0xE => Command::SilentNvRebuilding,
            0xF => Command::NormalPowerOff,
            _ => return None,
        })
    }

    /// Mailbox word carrying this command.
    pub fn to_word(self) -> u16 {
        INT_VALID | INT_COMMAND | self.code()
    }

    /// Whether the peer reports that it has crashed.
    pub fn is_crash(self) -> bool {
        matches!(self, Command::CrashReset | Command::CrashExit)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Command::InitStart => "INIT_START",
            Command::InitEnd => "INIT_END",
            Command::ReqActive => "REQ_ACTIVE",
            Command::ResActive => "RES_ACTIVE",
            Command::ReqTimeSync => "REQ_TIME_SYNC",
            Command::CrashReset => "CRASH_RESET",
            Command::PhoneStart => "PHONE_START",
            Command::CrashExit => "CRASH_EXIT",
            Command::PhoneDeepSleep => "PHONE_DEEP_SLEEP",
            Command::NvRebuilding => "NV_REBUILDING",
            Command::EmerDown => "EMER_DOWN",
            Command::PifInitDone => "PIF_INIT_DONE",
            Command::SilentNvRebuilding => "SILENT_NV_REBUILDING",
            Command::NormalPowerOff => "NORMAL_POWER_OFF",
        };
        f.write_str(name)
    }
}

/// Decoded meaning of a mailbox word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntWord {
    /// Valid bit clear; nothing to do.
    Invalid,
    /// Per-queue data bits (REQ_ACK / RES_ACK / SEND).
    Data(u16),
    Command(Command),
    /// Command bit set with a code this side does not know.
    UnknownCommand(u16),
}

pub fn decode(word: u16) -> IntWord {
    if word & INT_VALID == 0 {
        return IntWord::Invalid;
    }
    if word & INT_COMMAND != 0 {
        let code = word & INT_CMD_MASK;
        return match Command::from_code(code) {
            Some(cmd) => IntWord::Command(cmd),
            None => IntWord::UnknownCommand(code),
        };
    }
    IntWord::Data(word & INT_DATA_MASK)
}

/// Mailbox word carrying data bits.
pub fn data_word(bits: u16) -> u16 {
    INT_VALID | (bits & INT_DATA_MASK)
}

/// Fold new data bits into a word the peer has not consumed yet.
///
/// Data bits OR into a pending data word; a pending command is never
/// overwritten by data.
pub fn merge(pending: u16, bits: u16) -> u16 {
    match decode(pending) {
        IntWord::Data(old) => data_word(old | bits),
        IntWord::Invalid => data_word(bits),
        IntWord::Command(_) | IntWord::UnknownCommand(_) => pending,
    }
}
