//! Commands and responses understood by the Tock bootloader.

use std::time::Duration;

use strum::Display;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);
const PING_TIMEOUT: Duration = Duration::from_millis(300);
const WRITE_PAGE_TIMEOUT: Duration = Duration::from_secs(5);
const ERASE_PAGE_TIMEOUT: Duration = Duration::from_secs(5);
const CRC_TIMEOUT_PER_KB: Duration = Duration::from_millis(20);

/// Numeric command codes.
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq)]
#[repr(u8)]
#[non_exhaustive]
pub enum CommandType {
    Ping = 0x01,
    Info = 0x03,
    Id = 0x04,
    ReadRange = 0x12,
    WritePage = 0x13,
    ErasePage = 0x14,
    CrcInternalFlash = 0x16,
    ChangeBaud = 0x21,
    GetAttribute = 0x22,
    SetAttribute = 0x23,
    SetStartAddress = 0x25,
    Exit = 0x28,
}

impl CommandType {
    /// How long to wait for a response before declaring a timeout.
    pub fn timeout(&self) -> Duration {
        match self {
            CommandType::Ping => PING_TIMEOUT,
            CommandType::WritePage => WRITE_PAGE_TIMEOUT,
            CommandType::ErasePage => ERASE_PAGE_TIMEOUT,
            _ => DEFAULT_TIMEOUT,
        }
    }

    /// Timeout scaled by the amount of flash a command touches.
    pub fn timeout_for_size(&self, size: u32) -> Duration {
        match self {
            CommandType::CrcInternalFlash => std::cmp::max(
                DEFAULT_TIMEOUT,
                CRC_TIMEOUT_PER_KB * (size / 1024 + 1),
            ),
            _ => self.timeout(),
        }
    }
}

/// Numeric response codes.
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq)]
#[repr(u8)]
#[non_exhaustive]
pub enum ResponseCode {
    Overflow = 0x10,
    Pong = 0x11,
    BadAddress = 0x12,
    InternalError = 0x13,
    BadArguments = 0x14,
    Ok = 0x15,
    Unknown = 0x16,
    ReadRange = 0x20,
    GetAttribute = 0x22,
    CrcInternalFlash = 0x23,
    Info = 0x25,
    ChangeBaudFail = 0x26,
    /// A code this version of tockloader does not know about.
    Unrecognized = 0xff,
}

impl From<u8> for ResponseCode {
    fn from(raw: u8) -> Self {
        match raw {
            0x10 => ResponseCode::Overflow,
            0x11 => ResponseCode::Pong,
            0x12 => ResponseCode::BadAddress,
            0x13 => ResponseCode::InternalError,
            0x14 => ResponseCode::BadArguments,
            0x15 => ResponseCode::Ok,
            0x16 => ResponseCode::Unknown,
            0x20 => ResponseCode::ReadRange,
            0x22 => ResponseCode::GetAttribute,
            0x23 => ResponseCode::CrcInternalFlash,
            0x25 => ResponseCode::Info,
            0x26 => ResponseCode::ChangeBaudFail,
            _ => ResponseCode::Unrecognized,
        }
    }
}

/// The 192 byte INFO response: a length byte followed by a JSON blob.
pub const INFO_RESPONSE_LENGTH: usize = 192;

/// The 8 byte unique device identifier.
pub const ID_RESPONSE_LENGTH: usize = 8;

/// Attribute slots are always transferred whole.
pub const ATTRIBUTE_LENGTH: usize = 64;

/// Largest chunk a single READ_RANGE can return.
pub const MAX_READ_LENGTH: u16 = 4095;

/// A command with its payload, ready to put on the wire.
#[derive(Clone, Debug)]
pub enum Command<'a> {
    Ping,
    Info,
    Id,
    ReadRange {
        address: u32,
        length: u16,
    },
    WritePage {
        address: u32,
        page: &'a [u8],
    },
    ErasePage {
        address: u32,
    },
    CrcInternalFlash {
        address: u32,
        length: u32,
    },
    ChangeBaud {
        mode: BaudMode,
        baud: u32,
    },
    GetAttribute {
        index: u8,
    },
    SetAttribute {
        index: u8,
        raw: &'a [u8],
    },
    SetStartAddress {
        address: u32,
    },
    Exit,
}

/// The two phases of baud-rate negotiation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum BaudMode {
    /// Request the new rate; takes effect after the response is sent.
    Set = 0x01,
    /// Confirm, at the new rate, that both sides made the switch.
    Verify = 0x02,
}

impl Command<'_> {
    pub fn command_type(&self) -> CommandType {
        match self {
            Command::Ping => CommandType::Ping,
            Command::Info => CommandType::Info,
            Command::Id => CommandType::Id,
            Command::ReadRange { .. } => CommandType::ReadRange,
            Command::WritePage { .. } => CommandType::WritePage,
            Command::ErasePage { .. } => CommandType::ErasePage,
            Command::CrcInternalFlash { .. } => CommandType::CrcInternalFlash,
            Command::ChangeBaud { .. } => CommandType::ChangeBaud,
            Command::GetAttribute { .. } => CommandType::GetAttribute,
            Command::SetAttribute { .. } => CommandType::SetAttribute,
            Command::SetStartAddress { .. } => CommandType::SetStartAddress,
            Command::Exit => CommandType::Exit,
        }
    }

    /// The unescaped payload bytes for this command.
    pub fn payload(&self) -> Vec<u8> {
        match self {
            Command::Ping | Command::Info | Command::Id | Command::Exit => Vec::new(),
            Command::ReadRange { address, length } => {
                let mut out = Vec::with_capacity(6);
                out.extend_from_slice(&address.to_le_bytes());
                out.extend_from_slice(&length.to_le_bytes());
                out
            }
            Command::WritePage { address, page } => {
                let mut out = Vec::with_capacity(4 + page.len());
                out.extend_from_slice(&address.to_le_bytes());
                out.extend_from_slice(page);
                out
            }
            Command::ErasePage { address } | Command::SetStartAddress { address } => {
                address.to_le_bytes().to_vec()
            }
            Command::CrcInternalFlash { address, length } => {
                let mut out = Vec::with_capacity(8);
                out.extend_from_slice(&address.to_le_bytes());
                out.extend_from_slice(&length.to_le_bytes());
                out
            }
            Command::ChangeBaud { mode, baud } => {
                let mut out = Vec::with_capacity(5);
                out.push(*mode as u8);
                out.extend_from_slice(&baud.to_le_bytes());
                out
            }
            Command::GetAttribute { index } => vec![*index],
            Command::SetAttribute { index, raw } => {
                let mut out = Vec::with_capacity(1 + raw.len());
                out.push(*index);
                out.extend_from_slice(raw);
                out
            }
        }
    }

    /// The response code a successful invocation produces, and how many
    /// payload bytes follow it.
    pub fn expected_response(&self) -> (ResponseCode, usize) {
        match self {
            Command::Ping => (ResponseCode::Pong, 0),
            Command::Info => (ResponseCode::Info, INFO_RESPONSE_LENGTH),
            Command::Id => (ResponseCode::Ok, ID_RESPONSE_LENGTH),
            Command::ReadRange { length, .. } => (ResponseCode::ReadRange, *length as usize),
            Command::WritePage { .. }
            | Command::ErasePage { .. }
            | Command::ChangeBaud { .. }
            | Command::SetAttribute { .. }
            | Command::SetStartAddress { .. }
            | Command::Exit => (ResponseCode::Ok, 0),
            Command::CrcInternalFlash { .. } => (ResponseCode::CrcInternalFlash, 4),
            Command::GetAttribute { .. } => (ResponseCode::GetAttribute, ATTRIBUTE_LENGTH),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_range_payload_layout() {
        let cmd = Command::ReadRange {
            address: 0x30000,
            length: 512,
        };
        assert_eq!(cmd.payload(), vec![0x00, 0x00, 0x03, 0x00, 0x00, 0x02]);
    }

    #[test]
    fn write_page_payload_prepends_address() {
        let page = [0xaau8; 4];
        let cmd = Command::WritePage {
            address: 0x1000,
            page: &page,
        };
        assert_eq!(
            cmd.payload(),
            vec![0x00, 0x10, 0x00, 0x00, 0xaa, 0xaa, 0xaa, 0xaa]
        );
    }

    #[test]
    fn change_baud_mode_byte() {
        let cmd = Command::ChangeBaud {
            mode: BaudMode::Set,
            baud: 921_600,
        };
        assert_eq!(cmd.payload()[0], 0x01);
        assert_eq!(&cmd.payload()[1..], &921_600u32.to_le_bytes());
    }

    #[test]
    fn response_codes_round_trip() {
        for code in [0x10u8, 0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x20, 0x22, 0x23, 0x25, 0x26] {
            assert_ne!(ResponseCode::from(code), ResponseCode::Unrecognized);
        }
        assert_eq!(ResponseCode::from(0x99), ResponseCode::Unrecognized);
    }
}
