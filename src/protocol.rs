//! Host side of the STK500v1 subset: request encoding and reply decoding.

use std::fmt;

use anyhow::Result;
use scroll::{BE, LE, Pwrite};

use crate::constants::{commands, memory_type, status};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryType {
    Flash,
    Eeprom,
}

impl From<MemoryType> for u8 {
    fn from(value: MemoryType) -> Self {
        match value {
            MemoryType::Flash => memory_type::FLASH,
            MemoryType::Eeprom => memory_type::EEPROM,
        }
    }
}

/// STK500v1 request
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Command {
    GetSync,
    /// Returns one byte. 0x81/0x82 are the bootloader version.
    GetParameter { param: u8 },
    /// Device programming parameters. The bootloader ignores them.
    SetDevice { params: [u8; 20] },
    SetDeviceExt { params: [u8; 5] },
    EnterProgmode,
    /// Ends the session. The device resets into the application shortly after
    /// the reply.
    LeaveProgmode,
    /// Word address, little endian on the wire.
    LoadAddress { word_address: u16 },
    /// Raw ISP instruction. Answered with a placeholder byte.
    Universal { instruction: [u8; 4] },
    /// Page write at the current address. Length is big endian.
    ProgPage { memory: MemoryType, data: Vec<u8> },
    ReadPage { memory: MemoryType, len: u16 },
    ReadSign,
}

impl Command {
    pub fn get_parameter(param: u8) -> Self {
        Command::GetParameter { param }
    }

    /// LOAD_ADDRESS for a byte address.
    pub fn load_address(byte_address: u32) -> Self {
        Command::LoadAddress {
            word_address: (byte_address >> 1) as u16,
        }
    }

    pub fn prog_flash(data: Vec<u8>) -> Self {
        Command::ProgPage {
            memory: MemoryType::Flash,
            data,
        }
    }

    pub fn read_flash(len: u16) -> Self {
        Command::ReadPage {
            memory: MemoryType::Flash,
            len,
        }
    }

    /// Payload bytes between INSYNC and OK in the reply.
    pub fn reply_len(&self) -> usize {
        match self {
            Command::GetParameter { .. } | Command::Universal { .. } => 1,
            Command::ReadSign => 3,
            Command::ReadPage { len, .. } => match *len & 0xff {
                0 => 256,
                n => n as usize,
            },
            _ => 0,
        }
    }

    pub fn into_raw(self) -> Result<Vec<u8>> {
        let mut buf = match self {
            Command::GetSync => vec![commands::GET_SYNC],
            Command::GetParameter { param } => vec![commands::GET_PARAMETER, param],
            Command::SetDevice { params } => {
                let mut buf = Vec::with_capacity(1 + params.len() + 1);
                buf.push(commands::SET_DEVICE);
                buf.extend_from_slice(&params);
                buf
            }
            Command::SetDeviceExt { params } => {
                let mut buf = Vec::with_capacity(1 + params.len() + 1);
                buf.push(commands::SET_DEVICE_EXT);
                buf.extend_from_slice(&params);
                buf
            }
            Command::EnterProgmode => vec![commands::ENTER_PROGMODE],
            Command::LeaveProgmode => vec![commands::LEAVE_PROGMODE],
            Command::LoadAddress { word_address } => {
                let mut buf = vec![commands::LOAD_ADDRESS, 0, 0];
                buf.pwrite_with(word_address, 1, LE)?;
                buf
            }
            Command::Universal { instruction } => {
                let mut buf = vec![commands::UNIVERSAL];
                buf.extend_from_slice(&instruction);
                buf
            }
            Command::ProgPage { memory, data } => {
                anyhow::ensure!(
                    !data.is_empty() && data.len() <= 256,
                    "page data must be 1..=256 bytes, got {}",
                    data.len()
                );
                // CMD, LEN(BE), TYPE, DATA
                let mut buf = vec![0u8; 1 + 2 + 1 + data.len()];
                buf[0] = commands::PROG_PAGE;
                buf.pwrite_with(data.len() as u16, 1, BE)?;
                buf[3] = memory.into();
                buf[4..].copy_from_slice(&data);
                buf
            }
            Command::ReadPage { memory, len } => {
                anyhow::ensure!((1..=256).contains(&len), "read length must be 1..=256");
                let mut buf = vec![commands::READ_PAGE, 0, 0, memory.into()];
                buf.pwrite_with(len, 1, BE)?;
                buf
            }
            Command::ReadSign => vec![commands::READ_SIGN],
        };
        buf.push(status::CRC_EOP);
        Ok(buf)
    }
}

/// Reply to a Command.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Response {
    /// INSYNC, payload, OK
    Ok(Vec<u8>),
    /// Anything else, first byte and the rest
    Err(u8, Vec<u8>),
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Response::Ok(data) => write!(f, "OK[{}]", hex::encode(data)),
            Response::Err(code, data) => write!(f, "ERROR({:x})[{}]", code, hex::encode(data)),
        }
    }
}

impl Response {
    pub fn is_ok(&self) -> bool {
        matches!(self, Response::Ok(_))
    }

    pub fn payload(&self) -> &[u8] {
        match self {
            Response::Ok(payload) => payload,
            Response::Err(_, payload) => payload,
        }
    }

    pub fn from_raw(raw: &[u8]) -> Result<Self> {
        match raw {
            [status::INSYNC, payload @ .., status::OK] => Ok(Response::Ok(payload.to_vec())),
            [first, rest @ ..] => Ok(Response::Err(*first, rest.to_vec())),
            [] => anyhow::bail!("empty response"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn load_address_is_little_endian_words() {
        assert_eq!(
            Command::load_address(0x7f00).into_raw().unwrap(),
            vec![0x55, 0x80, 0x3f, 0x20]
        );
    }

    #[test]
    fn prog_page_length_is_big_endian() {
        let raw = Command::prog_flash(vec![0xaa; 256]).into_raw().unwrap();
        assert_eq!(&raw[..4], &[0x64, 0x01, 0x00, b'F']);
        assert_eq!(raw.len(), 4 + 256 + 1);
        assert_eq!(*raw.last().unwrap(), 0x20);
    }

    #[test]
    fn read_page_layout() {
        let cmd = Command::ReadPage {
            memory: MemoryType::Eeprom,
            len: 4,
        };
        assert_eq!(cmd.reply_len(), 4);
        assert_eq!(cmd.into_raw().unwrap(), vec![0x74, 0x00, 0x04, b'E', 0x20]);
        assert_eq!(Command::read_flash(256).reply_len(), 256);
    }

    #[test]
    fn oversized_page_is_rejected() {
        assert!(Command::prog_flash(vec![0; 257]).into_raw().is_err());
        assert!(Command::prog_flash(vec![]).into_raw().is_err());
    }

    #[test]
    fn response_decoding() {
        let ok = Response::from_raw(&[0x14, 0x1e, 0x95, 0x0f, 0x10]).unwrap();
        assert!(ok.is_ok());
        assert_eq!(ok.payload(), &[0x1e, 0x95, 0x0f]);

        let err = Response::from_raw(&[0x15, 0x10]).unwrap();
        assert_eq!(err, Response::Err(0x15, vec![0x10]));
        assert!(Response::from_raw(&[]).is_err());
    }
}
