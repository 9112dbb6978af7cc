
/// Radio packet size, sequence byte included.
pub const MAX_PACKET_SIZE: usize = 32;

/// Largest flash page among supported parts.
pub const MAX_PAGE_SIZE: usize = 256;

pub const VERSION_MAJOR: u8 = 5;
pub const VERSION_MINOR: u8 = 0;

/// Reset Marker sentinel.
pub const RESET_MARKER_MAGIC: u32 = 0xdead_beef;

/// STK500v1 command codes
pub mod commands {
    pub const GET_SYNC: u8 = 0x30;
    pub const GET_PARAMETER: u8 = 0x41;
    pub const SET_DEVICE: u8 = 0x42;
    pub const SET_DEVICE_EXT: u8 = 0x45;
    pub const ENTER_PROGMODE: u8 = 0x50;
    pub const LEAVE_PROGMODE: u8 = 0x51;
    pub const LOAD_ADDRESS: u8 = 0x55;
    pub const UNIVERSAL: u8 = 0x56;
    pub const PROG_PAGE: u8 = 0x64;
    pub const READ_PAGE: u8 = 0x74;
    pub const READ_SIGN: u8 = 0x75;
}

/// STK500v1 status and framing bytes
pub mod status {
    pub const OK: u8 = 0x10;
    pub const INSYNC: u8 = 0x14;
    /// End of every request
    pub const CRC_EOP: u8 = 0x20;
}

pub mod parameters {
    pub const SW_MAJOR: u8 = 0x81;
    pub const SW_MINOR: u8 = 0x82;
    /// Returned for every other parameter id.
    pub const PLACEHOLDER: u8 = 0x03;
}

pub mod memory_type {
    pub const FLASH: u8 = b'F';
    pub const EEPROM: u8 = b'E';
}

/// SET_DEVICE / SET_DEVICE_EXT / UNIVERSAL payload sizes
pub const SET_DEVICE_LEN: usize = 20;
pub const SET_DEVICE_EXT_LEN: usize = 5;
pub const UNIVERSAL_LEN: usize = 4;
