//! The STK500v1 command loop.
//!
//! Only the subset avrdude needs for `-c arduino` is implemented. Unknown
//! commands are acknowledged without effect, and a request whose terminator
//! is wrong gets no reply at all: the engine forces a watchdog reset and the
//! host retries from scratch.

use crate::{
    config::{BootConfig, TransportKind},
    constants::{
        SET_DEVICE_EXT_LEN, SET_DEVICE_LEN, UNIVERSAL_LEN, commands, memory_type, parameters,
        status,
    },
    device::DeviceParams,
    eeprom::{self, Eeprom},
    flashing::{FlashProgrammer, PageBuffer, SelfProgramming},
    hal::{Hal, Halt, WatchdogTimeout},
    transport::ByteChannel,
};

/// Where PROG_PAGE / READ_PAGE data goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Memory {
    Flash,
    Eeprom,
    Unsupported,
}

pub struct ProtocolEngine<'a, M, C, E> {
    mcu: &'a mut M,
    channel: &'a mut C,
    eeprom: &'a mut E,
    config: BootConfig,
    programmer: FlashProgrammer,
    params: DeviceParams,
    /// Byte address into program memory (or EEPROM).
    address: u32,
    page: PageBuffer,
}

impl<'a, M, C, E> ProtocolEngine<'a, M, C, E>
where
    M: Hal + SelfProgramming,
    C: ByteChannel,
    E: Eeprom,
{
    pub fn new(
        mcu: &'a mut M,
        channel: &'a mut C,
        eeprom: &'a mut E,
        params: DeviceParams,
        config: &BootConfig,
    ) -> Self {
        ProtocolEngine {
            mcu,
            channel,
            eeprom,
            config: *config,
            programmer: FlashProgrammer::new(params),
            params,
            address: 0,
            page: PageBuffer::default(),
        }
    }

    pub fn address(&self) -> u32 {
        self.address
    }

    /// Serve commands until the device resets or leaves.
    pub fn run(&mut self) -> Halt {
        loop {
            if let Err(halt) = self.step() {
                log::debug!("session ended: {:?}", halt);
                return halt;
            }
        }
    }

    /// Handle exactly one command.
    pub fn step(&mut self) -> Result<(), Halt> {
        let cmd = self.getch()?;
        // Someone is talking to us: a watchdog reset from here on must come
        // back to the bootloader instead of the application.
        self.mcu.reset_marker().disarm();

        match cmd {
            commands::GET_PARAMETER => {
                let which = self.getch()?;
                self.verify_space()?;
                let value = match which {
                    parameters::SW_MAJOR => self.config.version_major,
                    parameters::SW_MINOR => self.config.version_minor,
                    _ => parameters::PLACEHOLDER,
                };
                log::debug!("GET_PARAMETER 0x{:02x} -> 0x{:02x}", which, value);
                self.putch(value);
            }
            commands::SET_DEVICE => self.get_n(SET_DEVICE_LEN)?,
            commands::SET_DEVICE_EXT => self.get_n(SET_DEVICE_EXT_LEN)?,
            commands::LOAD_ADDRESS => {
                let lo = self.getch()?;
                let hi = self.getch()?;
                // word address to byte address; bit 15 becomes the RAMPZ bit
                self.address = (u16::from_le_bytes([lo, hi]) as u32) << 1;
                log::debug!("LOAD_ADDRESS 0x{:05x}", self.address);
                self.verify_space()?;
            }
            commands::UNIVERSAL => {
                self.get_n(UNIVERSAL_LEN)?;
                self.putch(0x00);
            }
            commands::PROG_PAGE => self.prog_page()?,
            commands::READ_PAGE => self.read_page()?,
            commands::READ_SIGN => {
                self.verify_space()?;
                let [s0, s1, s2] = self.params.signature;
                self.putch(s0);
                self.putch(s1);
                self.putch(s2);
            }
            commands::LEAVE_PROGMODE => {
                log::info!("leaving programming mode");
                self.mcu.reset_marker().rearm();
                self.mcu.configure(WatchdogTimeout::Ms16);
                self.verify_space()?;
            }
            other => {
                // ENTER_PROGMODE, GET_SYNC and anything a host probes for
                log::debug!("command 0x{:02x} acknowledged", other);
                self.verify_space()?;
            }
        }
        self.putch(status::OK);
        Ok(())
    }

    fn prog_page(&mut self) -> Result<(), Halt> {
        let len = self.get_len()?;
        let memory = self.memory_type()?;
        let address = self.address;
        log::debug!("PROG_PAGE {:?} @0x{:05x} len {}", memory, address, len);

        if memory == Memory::Flash {
            self.programmer.begin_page(&mut *self.mcu, address);
        }
        self.page.restart();
        for _ in 0..len {
            let b = self.getch()?;
            self.page.push(b);
        }
        self.verify_space()?;

        match memory {
            Memory::Flash => self.programmer.commit_page(&mut *self.mcu, address, &self.page)?,
            Memory::Eeprom => {
                let mut at = address as u16;
                for &b in self.page.staged() {
                    self.mcu.service();
                    eeprom::write_byte(&mut *self.eeprom, &mut *self.mcu, at, b)?;
                    at = at.wrapping_add(1);
                }
            }
            Memory::Unsupported => log::warn!("PROG_PAGE to unknown memory ignored"),
        }
        Ok(())
    }

    fn read_page(&mut self) -> Result<(), Halt> {
        let len = self.get_len()?;
        let memory = self.memory_type()?;
        self.verify_space()?;
        log::debug!("READ_PAGE {:?} @0x{:05x} len {}", memory, self.address, len);

        if memory == Memory::Unsupported {
            log::warn!("READ_PAGE from unknown memory ignored");
            return Ok(());
        }
        for _ in 0..len {
            let b = match memory {
                Memory::Eeprom => {
                    eeprom::read_byte(&mut *self.eeprom, &mut *self.mcu, self.address as u16)?
                }
                _ => self.mcu.read_byte(self.address),
            };
            self.address = self.address.wrapping_add(1);
            self.putch(b);
        }
        Ok(())
    }

    /// Big-endian length, of which only the low byte is used. 0 means 256.
    fn get_len(&mut self) -> Result<usize, Halt> {
        let _hi = self.getch()?;
        let lo = self.getch()?;
        Ok(if lo == 0 { 256 } else { lo as usize })
    }

    fn memory_type(&mut self) -> Result<Memory, Halt> {
        let t = self.getch()?;
        if !self.config.capabilities.eeprom {
            return Ok(Memory::Flash);
        }
        Ok(match t {
            memory_type::FLASH => Memory::Flash,
            memory_type::EEPROM => Memory::Eeprom,
            _ => Memory::Unsupported,
        })
    }

    fn getch(&mut self) -> Result<u8, Halt> {
        let b = self.channel.read_byte(&mut *self.mcu)?;
        // The data LED follows the UART only.
        let serial = self.config.transport == TransportKind::Serial;
        if serial && self.config.capabilities.led_data_flash {
            self.mcu.toggle_led();
        }
        Ok(b)
    }

    fn putch(&mut self, byte: u8) {
        self.channel.write_byte(byte);
    }

    fn get_n(&mut self, count: usize) -> Result<(), Halt> {
        for _ in 0..count {
            self.getch()?;
        }
        self.verify_space()
    }

    /// Check the request terminator and start the reply.
    fn verify_space(&mut self) -> Result<(), Halt> {
        let eop = self.getch()?;
        if eop != status::CRC_EOP {
            log::warn!("expected CRC_EOP, got 0x{:02x}: forcing reset", eop);
            self.channel.shutdown();
            return Err(self.mcu.force_timeout());
        }
        self.putch(status::INSYNC);
        Ok(())
    }
}
