//! Data EEPROM access.
use crate::hal::{Halt, Watchdog};

/// EEPROM control register primitives.
pub trait Eeprom {
    /// EEPE clear, no write in progress.
    fn is_ready(&mut self) -> bool;
    fn read(&mut self, address: u16) -> u8;
    /// Start a byte write. Only valid when ready.
    fn write(&mut self, address: u16, value: u8);
}

/// For builds without EEPROM support. Reads as erased.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoEeprom;

impl Eeprom for NoEeprom {
    fn is_ready(&mut self) -> bool {
        true
    }

    fn read(&mut self, _address: u16) -> u8 {
        0xff
    }

    fn write(&mut self, _address: u16, _value: u8) {}
}

pub fn read_byte<E, W>(eeprom: &mut E, wdt: &mut W, address: u16) -> Result<u8, Halt>
where
    E: Eeprom + ?Sized,
    W: Watchdog + ?Sized,
{
    wait_ready(eeprom, wdt)?;
    Ok(eeprom.read(address))
}

pub fn write_byte<E, W>(eeprom: &mut E, wdt: &mut W, address: u16, value: u8) -> Result<(), Halt>
where
    E: Eeprom + ?Sized,
    W: Watchdog + ?Sized,
{
    wait_ready(eeprom, wdt)?;
    eeprom.write(address, value);
    Ok(())
}

fn wait_ready<E: Eeprom + ?Sized, W: Watchdog + ?Sized>(eeprom: &mut E, wdt: &mut W) -> Result<(), Halt> {
    while !eeprom.is_ready() {
        wdt.tick()?;
    }
    Ok(())
}
