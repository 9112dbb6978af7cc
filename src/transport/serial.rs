//! Serial Transportation.
use super::ByteChannel;
use crate::hal::{Halt, Watchdog};

/// USART status and data register primitives.
pub trait Uart {
    /// RXC: a received byte is waiting in the data register.
    fn rx_complete(&mut self) -> bool;
    /// FE: the waiting byte had a framing error.
    fn frame_error(&mut self) -> bool;
    fn read_data(&mut self) -> u8;
    /// UDRE: the transmit data register can take a byte.
    fn tx_ready(&mut self) -> bool;
    fn write_data(&mut self, byte: u8);
}

/// Byte channel over the hardware UART.
pub struct SerialChannel<U> {
    uart: U,
}

impl<U: Uart> SerialChannel<U> {
    pub fn new(uart: U) -> Self {
        SerialChannel { uart }
    }

    pub fn uart(&self) -> &U {
        &self.uart
    }

    pub fn uart_mut(&mut self) -> &mut U {
        &mut self.uart
    }

    pub fn into_inner(self) -> U {
        self.uart
    }
}

impl<U: Uart> ByteChannel for SerialChannel<U> {
    fn read_byte(&mut self, wdt: &mut dyn Watchdog) -> Result<u8, Halt> {
        while !self.uart.rx_complete() {
            wdt.tick()?;
        }
        // A line glitch must not keep the session alive, only real bytes do.
        if self.uart.frame_error() {
            log::warn!("framing error on rx");
        } else {
            wdt.service();
        }
        Ok(self.uart.read_data())
    }

    fn write_byte(&mut self, byte: u8) {
        while !self.uart.tx_ready() {}
        self.uart.write_data(byte);
    }
}

#[cfg(feature = "std")]
pub use self::host::{Baudrate, SerialPortUart};

#[cfg(feature = "std")]
mod host {
    use std::{fmt::Display, io::Read, io::Write, time::Duration};

    use anyhow::{Error, Result};
    use clap::{ValueEnum, builder::PossibleValue};
    use serialport::SerialPort;

    use super::Uart;

    /// Poll interval of `rx_complete`, also the watchdog tick granularity.
    const SERIAL_POLL_MS: u64 = 1;

    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
    pub enum Baudrate {
        Baud19200,
        Baud57600,
        #[default]
        Baud115200,
        Baud230400,
    }

    impl From<Baudrate> for u32 {
        fn from(value: Baudrate) -> Self {
            match value {
                Baudrate::Baud19200 => 19200,
                Baudrate::Baud57600 => 57600,
                Baudrate::Baud115200 => 115200,
                Baudrate::Baud230400 => 230400,
            }
        }
    }

    impl Display for Baudrate {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{}", u32::from(*self))
        }
    }

    impl ValueEnum for Baudrate {
        fn value_variants<'a>() -> &'a [Self] {
            &[
                Baudrate::Baud19200,
                Baudrate::Baud57600,
                Baudrate::Baud115200,
                Baudrate::Baud230400,
            ]
        }

        fn to_possible_value(&self) -> Option<PossibleValue> {
            match self {
                Baudrate::Baud19200 => Some(PossibleValue::new("Baud19200").aliases(["19200"])),
                Baudrate::Baud57600 => Some(PossibleValue::new("Baud57600").aliases(["57600"])),
                Baudrate::Baud115200 => {
                    Some(PossibleValue::new("Baud115200").aliases(["115200"]))
                }
                // LUDICROUS_SPEED
                Baudrate::Baud230400 => Some(
                    PossibleValue::new("Baud230400").aliases(["230400", "ludicrous"]),
                ),
            }
        }
    }

    /// Lets the simulated bootloader answer a real host tool through a
    /// serial port (e.g. one end of a null-modem pair).
    pub struct SerialPortUart {
        serial_port: Box<dyn SerialPort>,
        pending: Option<u8>,
    }

    impl SerialPortUart {
        pub fn open(port: &str, baudrate: Baudrate) -> Result<Self> {
            log::info!("Opening serial port: \"{}\" @ {} baud", port, baudrate);
            let port = serialport::new(port, baudrate.into())
                .timeout(Duration::from_millis(SERIAL_POLL_MS))
                .open()?;
            Ok(SerialPortUart {
                serial_port: port,
                pending: None,
            })
        }

        pub fn open_nth(nth: usize, baudrate: Baudrate) -> Result<Self> {
            let ports = serialport::available_ports()?;

            match ports.get(nth) {
                Some(port) => Self::open(&port.port_name, baudrate),
                None => Err(Error::msg("No serial ports found!")),
            }
        }

        /// Drop anything the host sent while no bootloader was listening.
        pub fn discard_input(&mut self) -> Result<()> {
            self.pending = None;
            self.serial_port.clear(serialport::ClearBuffer::Input)?;
            Ok(())
        }
    }

    impl Uart for SerialPortUart {
        fn rx_complete(&mut self) -> bool {
            if self.pending.is_some() {
                return true;
            }
            let mut buf = [0u8; 1];
            match self.serial_port.read(&mut buf) {
                Ok(1) => {
                    self.pending = Some(buf[0]);
                    true
                }
                Ok(_) => false,
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => false,
                Err(e) => {
                    log::warn!("serial read failed: {}", e);
                    false
                }
            }
        }

        fn frame_error(&mut self) -> bool {
            false
        }

        fn read_data(&mut self) -> u8 {
            self.pending.take().unwrap_or(0)
        }

        fn tx_ready(&mut self) -> bool {
            true
        }

        fn write_data(&mut self, byte: u8) {
            if let Err(e) = self
                .serial_port
                .write_all(&[byte])
                .and_then(|_| self.serial_port.flush())
            {
                log::warn!("serial write failed: {}", e);
            }
        }
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use crate::sim::{ScriptedUart, SimWatchdog};

    #[test]
    fn framing_error_does_not_service_watchdog() {
        let mut uart = ScriptedUart::new();
        uart.push_with_frame_error(0x55);
        uart.push(0x20);
        let mut chan = SerialChannel::new(uart);
        let mut wdt = SimWatchdog::virtual_clock();
        wdt.configure(crate::hal::WatchdogTimeout::Ms16);

        assert_eq!(chan.read_byte(&mut wdt).unwrap(), 0x55);
        assert_eq!(wdt.services(), 0);
        assert_eq!(chan.read_byte(&mut wdt).unwrap(), 0x20);
        assert_eq!(wdt.services(), 1);
        // nothing left: polls until the watchdog bites
        assert_eq!(chan.read_byte(&mut wdt), Err(Halt::WatchdogReset));
    }

    #[test]
    fn write_goes_straight_to_uart() {
        let mut chan = SerialChannel::new(ScriptedUart::new());
        chan.write_byte(0x14);
        chan.write_byte(0x10);
        assert_eq!(chan.uart().output(), &[0x14, 0x10]);
    }
}
