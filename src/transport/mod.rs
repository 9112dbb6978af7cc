//! Abstract byte channel the protocol engine talks through.
use crate::config::BootConfig;
use crate::hal::{Halt, Watchdog};

pub use self::radio::{Radio, RadioLink};
pub use self::serial::{SerialChannel, Uart};
#[cfg(feature = "std")]
pub use self::serial::{Baudrate, SerialPortUart};

pub mod radio;
pub mod serial;

/// Abstraction of the transport layer.
/// Either a hardware UART or a radio link.
pub trait ByteChannel {
    /// Bring the link up. `false` when the hardware is missing.
    fn start(&mut self, _config: &BootConfig) -> bool {
        true
    }

    /// Blocks until a byte arrives. There is no timeout of its own: every
    /// empty poll ticks `wdt`, and the link services it when data shows up.
    fn read_byte(&mut self, wdt: &mut dyn Watchdog) -> Result<u8, Halt>;

    fn write_byte(&mut self, byte: u8);

    /// Quiesce the link ahead of a forced reset.
    fn shutdown(&mut self) {}
}
