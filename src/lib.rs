//! STK500v1 bootloader core for AVR-class MCUs.
//!
//! The bootloader logic is `no_std` and reaches the hardware only through the
//! traits in [`hal`], [`flashing`], [`eeprom`] and [`transport`]. With the
//! default `std` feature the crate also carries an in-memory MCU ([`sim`]) and
//! the host side of the protocol.
#![cfg_attr(not(feature = "std"), no_std)]

pub mod boot;
pub mod config;
pub mod constants;
pub mod device;
pub mod eeprom;
pub mod engine;
pub mod flashing;
pub mod hal;
pub mod transport;

#[cfg(feature = "std")]
pub mod format;
#[cfg(feature = "std")]
pub mod host;
#[cfg(feature = "std")]
pub mod protocol;
#[cfg(feature = "std")]
pub mod sim;

pub use self::boot::{BootSequencer, ResetMarker, boot};
pub use self::config::BootConfig;
pub use self::device::DeviceParams;
pub use self::engine::ProtocolEngine;
pub use self::hal::{Hal, Halt, ResetCause, Watchdog};
pub use self::transport::ByteChannel;

#[cfg(feature = "std")]
pub use self::device::Chip;
#[cfg(feature = "std")]
pub use self::protocol::{Command, Response};
