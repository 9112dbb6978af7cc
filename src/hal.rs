//! Hardware abstraction seam.
//!
//! The protocol engine, the flash programmer and the boot sequencer only talk
//! to the MCU through these traits. A target port implements them with raw
//! register access; [`crate::sim`] implements them in memory so the rest of
//! the crate can be exercised on a host.
use bitfield::bitfield;

use crate::boot::ResetMarker;

bitfield! {
    /// Hardware-latched reset cause flags (MCUSR layout).
    #[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ResetCause(u8);
    impl Debug;
    pub power_on, set_power_on: 0;
    pub external, set_external: 1;
    pub brown_out, set_brown_out: 2;
    pub watchdog, set_watchdog: 3;
}

impl ResetCause {
    pub const NONE: ResetCause = ResetCause(0);
    pub const POWER_ON: ResetCause = ResetCause(1 << 0);
    pub const EXTERNAL: ResetCause = ResetCause(1 << 1);
    pub const BROWN_OUT: ResetCause = ResetCause(1 << 2);
    pub const WATCHDOG: ResetCause = ResetCause(1 << 3);
    pub const ALL: ResetCause = ResetCause(0x0f);

    pub const fn from_bits(bits: u8) -> Self {
        ResetCause(bits & 0x0f)
    }

    pub const fn bits(&self) -> u8 {
        self.0
    }

    pub const fn union(self, other: ResetCause) -> Self {
        ResetCause(self.0 | other.0)
    }

    pub const fn intersects(&self, other: ResetCause) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

/// How control leaves the bootloader.
///
/// A target never observes either value: a watchdog reset restarts the chip
/// and the application jump goes through the reset vector. The simulator
/// returns them so a session can be inspected after it ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Halt {
    /// The watchdog expired and the device reset.
    WatchdogReset,
    /// Control was passed to the application, with the cause handed off.
    StartApplication(ResetCause),
}

/// Watchdog prescaler settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "std", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "std", serde(rename_all = "lowercase"))]
pub enum WatchdogTimeout {
    Off,
    #[cfg_attr(feature = "std", serde(rename = "16ms"))]
    Ms16,
    #[cfg_attr(feature = "std", serde(rename = "32ms"))]
    Ms32,
    #[cfg_attr(feature = "std", serde(rename = "64ms"))]
    Ms64,
    #[cfg_attr(feature = "std", serde(rename = "125ms"))]
    Ms125,
    #[cfg_attr(feature = "std", serde(rename = "250ms"))]
    Ms250,
    #[cfg_attr(feature = "std", serde(rename = "500ms"))]
    Ms500,
    #[cfg_attr(feature = "std", serde(rename = "1s"))]
    S1,
    #[default]
    #[cfg_attr(feature = "std", serde(rename = "2s"))]
    S2,
    #[cfg_attr(feature = "std", serde(rename = "4s"))]
    S4,
    #[cfg_attr(feature = "std", serde(rename = "8s"))]
    S8,
}

impl WatchdogTimeout {
    /// Nominal period, `None` when disabled.
    pub const fn as_millis(&self) -> Option<u32> {
        match self {
            WatchdogTimeout::Off => None,
            WatchdogTimeout::Ms16 => Some(16),
            WatchdogTimeout::Ms32 => Some(32),
            WatchdogTimeout::Ms64 => Some(64),
            WatchdogTimeout::Ms125 => Some(125),
            WatchdogTimeout::Ms250 => Some(250),
            WatchdogTimeout::Ms500 => Some(500),
            WatchdogTimeout::S1 => Some(1000),
            WatchdogTimeout::S2 => Some(2000),
            WatchdogTimeout::S4 => Some(4000),
            WatchdogTimeout::S8 => Some(8000),
        }
    }

    /// WDTCSR value: WDE plus the WDP prescaler bits.
    pub const fn register_value(&self) -> u8 {
        const WDE: u8 = 1 << 3;
        const WDP0: u8 = 1 << 0;
        const WDP1: u8 = 1 << 1;
        const WDP2: u8 = 1 << 2;
        const WDP3: u8 = 1 << 5;
        match self {
            WatchdogTimeout::Off => 0,
            WatchdogTimeout::Ms16 => WDE,
            WatchdogTimeout::Ms32 => WDP0 | WDE,
            WatchdogTimeout::Ms64 => WDP1 | WDE,
            WatchdogTimeout::Ms125 => WDP1 | WDP0 | WDE,
            WatchdogTimeout::Ms250 => WDP2 | WDE,
            WatchdogTimeout::Ms500 => WDP2 | WDP0 | WDE,
            WatchdogTimeout::S1 => WDP2 | WDP1 | WDE,
            WatchdogTimeout::S2 => WDP2 | WDP1 | WDP0 | WDE,
            WatchdogTimeout::S4 => WDP3 | WDE,
            WatchdogTimeout::S8 => WDP3 | WDP0 | WDE,
        }
    }
}

/// The watchdog timer, the only timeout mechanism the bootloader has.
///
/// Only safe with interrupts disabled.
pub trait Watchdog {
    /// Restart the countdown (`wdr`).
    fn service(&mut self);

    /// Reprogram the prescaler; `Off` disables the watchdog.
    fn configure(&mut self, timeout: WatchdogTimeout);

    /// Called once per iteration of every busy-wait loop.
    ///
    /// On a target this is a no-op returning `Ok`: an expired watchdog resets
    /// the chip asynchronously. Simulated watchdogs return
    /// `Err(Halt::WatchdogReset)` once their deadline passed.
    fn tick(&mut self) -> Result<(), Halt>;

    /// Arm the shortest timeout and spin until the watchdog resets the device.
    fn force_timeout(&mut self) -> Halt {
        self.configure(WatchdogTimeout::Ms16);
        loop {
            if let Err(halt) = self.tick() {
                return halt;
            }
        }
    }
}

/// Reset cause register, application hand-off and board LED.
pub trait Hal: Watchdog {
    fn read_reset_cause(&mut self) -> ResetCause;

    fn clear_reset_cause(&mut self);

    /// RAM cell that survives a watchdog reset but not a power cycle.
    fn reset_marker(&mut self) -> &mut ResetMarker;

    /// Transfer control to the application through the reset vector.
    ///
    /// `cause`, when present, is placed in the hand-off register first. The
    /// watchdog has already been disabled by the caller.
    fn jump_to_application(&mut self, cause: Option<ResetCause>) -> Halt;

    fn toggle_led(&mut self);

    /// Busy-wait for roughly `ms` milliseconds.
    fn delay_ms(&mut self, ms: u16);
}
