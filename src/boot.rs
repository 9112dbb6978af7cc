//! Reset path: decide between bootloader and application, once per reset.
//!
//! Must run straight out of reset: interrupts disabled and the stack pointer
//! still at its reset value. Calling it later is not supported.

use crate::{
    config::BootConfig,
    constants::RESET_MARKER_MAGIC,
    device::DeviceParams,
    eeprom::Eeprom,
    engine::ProtocolEngine,
    flashing::SelfProgramming,
    hal::{Hal, Halt, ResetCause, WatchdogTimeout},
    transport::ByteChannel,
};

/// LED half period, 1/16 s.
const LED_FLASH_MS: u16 = 62;

/// Lives in RAM that is not cleared by a watchdog reset.
///
/// While armed, the next watchdog reset goes straight to the application
/// with the reset cause saved here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct ResetMarker {
    magic: u32,
    saved_cause: ResetCause,
}

impl ResetMarker {
    pub const fn cleared() -> Self {
        ResetMarker {
            magic: 0,
            saved_cause: ResetCause::NONE,
        }
    }

    /// Whatever was left in RAM, e.g. after power-up.
    pub const fn from_raw(magic: u32, saved_cause: u8) -> Self {
        ResetMarker {
            magic,
            saved_cause: ResetCause::from_bits(saved_cause),
        }
    }

    /// Arm for an idle session, remembering why we were reset.
    pub fn arm(&mut self, cause: ResetCause) {
        self.saved_cause = cause;
        self.magic = RESET_MARKER_MAGIC;
    }

    /// Arm again, keeping the saved cause.
    pub fn rearm(&mut self) {
        self.magic = RESET_MARKER_MAGIC;
    }

    pub fn disarm(&mut self) {
        self.magic = 0;
    }

    pub fn is_armed(&self) -> bool {
        self.magic == RESET_MARKER_MAGIC
    }

    /// Consume the marker: disarmed afterwards either way.
    pub fn take(&mut self) -> Option<ResetCause> {
        let armed = self.is_armed();
        self.disarm();
        armed.then_some(self.saved_cause)
    }
}

impl Default for ResetMarker {
    fn default() -> Self {
        Self::cleared()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootDecision {
    /// Start the application, handing off this cause.
    StartApplication(ResetCause),
    EnterBootloader,
}

pub struct BootSequencer {
    config: BootConfig,
}

impl BootSequencer {
    pub fn new(config: &BootConfig) -> Self {
        BootSequencer { config: *config }
    }

    pub fn decide<H: Hal + ?Sized>(&self, hal: &mut H) -> BootDecision {
        let cause = hal.read_reset_cause();
        hal.clear_reset_cause();

        if cause.watchdog() {
            if let Some(saved) = hal.reset_marker().take() {
                log::info!("fast path to application, reset cause {:?}", saved);
                return BootDecision::StartApplication(saved);
            }
        }
        if !cause.intersects(self.config.entry_causes) {
            log::info!("reset cause {:?} does not enter the bootloader", cause);
            hal.reset_marker().disarm();
            return BootDecision::StartApplication(cause);
        }
        // Fall through to the application if nobody talks to us before the
        // session watchdog fires.
        hal.reset_marker().arm(cause);
        log::info!("entering bootloader, reset cause {:?}", cause);
        BootDecision::EnterBootloader
    }

    /// Disable the watchdog and jump through the reset vector.
    pub fn start_application<H: Hal + ?Sized>(&self, hal: &mut H, cause: ResetCause) -> Halt {
        hal.configure(WatchdogTimeout::Off);
        hal.jump_to_application(self.config.forward_reset_cause.then_some(cause))
    }
}

/// Everything from reset to the end of the session.
pub fn boot<M, C, E>(
    mcu: &mut M,
    channel: &mut C,
    eeprom: &mut E,
    params: DeviceParams,
    config: &BootConfig,
) -> Halt
where
    M: Hal + SelfProgramming,
    C: ByteChannel,
    E: Eeprom,
{
    let sequencer = BootSequencer::new(config);
    if let BootDecision::StartApplication(cause) = sequencer.decide(mcu) {
        return sequencer.start_application(mcu, cause);
    }

    let timeout = match config.session_timeout {
        WatchdogTimeout::Off => {
            log::warn!("session timeout off, using {:?}", WatchdogTimeout::default());
            WatchdogTimeout::default()
        }
        period => period,
    };
    mcu.configure(timeout);

    let flashes = config.capabilities.led_start_flashes;
    if flashes > 0 {
        if let Err(halt) = flash_led(mcu, flashes as u16 * 2) {
            return halt;
        }
    }

    if !channel.start(config) {
        // Park until the watchdog sends us to the application.
        return park(mcu);
    }

    ProtocolEngine::new(mcu, channel, eeprom, params, config).run()
}

fn flash_led<H: Hal + ?Sized>(hal: &mut H, count: u16) -> Result<(), Halt> {
    for _ in 0..count {
        hal.delay_ms(LED_FLASH_MS);
        hal.tick()?;
        hal.toggle_led();
        hal.service();
    }
    Ok(())
}

fn park<H: Hal + ?Sized>(hal: &mut H) -> Halt {
    loop {
        if let Err(halt) = hal.tick() {
            return halt;
        }
    }
}
