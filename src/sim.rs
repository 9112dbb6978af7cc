//! In-memory MCU, UART and radio used by the tests and the CLI.
//!
//! Time is virtual by default: every watchdog tick is one busy-wait
//! iteration of [`TICK_US`], so a session that runs out of input ends in a
//! deterministic watchdog reset instead of hanging.
use std::{
    cell::RefCell,
    collections::VecDeque,
    rc::Rc,
    time::Instant,
};

use anyhow::{Result, ensure};
use rand::{Rng, SeedableRng, rngs::StdRng};

use crate::{
    boot::ResetMarker,
    constants::MAX_PACKET_SIZE,
    device::DeviceParams,
    eeprom::Eeprom,
    flashing::SelfProgramming,
    hal::{Hal, Halt, ResetCause, Watchdog, WatchdogTimeout},
    transport::{Radio, Uart},
};

/// Length of one busy-wait iteration on the virtual clock.
pub const TICK_US: u64 = 50;
/// Busy polls an SPM or EEPROM operation takes to complete.
const SPM_BUSY_POLLS: u8 = 4;
const EEPROM_BUSY_POLLS: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpmOp {
    Erase(u32),
    Fill(u32, u16),
    Write(u32),
    RwwEnable,
}

/// Interleaving of received bytes and flash operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceEvent {
    Rx(u8),
    Spm(SpmOp),
}

pub type Trace = Rc<RefCell<Vec<TraceEvent>>>;

#[derive(Debug, Clone, Copy)]
enum Clock {
    Virtual { now_us: u64 },
    Wall { origin: Instant },
}

#[derive(Debug, Clone)]
pub struct SimWatchdog {
    clock: Clock,
    timeout: WatchdogTimeout,
    deadline_us: Option<u64>,
    services: usize,
}

impl SimWatchdog {
    pub fn virtual_clock() -> Self {
        SimWatchdog {
            clock: Clock::Virtual { now_us: 0 },
            timeout: WatchdogTimeout::Off,
            deadline_us: None,
            services: 0,
        }
    }

    pub fn wall_clock() -> Self {
        SimWatchdog {
            clock: Clock::Wall {
                origin: Instant::now(),
            },
            ..Self::virtual_clock()
        }
    }

    pub fn now_us(&self) -> u64 {
        match self.clock {
            Clock::Virtual { now_us } => now_us,
            Clock::Wall { origin } => origin.elapsed().as_micros() as u64,
        }
    }

    /// Let virtual time pass. No effect on a wall clock.
    pub fn advance(&mut self, us: u64) {
        if let Clock::Virtual { now_us } = &mut self.clock {
            *now_us += us;
        }
    }

    pub fn timeout(&self) -> WatchdogTimeout {
        self.timeout
    }

    pub fn services(&self) -> usize {
        self.services
    }

    fn restart(&mut self) {
        let now = self.now_us();
        self.deadline_us = self.timeout.as_millis().map(|ms| now + ms as u64 * 1000);
    }
}

impl Watchdog for SimWatchdog {
    fn service(&mut self) {
        self.services += 1;
        self.restart();
    }

    fn configure(&mut self, timeout: WatchdogTimeout) {
        self.timeout = timeout;
        self.restart();
    }

    fn tick(&mut self) -> Result<(), Halt> {
        self.advance(TICK_US);
        match self.deadline_us {
            Some(deadline) if self.now_us() >= deadline => {
                log::debug!("watchdog expired after {:?}", self.timeout);
                self.deadline_us = None;
                self.timeout = WatchdogTimeout::Off;
                Err(Halt::WatchdogReset)
            }
            _ => Ok(()),
        }
    }
}

/// An MCU with self-programmable flash.
pub struct SimulatedMcu {
    params: DeviceParams,
    flash: Vec<u8>,
    temp_page: Vec<u16>,
    busy: u8,
    rww_locked: bool,
    journal: Vec<SpmOp>,
    trace: Option<Trace>,
    reset_cause: ResetCause,
    marker: ResetMarker,
    watchdog: SimWatchdog,
    handoff: Option<ResetCause>,
    app_starts: usize,
    led_toggles: usize,
}

impl SimulatedMcu {
    /// Fresh part, erased flash, just powered on.
    pub fn new(params: DeviceParams) -> Self {
        SimulatedMcu {
            params,
            flash: vec![0xff; params.flash_size as usize],
            temp_page: vec![0xffff; params.page_size as usize / 2],
            busy: 0,
            rww_locked: false,
            journal: vec![],
            trace: None,
            reset_cause: ResetCause::POWER_ON,
            marker: ResetMarker::from_raw(0x5a5a_5a5a, 0xff),
            watchdog: SimWatchdog::virtual_clock(),
            handoff: None,
            app_starts: 0,
            led_toggles: 0,
        }
    }

    pub fn with_wall_clock(mut self) -> Self {
        self.watchdog = SimWatchdog::wall_clock();
        self
    }

    pub fn with_trace(mut self, trace: Trace) -> Self {
        self.trace = Some(trace);
        self
    }

    pub fn params(&self) -> &DeviceParams {
        &self.params
    }

    pub fn flash(&self) -> &[u8] {
        &self.flash
    }

    /// Preload flash content, as if programmed by an external programmer.
    pub fn load_flash(&mut self, base: u32, data: &[u8]) -> Result<()> {
        let start = base as usize;
        let end = start + data.len();
        ensure!(
            end <= self.flash.len(),
            "image {:#06x}..{:#06x} does not fit in {} bytes of flash",
            start,
            end,
            self.flash.len()
        );
        self.flash[start..end].copy_from_slice(data);
        Ok(())
    }

    pub fn journal(&self) -> &[SpmOp] {
        &self.journal
    }

    pub fn marker(&self) -> &ResetMarker {
        &self.marker
    }

    pub fn watchdog(&self) -> &SimWatchdog {
        &self.watchdog
    }

    /// Reset cause passed to the application on its last start.
    pub fn handoff(&self) -> Option<ResetCause> {
        self.handoff
    }

    pub fn app_starts(&self) -> usize {
        self.app_starts
    }

    pub fn led_toggles(&self) -> usize {
        self.led_toggles
    }

    pub fn latched_reset_cause(&self) -> ResetCause {
        self.reset_cause
    }

    /// Power removed and restored. RAM content is lost.
    pub fn power_cycle(&mut self) {
        self.reset_cause = ResetCause::POWER_ON;
        self.marker = ResetMarker::from_raw(0x5a5a_5a5a, 0xff);
        self.reset_peripherals();
    }

    /// Reset pin pulled, e.g. by a host toggling DTR. RAM survives.
    pub fn external_reset(&mut self) {
        self.reset_cause = self.reset_cause.union(ResetCause::EXTERNAL);
        self.reset_peripherals();
    }

    pub fn brown_out(&mut self) {
        self.reset_cause = self.reset_cause.union(ResetCause::BROWN_OUT);
        self.reset_peripherals();
    }

    fn reset_peripherals(&mut self) {
        self.watchdog.configure(WatchdogTimeout::Off);
        self.busy = 0;
        self.rww_locked = false;
        self.temp_page.fill(0xffff);
    }

    fn record(&mut self, op: SpmOp) {
        self.journal.push(op);
        if let Some(trace) = &self.trace {
            trace.borrow_mut().push(TraceEvent::Spm(op));
        }
    }

    fn page_range(&self, address: u32) -> Option<std::ops::Range<usize>> {
        let start = (address & self.params.page_mask()) as usize;
        let end = start + self.params.page_size as usize;
        (end <= self.flash.len()).then_some(start..end)
    }

    fn spm_started(&mut self, address: u32) {
        self.busy = SPM_BUSY_POLLS;
        if self.params.is_rww(address) {
            self.rww_locked = true;
        }
    }
}

impl Watchdog for SimulatedMcu {
    fn service(&mut self) {
        self.watchdog.service();
    }

    fn configure(&mut self, timeout: WatchdogTimeout) {
        self.watchdog.configure(timeout);
    }

    fn tick(&mut self) -> Result<(), Halt> {
        let result = self.watchdog.tick();
        if result.is_err() {
            // WDRF latches; RAM (and the marker) survives.
            self.reset_cause = self.reset_cause.union(ResetCause::WATCHDOG);
            self.reset_peripherals();
        }
        result
    }
}

impl Hal for SimulatedMcu {
    fn read_reset_cause(&mut self) -> ResetCause {
        self.reset_cause
    }

    fn clear_reset_cause(&mut self) {
        self.reset_cause = ResetCause::NONE;
    }

    fn reset_marker(&mut self) -> &mut ResetMarker {
        &mut self.marker
    }

    fn jump_to_application(&mut self, cause: Option<ResetCause>) -> Halt {
        self.handoff = cause;
        self.app_starts += 1;
        log::info!("application started, hand-off {:?}", cause);
        Halt::StartApplication(cause.unwrap_or(ResetCause::NONE))
    }

    fn toggle_led(&mut self) {
        self.led_toggles += 1;
    }

    fn delay_ms(&mut self, ms: u16) {
        self.watchdog.advance(ms as u64 * 1000);
    }
}

impl SelfProgramming for SimulatedMcu {
    fn page_erase(&mut self, address: u32) {
        self.record(SpmOp::Erase(address));
        if let Some(range) = self.page_range(address) {
            self.flash[range].fill(0xff);
        }
        self.spm_started(address);
    }

    fn page_fill(&mut self, address: u32, word: u16) {
        self.record(SpmOp::Fill(address, word));
        let index = (address % self.params.page_size as u32) as usize / 2;
        self.temp_page[index] = word;
    }

    fn page_write(&mut self, address: u32) {
        self.record(SpmOp::Write(address));
        if let Some(range) = self.page_range(address) {
            // Programming can only clear bits; an unerased page keeps its zeros.
            for (i, cell) in self.flash[range].iter_mut().enumerate() {
                let word = self.temp_page[i / 2].to_le_bytes();
                *cell &= word[i % 2];
            }
        }
        self.temp_page.fill(0xffff);
        self.spm_started(address);
    }

    fn is_busy(&mut self) -> bool {
        if self.busy > 0 {
            self.busy -= 1;
            true
        } else {
            false
        }
    }

    fn rww_enable(&mut self) {
        self.record(SpmOp::RwwEnable);
        self.rww_locked = false;
    }

    fn read_byte(&mut self, address: u32) -> u8 {
        if self.rww_locked && self.params.is_rww(address) {
            log::warn!("read of RWW section @0x{:05x} while locked", address);
            return 0xff;
        }
        self.flash.get(address as usize).copied().unwrap_or(0xff)
    }
}

pub struct SimEeprom {
    cells: Vec<u8>,
    busy: u8,
    writes: usize,
}

impl SimEeprom {
    pub fn new(size: u16) -> Self {
        SimEeprom {
            cells: vec![0xff; size as usize],
            busy: 0,
            writes: 0,
        }
    }

    pub fn contents(&self) -> &[u8] {
        &self.cells
    }

    pub fn writes(&self) -> usize {
        self.writes
    }
}

impl Eeprom for SimEeprom {
    fn is_ready(&mut self) -> bool {
        if self.busy > 0 {
            self.busy -= 1;
            false
        } else {
            true
        }
    }

    fn read(&mut self, address: u16) -> u8 {
        let len = self.cells.len();
        self.cells[address as usize % len]
    }

    fn write(&mut self, address: u16, value: u8) {
        let len = self.cells.len();
        self.cells[address as usize % len] = value;
        self.busy = EEPROM_BUSY_POLLS;
        self.writes += 1;
    }
}

/// UART fed from a prepared byte script.
#[derive(Default)]
pub struct ScriptedUart {
    input: VecDeque<(u8, bool)>,
    current: Option<(u8, bool)>,
    output: Vec<u8>,
    trace: Option<Trace>,
}

impl ScriptedUart {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut uart = Self::new();
        uart.extend(bytes);
        uart
    }

    pub fn with_trace(mut self, trace: Trace) -> Self {
        self.trace = Some(trace);
        self
    }

    pub fn push(&mut self, byte: u8) {
        self.input.push_back((byte, false));
    }

    pub fn push_with_frame_error(&mut self, byte: u8) {
        self.input.push_back((byte, true));
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.input.extend(bytes.iter().map(|&b| (b, false)));
    }

    pub fn output(&self) -> &[u8] {
        &self.output
    }

    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.output)
    }
}

impl Uart for ScriptedUart {
    fn rx_complete(&mut self) -> bool {
        if self.current.is_none() {
            self.current = self.input.pop_front();
        }
        self.current.is_some()
    }

    fn frame_error(&mut self) -> bool {
        self.current.is_some_and(|(_, fe)| fe)
    }

    fn read_data(&mut self) -> u8 {
        let byte = self.current.take().map_or(0, |(b, _)| b);
        if let Some(trace) = &self.trace {
            trace.borrow_mut().push(TraceEvent::Rx(byte));
        }
        byte
    }

    fn tx_ready(&mut self) -> bool {
        true
    }

    fn write_data(&mut self, byte: u8) {
        self.output.push(byte);
    }
}

/// A radio whose peer is the test (or the CLI host).
///
/// Inbound packets are queued up front; every transmit attempt is recorded
/// as seen by the peer, retries included.
pub struct LoopbackRadio {
    present: bool,
    inbound: VecDeque<Vec<u8>>,
    sent: Vec<Vec<u8>>,
    rx_address: Option<[u8; 5]>,
    tx_address: Option<[u8; 5]>,
    listening: bool,
    ack_loss: f64,
    duplicate_rate: f64,
    rng: StdRng,
    delayed_ms: u64,
}

impl Default for LoopbackRadio {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackRadio {
    pub fn new() -> Self {
        Self::with_seed(0)
    }

    pub fn with_seed(seed: u64) -> Self {
        LoopbackRadio {
            present: true,
            inbound: VecDeque::new(),
            sent: vec![],
            rx_address: None,
            tx_address: None,
            listening: false,
            ack_loss: 0.0,
            duplicate_rate: 0.0,
            rng: StdRng::seed_from_u64(seed),
            delayed_ms: 0,
        }
    }

    pub fn set_present(&mut self, present: bool) {
        self.present = present;
    }

    /// Probability that the device never sees the ack for a transmission.
    pub fn set_ack_loss(&mut self, p: f64) {
        self.ack_loss = p.clamp(0.0, 1.0);
    }

    /// Probability that the peer sends a packet twice, as it would after
    /// losing our ack.
    pub fn set_duplicate_rate(&mut self, p: f64) {
        self.duplicate_rate = p.clamp(0.0, 1.0);
    }

    pub fn push_packet(&mut self, packet: &[u8]) {
        self.inbound.push_back(packet.to_vec());
        if self.rng.random_bool(self.duplicate_rate) {
            self.inbound.push_back(packet.to_vec());
        }
    }

    pub fn sent(&self) -> &[Vec<u8>] {
        &self.sent
    }

    pub fn rx_address(&self) -> Option<[u8; 5]> {
        self.rx_address
    }

    pub fn tx_address(&self) -> Option<[u8; 5]> {
        self.tx_address
    }

    pub fn listening(&self) -> bool {
        self.listening
    }

    pub fn delayed_ms(&self) -> u64 {
        self.delayed_ms
    }
}

impl Radio for LoopbackRadio {
    fn init(&mut self) -> bool {
        self.present
    }

    fn set_rx_address(&mut self, address: &[u8; 5]) {
        self.rx_address = Some(*address);
    }

    fn set_tx_address(&mut self, address: &[u8; 5]) {
        self.tx_address = Some(*address);
    }

    fn rx_mode(&mut self) {
        self.listening = true;
    }

    fn idle_mode(&mut self) {
        self.listening = false;
    }

    fn rx_fifo_data(&mut self) -> bool {
        !self.inbound.is_empty()
    }

    fn rx_read(&mut self, buf: &mut [u8; MAX_PACKET_SIZE]) -> usize {
        match self.inbound.pop_front() {
            Some(packet) => {
                let len = packet.len().min(MAX_PACKET_SIZE);
                buf[..len].copy_from_slice(&packet[..len]);
                len
            }
            None => 0,
        }
    }

    fn tx(&mut self, packet: &[u8]) {
        self.sent.push(packet.to_vec());
    }

    fn tx_result_wait(&mut self) -> bool {
        !self.rng.random_bool(self.ack_loss)
    }

    fn delay_ms(&mut self, ms: u16) {
        self.delayed_ms += ms as u64;
    }
}
