//! Reliable byte stream over a point-to-point packet radio.
//!
//! Every packet starts with a one-byte sequence number followed by up to 31
//! payload bytes. The sender retries until the radio reports an
//! acknowledgment; the receiver drops a packet whose sequence number equals
//! the previous one, which is what a retry after a lost acknowledgment looks
//! like. Only the immediate predecessor is filtered, there is no reordering.
use super::ByteChannel;
use crate::config::BootConfig;
use crate::constants::{MAX_PACKET_SIZE, status};
use crate::hal::{Halt, Watchdog};

/// Transmit attempts per packet before it is abandoned.
pub const TX_ATTEMPTS: usize = 128;
/// Time given to the peer to turn around into receive mode.
pub const TX_TURNAROUND_MS: u16 = 4;

/// Radio chip driver primitives (nRF24L01 in ShockBurst mode).
pub trait Radio {
    /// Probe and configure the chip. `false` if nothing answers.
    fn init(&mut self) -> bool;
    fn set_rx_address(&mut self, address: &[u8; 5]);
    fn set_tx_address(&mut self, address: &[u8; 5]);
    fn rx_mode(&mut self);
    /// Power the radio down.
    fn idle_mode(&mut self);
    /// A packet is waiting in the RX FIFO.
    fn rx_fifo_data(&mut self) -> bool;
    /// Pop one packet, returning its length.
    fn rx_read(&mut self, buf: &mut [u8; MAX_PACKET_SIZE]) -> usize;
    fn tx(&mut self, packet: &[u8]);
    /// Block until the transmission settles. `true` if the peer acknowledged.
    fn tx_result_wait(&mut self) -> bool;
    fn delay_ms(&mut self, ms: u16);
}

pub struct RadioLink<R> {
    radio: R,
    tx_buf: [u8; MAX_PACKET_SIZE],
    tx_len: usize,
    rx_buf: [u8; MAX_PACKET_SIZE],
    rx_pos: usize,
    rx_remaining: usize,
    last_rx_seq: u8,
    abandoned: usize,
}

impl<R: Radio> RadioLink<R> {
    pub fn new(radio: R) -> Self {
        RadioLink {
            radio,
            tx_buf: [0; MAX_PACKET_SIZE],
            tx_len: 1,
            rx_buf: [0; MAX_PACKET_SIZE],
            rx_pos: 0,
            rx_remaining: 0,
            last_rx_seq: 0xff,
            abandoned: 0,
        }
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    /// Sequence number the next outgoing packet will carry.
    pub fn tx_sequence(&self) -> u8 {
        self.tx_buf[0]
    }

    /// Packets given up after exhausting every attempt.
    pub fn abandoned(&self) -> usize {
        self.abandoned
    }

    /// Send the pending packet and open the next one.
    ///
    /// An exhausted retry budget is not reported: the host will stall and
    /// the watchdog ends the session.
    pub fn flush(&mut self) {
        let packet = &self.tx_buf[..self.tx_len];
        let mut acked = false;
        for attempt in 1..=TX_ATTEMPTS {
            self.radio.delay_ms(TX_TURNAROUND_MS);
            self.radio.tx(packet);
            if self.radio.tx_result_wait() {
                log::trace!("tx seq {} acked after {} attempt(s)", packet[0], attempt);
                acked = true;
                break;
            }
            // The peer may have got it and lost only our ack; there is no
            // way to tell from here.
        }
        if !acked {
            log::warn!("tx seq {} abandoned after {} attempts", packet[0], TX_ATTEMPTS);
            self.abandoned += 1;
        }
        self.tx_len = 1;
        self.tx_buf[0] = self.tx_buf[0].wrapping_add(1);
    }

    fn fetch_packet(&mut self, wdt: &mut dyn Watchdog) -> Result<(), Halt> {
        while self.rx_remaining == 0 {
            if !self.radio.rx_fifo_data() {
                wdt.tick()?;
                continue;
            }
            wdt.service();
            let len = self.radio.rx_read(&mut self.rx_buf).min(MAX_PACKET_SIZE);
            if len == 0 {
                continue;
            }
            let seq = self.rx_buf[0];
            if seq == self.last_rx_seq {
                log::trace!("rx seq {} duplicate, dropped", seq);
                continue;
            }
            log::trace!("rx seq {} with {} byte(s)", seq, len - 1);
            self.last_rx_seq = seq;
            self.rx_pos = 1;
            self.rx_remaining = len - 1;
        }
        Ok(())
    }
}

impl<R: Radio> ByteChannel for RadioLink<R> {
    fn start(&mut self, config: &BootConfig) -> bool {
        if !self.radio.init() {
            log::warn!("no radio found");
            return false;
        }
        self.radio.set_rx_address(&config.radio_rx_address);
        self.radio.set_tx_address(&config.radio_tx_address);
        self.radio.rx_mode();
        true
    }

    fn read_byte(&mut self, wdt: &mut dyn Watchdog) -> Result<u8, Halt> {
        self.fetch_packet(wdt)?;
        let byte = self.rx_buf[self.rx_pos];
        self.rx_pos += 1;
        self.rx_remaining -= 1;
        Ok(byte)
    }

    fn write_byte(&mut self, byte: u8) {
        self.tx_buf[self.tx_len] = byte;
        self.tx_len += 1;
        if byte == status::OK || self.tx_len == MAX_PACKET_SIZE {
            self.flush();
        }
    }

    fn shutdown(&mut self) {
        self.radio.idle_mode();
    }
}
