//! Self-programming of the code flash, one page at a time.

use crate::{
    constants::MAX_PAGE_SIZE,
    device::DeviceParams,
    hal::{Halt, Watchdog},
};

/// SPM primitives of the MCU.
pub trait SelfProgramming {
    fn page_erase(&mut self, address: u32);
    /// Load one word into the temporary page buffer.
    fn page_fill(&mut self, address: u32, word: u16);
    fn page_write(&mut self, address: u32);
    /// An erase or write is still in flight.
    fn is_busy(&mut self) -> bool;
    /// Re-enable reads from the RWW section. No-op on parts without one.
    fn rww_enable(&mut self);
    /// `lpm`/`elpm`
    fn read_byte(&mut self, address: u32) -> u8;
}

/// RAM staging area for one PROG_PAGE.
#[derive(Clone)]
pub struct PageBuffer {
    data: [u8; MAX_PAGE_SIZE],
    staged: usize,
}

impl Default for PageBuffer {
    fn default() -> Self {
        PageBuffer {
            data: [0xff; MAX_PAGE_SIZE],
            staged: 0,
        }
    }
}

impl PageBuffer {
    /// Start a new page. Old content stays in place and is what gets written
    /// for bytes the host does not send.
    pub fn restart(&mut self) {
        self.staged = 0;
    }

    pub fn push(&mut self, byte: u8) {
        self.data[self.staged % MAX_PAGE_SIZE] = byte;
        self.staged += 1;
    }

    /// Bytes received since the last restart.
    pub fn staged(&self) -> &[u8] {
        &self.data[..self.staged.min(MAX_PAGE_SIZE)]
    }

    fn word(&self, index: usize) -> u16 {
        u16::from_le_bytes([self.data[index * 2], self.data[index * 2 + 1]])
    }
}

pub struct FlashProgrammer {
    params: DeviceParams,
}

impl FlashProgrammer {
    pub fn new(params: DeviceParams) -> Self {
        FlashProgrammer { params }
    }

    fn in_range(&self, address: u32) -> bool {
        address
            .checked_add(self.params.page_size as u32)
            .is_some_and(|end| end <= self.params.flash_size)
    }

    /// Called before the page content is received.
    ///
    /// In the RWW section the erase starts right away and runs while the host
    /// is still sending data.
    pub fn begin_page<S: SelfProgramming + ?Sized>(&self, spm: &mut S, address: u32) {
        if self.in_range(address) && self.params.is_rww(address) {
            log::trace!("early erase @0x{:05x}", address);
            spm.page_erase(address);
        }
    }

    /// Called once the whole page is staged and the request terminator checked.
    pub fn commit_page<S>(&self, spm: &mut S, address: u32, page: &PageBuffer) -> Result<(), Halt>
    where
        S: SelfProgramming + Watchdog + ?Sized,
    {
        if !self.in_range(address) {
            log::warn!("page write @0x{:05x} beyond end of flash ignored", address);
            return Ok(());
        }
        // NRWW: we may be running from the page's section, erase only now.
        if !self.params.is_rww(address) {
            log::trace!("late erase @0x{:05x}", address);
            spm.page_erase(address);
        }
        // A short page may not have covered the early erase.
        wait_spm(spm)?;

        let words = self.params.page_size as usize / 2;
        for i in 0..words {
            spm.page_fill(address + (i as u32) * 2, page.word(i));
        }
        spm.page_write(address);
        wait_spm(spm)?;
        spm.rww_enable();
        log::debug!("page @0x{:05x} written", address);
        Ok(())
    }
}

/// No timeout: a stuck SPM operation is left to the watchdog.
fn wait_spm<S: SelfProgramming + Watchdog + ?Sized>(spm: &mut S) -> Result<(), Halt> {
    while spm.is_busy() {
        spm.tick()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::WatchdogTimeout;

    #[derive(Debug, PartialEq, Eq)]
    enum Op {
        Erase(u32),
        Fill(u32, u16),
        Write(u32),
        Rww,
    }

    #[derive(Default)]
    struct Recorder {
        ops: Vec<Op>,
        busy: u8,
        ticks: u32,
    }

    impl SelfProgramming for Recorder {
        fn page_erase(&mut self, address: u32) {
            self.ops.push(Op::Erase(address));
            self.busy = 2;
        }
        fn page_fill(&mut self, address: u32, word: u16) {
            assert_eq!(self.busy, 0, "fill while busy");
            self.ops.push(Op::Fill(address, word));
        }
        fn page_write(&mut self, address: u32) {
            self.ops.push(Op::Write(address));
            self.busy = 2;
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
            self.ops.push(Op::Rww);
        }
        fn read_byte(&mut self, _address: u32) -> u8 {
            0xff
        }
    }

    impl Watchdog for Recorder {
        fn service(&mut self) {}
        fn configure(&mut self, _timeout: WatchdogTimeout) {}
        fn tick(&mut self) -> Result<(), Halt> {
            self.ticks += 1;
            Ok(())
        }
    }

    fn tiny() -> DeviceParams {
        DeviceParams {
            signature: [0x1e, 0x93, 0x0a],
            flash_size: 0x2000,
            page_size: 8,
            nrww_start: 0x1800,
            ram_start: 0x100,
            eeprom_size: 512,
        }
    }

    fn page(bytes: &[u8]) -> PageBuffer {
        let mut buf = PageBuffer::default();
        buf.restart();
        bytes.iter().for_each(|b| buf.push(*b));
        buf
    }

    #[test]
    fn rww_page_erases_early() {
        let prog = FlashProgrammer::new(tiny());
        let mut spm = Recorder::default();
        prog.begin_page(&mut spm, 0x0100);
        assert_eq!(spm.ops, vec![Op::Erase(0x0100)]);

        let buf = page(&[1, 2, 3, 4, 5, 6, 7, 8]);
        prog.commit_page(&mut spm, 0x0100, &buf).unwrap();
        assert_eq!(
            spm.ops,
            vec![
                Op::Erase(0x0100),
                Op::Fill(0x0100, 0x0201),
                Op::Fill(0x0102, 0x0403),
                Op::Fill(0x0104, 0x0605),
                Op::Fill(0x0106, 0x0807),
                Op::Write(0x0100),
                Op::Rww,
            ]
        );
        assert!(spm.ticks > 0);
    }

    #[test]
    fn nrww_page_erases_late() {
        let prog = FlashProgrammer::new(tiny());
        let mut spm = Recorder::default();
        prog.begin_page(&mut spm, 0x1800);
        assert!(spm.ops.is_empty());

        prog.commit_page(&mut spm, 0x1800, &page(&[0; 8])).unwrap();
        assert_eq!(spm.ops[0], Op::Erase(0x1800));
        assert_eq!(spm.ops[5], Op::Write(0x1800));
    }

    #[test]
    fn out_of_range_page_is_untouched() {
        let prog = FlashProgrammer::new(tiny());
        let mut spm = Recorder::default();
        prog.begin_page(&mut spm, 0x2000);
        prog.commit_page(&mut spm, 0x2000, &page(&[0; 8])).unwrap();
        prog.commit_page(&mut spm, 0x1ffc, &page(&[0; 8])).unwrap();
        assert!(spm.ops.is_empty());
    }

    #[test]
    fn short_page_keeps_previous_tail() {
        let mut buf = page(&[9; 8]);
        buf.restart();
        buf.push(1);
        buf.push(2);
        assert_eq!(buf.staged(), &[1, 2]);
        assert_eq!(buf.word(0), 0x0201);
        assert_eq!(buf.word(1), 0x0909);
    }
}
