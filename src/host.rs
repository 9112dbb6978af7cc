//! Host-side programming sessions, the way avrdude's `arduino` programmer
//! drives the bootloader.

use anyhow::Result;

use crate::{
    constants::{MAX_PACKET_SIZE, parameters},
    device::DeviceParams,
    format::Firmware,
    protocol::{Command, Response},
};

/// A scripted request stream and the commands it was built from.
#[derive(Debug, Clone, Default)]
pub struct Session {
    commands: Vec<Command>,
    requests: Vec<Vec<u8>>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, cmd: Command) -> Result<&mut Self> {
        let raw = cmd.clone().into_raw()?;
        log::trace!("=> {}", hex::encode(&raw));
        self.commands.push(cmd);
        self.requests.push(raw);
        Ok(self)
    }

    /// All requests back to back, as written to a serial line.
    pub fn script(&self) -> Vec<u8> {
        self.requests.concat()
    }

    /// One radio packet per request (split when longer than a packet), each
    /// prefixed with a sequence number counting up from `first_seq`.
    pub fn packets(&self, first_seq: u8) -> Vec<Vec<u8>> {
        let mut seq = first_seq;
        let mut packets = vec![];
        for raw in &self.requests {
            for chunk in raw.chunks(MAX_PACKET_SIZE - 1) {
                let mut packet = Vec::with_capacity(chunk.len() + 1);
                packet.push(seq);
                packet.extend_from_slice(chunk);
                packets.push(packet);
                seq = seq.wrapping_add(1);
            }
        }
        packets
    }

    /// Split the device's reply stream into one response per command.
    pub fn parse_replies(&self, mut output: &[u8]) -> Result<Vec<Response>> {
        let mut responses = Vec::with_capacity(self.commands.len());
        for cmd in &self.commands {
            let len = cmd.reply_len() + 2;
            anyhow::ensure!(
                output.len() >= len,
                "reply to {:?} truncated: {} of {} bytes",
                cmd,
                output.len(),
                len
            );
            let (raw, rest) = output.split_at(len);
            let resp = Response::from_raw(raw)?;
            log::trace!("<= {:?}", resp);
            anyhow::ensure!(resp.is_ok(), "{:?} failed: {:?}", cmd, resp);
            responses.push(resp);
            output = rest;
        }
        if !output.is_empty() {
            log::warn!("{} trailing byte(s) after the last reply", output.len());
        }
        Ok(responses)
    }
}

/// Rebuild the device's byte stream from every radio packet it sent,
/// dropping retransmissions the same way the device does.
pub fn reassemble(packets: &[Vec<u8>]) -> Vec<u8> {
    let mut last_seq = None;
    let mut out = vec![];
    for packet in packets {
        let Some((&seq, payload)) = packet.split_first() else {
            continue;
        };
        if last_seq == Some(seq) {
            continue;
        }
        last_seq = Some(seq);
        out.extend_from_slice(payload);
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub signature: [u8; 3],
    pub version: (u8, u8),
    pub pages_written: usize,
    /// `None` when read-back was not requested.
    pub verified: Option<bool>,
}

/// Plans a flash upload for one part.
pub struct Programmer {
    params: DeviceParams,
    verify: bool,
}

impl Programmer {
    pub fn new(params: DeviceParams) -> Self {
        Programmer {
            params,
            verify: true,
        }
    }

    pub fn verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    /// Page-aligned chunks of the image, padded with 0xff.
    pub fn pages(&self, firmware: &Firmware) -> Result<Vec<(u32, Vec<u8>)>> {
        let page_size = self.params.page_size as u32;
        anyhow::ensure!(
            firmware.base % page_size == 0,
            "firmware base {:#06x} is not page aligned",
            firmware.base
        );
        anyhow::ensure!(
            firmware.end() <= self.params.flash_size,
            "firmware ends at {:#06x}, beyond {} bytes of flash",
            firmware.end(),
            self.params.flash_size
        );
        Ok(firmware
            .data
            .chunks(page_size as usize)
            .enumerate()
            .map(|(i, chunk)| {
                let mut page = chunk.to_vec();
                page.resize(page_size as usize, 0xff);
                (firmware.base + i as u32 * page_size, page)
            })
            .collect())
    }

    pub fn plan(&self, firmware: &Firmware) -> Result<Session> {
        let pages = self.pages(firmware)?;
        let mut session = Session::new();
        session
            .push(Command::GetSync)?
            .push(Command::get_parameter(parameters::SW_MAJOR))?
            .push(Command::get_parameter(parameters::SW_MINOR))?
            .push(Command::SetDevice { params: [0; 20] })?
            .push(Command::SetDeviceExt { params: [0; 5] })?
            .push(Command::EnterProgmode)?
            .push(Command::ReadSign)?;
        for (address, page) in &pages {
            session
                .push(Command::load_address(*address))?
                .push(Command::prog_flash(page.clone()))?;
        }
        if self.verify {
            for (address, page) in &pages {
                session
                    .push(Command::load_address(*address))?
                    .push(Command::read_flash(page.len() as u16))?;
            }
        }
        session.push(Command::LeaveProgmode)?;
        Ok(session)
    }

    /// Check the device's replies to a session built by [`Programmer::plan`].
    pub fn check(&self, session: &Session, firmware: &Firmware, output: &[u8]) -> Result<SessionReport> {
        let responses = session.parse_replies(output)?;
        let pages = self.pages(firmware)?;

        let signature: [u8; 3] = responses[6]
            .payload()
            .try_into()
            .map_err(|_| anyhow::format_err!("bad signature reply"))?;
        anyhow::ensure!(
            signature == self.params.signature,
            "signature mismatch: device {}, expected {}",
            hex::encode(signature),
            hex::encode(self.params.signature)
        );
        let version = (responses[1].payload()[0], responses[2].payload()[0]);

        let verified = self.verify.then(|| {
            // Read-back replies sit after the 7 preamble and 2 per written page.
            let readback = &responses[7 + 2 * pages.len()..];
            pages.iter().enumerate().all(|(i, (address, page))| {
                let ok = readback[2 * i + 1].payload() == page.as_slice();
                if !ok {
                    log::warn!("verify failed for page @{:#06x}", address);
                }
                ok
            })
        });

        Ok(SessionReport {
            signature,
            version,
            pages_written: pages.len(),
            verified,
        })
    }
}
