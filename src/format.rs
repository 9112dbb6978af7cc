//! Firmware file formats
use std::str;
use std::{borrow::Cow, path::Path};

use anyhow::Result;
use object::{
    Endianness, Object, ObjectSection, elf::FileHeader32, elf::PT_LOAD, read::elf::FileHeader,
    read::elf::ProgramHeader,
};

/// avr-gcc maps SRAM at 0x800000 and EEPROM at 0x810000 in its ELF files.
const AVR_DATA_SPACE: u64 = 0x80_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FirmwareFormat {
    PlainHex,
    IntelHex,
    ELF,
    Binary,
}

/// A flash image: contiguous bytes starting at `base`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Firmware {
    pub base: u32,
    pub data: Vec<u8>,
}

impl Firmware {
    pub fn from_binary(data: Vec<u8>) -> Self {
        Firmware { base: 0, data }
    }

    pub fn end(&self) -> u32 {
        self.base + self.data.len() as u32
    }
}

pub fn read_firmware_from_file<P: AsRef<Path>>(path: P) -> Result<Firmware> {
    let p = path.as_ref();
    let raw = std::fs::read(p)?;
    anyhow::ensure!(!raw.is_empty(), "{} is empty", p.display());

    let format = guess_format(p, &raw);
    log::info!("Read {} as {:?} format", p.display(), format);
    match format {
        FirmwareFormat::PlainHex => read_hex(str::from_utf8(&raw)?).map(Firmware::from_binary),
        FirmwareFormat::IntelHex => read_ihex(str::from_utf8(&raw)?),
        FirmwareFormat::ELF => objcopy_binary(&raw),
        FirmwareFormat::Binary => Ok(Firmware::from_binary(raw)),
    }
}

pub fn guess_format(path: &Path, raw: &[u8]) -> FirmwareFormat {
    let ext = path
        .extension()
        .map(|s| s.to_string_lossy())
        .unwrap_or_default()
        .to_lowercase();
    if ["ihex", "ihe", "h86", "hex", "a43", "a90"].contains(&&*ext) {
        return FirmwareFormat::IntelHex;
    }

    if raw.starts_with(&[0x7f, b'E', b'L', b'F']) {
        FirmwareFormat::ELF
    } else if raw.first() == Some(&b':')
        && raw
            .iter()
            .all(|&c| (c as char).is_ascii_hexdigit() || c == b':' || c == b'\n' || c == b'\r')
    {
        FirmwareFormat::IntelHex
    } else if raw
        .iter()
        .all(|&c| (c as char).is_ascii_hexdigit() || c == b'\n' || c == b'\r')
    {
        FirmwareFormat::PlainHex
    } else {
        FirmwareFormat::Binary
    }
}

pub fn read_hex(data: &str) -> Result<Vec<u8>> {
    let digits: String = data.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    Ok(hex::decode(digits)?)
}

pub fn read_ihex(data: &str) -> Result<Firmware> {
    use ihex::Record;

    let mut base_address = 0;

    let mut records = vec![];
    for record in ihex::Reader::new(data) {
        let record = record?;
        use Record::*;
        match record {
            Data { offset, value } => {
                let offset = base_address + offset as u32;

                records.push((offset, value.into()));
            }
            EndOfFile => (),
            ExtendedSegmentAddress(address) => {
                base_address = (address as u32) * 16;
            }
            StartSegmentAddress { .. } => (),
            ExtendedLinearAddress(address) => {
                base_address = (address as u32) << 16;
            }
            StartLinearAddress(_) => (),
        };
    }
    merge_sections(records)
}

/// Simulates `avr-objcopy -O binary -R .eeprom`.
pub fn objcopy_binary(elf_data: &[u8]) -> Result<Firmware> {
    let file_kind = object::FileKind::parse(elf_data)?;

    match file_kind {
        object::FileKind::Elf32 => (),
        _ => anyhow::bail!("cannot read file as ELF32 format"),
    }
    let elf_header = FileHeader32::<Endianness>::parse(elf_data)?;
    let binary = object::read::elf::ElfFile::<FileHeader32<Endianness>>::parse(elf_data)?;

    let mut sections = vec![];

    let endian = elf_header.endian()?;

    for segment in elf_header.program_headers(endian, elf_data)? {
        // Load address: where the bytes live in flash (.data is copied to RAM at startup).
        let p_paddr: u64 = segment.p_paddr(endian).into();
        let p_vaddr: u64 = segment.p_vaddr(endian).into();

        let segment_data = segment
            .data(endian, elf_data)
            .map_err(|_| anyhow::format_err!("Failed to access data for an ELF segment."))?;
        if segment_data.is_empty() || segment.p_type(endian) != PT_LOAD {
            continue;
        }
        if p_paddr >= AVR_DATA_SPACE {
            log::debug!("Skipping non-flash segment @{:#08x}", p_paddr);
            continue;
        }
        log::info!(
            "Found loadable segment, physical address: {:#06x}, virtual address: {:#08x}, size: {:#x}",
            p_paddr,
            p_vaddr,
            segment_data.len()
        );
        let (segment_offset, segment_filesize) = segment.file_range(endian);
        for section in binary.sections() {
            let Some((section_offset, section_filesize)) = section.file_range() else {
                continue;
            };
            if section_filesize != 0
                && segment_offset <= section_offset
                && segment_offset + segment_filesize >= section_offset + section_filesize
            {
                log::debug!(
                    "Matching section: {:?} offset: 0x{:x} size: 0x{:x}",
                    section.name()?,
                    section_offset,
                    section_filesize
                );
            }
        }
        sections.push((p_paddr as u32, Cow::Borrowed(segment_data)));
    }

    if sections.is_empty() {
        anyhow::bail!("no flash segments in ELF file");
    }
    log::debug!("found {} segments", sections.len());
    merge_sections(sections)
}

fn merge_sections(mut sections: Vec<(u32, Cow<[u8]>)>) -> Result<Firmware> {
    sections.sort_by_key(|(addr, _)| *addr);

    let (Some(first), Some(last)) = (sections.first(), sections.last()) else {
        anyhow::bail!("firmware contains no data");
    };
    let start_address = first.0;
    let end_address = sections
        .iter()
        .map(|(addr, data)| addr + data.len() as u32)
        .max()
        .unwrap_or(last.0);

    // Gaps read back as erased flash.
    let mut data = vec![0xffu8; (end_address - start_address) as usize];
    for (addr, sect) in &sections {
        let sect_start = (addr - start_address) as usize;
        let target = &mut data[sect_start..sect_start + sect.len()];
        if target.iter().any(|&b| b != 0xff) {
            log::warn!("overlapping data at {:#06x}", addr);
        }
        target.copy_from_slice(sect);
    }
    Ok(Firmware {
        base: start_address,
        data,
    })
}
