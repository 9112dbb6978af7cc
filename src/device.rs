//! MCU definitions: the per-part constants the bootloader is built against.

/// Build-time device parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceParams {
    pub signature: [u8; 3],
    pub flash_size: u32,
    pub page_size: u16,
    /// First byte address of the No-Read-While-Write section.
    pub nrww_start: u32,
    /// First SRAM address, the page buffer sits just above it on the target.
    pub ram_start: u16,
    pub eeprom_size: u16,
}

impl DeviceParams {
    /// ATmega328P, the usual Arduino target.
    pub const ATMEGA328P: DeviceParams = DeviceParams {
        signature: [0x1e, 0x95, 0x0f],
        flash_size: 32 * 1024,
        page_size: 128,
        nrww_start: 0x7000,
        ram_start: 0x100,
        eeprom_size: 1024,
    };

    pub const fn page_mask(&self) -> u32 {
        !(self.page_size as u32 - 1)
    }

    /// Whether the page containing `address` may be erased while code runs
    /// from the RWW section.
    pub const fn is_rww(&self, address: u32) -> bool {
        address < self.nrww_start
    }
}

#[cfg(feature = "std")]
pub use self::db::{Chip, ChipDB, Family};

#[cfg(feature = "std")]
mod db {
    use anyhow::Result;
    use serde::{Deserialize, Serialize};

    use super::DeviceParams;

    /// MCU Family
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Family {
        pub name: String,
        pub description: String,
        pub variants: Vec<Chip>,
    }

    /// Represents an MCU part
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Chip {
        pub name: String,
        /// avrdude part ids, e.g. `m328p`
        #[serde(default)]
        pub aliases: Vec<String>,
        #[serde(deserialize_with = "parse_signature")]
        pub signature: [u8; 3],

        #[serde(deserialize_with = "parse_address_and_offset")]
        pub flash_size: u32,
        #[serde(deserialize_with = "parse_address_and_offset")]
        pub page_size: u32,
        #[serde(deserialize_with = "parse_address_and_offset")]
        pub nrww_start: u32,
        #[serde(deserialize_with = "parse_address_and_offset")]
        pub ram_start: u32,
        #[serde(default, deserialize_with = "parse_address_and_offset")]
        pub eeprom_size: u32,
    }

    impl ::std::fmt::Display for Chip {
        fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
            write!(f, "{}({})", self.name, hex::encode(self.signature))
        }
    }

    pub struct ChipDB {
        families: Vec<Family>,
    }

    impl ChipDB {
        pub fn load() -> Result<Self> {
            Ok(ChipDB {
                families: vec![
                    serde_yaml::from_str(include_str!("../devices/megaAVR.yaml"))?,
                    serde_yaml::from_str(include_str!("../devices/tinyAVR.yaml"))?,
                ],
            })
        }

        pub fn families(&self) -> &[Family] {
            &self.families
        }

        pub fn chips(&self) -> impl Iterator<Item = &Chip> {
            self.families.iter().flat_map(|f| f.variants.iter())
        }

        /// Lookup by part name or avrdude alias, ignoring case.
        pub fn find_chip(&self, name: &str) -> Result<Chip> {
            let chip = self
                .chips()
                .find(|c| {
                    c.name.eq_ignore_ascii_case(name)
                        || c.aliases.iter().any(|a| a.eq_ignore_ascii_case(name))
                })
                .cloned()
                .ok_or_else(|| anyhow::format_err!("Cannot find chip named {:?}", name))?;
            log::debug!("Find chip: {}", chip);
            chip.check()?;
            Ok(chip)
        }

        pub fn find_by_signature(&self, signature: [u8; 3]) -> Result<Chip> {
            let family = self
                .families
                .iter()
                .find(|f| f.variants.iter().any(|c| c.signature == signature))
                .ok_or_else(|| {
                    anyhow::format_err!("Signature {} not found", hex::encode(signature))
                })?;
            log::debug!("Find chip family: {}", family.name);
            let chip = family
                .variants
                .iter()
                .find(|c| c.signature == signature)
                .cloned()
                .ok_or_else(|| anyhow::format_err!("Signature {} not found", hex::encode(signature)))?;
            chip.check()?;
            Ok(chip)
        }
    }

    impl Chip {
        fn check(&self) -> Result<()> {
            anyhow::ensure!(
                self.page_size.is_power_of_two()
                    && self.page_size as usize <= crate::constants::MAX_PAGE_SIZE,
                "{}: unsupported page size {}",
                self.name,
                self.page_size
            );
            anyhow::ensure!(
                self.flash_size % self.page_size == 0,
                "{}: flash size is not a whole number of pages",
                self.name
            );
            Ok(())
        }

        pub fn params(&self) -> DeviceParams {
            DeviceParams {
                signature: self.signature,
                flash_size: self.flash_size,
                page_size: self.page_size as u16,
                nrww_start: self.nrww_start,
                ram_start: self.ram_start as u16,
                eeprom_size: self.eeprom_size as u16,
            }
        }
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawNumber {
        Int(u64),
        Str(String),
    }

    fn parse_signature<'de, D>(deserializer: D) -> std::result::Result<[u8; 3], D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error;

        let s: String = serde::Deserialize::deserialize(deserializer)?;
        let raw = hex::decode(s.trim_start_matches("0x")).map_err(D::Error::custom)?;
        raw.try_into()
            .map_err(|_| D::Error::custom(format!("signature {:?} is not 3 bytes", s)))
    }

    fn parse_address_and_offset<'de, D>(deserializer: D) -> std::result::Result<u32, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error;

        let s = match RawNumber::deserialize(deserializer)? {
            RawNumber::Int(n) => return u32::try_from(n).map_err(D::Error::custom),
            RawNumber::Str(s) => s,
        };
        let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            u32::from_str_radix(hex, 16)
        } else if let Some(kib) = s.strip_suffix("KiB") {
            kib.parse::<u32>().map(|n| n * 1024)
        } else if let Some(kb) = s.strip_suffix("KB") {
            kb.parse::<u32>().map(|n| n * 1024)
        } else if let Some(k) = s.strip_suffix('K') {
            k.parse::<u32>().map(|n| n * 1024)
        } else {
            s.parse()
        };
        parsed.map_err(|e| D::Error::custom(format!("error while parsing {:?}: {}", s, e)))
    }
}
