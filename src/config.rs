//! Bootloader build options, expressed as values instead of cfg flags.
use crate::constants::{VERSION_MAJOR, VERSION_MINOR};
use crate::hal::{ResetCause, WatchdogTimeout};

/// Optional features of a bootloader build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "std", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "std", serde(default))]
pub struct Capabilities {
    /// Route memory type `'E'` of PROG_PAGE / READ_PAGE to the EEPROM.
    pub eeprom: bool,
    /// LED flashes on entry. Zero disables.
    pub led_start_flashes: u8,
    /// Toggle the LED on every received byte.
    pub led_data_flash: bool,
}

/// Which physical link carries the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "std", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "std", serde(rename_all = "lowercase"))]
pub enum TransportKind {
    #[default]
    Serial,
    Radio,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "std", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "std", serde(default))]
pub struct BootConfig {
    pub capabilities: Capabilities,
    /// Picks the channel the caller hands to [`crate::boot`], and gates the
    /// data LED to serial traffic.
    pub transport: TransportKind,
    /// Reset causes that enter the protocol engine. Any other reset jumps
    /// straight to the application.
    #[cfg_attr(feature = "std", serde(with = "reset_cause_list"))]
    pub entry_causes: ResetCause,
    /// Watchdog period while waiting for the host. `Off` is treated as the
    /// default period, the session must always end in a reset.
    pub session_timeout: WatchdogTimeout,
    /// Place the reset cause in the hand-off register before jumping.
    pub forward_reset_cause: bool,
    pub version_major: u8,
    pub version_minor: u8,
    pub radio_rx_address: [u8; 5],
    pub radio_tx_address: [u8; 5],
}

impl Default for BootConfig {
    fn default() -> Self {
        BootConfig {
            capabilities: Capabilities::default(),
            transport: TransportKind::Serial,
            entry_causes: ResetCause::ALL,
            session_timeout: WatchdogTimeout::S2,
            forward_reset_cause: true,
            version_major: VERSION_MAJOR,
            version_minor: VERSION_MINOR,
            radio_rx_address: [0x02; 5],
            radio_tx_address: [0x01; 5],
        }
    }
}

#[cfg(feature = "std")]
impl BootConfig {
    pub fn from_yaml(s: &str) -> anyhow::Result<Self> {
        let cfg: Self = serde_yaml::from_str(s)?;
        anyhow::ensure!(
            cfg.session_timeout != WatchdogTimeout::Off,
            "session_timeout must be a watchdog period, not off"
        );
        Ok(cfg)
    }

    pub fn load<P: AsRef<std::path::Path>>(path: P) -> anyhow::Result<Self> {
        let p = path.as_ref();
        let raw = std::fs::read_to_string(p)?;
        log::info!("Read bootloader config from {}", p.display());
        Self::from_yaml(&raw)
    }
}

/// `entry_causes: [power-on, external, brown-out, watchdog]`
#[cfg(feature = "std")]
mod reset_cause_list {
    use serde::{Deserialize, Deserializer, Serializer, de::Error, ser::SerializeSeq};

    use crate::hal::ResetCause;

    const NAMES: [(&str, ResetCause); 4] = [
        ("power-on", ResetCause::POWER_ON),
        ("external", ResetCause::EXTERNAL),
        ("brown-out", ResetCause::BROWN_OUT),
        ("watchdog", ResetCause::WATCHDOG),
    ];

    pub fn serialize<S: Serializer>(cause: &ResetCause, serializer: S) -> Result<S::Ok, S::Error> {
        let names: Vec<_> = NAMES
            .iter()
            .filter(|(_, bit)| cause.intersects(*bit))
            .map(|(name, _)| *name)
            .collect();
        let mut seq = serializer.serialize_seq(Some(names.len()))?;
        for name in names {
            seq.serialize_element(name)?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<ResetCause, D::Error> {
        let names: Vec<String> = Vec::deserialize(deserializer)?;
        names.iter().try_fold(ResetCause::NONE, |acc, name| {
            NAMES
                .iter()
                .find(|(n, _)| n.eq_ignore_ascii_case(name))
                .map(|(_, bit)| acc.union(*bit))
                .ok_or_else(|| D::Error::custom(format!("unknown reset cause {:?}", name)))
        })
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;

    #[test]
    fn empty_yaml_is_default() {
        let cfg = BootConfig::from_yaml("{}").unwrap();
        assert_eq!(cfg, BootConfig::default());
        assert_eq!(cfg.session_timeout.as_millis(), Some(2000));
    }

    #[test]
    fn no_wait_variant() {
        let cfg = BootConfig::from_yaml(
            "entry_causes: [external]\ntransport: radio\ncapabilities:\n  eeprom: true\n",
        )
        .unwrap();
        assert_eq!(cfg.entry_causes, ResetCause::EXTERNAL);
        assert_eq!(cfg.transport, TransportKind::Radio);
        assert!(cfg.capabilities.eeprom);
        assert_eq!(cfg.capabilities.led_start_flashes, 0);
    }

    #[test]
    fn disabled_session_timeout_is_rejected() {
        assert!(BootConfig::from_yaml("session_timeout: off").is_err());
        let cfg = BootConfig::from_yaml("session_timeout: 16ms").unwrap();
        assert_eq!(cfg.session_timeout, WatchdogTimeout::Ms16);
    }

    #[test]
    fn unknown_cause_is_rejected() {
        assert!(BootConfig::from_yaml("entry_causes: [jtag]").is_err());
    }
}
