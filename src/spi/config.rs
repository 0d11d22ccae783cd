//! SPI session configuration
//!
//! A [`SpiConfig`] can be built in code or loaded from TOML:
//!
//! ```toml
//! device = 0
//! mode = "polled"
//! speed = 500          # CDIV: 500 MHz core clock / 500 = 1 MHz
//! soc = "bcm2711"
//! poll_timeout_ms = 100
//! ```
//!
//! Missing keys take their defaults.

use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::regs::{SPI0_OFFSET, SPI_INSTANCE_STRIDE, SPI_REGISTER_LEN};
use crate::error::{ConfigError, MapError};
use crate::mmap::PhysicalAddressRange;

/// Default clock divider: 1 MHz from the 500 MHz BCM2711 core clock
pub const DEFAULT_CLOCK_DIVIDER: u32 = 500;

/// Default bound on every status poll
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// How transfers are synchronized with the hardware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferMode {
    /// Busy-poll status bits (the only implemented mode)
    #[default]
    Polled,
    Interrupt,
    Dma,
}

/// SoC family, which fixes where the peripheral window sits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Soc {
    /// Raspberry Pi 1 / Zero
    Bcm2835,
    /// Raspberry Pi 3
    Bcm2837,
    /// Raspberry Pi 4
    #[default]
    Bcm2711,
}

impl Soc {
    /// ARM physical address of the peripheral window
    pub const fn peripheral_base(self) -> u32 {
        match self {
            Soc::Bcm2835 => 0x2000_0000,
            Soc::Bcm2837 => 0x3F00_0000,
            Soc::Bcm2711 => 0xFE00_0000,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Soc::Bcm2835 => "bcm2835",
            Soc::Bcm2837 => "bcm2837",
            Soc::Bcm2711 => "bcm2711",
        }
    }
}

impl fmt::Display for Soc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Error)]
#[error("unknown SoC '{0}' (expected bcm2835, bcm2837 or bcm2711)")]
pub struct UnknownSoc(String);

impl FromStr for Soc {
    type Err = UnknownSoc;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "bcm2835" | "pi1" | "pi0" => Ok(Soc::Bcm2835),
            "bcm2837" | "pi3" => Ok(Soc::Bcm2837),
            "bcm2711" | "pi4" => Ok(Soc::Bcm2711),
            _ => Err(UnknownSoc(s.to_string())),
        }
    }
}

/// Configuration of one SPI session, fixed for the session's lifetime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpiConfig {
    /// SPI instance index, counted in 0x200 strides from SPI0
    pub device: u8,
    /// Synchronization mode
    pub mode: TransferMode,
    /// Clock divider written verbatim to CLK (SCLK = core clock / CDIV)
    pub speed: u32,
    /// SoC the peripheral window belongs to
    pub soc: Soc,
    /// Upper bound on each status poll
    #[serde(rename = "poll_timeout_ms", with = "millis")]
    pub poll_timeout: Duration,
}

impl Default for SpiConfig {
    fn default() -> Self {
        Self {
            device: 0,
            mode: TransferMode::Polled,
            speed: DEFAULT_CLOCK_DIVIDER,
            soc: Soc::default(),
            poll_timeout: DEFAULT_POLL_TIMEOUT,
        }
    }
}

impl SpiConfig {
    /// Polled configuration for `device` with clock divider `speed`
    pub fn new(device: u8, speed: u32) -> Self {
        Self {
            device,
            speed,
            ..Default::default()
        }
    }

    pub fn with_mode(mut self, mode: TransferMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_soc(mut self, soc: Soc) -> Self {
        self.soc = soc;
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Physical base of this device's register block
    pub fn physical_base(&self) -> u32 {
        self.soc.peripheral_base() + SPI0_OFFSET + u32::from(self.device) * SPI_INSTANCE_STRIDE
    }

    /// Physical window holding this device's register block
    pub fn register_range(&self) -> Result<PhysicalAddressRange, MapError> {
        PhysicalAddressRange::new(self.physical_base(), SPI_REGISTER_LEN)
    }

    /// Parse a config from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Load a config from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Render as TOML
    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string(self)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{ser, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(value.as_millis()).map_err(ser::Error::custom)?;
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = SpiConfig::default();
        assert_eq!(config.device, 0);
        assert_eq!(config.mode, TransferMode::Polled);
        assert_eq!(config.speed, 500);
        assert_eq!(config.soc, Soc::Bcm2711);
        assert_eq!(config.poll_timeout, Duration::from_millis(100));
    }

    #[test]
    fn test_physical_base() {
        assert_eq!(SpiConfig::new(0, 500).physical_base(), 0xFE20_4000);
        assert_eq!(SpiConfig::new(1, 500).physical_base(), 0xFE20_4200);
        assert_eq!(SpiConfig::new(6, 500).physical_base(), 0xFE20_4C00);
        assert_eq!(
            SpiConfig::new(0, 500).with_soc(Soc::Bcm2837).physical_base(),
            0x3F20_4000
        );
        assert_eq!(
            SpiConfig::new(0, 500).with_soc(Soc::Bcm2835).physical_base(),
            0x2020_4000
        );
    }

    #[test]
    fn test_register_range() {
        let range = SpiConfig::new(3, 500).register_range().unwrap();
        assert_eq!(range.base(), 0xFE20_4600);
        assert_eq!(range.length(), 0x18);
    }

    #[test]
    fn test_parse_partial_toml() {
        let config = SpiConfig::from_toml_str("device = 1\nspeed = 64\n").unwrap();
        assert_eq!(config.device, 1);
        assert_eq!(config.speed, 64);
        assert_eq!(config.mode, TransferMode::Polled);
        assert_eq!(config.poll_timeout, DEFAULT_POLL_TIMEOUT);
    }

    #[test]
    fn test_parse_full_toml() {
        let config = SpiConfig::from_toml_str(
            "device = 0\nmode = \"dma\"\nspeed = 8\nsoc = \"bcm2837\"\npoll_timeout_ms = 5\n",
        )
        .unwrap();
        assert_eq!(config.mode, TransferMode::Dma);
        assert_eq!(config.soc, Soc::Bcm2837);
        assert_eq!(config.poll_timeout, Duration::from_millis(5));
    }

    #[test]
    fn test_parse_rejects_bad_mode() {
        let result = SpiConfig::from_toml_str("mode = \"turbo\"\n");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = SpiConfig::new(2, 128).with_poll_timeout(Duration::from_millis(250));
        let text = config.to_toml_string().unwrap();
        assert!(text.contains("poll_timeout_ms = 250"));
        assert_eq!(SpiConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn test_unrepresentable_timeout_fails_to_serialize() {
        let config = SpiConfig::default().with_poll_timeout(Duration::MAX);
        assert!(config.to_toml_string().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "device = 4").unwrap();
        writeln!(file, "soc = \"bcm2711\"").unwrap();

        let config = SpiConfig::load(file.path()).unwrap();
        assert_eq!(config.device, 4);
        assert_eq!(config.physical_base(), 0xFE20_4800);
    }

    #[test]
    fn test_load_missing_file() {
        let result = SpiConfig::load(Path::new("/nonexistent/spi.toml"));
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_soc_from_str() {
        assert_eq!("pi4".parse::<Soc>().unwrap(), Soc::Bcm2711);
        assert_eq!("BCM2837".parse::<Soc>().unwrap(), Soc::Bcm2837);
        assert!("esp32".parse::<Soc>().is_err());
    }
}
