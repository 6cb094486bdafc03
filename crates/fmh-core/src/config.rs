//! Build configuration.
//!
//! A TOML document with one `[global]` table and an ordered list of
//! `[[section]]` tables. Section order is build order.
//!
//! ```toml
//! [global]
//! output = "rom.ima"
//! flash_size = "16M"
//! block_size = "64K"
//!
//! [[section]]
//! name = "boot"
//! type = 0x0101
//! locate = "start"
//! file = "u-boot.bin"
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::format::{Compression, ModuleFlags, ModuleType, NO_LOAD_ADDRESS};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Config parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Config encode error: {0}")]
    Encode(#[from] toml::ser::Error),
    #[error("Invalid size value '{0}'")]
    InvalidSize(String),
    #[error("Missing field '{field}' for {section}")]
    MissingField {
        section: String,
        field: &'static str,
    },
    #[error("Invalid flash geometry: {0}")]
    InvalidGeometry(String),
}

/// Parse `123`, `0x7B`, `64K`, `16M`.
pub fn parse_number(text: &str) -> Result<u64, ConfigError> {
    let invalid = || ConfigError::InvalidSize(text.to_string());
    let trimmed = text.trim();

    let (body, scale) = match trimmed.chars().last() {
        Some('k' | 'K') => (&trimmed[..trimmed.len() - 1], 1024u64),
        Some('m' | 'M') => (&trimmed[..trimmed.len() - 1], 1024 * 1024),
        _ => (trimmed, 1),
    };
    let body = body.trim();

    let value = if let Some(hex) = body
        .strip_prefix("0x")
        .or_else(|| body.strip_prefix("0X"))
    {
        u64::from_str_radix(hex, 16).map_err(|_| invalid())?
    } else {
        body.parse::<u64>().map_err(|_| invalid())?
    };

    value.checked_mul(scale).ok_or_else(invalid)
}

/// Raw TOML value accepted wherever a size is expected.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SizeRepr {
    Int(i64),
    Text(String),
}

impl SizeRepr {
    fn to_u32(&self) -> Result<u32, ConfigError> {
        let value = match self {
            SizeRepr::Int(v) => {
                u64::try_from(*v).map_err(|_| ConfigError::InvalidSize(v.to_string()))?
            }
            SizeRepr::Text(s) => parse_number(s)?,
        };
        u32::try_from(value).map_err(|_| ConfigError::InvalidSize(value.to_string()))
    }
}

/// Byte count or offset within the 32-bit flash address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "SizeRepr", into = "SizeRepr")]
pub struct ByteSize(pub u32);

impl ByteSize {
    pub fn get(self) -> u32 {
        self.0
    }
}

impl TryFrom<SizeRepr> for ByteSize {
    type Error = ConfigError;

    fn try_from(repr: SizeRepr) -> Result<Self, Self::Error> {
        repr.to_u32().map(ByteSize)
    }
}

impl From<ByteSize> for SizeRepr {
    fn from(size: ByteSize) -> Self {
        SizeRepr::Text(size.to_string())
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const MIB: u32 = 1024 * 1024;
        match self.0 {
            0 => write!(f, "0"),
            v if v % MIB == 0 => write!(f, "{}M", v / MIB),
            v if v % 1024 == 0 && v / 1024 < 2049 => write!(f, "{}K", v / 1024),
            v => write!(f, "0x{v:x}"),
        }
    }
}

/// Where a section goes in flash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "SizeRepr", into = "SizeRepr")]
pub enum Locate {
    /// Offset 0.
    Start,
    /// Flush against the end of flash.
    End,
    Offset(u32),
}

impl TryFrom<SizeRepr> for Locate {
    type Error = ConfigError;

    fn try_from(repr: SizeRepr) -> Result<Self, Self::Error> {
        if let SizeRepr::Text(text) = &repr {
            if text.trim().eq_ignore_ascii_case("start") {
                return Ok(Locate::Start);
            }
            if text.trim().eq_ignore_ascii_case("end") {
                return Ok(Locate::End);
            }
        }
        repr.to_u32().map(Locate::Offset)
    }
}

impl From<Locate> for SizeRepr {
    fn from(locate: Locate) -> Self {
        match locate {
            Locate::Start => SizeRepr::Text("start".into()),
            Locate::End => SizeRepr::Text("end".into()),
            Locate::Offset(v) => ByteSize(v).into(),
        }
    }
}

/// Module type written as `0x0202` in listings, accepted as int or string.
mod hex16 {
    use serde::{Deserialize, Deserializer, Serializer};

    use super::SizeRepr;

    pub fn serialize<S: Serializer>(value: &u16, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{value:04x}"))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u16, D::Error> {
        let repr = SizeRepr::deserialize(deserializer)?;
        let value = repr.to_u32().map_err(serde::de::Error::custom)?;
        u16::try_from(value).map_err(|_| serde::de::Error::custom("type code exceeds 16 bits"))
    }
}

fn default_true() -> bool {
    true
}

fn is_false(v: &bool) -> bool {
    !*v
}

fn is_zero(v: &u8) -> bool {
    *v == 0
}

/// `[global]` table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Output image file name.
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flash_size: Option<ByteSize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_size: Option<ByteSize>,
    /// Write headers; when false the image holds raw payloads only.
    #[serde(default = "default_true")]
    pub fmh_enable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub out_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_no: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_name: Option<String>,
    /// Extra `OEM_<key>=<value>` lines for the firmware-info blob.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub oem_keys: BTreeMap<String, String>,
}

/// One `[[section]]` table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SectionConfig {
    pub name: String,
    #[serde(default)]
    pub major: u8,
    #[serde(default)]
    pub minor: u8,
    #[serde(rename = "type", default, with = "hex16")]
    pub module_type: u16,
    #[serde(default, skip_serializing_if = "is_false")]
    pub boot_os: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub boot_diag: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub boot_reco: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub copy_to_ram: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub execute: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub checksum: bool,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub compress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load: Option<ByteSize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alloc: Option<ByteSize>,
    /// Payload offset inside the allocation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<ByteSize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locate: Option<Locate>,
    /// Header offset inside the first block; enables the alternate marker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fmh_loc: Option<ByteSize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

impl SectionConfig {
    pub fn module_type(&self) -> ModuleType {
        ModuleType(self.module_type)
    }

    pub fn is_firmware_info(&self) -> bool {
        self.module_type().is_firmware_info()
    }

    /// Flag word; copy-to-RAM is dropped without a load address.
    pub fn flags(&self) -> ModuleFlags {
        let mut flags = ModuleFlags::default();
        flags.set(ModuleFlags::BOOT_OS, self.boot_os);
        flags.set(ModuleFlags::BOOT_DIAG, self.boot_diag);
        flags.set(ModuleFlags::BOOT_RECOVERY, self.boot_reco);
        flags.set(ModuleFlags::COPY_TO_RAM, self.copy_to_ram);
        flags.set(ModuleFlags::EXECUTE, self.execute);
        flags.set(ModuleFlags::VALID_CHECKSUM, self.checksum);
        flags.set_compression(Compression::from(self.compress));
        if self.load_address() == NO_LOAD_ADDRESS {
            flags.set(ModuleFlags::COPY_TO_RAM, false);
        }
        flags
    }

    pub fn load_address(&self) -> u32 {
        self.load.map(ByteSize::get).unwrap_or(NO_LOAD_ADDRESS)
    }

    /// Alternate header offset, 0 when unused.
    pub fn fmh_loc(&self) -> u32 {
        self.fmh_loc.map(ByteSize::get).unwrap_or(0)
    }
}

/// Flash size and erase block size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub flash_size: u32,
    pub block_size: u32,
}

impl Geometry {
    pub fn new(flash_size: u32, block_size: u32) -> Result<Self, ConfigError> {
        if block_size < crate::format::FMH_SIZE as u32 {
            return Err(ConfigError::InvalidGeometry(format!(
                "block size 0x{block_size:x} is smaller than a header"
            )));
        }
        if flash_size < block_size {
            return Err(ConfigError::InvalidGeometry(format!(
                "flash size 0x{flash_size:x} is smaller than block size 0x{block_size:x}"
            )));
        }
        Ok(Self {
            flash_size,
            block_size,
        })
    }

    /// Round `size` up to a whole number of blocks.
    pub fn round_up(&self, size: u64) -> u64 {
        size.div_ceil(self.block_size as u64) * self.block_size as u64
    }
}

/// Complete build description.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildConfig {
    pub global: GlobalConfig,
    #[serde(default, rename = "section", skip_serializing_if = "Vec::is_empty")]
    pub sections: Vec<SectionConfig>,
}

impl BuildConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        std::fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }

    /// Validated flash geometry from `[global]`.
    pub fn geometry(&self) -> Result<Geometry, ConfigError> {
        let flash_size = self.global.flash_size.ok_or(ConfigError::MissingField {
            section: "global".into(),
            field: "flash_size",
        })?;
        let block_size = self.global.block_size.ok_or(ConfigError::MissingField {
            section: "global".into(),
            field: "block_size",
        })?;
        Geometry::new(flash_size.get(), block_size.get())
    }
}

/// Release metadata supplied by the build environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReleaseOverrides {
    /// Firmware descriptor version override.
    pub major: Option<u8>,
    pub minor: Option<u8>,
    pub description: Option<String>,
    pub date: Option<String>,
    pub build_time: Option<String>,
}

impl ReleaseOverrides {
    /// Read `FW_MAJOR`, `FW_MINOR`, `FW_DESC`, `FW_DATE`, `FW_BUILDTIME`.
    pub fn from_env() -> Self {
        let var = |key: &str| std::env::var(key).ok().filter(|v| !v.is_empty());
        let version = |key: &str| {
            var(key)
                .and_then(|v| parse_number(&v).ok())
                .and_then(|v| u8::try_from(v).ok())
        };
        Self {
            major: version("FW_MAJOR"),
            minor: version("FW_MINOR"),
            description: var("FW_DESC"),
            date: var("FW_DATE"),
            build_time: var("FW_BUILDTIME"),
        }
    }
}
