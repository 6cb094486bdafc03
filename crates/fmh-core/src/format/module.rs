//! Module sub-record: the payload description embedded in every header.

use std::fmt;

use byteorder::{ByteOrder, LittleEndian};

use super::constants::*;

/// Version pair (major, minor).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl Version {
    pub fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// 16-bit module type: low byte is the kind, high byte the payload format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ModuleType(pub u16);

impl ModuleType {
    /// Format 1.4+ firmware descriptor type.
    pub const FIRMWARE: ModuleType = ModuleType(MODULE_FIRMWARE_1_4);

    pub fn new(kind: u8, format: u8) -> Self {
        Self(((format as u16) << 8) | kind as u16)
    }

    /// Semantic kind (bootloader, kernel, ...).
    pub fn kind(&self) -> u8 {
        (self.0 & 0xFF) as u8
    }

    /// Payload encoding (binary, ELF, JFFS2, ...).
    pub fn format(&self) -> u8 {
        (self.0 >> 8) as u8
    }

    /// Firmware descriptor pseudo-section, old or new style.
    pub fn is_firmware_info(&self) -> bool {
        self.0 == MODULE_FMH_FIRMWARE as u16 || self.0 == MODULE_FIRMWARE_1_4
    }

    /// JFFS-family payloads start one block into their allocation.
    pub fn is_jffs(&self) -> bool {
        matches!(
            self.0,
            0x0010 | 0x0011 | 0x0020 | 0x0021 // pre-1.4 type codes
        ) || matches!(self.format(), MODULE_FORMAT_JFFS | MODULE_FORMAT_JFFS2)
    }

    /// Human readable kind name.
    pub fn kind_name(&self) -> &'static str {
        match self.kind() {
            MODULE_BOOTLOADER => "bootloader",
            MODULE_FMH_FIRMWARE => "firmware-info",
            MODULE_KERNEL => "kernel",
            MODULE_FPGA => "fpga",
            MODULE_ELF => "elf",
            MODULE_PIMAGE => "pimage",
            MODULE_INITRD_CRAMFS => "initrd-cramfs",
            MODULE_LINUX_KERNEL => "linux-kernel",
            MODULE_LINUX_ROOTFS => "linux-rootfs",
            MODULE_JFFS => "jffs",
            MODULE_JFFS2 => "jffs2",
            MODULE_JFFS_CONFIG => "jffs-config",
            MODULE_JFFS2_CONFIG => "jffs2-config",
            MODULE_CONFIG => "config",
            MODULE_WEB => "web",
            MODULE_PDK => "pdk",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ModuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04x}", self.0)
    }
}

/// Payload compression, packed in bits 5..8 of the flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    MiniLzo,
    Gzip,
    Other(u8),
}

impl From<u8> for Compression {
    fn from(v: u8) -> Self {
        match v & 0x07 {
            MODULE_COMPRESSION_NONE => Compression::None,
            MODULE_COMPRESSION_MINILZO_1X => Compression::MiniLzo,
            MODULE_COMPRESSION_GZIP => Compression::Gzip,
            other => Compression::Other(other),
        }
    }
}

impl From<Compression> for u8 {
    fn from(c: Compression) -> Self {
        match c {
            Compression::None => MODULE_COMPRESSION_NONE,
            Compression::MiniLzo => MODULE_COMPRESSION_MINILZO_1X,
            Compression::Gzip => MODULE_COMPRESSION_GZIP,
            Compression::Other(v) => v & 0x07,
        }
    }
}

/// Module flag bitset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModuleFlags(pub u16);

impl ModuleFlags {
    pub const BOOT_OS: u16 = MODULE_FLAG_BOOTPATH_OS;
    pub const BOOT_DIAG: u16 = MODULE_FLAG_BOOTPATH_DIAG;
    pub const BOOT_RECOVERY: u16 = MODULE_FLAG_BOOTPATH_RECOVERY;
    pub const COPY_TO_RAM: u16 = MODULE_FLAG_COPY_TO_RAM;
    pub const EXECUTE: u16 = MODULE_FLAG_EXECUTE;
    pub const VALID_CHECKSUM: u16 = MODULE_FLAG_VALID_CHECKSUM;

    pub fn contains(&self, bit: u16) -> bool {
        self.0 & bit == bit
    }

    pub fn set(&mut self, bit: u16, on: bool) {
        if on {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
    }

    pub fn compression(&self) -> Compression {
        Compression::from(
            ((self.0 & MODULE_FLAG_COMPRESSION_MASK) >> MODULE_FLAG_COMPRESSION_LSHIFT) as u8,
        )
    }

    pub fn set_compression(&mut self, compression: Compression) {
        let bits = (u8::from(compression) as u16) << MODULE_FLAG_COMPRESSION_LSHIFT;
        self.0 = (self.0 & !MODULE_FLAG_COMPRESSION_MASK) | (bits & MODULE_FLAG_COMPRESSION_MASK);
    }
}

/// Payload-describing sub-record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    /// Raw name, NUL padded.
    pub name: [u8; MODULE_NAME_LEN],
    pub version: Version,
    pub module_type: ModuleType,
    /// Payload offset from the start of the section allocation.
    pub location: u32,
    pub size: u32,
    pub flags: ModuleFlags,
    pub load_address: u32,
    /// CRC32 of the payload (whole-image CRC for the firmware descriptor).
    pub checksum: u32,
}

impl Default for ModuleInfo {
    fn default() -> Self {
        Self {
            name: [0; MODULE_NAME_LEN],
            version: Version::default(),
            module_type: ModuleType::default(),
            location: 0,
            size: 0,
            flags: ModuleFlags::default(),
            load_address: NO_LOAD_ADDRESS,
            checksum: 0,
        }
    }
}

impl ModuleInfo {
    pub fn new(name: &str, module_type: ModuleType) -> Self {
        let mut module = Self {
            module_type,
            ..Default::default()
        };
        module.set_name(name);
        module
    }

    /// Store a name, truncated to eight bytes.
    pub fn set_name(&mut self, name: &str) {
        self.name = [0; MODULE_NAME_LEN];
        let bytes = name.as_bytes();
        let len = bytes.len().min(MODULE_NAME_LEN);
        self.name[..len].copy_from_slice(&bytes[..len]);
    }

    /// Name as stored, trailing NULs removed.
    pub fn raw_name(&self) -> String {
        let end = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(MODULE_NAME_LEN);
        String::from_utf8_lossy(&self.name[..end]).into_owned()
    }

    /// Case-normalized name used on the read path.
    pub fn display_name(&self) -> String {
        self.raw_name().to_uppercase()
    }

    pub fn has_load_address(&self) -> bool {
        self.load_address != NO_LOAD_ADDRESS
    }

    pub(crate) fn write_into(&self, buf: &mut [u8]) {
        buf[MODULE_NAME_OFFSET..MODULE_NAME_OFFSET + MODULE_NAME_LEN].copy_from_slice(&self.name);
        buf[MODULE_VER_MAJOR_OFFSET] = self.version.major;
        buf[MODULE_VER_MINOR_OFFSET] = self.version.minor;
        LittleEndian::write_u16(&mut buf[MODULE_TYPE_OFFSET..], self.module_type.0);
        LittleEndian::write_u32(&mut buf[MODULE_LOCATION_OFFSET..], self.location);
        LittleEndian::write_u32(&mut buf[MODULE_SIZE_OFFSET..], self.size);
        LittleEndian::write_u16(&mut buf[MODULE_FLAGS_OFFSET..], self.flags.0);
        LittleEndian::write_u32(&mut buf[MODULE_LOAD_ADDRESS_OFFSET..], self.load_address);
        LittleEndian::write_u32(&mut buf[MODULE_CHECKSUM_OFFSET..], self.checksum);
    }

    pub(crate) fn read_from(buf: &[u8]) -> Self {
        let mut name = [0u8; MODULE_NAME_LEN];
        name.copy_from_slice(&buf[MODULE_NAME_OFFSET..MODULE_NAME_OFFSET + MODULE_NAME_LEN]);
        Self {
            name,
            version: Version::new(buf[MODULE_VER_MAJOR_OFFSET], buf[MODULE_VER_MINOR_OFFSET]),
            module_type: ModuleType(LittleEndian::read_u16(&buf[MODULE_TYPE_OFFSET..])),
            location: LittleEndian::read_u32(&buf[MODULE_LOCATION_OFFSET..]),
            size: LittleEndian::read_u32(&buf[MODULE_SIZE_OFFSET..]),
            flags: ModuleFlags(LittleEndian::read_u16(&buf[MODULE_FLAGS_OFFSET..])),
            load_address: LittleEndian::read_u32(&buf[MODULE_LOAD_ADDRESS_OFFSET..]),
            checksum: LittleEndian::read_u32(&buf[MODULE_CHECKSUM_OFFSET..]),
        }
    }
}
