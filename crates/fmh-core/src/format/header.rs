//! Primary header and alternate marker codecs.
//!
//! Both records are encoded into fixed-size byte arrays with explicit field
//! offsets. Decoding validates signature, end signature and the modulo-100
//! checksum; a record failing any of these is reported as absent.

use byteorder::{ByteOrder, LittleEndian};

use super::checksum::{is_valid_module100, module100};
use super::constants::*;
use super::module::{ModuleInfo, Version};

/// Flash Module Header (64 bytes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FmhHeader {
    pub version: Version,
    pub header_size: u16,
    /// Bytes reserved for the section, block aligned.
    pub allocated_size: u32,
    /// Absolute image offset of this header.
    pub location: u32,
    pub header_checksum: u8,
    pub module: ModuleInfo,
}

impl FmhHeader {
    pub const SIZE: usize = FMH_SIZE;

    /// Build a header for `module` and stamp its checksum.
    pub fn new(module: ModuleInfo, allocated_size: u32, location: u32) -> Self {
        let mut header = Self {
            version: Version::new(FMH_MAJOR, FMH_MINOR),
            header_size: FMH_SIZE as u16,
            allocated_size,
            location,
            header_checksum: 0,
            module,
        };
        header.refresh_checksum();
        header
    }

    /// Recompute the checksum after a field changed.
    pub fn refresh_checksum(&mut self) {
        self.header_checksum = 0;
        let bytes = self.to_bytes();
        self.header_checksum = module100(&bytes);
    }

    pub fn to_bytes(&self) -> [u8; FMH_SIZE] {
        let mut buf = [0u8; FMH_SIZE];
        buf[FMH_SIGNATURE_OFFSET..FMH_SIGNATURE_OFFSET + FMH_SIGNATURE.len()]
            .copy_from_slice(FMH_SIGNATURE);
        buf[FMH_VER_MAJOR_OFFSET] = self.version.major;
        buf[FMH_VER_MINOR_OFFSET] = self.version.minor;
        LittleEndian::write_u16(&mut buf[FMH_SIZE_OFFSET..], self.header_size);
        LittleEndian::write_u32(&mut buf[FMH_ALLOC_OFFSET..], self.allocated_size);
        LittleEndian::write_u32(&mut buf[FMH_LOCATION_OFFSET..], self.location);
        buf[FMH_HEADER_CHECKSUM_OFFSET] = self.header_checksum;
        self.module
            .write_into(&mut buf[FMH_MODULE_OFFSET..FMH_MODULE_OFFSET + MODULE_INFO_SIZE]);
        LittleEndian::write_u16(&mut buf[FMH_END_SIGNATURE_OFFSET..], FMH_END_SIGNATURE);
        buf
    }

    /// Decode and validate a header at the start of `data`.
    ///
    /// Returns `None` when the bytes do not hold a valid header.
    pub fn parse(data: &[u8]) -> Option<Self> {
        let raw = data.get(..FMH_SIZE)?;

        if &raw[FMH_SIGNATURE_OFFSET..FMH_SIGNATURE_OFFSET + FMH_SIGNATURE.len()] != FMH_SIGNATURE
        {
            return None;
        }
        if LittleEndian::read_u16(&raw[FMH_END_SIGNATURE_OFFSET..]) != FMH_END_SIGNATURE {
            return None;
        }
        if !is_valid_module100(raw) {
            return None;
        }

        Some(Self {
            version: Version::new(raw[FMH_VER_MAJOR_OFFSET], raw[FMH_VER_MINOR_OFFSET]),
            header_size: LittleEndian::read_u16(&raw[FMH_SIZE_OFFSET..]),
            allocated_size: LittleEndian::read_u32(&raw[FMH_ALLOC_OFFSET..]),
            location: LittleEndian::read_u32(&raw[FMH_LOCATION_OFFSET..]),
            header_checksum: raw[FMH_HEADER_CHECKSUM_OFFSET],
            module: ModuleInfo::read_from(
                &raw[FMH_MODULE_OFFSET..FMH_MODULE_OFFSET + MODULE_INFO_SIZE],
            ),
        })
    }
}

/// Alternate header marker, written at the tail of a section's first block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AltFmh {
    /// Offset of the primary header relative to the block start.
    pub link_address: u32,
    pub header_checksum: u8,
}

impl AltFmh {
    pub const SIZE: usize = ALT_FMH_SIZE;

    pub fn new(link_address: u32) -> Self {
        let mut alt = Self {
            link_address,
            header_checksum: 0,
        };
        alt.header_checksum = module100(&alt.to_bytes());
        alt
    }

    pub fn to_bytes(&self) -> [u8; ALT_FMH_SIZE] {
        let mut buf = [0u8; ALT_FMH_SIZE];
        LittleEndian::write_u16(&mut buf[ALT_END_SIGNATURE_OFFSET..], FMH_END_SIGNATURE);
        buf[ALT_HEADER_CHECKSUM_OFFSET] = self.header_checksum;
        LittleEndian::write_u32(&mut buf[ALT_LINK_ADDRESS_OFFSET..], self.link_address);
        buf[ALT_SIGNATURE_OFFSET..].copy_from_slice(FMH_SIGNATURE);
        buf
    }

    /// Decode and validate a marker at the start of `data`.
    pub fn parse(data: &[u8]) -> Option<Self> {
        let raw = data.get(..ALT_FMH_SIZE)?;

        if &raw[ALT_SIGNATURE_OFFSET..] != FMH_SIGNATURE {
            return None;
        }
        if LittleEndian::read_u16(&raw[ALT_END_SIGNATURE_OFFSET..]) != FMH_END_SIGNATURE {
            return None;
        }
        if !is_valid_module100(raw) {
            return None;
        }

        Some(Self {
            link_address: LittleEndian::read_u32(&raw[ALT_LINK_ADDRESS_OFFSET..]),
            header_checksum: raw[ALT_HEADER_CHECKSUM_OFFSET],
        })
    }
}
