//! Flash Module Header layout constants.
//!
//! Format version 1.5. All multi-byte fields are little-endian.

// ============================================================================
// Header Identification
// ============================================================================

/// Header signature, shared by the primary header and the alternate marker.
pub const FMH_SIGNATURE: &[u8; 8] = b"$MODULE$";

/// Structural end marker.
pub const FMH_END_SIGNATURE: u16 = 0x55AA;

pub const FMH_MAJOR: u8 = 1;
pub const FMH_MINOR: u8 = 5;

/// Size of the primary header record (format 1.5).
pub const FMH_SIZE: usize = 64;

/// Size of the alternate header marker.
pub const ALT_FMH_SIZE: usize = 16;

/// Size of the embedded module sub-record.
pub const MODULE_INFO_SIZE: usize = 38;

/// Sentinel for "no link" / "no load address".
pub const INVALID_FMH_OFFSET: u32 = 0xFFFF_FFFF;
pub const NO_LOAD_ADDRESS: u32 = 0xFFFF_FFFF;

// ============================================================================
// Primary Header Field Offsets
// ============================================================================

pub const FMH_SIGNATURE_OFFSET: usize = 0x00;
pub const FMH_VER_MAJOR_OFFSET: usize = 0x08;
pub const FMH_VER_MINOR_OFFSET: usize = 0x09;
pub const FMH_SIZE_OFFSET: usize = 0x0A;
pub const FMH_ALLOC_OFFSET: usize = 0x0C;
pub const FMH_LOCATION_OFFSET: usize = 0x10;
/// Header checksum byte, excluded from the whole-image CRC.
pub const FMH_HEADER_CHECKSUM_OFFSET: usize = 0x17;
pub const FMH_MODULE_OFFSET: usize = 0x18;
pub const FMH_END_SIGNATURE_OFFSET: usize = 0x3E;

/// Module checksum field, excluded from the whole-image CRC (inclusive range).
pub const FMH_MODULE_CHECKSUM_START_OFFSET: usize = 0x32;
pub const FMH_MODULE_CHECKSUM_END_OFFSET: usize = 0x35;

// ============================================================================
// Module Sub-record Field Offsets (relative to the sub-record)
// ============================================================================

pub const MODULE_NAME_LEN: usize = 8;
pub const MODULE_NAME_OFFSET: usize = 0x00;
pub const MODULE_VER_MAJOR_OFFSET: usize = 0x08;
pub const MODULE_VER_MINOR_OFFSET: usize = 0x09;
pub const MODULE_TYPE_OFFSET: usize = 0x0A;
pub const MODULE_LOCATION_OFFSET: usize = 0x0C;
pub const MODULE_SIZE_OFFSET: usize = 0x10;
pub const MODULE_FLAGS_OFFSET: usize = 0x14;
pub const MODULE_LOAD_ADDRESS_OFFSET: usize = 0x16;
pub const MODULE_CHECKSUM_OFFSET: usize = 0x1A;

// ============================================================================
// Alternate Marker Field Offsets
// ============================================================================

pub const ALT_END_SIGNATURE_OFFSET: usize = 0x00;
pub const ALT_HEADER_CHECKSUM_OFFSET: usize = 0x02;
pub const ALT_LINK_ADDRESS_OFFSET: usize = 0x04;
pub const ALT_SIGNATURE_OFFSET: usize = 0x08;

// ============================================================================
// Module Types (low byte: kind)
// ============================================================================

pub const MODULE_UNKNOWN: u8 = 0x00;
pub const MODULE_BOOTLOADER: u8 = 0x01;
/// Firmware descriptor pseudo-section.
pub const MODULE_FMH_FIRMWARE: u8 = 0x02;
pub const MODULE_KERNEL: u8 = 0x03;
pub const MODULE_FPGA: u8 = 0x04;
pub const MODULE_ELF: u8 = 0x05;
pub const MODULE_PIMAGE: u8 = 0x06;
pub const MODULE_INITRD_CRAMFS: u8 = 0x07;
pub const MODULE_LINUX_KERNEL: u8 = 0x08;
pub const MODULE_LINUX_ROOTFS: u8 = 0x09;
pub const MODULE_JFFS: u8 = 0x10;
pub const MODULE_JFFS2: u8 = 0x11;
pub const MODULE_JFFS_CONFIG: u8 = 0x20;
pub const MODULE_JFFS2_CONFIG: u8 = 0x21;
pub const MODULE_CONFIG: u8 = 0x30;
pub const MODULE_WEB: u8 = 0x40;
pub const MODULE_PDK: u8 = 0x50;

// ============================================================================
// Module Formats (high byte)
// ============================================================================

pub const MODULE_FORMAT_BACKWARD: u8 = 0x00;
pub const MODULE_FORMAT_BINARY: u8 = 0x01;
pub const MODULE_FORMAT_FIRMWARE_INFO: u8 = 0x02;
pub const MODULE_FORMAT_UBOOT_WRAP: u8 = 0x03;
pub const MODULE_FORMAT_ELF: u8 = 0x04;
pub const MODULE_FORMAT_CRAMFS: u8 = 0x10;
pub const MODULE_FORMAT_JFFS: u8 = 0x11;
pub const MODULE_FORMAT_JFFS2: u8 = 0x12;
pub const MODULE_FORMAT_INITRD: u8 = 0x80;

/// Firmware descriptor type as written by format 1.4 and later.
pub const MODULE_FIRMWARE_1_4: u16 =
    ((MODULE_FORMAT_FIRMWARE_INFO as u16) << 8) | MODULE_FMH_FIRMWARE as u16;

// ============================================================================
// Module Flags
// ============================================================================

pub const MODULE_FLAG_BOOTPATH_OS: u16 = 0x0001;
pub const MODULE_FLAG_BOOTPATH_DIAG: u16 = 0x0002;
pub const MODULE_FLAG_BOOTPATH_RECOVERY: u16 = 0x0004;
pub const MODULE_FLAG_COPY_TO_RAM: u16 = 0x0008;
pub const MODULE_FLAG_EXECUTE: u16 = 0x0010;
pub const MODULE_FLAG_COMPRESSION_MASK: u16 = 0x00E0;
pub const MODULE_FLAG_COMPRESSION_LSHIFT: u16 = 5;
pub const MODULE_FLAG_VALID_CHECKSUM: u16 = 0x0100;

// ============================================================================
// Compression Kinds
// ============================================================================

pub const MODULE_COMPRESSION_NONE: u8 = 0x00;
pub const MODULE_COMPRESSION_MINILZO_1X: u8 = 0x01;
pub const MODULE_COMPRESSION_GZIP: u8 = 0x02;

// ============================================================================
// Layout Defaults
// ============================================================================

/// Default payload offset inside an allocation: right after the header.
pub const DEFAULT_MODULE_LOCATION: u32 = FMH_SIZE as u32;

/// Largest firmware-info blob that fits in the descriptor block.
pub const MAX_FIRMWARE_INFO_SIZE: usize = 64 * 1024 - FMH_SIZE;

/// Erased flash fill byte.
pub const ERASED_BYTE: u8 = 0xFF;
