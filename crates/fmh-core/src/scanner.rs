//! Image scanner: the read path.
//!
//! An image is read in block-sized windows. A window holds a section
//! header either at its first byte or, failing that, wherever the
//! alternate marker in its last 16 bytes points to.

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use thiserror::Error;
use tracing::{debug, instrument, trace};

use crate::assembler::{ChecksumTarget, image_checksum};
use crate::crc32::Crc32;
use crate::format::{ALT_FMH_SIZE, AltFmh, FMH_SIZE, FmhHeader};
use crate::fwinfo::FirmwareInfo;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("No valid header in the block at 0x{offset:08X}")]
    HeaderNotFound { offset: u64 },

    #[error("Image of {size} bytes is smaller than one block (0x{block_size:X})")]
    ImageTooSmall { size: u64, block_size: u32 },

    #[error("Invalid block size 0x{0:X}")]
    InvalidBlockSize(u32),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Header found inside a window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanHit {
    pub header: FmhHeader,
    /// Header offset relative to the window start.
    pub offset: usize,
    /// Found through the alternate marker.
    pub via_alternate: bool,
}

/// Look for a header in one block-sized window.
pub fn scan_window(window: &[u8]) -> Option<ScanHit> {
    if let Some(header) = FmhHeader::parse(window) {
        return Some(ScanHit {
            header,
            offset: 0,
            via_alternate: false,
        });
    }

    let marker_at = window.len().checked_sub(ALT_FMH_SIZE)?;
    let alt = AltFmh::parse(&window[marker_at..])?;
    let link = usize::try_from(alt.link_address).ok()?;
    trace!(link = %format!("0x{link:X}"), "Alternate marker found");

    let header = FmhHeader::parse(window.get(link..)?)?;
    Some(ScanHit {
        header,
        offset: link,
        via_alternate: true,
    })
}

/// Section header located in an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedSection {
    /// Start of the block the header was found in.
    pub window_offset: u64,
    pub header: FmhHeader,
    pub via_alternate: bool,
}

impl ScannedSection {
    /// Upper-cased section name.
    pub fn name(&self) -> String {
        self.header.module.display_name()
    }

    pub fn is_firmware_info(&self) -> bool {
        self.header.module.module_type.is_firmware_info()
    }

    /// Absolute payload offset.
    pub fn payload_offset(&self) -> u64 {
        self.window_offset + self.header.module.location as u64
    }

    pub fn payload_size(&self) -> u32 {
        self.header.module.size
    }
}

/// Random-access reader over a flash image.
pub struct ImageScanner<R> {
    reader: R,
    block_size: u32,
    image_size: u64,
}

impl ImageScanner<BufReader<File>> {
    pub fn open<P: AsRef<Path>>(path: P, block_size: u32) -> Result<Self, ScanError> {
        let file = File::open(path)?;
        Self::new(BufReader::new(file), block_size)
    }
}

impl<R: Read + Seek> ImageScanner<R> {
    pub fn new(mut reader: R, block_size: u32) -> Result<Self, ScanError> {
        if (block_size as usize) < FMH_SIZE + ALT_FMH_SIZE {
            return Err(ScanError::InvalidBlockSize(block_size));
        }
        let image_size = reader.seek(SeekFrom::End(0))?;
        if image_size < block_size as u64 {
            return Err(ScanError::ImageTooSmall {
                size: image_size,
                block_size,
            });
        }
        Ok(Self {
            reader,
            block_size,
            image_size,
        })
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn image_size(&self) -> u64 {
        self.image_size
    }

    pub fn into_inner(self) -> R {
        self.reader
    }

    fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>, ScanError> {
        let mut buf = vec![0u8; len];
        self.reader.seek(SeekFrom::Start(offset))?;
        self.reader.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// One block from `offset`, shorter at the end of the image.
    fn read_window(&mut self, offset: u64) -> Result<Vec<u8>, ScanError> {
        let len = (self.block_size as u64).min(self.image_size.saturating_sub(offset));
        self.read_at(offset, len as usize)
    }

    fn try_header_at(&mut self, offset: u64) -> Result<Option<ScannedSection>, ScanError> {
        let window = self.read_window(offset)?;
        Ok(scan_window(&window).map(|hit| ScannedSection {
            window_offset: offset,
            header: hit.header,
            via_alternate: hit.via_alternate,
        }))
    }

    /// Header in the block starting at `offset`.
    pub fn header_at(&mut self, offset: u64) -> Result<ScannedSection, ScanError> {
        if offset >= self.image_size {
            return Err(ScanError::HeaderNotFound { offset });
        }
        self.try_header_at(offset)?
            .ok_or(ScanError::HeaderNotFound { offset })
    }

    /// Outermost header, found in the last block of the image.
    ///
    /// An end-placed section allocating more than one block keeps its header
    /// in its first block, not the last one. Such images fail here with
    /// [`ScanError::HeaderNotFound`]; pass the real block to
    /// [`ImageScanner::header_at`] instead.
    pub fn terminal(&mut self) -> Result<ScannedSection, ScanError> {
        self.header_at(self.image_size - self.block_size as u64)
    }

    /// Every section in ascending order, ending with the terminal header.
    pub fn sections(&mut self) -> Result<Vec<ScannedSection>, ScanError> {
        let terminal = self.terminal()?;
        self.sections_until(terminal)
    }

    /// Walk from the start of the image up to `terminal`.
    ///
    /// Blocks without a header are gaps and are skipped one at a time.
    #[instrument(skip_all, fields(terminal = %format!("0x{:X}", terminal.header.location)))]
    pub fn sections_until(
        &mut self,
        terminal: ScannedSection,
    ) -> Result<Vec<ScannedSection>, ScanError> {
        let block = self.block_size as u64;
        let mut sections = Vec::new();
        let mut offset = 0u64;

        while offset + FMH_SIZE as u64 <= self.image_size {
            let Some(section) = self.try_header_at(offset)? else {
                offset += block;
                continue;
            };
            if section.header.location == terminal.header.location {
                break;
            }
            debug!(
                section = %section.name(),
                offset = %format!("0x{offset:X}"),
                alloc = %format!("0x{:X}", section.header.allocated_size),
                "Header found"
            );
            offset += (section.header.allocated_size as u64).max(block);
            sections.push(section);
        }

        sections.push(terminal);
        Ok(sections)
    }

    /// Payload bytes of a section.
    pub fn read_payload(&mut self, section: &ScannedSection) -> Result<Vec<u8>, ScanError> {
        let start = section.payload_offset();
        let len = section.payload_size() as u64;
        if start + len > self.image_size {
            return Err(ScanError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("payload of {} runs past the end of the image", section.name()),
            )));
        }
        self.read_at(start, len as usize)
    }

    /// CRC32 of a section's payload.
    pub fn payload_crc(&mut self, section: &ScannedSection) -> Result<u32, ScanError> {
        self.reader.seek(SeekFrom::Start(section.payload_offset()))?;
        let mut crc = Crc32::begin();
        let copied = io::copy(
            &mut (&mut self.reader).take(section.payload_size() as u64),
            &mut crc,
        )?;
        if copied != section.payload_size() as u64 {
            return Err(ScanError::Io(io::ErrorKind::UnexpectedEof.into()));
        }
        Ok(crc.finish())
    }

    /// Check a section against the checksum stored in its header.
    ///
    /// The firmware descriptor is checked against the whole-image CRC32.
    pub fn verify(&mut self, section: &ScannedSection) -> Result<bool, ScanError> {
        let expected = section.header.module.checksum;
        let actual = if section.is_firmware_info() {
            self.image_checksum(section)?
        } else {
            self.payload_crc(section)?
        };
        Ok(actual == expected)
    }

    /// Whole-image CRC32 as the descriptor `section` defines it.
    pub fn image_checksum(&mut self, section: &ScannedSection) -> Result<u32, ScanError> {
        let target = ChecksumTarget {
            section_offset: section.window_offset as u32,
            header_offset: section.header.location,
        };
        Ok(image_checksum(&mut self.reader, target, self.block_size)?)
    }

    /// Parsed firmware-info blob of a descriptor section.
    pub fn firmware_info(&mut self, section: &ScannedSection) -> Result<FirmwareInfo, ScanError> {
        let blob = self.read_payload(section)?;
        Ok(FirmwareInfo::parse(&blob))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::crc32::crc32;
    use crate::format::{ModuleInfo, ModuleType};

    const BLOCK: usize = 0x1000;

    fn header(name: &str, alloc: u32, location: u32, payload: &[u8]) -> FmhHeader {
        let mut module = ModuleInfo::new(name, ModuleType(0x0101));
        module.location = 0x40;
        module.size = payload.len() as u32;
        module.checksum = crc32(payload);
        FmhHeader::new(module, alloc, location)
    }

    fn place(image: &mut [u8], at: usize, alloc: u32, name: &str, payload: &[u8]) {
        let h = header(name, alloc, at as u32, payload);
        image[at..at + FMH_SIZE].copy_from_slice(&h.to_bytes());
        image[at + 0x40..at + 0x40 + payload.len()].copy_from_slice(payload);
    }

    #[test]
    fn test_scan_window_primary() {
        let mut window = vec![0xFF; BLOCK];
        window[..FMH_SIZE].copy_from_slice(&header("boot", 0x1000, 0, b"x").to_bytes());
        let hit = scan_window(&window).unwrap();
        assert_eq!(hit.offset, 0);
        assert!(!hit.via_alternate);
        assert_eq!(hit.header.module.raw_name(), "boot");
    }

    #[test]
    fn test_scan_window_alternate_fallback() {
        let link = 0x700usize;
        let mut window = vec![0u8; BLOCK];
        window[..8].copy_from_slice(b"garbage!");
        window[link..link + FMH_SIZE]
            .copy_from_slice(&header("conf", 0x1000, link as u32, b"x").to_bytes());
        window[BLOCK - ALT_FMH_SIZE..].copy_from_slice(&AltFmh::new(link as u32).to_bytes());

        let hit = scan_window(&window).unwrap();
        assert!(hit.via_alternate);
        assert_eq!(hit.offset, link);
        assert_eq!(hit.header.location, link as u32);
    }

    #[test]
    fn test_scan_window_bad_link() {
        let mut window = vec![0xFF; BLOCK];
        window[BLOCK - ALT_FMH_SIZE..].copy_from_slice(&AltFmh::new(0x500).to_bytes());
        assert!(scan_window(&window).is_none());

        // Link pointing past the window.
        window[BLOCK - ALT_FMH_SIZE..].copy_from_slice(&AltFmh::new(0x10_0000).to_bytes());
        assert!(scan_window(&window).is_none());

        assert!(scan_window(&[0u8; 8]).is_none());
    }

    #[test]
    fn test_terminal_spanning_two_blocks() {
        let mut image = vec![0xFF; 8 * BLOCK];
        place(&mut image, 0, 0x1000, "boot", b"bootloader");
        place(&mut image, 6 * BLOCK, 0x2000, "app", b"application");

        let mut scanner = ImageScanner::new(Cursor::new(image), BLOCK as u32).unwrap();
        assert!(matches!(
            scanner.terminal(),
            Err(ScanError::HeaderNotFound { offset }) if offset == 7 * BLOCK as u64
        ));

        let terminal = scanner.header_at(6 * BLOCK as u64).unwrap();
        let sections = scanner.sections_until(terminal).unwrap();
        let names: Vec<_> = sections.iter().map(|s| s.name()).collect();
        assert_eq!(names, ["BOOT", "APP"]);
    }

    #[test]
    fn test_enumerate_with_gaps() {
        let mut image = vec![0xFF; 16 * BLOCK];
        place(&mut image, 0, 0x1000, "boot", b"bootloader");
        // Two blocks; the second one holds payload only.
        place(&mut image, 2 * BLOCK, 0x2000, "kernel", b"kernel!");
        place(&mut image, 15 * BLOCK, 0x1000, "conf", b"cfg");

        let mut scanner = ImageScanner::new(Cursor::new(image), BLOCK as u32).unwrap();
        let sections = scanner.sections().unwrap();
        let names: Vec<_> = sections.iter().map(|s| s.name()).collect();
        assert_eq!(names, ["BOOT", "KERNEL", "CONF"]);
        assert_eq!(sections[1].window_offset, 2 * BLOCK as u64);

        assert_eq!(scanner.read_payload(&sections[1]).unwrap(), b"kernel!");
        for section in &sections {
            assert!(scanner.verify(section).unwrap());
        }
    }

    #[test]
    fn test_verify_detects_corruption() {
        let mut image = vec![0xFF; 4 * BLOCK];
        place(&mut image, 0, 0x1000, "boot", b"payload");
        place(&mut image, 3 * BLOCK, 0x1000, "conf", b"cfg");
        image[0x41] ^= 0x01;

        let mut scanner = ImageScanner::new(Cursor::new(image), BLOCK as u32).unwrap();
        let sections = scanner.sections().unwrap();
        assert!(!scanner.verify(&sections[0]).unwrap());
        assert!(scanner.verify(&sections[1]).unwrap());
    }

    #[test]
    fn test_terminal_missing() {
        let image = vec![0xFF; 4 * BLOCK];
        let mut scanner = ImageScanner::new(Cursor::new(image), BLOCK as u32).unwrap();
        assert!(matches!(
            scanner.terminal(),
            Err(ScanError::HeaderNotFound { offset }) if offset == 3 * BLOCK as u64
        ));
        assert!(matches!(
            scanner.header_at(99 * BLOCK as u64),
            Err(ScanError::HeaderNotFound { .. })
        ));
    }

    #[test]
    fn test_image_too_small() {
        assert!(matches!(
            ImageScanner::new(Cursor::new(vec![0u8; 100]), BLOCK as u32),
            Err(ScanError::ImageTooSmall { .. })
        ));
        assert!(matches!(
            ImageScanner::new(Cursor::new(vec![0u8; 100]), 16),
            Err(ScanError::InvalidBlockSize(16))
        ));
    }
}
