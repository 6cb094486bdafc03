//! Image assembler: the write path.
//!
//! Sections are processed in configuration order. Each one is resolved
//! (payload, size, CRC32), sized, located, claimed in the placement chain
//! and written: payload first, then its header, then its alternate marker.
//! Once every section is on disk, the firmware descriptor header (if any)
//! receives the whole-image CRC32 and its structural checksum is redone.

use std::fs::OpenOptions;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::config::{BuildConfig, ConfigError, Geometry, Locate, ReleaseOverrides, SectionConfig};
use crate::crc32::{Crc32, crc32};
use crate::events::{BuildEvent, BuildObserver, BuildPhase, TracingObserver};
use crate::format::{
    ALT_FMH_SIZE, AltFmh, DEFAULT_MODULE_LOCATION, ERASED_BYTE, FMH_HEADER_CHECKSUM_OFFSET,
    FMH_MODULE_CHECKSUM_END_OFFSET, FMH_MODULE_CHECKSUM_START_OFFSET, FMH_SIZE, FmhHeader,
    MAX_FIRMWARE_INFO_SIZE, ModuleInfo, ModuleType, Version, module100,
};
use crate::fwinfo::FirmwareInfo;
use crate::placement::{FlashMap, FreeRegions, PlacementError, SectionChain};
use crate::source::{PayloadSource, SourceError};

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("Missing field '{field}' for {section}")]
    MissingField {
        section: String,
        field: &'static str,
    },

    #[error("Invalid location for section {section}: {reason}")]
    InvalidLocation { section: String, reason: String },

    #[error(transparent)]
    Overlap(#[from] PlacementError),

    #[error("Input file {file} for section {section} is empty")]
    EmptyPayload { section: String, file: String },

    #[error("Payload error: {0}")]
    Source(#[from] SourceError),

    #[error("Invalid flash geometry: {0}")]
    InvalidGeometry(String),

    #[error("Config error: {0}")]
    Config(ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl From<ConfigError> for BuildError {
    fn from(e: ConfigError) -> Self {
        match e {
            ConfigError::MissingField { section, field } => {
                BuildError::MissingField { section, field }
            }
            ConfigError::InvalidGeometry(reason) => BuildError::InvalidGeometry(reason),
            ConfigError::Io(e) => BuildError::Io(e),
            other => BuildError::Config(other),
        }
    }
}

/// Header whose module checksum holds the whole-image CRC32.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChecksumTarget {
    /// Start of the descriptor section's allocation.
    pub section_offset: u32,
    /// Absolute offset of the descriptor header.
    pub header_offset: u32,
}

impl ChecksumTarget {
    /// Whether `pos` lies in one of the fields the pass patches.
    fn is_excluded(&self, pos: u64) -> bool {
        let Some(rel) = pos.checked_sub(self.header_offset as u64) else {
            return false;
        };
        (FMH_MODULE_CHECKSUM_START_OFFSET as u64..=FMH_MODULE_CHECKSUM_END_OFFSET as u64)
            .contains(&rel)
            || rel == FMH_HEADER_CHECKSUM_OFFSET as u64
    }
}

/// CRC32 of `[0, section_offset + block_size)`, skipping the descriptor
/// header's module checksum and header checksum fields.
///
/// Assumes the descriptor is the first section in the image.
pub fn image_checksum<R: Read + Seek>(
    image: &mut R,
    target: ChecksumTarget,
    block_size: u32,
) -> io::Result<u32> {
    let end = target.section_offset as u64 + block_size as u64;
    image.seek(SeekFrom::Start(0))?;

    let mut crc = Crc32::begin();
    let mut buf = vec![0u8; 64 * 1024];
    let mut pos = 0u64;
    while pos < end {
        let want = ((end - pos) as usize).min(buf.len());
        image.read_exact(&mut buf[..want])?;
        for (i, &byte) in buf[..want].iter().enumerate() {
            if !target.is_excluded(pos + i as u64) {
                crc.update(byte);
            }
        }
        pos += want as u64;
    }
    Ok(crc.finish())
}

/// Patch the whole-image CRC32 into the descriptor header and restamp its
/// structural checksum.
pub fn finalize_image_checksum<W: Read + Write + Seek>(
    image: &mut W,
    target: ChecksumTarget,
    block_size: u32,
) -> io::Result<u32> {
    let crc = image_checksum(image, target, block_size)?;
    let header_offset = target.header_offset as u64;

    image.seek(SeekFrom::Start(
        header_offset + FMH_MODULE_CHECKSUM_START_OFFSET as u64,
    ))?;
    image.write_all(&crc.to_le_bytes())?;

    let mut raw = [0u8; FMH_SIZE];
    image.seek(SeekFrom::Start(header_offset))?;
    image.read_exact(&mut raw)?;
    raw[FMH_HEADER_CHECKSUM_OFFSET] = 0;
    let sum = module100(&raw);

    image.seek(SeekFrom::Start(
        header_offset + FMH_HEADER_CHECKSUM_OFFSET as u64,
    ))?;
    image.write_all(&[sum])?;
    Ok(crc)
}

/// One section as committed to the image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacedSection {
    pub name: String,
    pub version: Version,
    pub module_type: ModuleType,
    pub offset: u32,
    pub allocated_size: u32,
    /// Absolute header offset, `None` when headers are disabled.
    pub header_offset: Option<u32>,
    /// Absolute payload offset.
    pub payload_offset: u32,
    pub payload_size: u32,
    pub checksum: u32,
}

/// Result of a successful build.
#[derive(Debug, Clone)]
pub struct BuildReport {
    pub geometry: Geometry,
    /// Sections in build order.
    pub sections: Vec<PlacedSection>,
    pub chain: SectionChain,
    /// Whole-image CRC32 patched into the firmware descriptor.
    pub image_checksum: Option<u32>,
}

impl BuildReport {
    pub fn flash_map(&self) -> FlashMap<'_> {
        self.chain.flash_map(self.geometry.flash_size)
    }

    pub fn free_regions(&self) -> FreeRegions<'_> {
        self.chain.free_regions(self.geometry.flash_size)
    }
}

/// State owned by one build.
struct BuildContext {
    geometry: Geometry,
    fmh_enable: bool,
    chain: SectionChain,
    checksum_target: Option<ChecksumTarget>,
    sections: Vec<PlacedSection>,
}

/// Everything needed to write one section.
struct SectionPlan {
    module: ModuleInfo,
    payload: Vec<u8>,
    allocated_size: u32,
    offset: u32,
    fmh_loc: u32,
    is_descriptor: bool,
}

/// Builds flash images from a [`BuildConfig`].
pub struct ImageAssembler<S: PayloadSource, O: BuildObserver> {
    config: BuildConfig,
    source: S,
    observer: Arc<O>,
    overrides: ReleaseOverrides,
    build_number: u32,
    firmware_info: Option<FirmwareInfo>,
}

impl<S: PayloadSource> ImageAssembler<S, TracingObserver> {
    /// Create an assembler with the default tracing observer.
    pub fn new(config: BuildConfig, source: S) -> Self {
        Self::with_observer(config, source, Arc::new(TracingObserver))
    }
}

impl<S: PayloadSource, O: BuildObserver> ImageAssembler<S, O> {
    /// Create an assembler with a custom observer.
    pub fn with_observer(config: BuildConfig, source: S, observer: Arc<O>) -> Self {
        let build_number = config.global.build_no.unwrap_or(0);
        Self {
            config,
            source,
            observer,
            overrides: ReleaseOverrides::default(),
            build_number,
            firmware_info: None,
        }
    }

    pub fn overrides(mut self, overrides: ReleaseOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn build_number(mut self, build_number: u32) -> Self {
        self.build_number = build_number;
        self
    }

    /// Use a prepared blob instead of generating one from `[global]`.
    pub fn firmware_info(mut self, info: FirmwareInfo) -> Self {
        self.firmware_info = Some(info);
        self
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    /// Create (or truncate) `path` and build into it.
    pub fn build_to_file<P: AsRef<Path>>(&self, path: P) -> Result<BuildReport, BuildError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        let report = self.build(&mut file)?;
        file.flush()?;
        Ok(report)
    }

    /// Build the image into `image`.
    ///
    /// On error the image is left partially written and must be discarded.
    #[instrument(skip_all, fields(output = %self.config.global.output))]
    pub fn build<W: Read + Write + Seek>(&self, image: &mut W) -> Result<BuildReport, BuildError> {
        let geometry = self.config.geometry()?;
        let mut ctx = BuildContext {
            geometry,
            fmh_enable: self.config.global.fmh_enable,
            chain: SectionChain::new(),
            checksum_target: None,
            sections: Vec::with_capacity(self.config.sections.len()),
        };

        info!(
            flash_size = %format!("0x{:X}", geometry.flash_size),
            block_size = %format!("0x{:X}", geometry.block_size),
            sections = self.config.sections.len(),
            "Building image"
        );

        self.phase(BuildPhase::Prefill, BuildPhase::Prefill);
        prefill(image, geometry.flash_size)?;

        self.phase(BuildPhase::Prefill, BuildPhase::Sections);
        let total = self.config.sections.len();
        for (index, section) in self.config.sections.iter().enumerate() {
            let plan = self.plan(section, &ctx)?;
            self.commit(image, plan, &mut ctx)?;
            self.observer.on_event(&BuildEvent::Progress {
                current: index + 1,
                total,
            });
        }

        let mut image_checksum = None;
        if let Some(target) = ctx.checksum_target {
            self.phase(BuildPhase::Sections, BuildPhase::ImageChecksum);
            let crc = finalize_image_checksum(image, target, geometry.block_size)?;
            self.observer.on_event(&BuildEvent::ImageChecksum {
                offset: target.header_offset,
                crc,
            });
            image_checksum = Some(crc);
        }

        self.phase(BuildPhase::Sections, BuildPhase::Complete);
        self.observer.on_event(&BuildEvent::Complete);

        Ok(BuildReport {
            geometry,
            sections: ctx.sections,
            chain: ctx.chain,
            image_checksum,
        })
    }

    fn phase(&self, from: BuildPhase, to: BuildPhase) {
        self.observer.on_event(&BuildEvent::PhaseChanged { from, to });
    }

    /// Resolve payload, allocation and flash offset for one section.
    fn plan(&self, section: &SectionConfig, ctx: &BuildContext) -> Result<SectionPlan, BuildError> {
        let geometry = ctx.geometry;
        let block_size = geometry.block_size;
        let name = section.name.as_str();
        let is_descriptor = section.is_firmware_info();
        let fmh_loc = if ctx.fmh_enable { section.fmh_loc() } else { 0 };

        let mut module = ModuleInfo::new(name, section.module_type());
        module.version = Version::new(section.major, section.minor);
        module.flags = section.flags();
        module.load_address = section.load_address();
        module.location = match section.offset {
            Some(offset) => offset.get(),
            None if fmh_loc != 0 => 0,
            None if module.module_type.is_jffs() => block_size,
            None => DEFAULT_MODULE_LOCATION,
        };
        if !ctx.fmh_enable {
            module.location = 0;
        }

        if fmh_loc != 0
            && (fmh_loc as u64 + FMH_SIZE as u64) > (block_size as u64 - ALT_FMH_SIZE as u64)
        {
            return Err(BuildError::InvalidLocation {
                section: name.to_string(),
                reason: format!("header offset 0x{fmh_loc:X} does not fit in the first block"),
            });
        }

        let (payload, allocated_size) = if is_descriptor {
            if module.location >= block_size {
                return Err(BuildError::InvalidLocation {
                    section: name.to_string(),
                    reason: format!(
                        "module offset 0x{:X} lies outside the descriptor block",
                        module.location
                    ),
                });
            }
            if let Some(major) = self.overrides.major {
                module.version.major = major;
            }
            if let Some(minor) = self.overrides.minor {
                module.version.minor = minor;
            }
            let mut info = self.firmware_info.clone().unwrap_or_else(|| {
                FirmwareInfo::for_build(
                    &self.config.global,
                    module.version,
                    self.build_number,
                    &self.overrides,
                )
            });
            info.version = module.version;
            let mut blob = info.to_bytes();

            let room = (block_size as usize)
                .saturating_sub(module.location as usize)
                .min(MAX_FIRMWARE_INFO_SIZE);
            if blob.len() > room {
                self.observer
                    .on_event(&BuildEvent::FirmwareInfoDropped { size: blob.len() });
                blob.clear();
            }
            module.size = blob.len() as u32;
            (blob, block_size)
        } else {
            let file = section.file.as_deref().ok_or_else(|| BuildError::MissingField {
                section: name.to_string(),
                field: "file",
            })?;
            let payload = self.source.read(file)?;
            if payload.is_empty() {
                return Err(BuildError::EmptyPayload {
                    section: name.to_string(),
                    file: self.source.describe(file),
                });
            }
            let size = u32::try_from(payload.len()).map_err(|_| BuildError::InvalidLocation {
                section: name.to_string(),
                reason: format!("payload of {} bytes exceeds 32-bit offsets", payload.len()),
            })?;
            module.size = size;
            module.checksum = crc32(&payload);

            let minimum = geometry.round_up(module.location as u64 + size as u64);
            let requested = section.alloc.map(|a| a.get()).unwrap_or(0);
            if requested != 0 && (requested as u64) < minimum {
                self.observer.on_event(&BuildEvent::AllocationGrown {
                    name: name.to_string(),
                    requested,
                    used: minimum.min(u32::MAX as u64) as u32,
                });
            }
            let allocated = minimum.max(requested as u64);
            if allocated > geometry.flash_size as u64 {
                return Err(BuildError::InvalidLocation {
                    section: name.to_string(),
                    reason: format!(
                        "allocation 0x{allocated:X} exceeds flash size 0x{:X}",
                        geometry.flash_size
                    ),
                });
            }
            (payload, allocated as u32)
        };

        let locate = section.locate.ok_or_else(|| BuildError::MissingField {
            section: name.to_string(),
            field: "locate",
        })?;
        let offset = match locate {
            Locate::Start => 0,
            Locate::End => geometry
                .flash_size
                .checked_sub(allocated_size)
                .ok_or_else(|| BuildError::InvalidLocation {
                    section: name.to_string(),
                    reason: format!(
                        "allocation 0x{allocated_size:X} exceeds flash size 0x{:X}",
                        geometry.flash_size
                    ),
                })?,
            Locate::Offset(offset) => offset,
        };
        if offset as u64 + allocated_size as u64 > geometry.flash_size as u64 {
            return Err(BuildError::InvalidLocation {
                section: name.to_string(),
                reason: format!(
                    "0x{offset:X} + alloc 0x{allocated_size:X} > flash 0x{:X}",
                    geometry.flash_size
                ),
            });
        }

        debug!(
            section = name,
            offset = %format!("0x{offset:X}"),
            alloc = %format!("0x{allocated_size:X}"),
            module_location = %format!("0x{:X}", module.location),
            "Section resolved"
        );

        Ok(SectionPlan {
            module,
            payload,
            allocated_size,
            offset,
            fmh_loc,
            is_descriptor,
        })
    }

    /// Claim the section's range and write it out.
    fn commit<W: Write + Seek>(
        &self,
        image: &mut W,
        plan: SectionPlan,
        ctx: &mut BuildContext,
    ) -> Result<(), BuildError> {
        let SectionPlan {
            module,
            payload,
            allocated_size,
            offset,
            fmh_loc,
            is_descriptor,
        } = plan;
        let name = module.raw_name();

        ctx.chain
            .claim(offset, allocated_size, &name, module.version)?;

        let header_offset = offset + fmh_loc;
        let header = ctx.fmh_enable.then(|| {
            let mut header = FmhHeader::new(module.clone(), allocated_size, header_offset);
            if is_descriptor {
                header.header_checksum = 0;
            }
            header
        });
        let alt = (fmh_loc != 0).then(|| AltFmh::new(fmh_loc));

        if is_descriptor && header.is_some() {
            if let Some(previous) = ctx.checksum_target {
                warn!(
                    previous = %format!("0x{:X}", previous.header_offset),
                    "Multiple firmware descriptors, using the last one"
                );
            }
            ctx.checksum_target = Some(ChecksumTarget {
                section_offset: offset,
                header_offset,
            });
        }

        let payload_offset = offset + module.location;
        if payload.is_empty() {
            info!(section = %name, "No firmware information written");
        } else {
            write_at(image, payload_offset, &payload)?;
        }
        if let Some(header) = &header {
            write_at(image, header_offset, &header.to_bytes())?;
        }
        if let Some(alt) = &alt {
            let alt_offset = offset + ctx.geometry.block_size - ALT_FMH_SIZE as u32;
            write_at(image, alt_offset, &alt.to_bytes())?;
            self.observer.on_event(&BuildEvent::AlternateHeader {
                name: name.clone(),
                link_address: fmh_loc,
            });
        }

        self.observer.on_event(&BuildEvent::SectionPlaced {
            name: name.clone(),
            version: module.version,
            offset,
            allocated_size,
            payload_size: module.size,
        });

        ctx.sections.push(PlacedSection {
            name,
            version: module.version,
            module_type: module.module_type,
            offset,
            allocated_size,
            header_offset: header.map(|_| header_offset),
            payload_offset,
            payload_size: module.size,
            checksum: module.checksum,
        });
        Ok(())
    }
}

fn write_at<W: Write + Seek>(image: &mut W, offset: u32, data: &[u8]) -> io::Result<()> {
    image.seek(SeekFrom::Start(offset as u64))?;
    image.write_all(data)
}

/// Erase the whole flash range to the fill byte.
fn prefill<W: Write + Seek>(image: &mut W, flash_size: u32) -> io::Result<()> {
    let chunk = vec![ERASED_BYTE; 64 * 1024];
    image.seek(SeekFrom::Start(0))?;
    let mut remaining = flash_size as usize;
    while remaining > 0 {
        let n = remaining.min(chunk.len());
        image.write_all(&chunk[..n])?;
        remaining -= n;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::config::{ByteSize, GlobalConfig};
    use crate::events::NullObserver;
    use crate::events::tests::RecordingObserver;
    use crate::format::{ModuleFlags, NO_LOAD_ADDRESS};
    use crate::source::MemorySource;

    const FLASH: u32 = 0x40000;
    const BLOCK: u32 = 0x1000;

    fn global() -> GlobalConfig {
        GlobalConfig {
            output: "test.ima".into(),
            flash_size: Some(ByteSize(FLASH)),
            block_size: Some(ByteSize(BLOCK)),
            fmh_enable: true,
            ..Default::default()
        }
    }

    fn section(name: &str, locate: Locate, file: &str) -> SectionConfig {
        SectionConfig {
            name: name.into(),
            major: 1,
            minor: 0,
            module_type: 0x0101,
            locate: Some(locate),
            file: Some(file.into()),
            ..Default::default()
        }
    }

    fn descriptor() -> SectionConfig {
        SectionConfig {
            name: "FWINFO".into(),
            major: 2,
            minor: 3,
            module_type: 0x0202,
            locate: Some(Locate::Start),
            ..Default::default()
        }
    }

    fn payload(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    fn build(
        sections: Vec<SectionConfig>,
        source: MemorySource,
    ) -> Result<(BuildReport, Vec<u8>), BuildError> {
        let config = BuildConfig {
            global: global(),
            sections,
        };
        let assembler = ImageAssembler::with_observer(config, source, Arc::new(NullObserver));
        let mut image = Cursor::new(Vec::new());
        let report = assembler.build(&mut image)?;
        Ok((report, image.into_inner()))
    }

    fn info() -> FirmwareInfo {
        FirmwareInfo {
            date: "Oct 18 2026".into(),
            build_time: "10:00:00".into(),
            description: "test".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_two_sections_layout() {
        let boot = payload(0x800, 1);
        let app = payload(0x1800, 2);
        let source = MemorySource::new()
            .with("boot.bin", boot.clone())
            .with("app.bin", app.clone());

        let (report, image) = build(
            vec![
                section("BOOT", Locate::Start, "boot.bin"),
                section("APP", Locate::End, "app.bin"),
            ],
            source,
        )
        .unwrap();

        assert_eq!(image.len(), FLASH as usize);
        assert_eq!(report.sections.len(), 2);
        assert_eq!(report.image_checksum, None);

        let head = FmhHeader::parse(&image[..64]).unwrap();
        assert_eq!(head.module.raw_name(), "BOOT");
        assert_eq!(head.allocated_size, BLOCK);
        assert_eq!(head.location, 0);
        assert_eq!(head.module.location, 0x40);
        assert_eq!(head.module.size, 0x800);
        assert_eq!(head.module.checksum, crc32(&boot));
        assert_eq!(&image[0x40..0x840], &boot[..]);
        assert!(image[0x840..BLOCK as usize].iter().all(|&b| b == 0xFF));

        // 0x40 + 0x1800 rounds up to two blocks.
        let app_offset = FLASH - 2 * BLOCK;
        let tail = FmhHeader::parse(&image[app_offset as usize..]).unwrap();
        assert_eq!(tail.module.raw_name(), "APP");
        assert_eq!(tail.allocated_size, 2 * BLOCK);
        assert_eq!(tail.location, app_offset);
        assert_eq!(report.sections[1].payload_offset, app_offset + 0x40);

        let free: Vec<_> = report.free_regions().collect();
        assert_eq!(free, [(BLOCK as u64, app_offset as u64)]);
    }

    #[test]
    fn test_overlap_aborts_before_write() {
        let source = MemorySource::new()
            .with("a.bin", payload(0x1800, 1))
            .with("b.bin", vec![0x11; 0x100]);
        let err = build(
            vec![
                section("A", Locate::Start, "a.bin"),
                section("B", Locate::Offset(BLOCK), "b.bin"),
            ],
            source,
        )
        .unwrap_err();
        match err {
            BuildError::Overlap(PlacementError::Overlap {
                name, conflicting, ..
            }) => {
                assert_eq!(name, "B");
                assert_eq!(conflicting, "A");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_overlap_leaves_image_untouched() {
        let source = MemorySource::new()
            .with("a.bin", vec![0x22; 0x100])
            .with("b.bin", vec![0x33; 0x100]);
        let config = BuildConfig {
            global: global(),
            sections: vec![
                section("A", Locate::Offset(0x8000), "a.bin"),
                section("B", Locate::Offset(0x8000), "b.bin"),
            ],
        };
        let assembler = ImageAssembler::with_observer(config, source, Arc::new(NullObserver));
        let mut image = Cursor::new(Vec::new());
        assert!(assembler.build(&mut image).is_err());
        let image = image.into_inner();
        assert!(image[0x8040..0x8140].iter().all(|&b| b == 0x22));
    }

    #[test]
    fn test_allocation_rules() {
        let observer = Arc::new(RecordingObserver::default());
        let mut small = section("SMALL", Locate::Start, "x.bin");
        small.alloc = Some(ByteSize(0x100));
        let mut big = section("BIG", Locate::Offset(0x10000), "x.bin");
        big.alloc = Some(ByteSize(0x8000));

        let config = BuildConfig {
            global: global(),
            sections: vec![small, big],
        };
        let source = MemorySource::new().with("x.bin", payload(0x1000, 3));
        let assembler = ImageAssembler::with_observer(config, source, observer.clone());
        let report = assembler.build(&mut Cursor::new(Vec::new())).unwrap();

        // 0x40 + 0x1000 needs two blocks.
        assert_eq!(report.sections[0].allocated_size, 2 * BLOCK);
        assert_eq!(report.sections[1].allocated_size, 0x8000);
        let grown = observer
            .events
            .borrow()
            .iter()
            .filter(|e| matches!(e, BuildEvent::AllocationGrown { used, .. } if *used == 2 * BLOCK))
            .count();
        assert_eq!(grown, 1);
    }

    #[test]
    fn test_location_errors() {
        let source = MemorySource::new().with("x.bin", vec![1; 16]);

        let err = build(
            vec![section("OUT", Locate::Offset(FLASH - 0x800), "x.bin")],
            source.clone(),
        )
        .unwrap_err();
        assert!(matches!(err, BuildError::InvalidLocation { .. }));

        let mut no_locate = section("NOLOC", Locate::Start, "x.bin");
        no_locate.locate = None;
        let err = build(vec![no_locate], source.clone()).unwrap_err();
        assert!(matches!(err, BuildError::MissingField { field: "locate", .. }));

        let mut no_file = section("NOFILE", Locate::Start, "x.bin");
        no_file.file = None;
        let err = build(vec![no_file], source.clone()).unwrap_err();
        assert!(matches!(err, BuildError::MissingField { field: "file", .. }));

        let err = build(vec![section("GONE", Locate::Start, "gone.bin")], source).unwrap_err();
        assert!(matches!(err, BuildError::Source(SourceError::NotFound(_))));
    }

    #[test]
    fn test_empty_payload_rejected() {
        let source = MemorySource::new().with("empty.bin", Vec::new());
        let err = build(vec![section("E", Locate::Start, "empty.bin")], source).unwrap_err();
        assert!(matches!(err, BuildError::EmptyPayload { .. }));
    }

    #[test]
    fn test_missing_geometry() {
        let config = BuildConfig {
            global: GlobalConfig {
                output: "x".into(),
                ..Default::default()
            },
            sections: vec![],
        };
        let assembler =
            ImageAssembler::with_observer(config, MemorySource::new(), Arc::new(NullObserver));
        assert!(matches!(
            assembler.build(&mut Cursor::new(Vec::new())),
            Err(BuildError::MissingField { field: "flash_size", .. })
        ));
    }

    #[test]
    fn test_alternate_header_written() {
        let mut conf = section("CONF", Locate::Offset(0x20000), "c.bin");
        conf.fmh_loc = Some(ByteSize(0x800));
        let data = payload(0x200, 9);
        let (report, image) =
            build(vec![conf], MemorySource::new().with("c.bin", data.clone())).unwrap();

        let base = 0x20000usize;
        // Payload starts the allocation, header sits inside the first block.
        assert_eq!(&image[base..base + 0x200], &data[..]);
        let header = FmhHeader::parse(&image[base + 0x800..]).unwrap();
        assert_eq!(header.location, 0x20800);
        assert_eq!(header.module.location, 0);

        let alt_at = base + BLOCK as usize - ALT_FMH_SIZE;
        let alt = AltFmh::parse(&image[alt_at..]).unwrap();
        assert_eq!(alt.link_address, 0x800);
        assert_eq!(report.sections[0].header_offset, Some(0x20800));
    }

    #[test]
    fn test_alternate_header_must_fit() {
        let mut conf = section("CONF", Locate::Start, "c.bin");
        conf.fmh_loc = Some(ByteSize(BLOCK - 0x20));
        let err = build(vec![conf], MemorySource::new().with("c.bin", vec![1; 4])).unwrap_err();
        assert!(matches!(err, BuildError::InvalidLocation { .. }));
    }

    #[test]
    fn test_descriptor_offset_outside_block() {
        let mut fw = descriptor();
        fw.locate = Some(Locate::End);
        fw.offset = Some(ByteSize(0xFFFF_FF00));
        let err = build(vec![fw], MemorySource::new()).unwrap_err();
        assert!(matches!(err, BuildError::InvalidLocation { .. }));

        let mut fw = descriptor();
        fw.offset = Some(ByteSize(BLOCK));
        let err = build(vec![fw], MemorySource::new()).unwrap_err();
        assert!(matches!(err, BuildError::InvalidLocation { .. }));
    }

    #[test]
    fn test_module_defaults() {
        let mut jffs = section("ROOT", Locate::Offset(0x10000), "r.bin");
        jffs.module_type = 0x1209;
        let mut loaded = section("KERN", Locate::Start, "k.bin");
        loaded.copy_to_ram = true;
        loaded.load = Some(ByteSize(0x8000_0000));
        let mut unloaded = section("DIAG", Locate::Offset(0x30000), "k.bin");
        unloaded.copy_to_ram = true;

        let source = MemorySource::new()
            .with("r.bin", vec![7; 0x100])
            .with("k.bin", vec![8; 0x100]);
        let (_, image) = build(vec![jffs, loaded, unloaded], source).unwrap();

        let root = FmhHeader::parse(&image[0x10000..]).unwrap();
        assert_eq!(root.module.location, BLOCK);
        assert_eq!(root.allocated_size, 2 * BLOCK);

        let kern = FmhHeader::parse(&image[..]).unwrap();
        assert!(kern.module.flags.contains(ModuleFlags::COPY_TO_RAM));
        assert_eq!(kern.module.load_address, 0x8000_0000);

        let diag = FmhHeader::parse(&image[0x30000..]).unwrap();
        assert!(!diag.module.flags.contains(ModuleFlags::COPY_TO_RAM));
        assert_eq!(diag.module.load_address, NO_LOAD_ADDRESS);
    }

    #[test]
    fn test_headers_disabled() {
        let mut g = global();
        g.fmh_enable = false;
        let config = BuildConfig {
            global: g,
            sections: vec![section("RAW", Locate::Offset(0x2000), "r.bin")],
        };
        let data = payload(0x80, 4);
        let assembler = ImageAssembler::with_observer(
            config,
            MemorySource::new().with("r.bin", data.clone()),
            Arc::new(NullObserver),
        );
        let mut image = Cursor::new(Vec::new());
        let report = assembler.build(&mut image).unwrap();
        let image = image.into_inner();
        assert_eq!(&image[0x2000..0x2080], &data[..]);
        assert!(FmhHeader::parse(&image[0x2000..]).is_none());
        assert_eq!(report.sections[0].header_offset, None);
    }

    #[test]
    fn test_descriptor_and_image_checksum() {
        let config = BuildConfig {
            global: global(),
            sections: vec![descriptor(), section("BOOT", Locate::Offset(BLOCK), "b.bin")],
        };
        let source = MemorySource::new().with("b.bin", payload(0x300, 5));
        let assembler = ImageAssembler::with_observer(config, source, Arc::new(NullObserver))
            .firmware_info(info())
            .overrides(ReleaseOverrides {
                major: Some(9),
                ..Default::default()
            });
        let mut image = Cursor::new(Vec::new());
        let report = assembler.build(&mut image).unwrap();

        let crc = report.image_checksum.unwrap();
        let header = FmhHeader::parse(&image.get_ref()[..64]).unwrap();
        assert_eq!(header.module.checksum, crc);
        assert_eq!(header.allocated_size, BLOCK);
        assert_eq!(header.module.version, Version::new(9, 3));

        let blob = &image.get_ref()[0x40..0x40 + header.module.size as usize];
        assert!(blob.starts_with(b"FW_VERSION=9.3.0\n"));

        let target = ChecksumTarget {
            section_offset: 0,
            header_offset: 0,
        };
        assert_eq!(image_checksum(&mut image, target, BLOCK).unwrap(), crc);
    }

    #[test]
    fn test_image_checksum_exclusions() {
        let config = BuildConfig {
            global: global(),
            sections: vec![descriptor()],
        };
        let assembler =
            ImageAssembler::with_observer(config, MemorySource::new(), Arc::new(NullObserver))
                .firmware_info(info());
        let mut image = Cursor::new(Vec::new());
        let crc = assembler.build(&mut image).unwrap().image_checksum.unwrap();
        let target = ChecksumTarget {
            section_offset: 0,
            header_offset: 0,
        };

        let pristine = image.into_inner();
        for pos in [0x17usize, 0x32, 0x33, 0x34, 0x35] {
            let mut mutated = Cursor::new(pristine.clone());
            mutated.get_mut()[pos] ^= 0x5A;
            assert_eq!(image_checksum(&mut mutated, target, BLOCK).unwrap(), crc);
        }
        for pos in [0x16usize, 0x31, 0x36, 0x100, BLOCK as usize - 1] {
            let mut mutated = Cursor::new(pristine.clone());
            mutated.get_mut()[pos] ^= 0x5A;
            assert_ne!(image_checksum(&mut mutated, target, BLOCK).unwrap(), crc);
        }
        // Bytes past the descriptor block are not covered.
        let mut mutated = Cursor::new(pristine);
        mutated.get_mut()[BLOCK as usize] ^= 0x5A;
        assert_eq!(image_checksum(&mut mutated, target, BLOCK).unwrap(), crc);
    }

    #[test]
    fn test_oversized_firmware_info_dropped() {
        let mut big = info();
        big.description = "x".repeat(BLOCK as usize);
        let config = BuildConfig {
            global: global(),
            sections: vec![descriptor()],
        };
        let assembler =
            ImageAssembler::with_observer(config, MemorySource::new(), Arc::new(NullObserver))
                .firmware_info(big);
        let mut image = Cursor::new(Vec::new());
        assembler.build(&mut image).unwrap();
        let image = image.into_inner();
        let header = FmhHeader::parse(&image).unwrap();
        assert_eq!(header.module.size, 0);
        assert!(image[0x40..BLOCK as usize].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn test_build_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.ima");
        let config = BuildConfig {
            global: global(),
            sections: vec![section("BOOT", Locate::Start, "b.bin")],
        };
        let assembler = ImageAssembler::new(config, MemorySource::new().with("b.bin", vec![1; 8]));
        let report = assembler.build_to_file(&path).unwrap();
        assert_eq!(report.chain.len(), 1);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), FLASH as u64);
    }
}
