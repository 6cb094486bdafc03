//! Reconstruct a build configuration from an existing image.

use std::fmt;
use std::io::{Read, Seek};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::info;

use crate::config::{BuildConfig, ByteSize, ConfigError, GlobalConfig, Locate, SectionConfig};
use crate::format::{DEFAULT_MODULE_LOCATION, ModuleFlags};
use crate::fwinfo::FirmwareInfo;
use crate::scanner::{ImageScanner, ScanError, ScannedSection};

/// File name of the reconstructed configuration inside a dump directory.
pub const LISTING_FILE: &str = "genimage.toml";

#[derive(Error, Debug)]
pub enum ListingError {
    #[error("Output directory {0} already exists")]
    OutputExists(PathBuf),

    #[error(transparent)]
    Scan(#[from] ScanError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Payload file name for a section. Names come from the image, so anything
/// outside `[A-Za-z0-9_-]` is replaced to keep the file inside the dump
/// directory.
fn payload_file(name: &str) -> String {
    let stem: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{stem}.bin")
}

/// Sections recovered from an image, plus its firmware info.
#[derive(Debug, Clone)]
pub struct ImageListing {
    pub image_name: String,
    pub image_size: u64,
    pub block_size: u32,
    /// Ascending, terminal header last.
    pub sections: Vec<ScannedSection>,
    pub firmware: Option<FirmwareInfo>,
}

impl ImageListing {
    /// Enumerate an image. The terminal header is looked up in the last
    /// block unless `terminal_offset` names the block holding it.
    pub fn read<R: Read + Seek>(
        scanner: &mut ImageScanner<R>,
        image_name: &str,
        terminal_offset: Option<u64>,
    ) -> Result<Self, ScanError> {
        let terminal = match terminal_offset {
            Some(offset) => scanner.header_at(offset)?,
            None => scanner.terminal()?,
        };
        let sections = scanner.sections_until(terminal)?;

        let firmware = match sections.iter().find(|s| s.is_firmware_info()) {
            Some(descriptor) => Some(scanner.firmware_info(descriptor)?),
            None => None,
        };

        Ok(Self {
            image_name: image_name.to_string(),
            image_size: scanner.image_size(),
            block_size: scanner.block_size(),
            sections,
            firmware,
        })
    }

    fn terminal_location(&self) -> Option<u32> {
        self.sections.last().map(|s| s.header.location)
    }

    fn section_config(&self, section: &ScannedSection) -> SectionConfig {
        let header = &section.header;
        let module = &header.module;
        let name = section.name();
        let block = self.block_size;

        let locate = if header.location < block {
            Locate::Start
        } else if Some(header.location) == self.terminal_location() {
            Locate::End
        } else {
            Locate::Offset(section.window_offset as u32)
        };

        let mut config = SectionConfig {
            name: name.clone(),
            major: module.version.major,
            minor: module.version.minor,
            module_type: module.module_type.0,
            locate: Some(locate),
            ..Default::default()
        };

        if section.is_firmware_info() {
            return config;
        }

        let flags = module.flags;
        config.boot_os = flags.contains(ModuleFlags::BOOT_OS);
        config.boot_diag = flags.contains(ModuleFlags::BOOT_DIAG);
        config.boot_reco = flags.contains(ModuleFlags::BOOT_RECOVERY);
        config.copy_to_ram = flags.contains(ModuleFlags::COPY_TO_RAM);
        config.execute = flags.contains(ModuleFlags::EXECUTE);
        config.checksum = flags.contains(ModuleFlags::VALID_CHECKSUM);
        config.compress = u8::from(flags.compression());

        let spare = (header.allocated_size as u64).saturating_sub(module.location as u64);
        if spare > module.size as u64 + block as u64 {
            config.alloc = Some(ByteSize(header.allocated_size));
        }
        if module.location > DEFAULT_MODULE_LOCATION {
            config.offset = Some(ByteSize(module.location));
        }
        if module.has_load_address() {
            config.load = Some(ByteSize(module.load_address));
        }
        if header.location % block != 0 {
            config.fmh_loc = Some(ByteSize(header.location % block));
        }
        config.file = Some(payload_file(&name));
        config
    }

    /// Configuration that rebuilds this image.
    pub fn to_build_config(&self) -> BuildConfig {
        let mut global = GlobalConfig {
            output: self.image_name.clone(),
            flash_size: Some(ByteSize(self.image_size.min(u32::MAX as u64) as u32)),
            block_size: Some(ByteSize(self.block_size)),
            fmh_enable: true,
            ..Default::default()
        };
        if let Some(info) = &self.firmware {
            global.build_no = Some(info.build_no).filter(|n| *n != 0);
            global.product_id = info.product_id;
            global.product_name = info.product_name.clone();
            global.oem_keys = info.oem.iter().cloned().collect();
        }

        BuildConfig {
            global,
            sections: self
                .sections
                .iter()
                .map(|s| self.section_config(s))
                .collect(),
        }
    }

    /// One line per section: name, version, type.
    pub fn summary(&self) -> Summary<'_> {
        Summary(self)
    }

    /// Write the configuration and every payload into a new directory.
    pub fn extract<R: Read + Seek>(
        &self,
        scanner: &mut ImageScanner<R>,
        out_dir: &Path,
    ) -> Result<Vec<PathBuf>, ListingError> {
        if out_dir.exists() {
            return Err(ListingError::OutputExists(out_dir.to_path_buf()));
        }
        std::fs::create_dir_all(out_dir)?;

        let mut written = Vec::new();
        let listing_path = out_dir.join(LISTING_FILE);
        self.to_build_config().save_to_file(&listing_path)?;
        written.push(listing_path);

        for section in self.sections.iter().filter(|s| !s.is_firmware_info()) {
            let name = section.name();
            info!(
                section = %name,
                kind = section.header.module.module_type.kind_name(),
                "Extracting"
            );
            let payload = scanner.read_payload(section)?;
            let path = out_dir.join(payload_file(&name));
            std::fs::write(&path, payload)?;
            written.push(path);
        }
        Ok(written)
    }
}

/// Summary rendering of an [`ImageListing`].
pub struct Summary<'a>(&'a ImageListing);

impl fmt::Display for Summary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for section in &self.0.sections {
            let module = &section.header.module;
            writeln!(
                f,
                "{:<16}\t{}\t0x{:04x}",
                section.name(),
                module.version,
                module.module_type.0
            )?;
        }
        Ok(())
    }
}
