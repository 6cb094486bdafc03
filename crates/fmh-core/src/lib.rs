//! FMH-Core: Flash Module Header image packing and scanning.
//!
//! Packs named binary sections (bootloader, kernel, file systems, firmware
//! metadata) into a flat flash image, each described by a self-validating
//! header, and scans such images back into their sections.
//!
//! # Architecture
//!
//! - **Format**: Header and alternate-marker codecs, modulo-100 checksum
//! - **CRC32**: Streaming table-driven CRC32
//! - **Placement**: Offset-ordered section chain with overlap detection
//! - **Assembler**: The write path, driven by a [`BuildConfig`]
//! - **Scanner**: The read path, block by block
//! - **Listing**: Build configuration reconstructed from an image
//! - **Events**: Observer pattern for UI decoupling
//!
//! # Example
//!
//! ```no_run
//! use fmh_core::{BuildConfig, FsSource, ImageAssembler};
//!
//! let config = BuildConfig::load_from_file("genimage.toml").expect("bad config");
//! let assembler = ImageAssembler::new(config, FsSource::new("input"));
//! let report = assembler.build_to_file("rom.ima").expect("build failed");
//! println!("{}", report.flash_map());
//! ```

pub mod assembler;
pub mod config;
pub mod crc32;
pub mod events;
pub mod format;
pub mod fwinfo;
pub mod listing;
pub mod placement;
pub mod scanner;
pub mod source;

// Re-exports for convenience
pub use assembler::{BuildError, BuildReport, ImageAssembler, PlacedSection};
pub use config::{BuildConfig, ByteSize, ConfigError, Locate, ReleaseOverrides, SectionConfig};
pub use crc32::{Crc32, crc32};
pub use events::{BuildEvent, BuildObserver, BuildPhase, NullObserver, TracingObserver};
pub use format::{AltFmh, FmhHeader, ModuleInfo, ModuleType, Version};
pub use fwinfo::FirmwareInfo;
pub use listing::{ImageListing, ListingError};
pub use placement::{PlacementError, SectionChain};
pub use scanner::{ImageScanner, ScanError, ScannedSection, scan_window};
pub use source::{FsSource, MemorySource, PayloadSource, SourceError};
