//! Binary layout of the Flash Module Header format.

pub mod checksum;
pub mod constants;
pub mod header;
pub mod module;

pub use checksum::{byte_sum, is_valid_module100, module100};
pub use constants::*;
pub use header::{AltFmh, FmhHeader};
pub use module::{Compression, ModuleFlags, ModuleInfo, ModuleType, Version};
