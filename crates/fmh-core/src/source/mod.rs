//! Payload sources.
//!
//! The assembler reads section payloads through the `PayloadSource` trait
//! so builds can run against the file system or an in-memory fixture.

pub mod fs;
pub mod memory;
pub mod traits;

pub use fs::FsSource;
pub use memory::MemorySource;
pub use traits::{PayloadSource, SourceError};
