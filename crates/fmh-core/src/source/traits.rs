//! Payload source abstraction.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Payload not found: {0}")]
    NotFound(String),

    #[error("Failed to read payload {name}: {source}")]
    Read {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// Provider of section payload bytes, addressed by the `file` value of a
/// section.
///
/// This trait enables:
/// - File system input directories
/// - In-memory fixtures for tests and generated images
pub trait PayloadSource {
    /// Read the whole payload.
    fn read(&self, name: &str) -> Result<Vec<u8>, SourceError>;

    /// Human readable location of a payload, for diagnostics.
    fn describe(&self, name: &str) -> String {
        name.to_string()
    }
}

impl<S: PayloadSource + ?Sized> PayloadSource for &S {
    fn read(&self, name: &str) -> Result<Vec<u8>, SourceError> {
        (**self).read(name)
    }

    fn describe(&self, name: &str) -> String {
        (**self).describe(name)
    }
}
