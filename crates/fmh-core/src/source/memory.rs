//! In-memory payload source.

use std::collections::HashMap;

use super::traits::{PayloadSource, SourceError};

/// Named byte buffers standing in for an input directory.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    files: HashMap<String, Vec<u8>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a payload.
    pub fn insert(&mut self, name: impl Into<String>, data: impl Into<Vec<u8>>) {
        self.files.insert(name.into(), data.into());
    }

    /// Builder form of [`MemorySource::insert`].
    pub fn with(mut self, name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        self.insert(name, data);
        self
    }
}

impl PayloadSource for MemorySource {
    fn read(&self, name: &str) -> Result<Vec<u8>, SourceError> {
        self.files
            .get(name)
            .cloned()
            .ok_or_else(|| SourceError::NotFound(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_source() {
        let source = MemorySource::new().with("a.bin", vec![0xAA; 4]);
        assert_eq!(source.read("a.bin").unwrap(), vec![0xAA; 4]);
        assert!(source.read("b.bin").is_err());
    }
}
