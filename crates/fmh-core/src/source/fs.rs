//! File system payload source.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use super::traits::{PayloadSource, SourceError};

/// Reads payloads relative to an input directory.
///
/// Names containing a path separator are used as given.
#[derive(Debug, Clone)]
pub struct FsSource {
    base_dir: PathBuf,
}

impl FsSource {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn resolve(&self, name: &str) -> PathBuf {
        if name.contains('/') || name.contains(std::path::MAIN_SEPARATOR) {
            PathBuf::from(name)
        } else {
            self.base_dir.join(name)
        }
    }
}

fn map_err(name: &str, e: std::io::Error) -> SourceError {
    if e.kind() == ErrorKind::NotFound {
        SourceError::NotFound(name.to_string())
    } else {
        SourceError::Read {
            name: name.to_string(),
            source: e,
        }
    }
}

impl PayloadSource for FsSource {
    fn read(&self, name: &str) -> Result<Vec<u8>, SourceError> {
        let path = self.resolve(name);
        std::fs::read(&path).map_err(|e| map_err(&path.display().to_string(), e))
    }

    fn describe(&self, name: &str) -> String {
        self.resolve(name).display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_relative_and_explicit() {
        let source = FsSource::new("/in");
        assert_eq!(source.resolve("boot.bin"), PathBuf::from("/in/boot.bin"));
        assert_eq!(source.resolve("/abs/boot.bin"), PathBuf::from("/abs/boot.bin"));
        assert_eq!(source.resolve("sub/boot.bin"), PathBuf::from("sub/boot.bin"));
    }

    #[test]
    fn test_read_from_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("app.bin"), [1u8, 2, 3]).unwrap();

        let source = FsSource::new(dir.path());
        assert_eq!(source.read("app.bin").unwrap(), vec![1, 2, 3]);
        assert!(matches!(
            source.read("missing.bin"),
            Err(SourceError::NotFound(_))
        ));
    }
}
