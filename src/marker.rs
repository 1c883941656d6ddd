//! Liveness marker
//!
//! A zero-byte file that tells a supervising host the extension has begun
//! initializing. The file is created (or truncated) once at startup and is
//! never removed by this process.

use crate::error::{ExtensionError, Result};
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::info;

/// Create the liveness marker at `path`.
///
/// An existing file is truncated to zero bytes, which also refreshes its
/// modification time for observers that look at it.
pub fn create(path: &Path) -> Result<PathBuf> {
    File::create(path)
        .map_err(|e| ExtensionError::marker(path.display().to_string(), e.to_string()))?;
    info!(path = %path.display(), "Liveness marker created");
    Ok(path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_create_zero_byte_marker() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nats-extension.lock");

        let created = create(&path).unwrap();
        assert_eq!(created, path);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    }

    #[test]
    fn test_existing_marker_is_truncated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("marker");
        let mut file = File::create(&path).unwrap();
        file.write_all(b"stale").unwrap();
        drop(file);

        create(&path).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    }

    #[test]
    fn test_missing_directory_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing").join("marker");

        let err = create(&path).unwrap_err();
        assert!(matches!(err, ExtensionError::Marker { .. }));
    }
}
