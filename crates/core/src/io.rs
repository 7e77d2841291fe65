//! Byte-range file I/O used by the scanners and the replica

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::error::{Result, SyncError};

/// Size and mtime of a file on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileInfo {
    pub size: u64,
    pub modified: SystemTime,
}

/// Synchronous access to file bytes.
///
/// Implementations block; async callers go through `spawn_blocking`.
pub trait FileIo: Send + Sync {
    /// Size and mtime, or an I/O error if the path is not a regular file
    ///
    /// # Errors
    /// Returns [`SyncError::Io`] if the file is missing or unreadable
    fn metadata(&self, path: &Path) -> Result<FileInfo>;

    /// Read exactly `len` bytes starting at `offset`
    ///
    /// # Errors
    /// Returns [`SyncError::Io`] on failure or if the file is shorter than requested
    fn read_range(&self, path: &Path, offset: u64, len: u64) -> Result<Vec<u8>>;

    /// Write `data` at `offset`, extending the file if needed
    ///
    /// # Errors
    /// Returns [`SyncError::Io`] if the file cannot be opened or written
    fn write_range(&self, path: &Path, offset: u64, data: &[u8]) -> Result<()>;

    /// Create or truncate/extend the file to `len` bytes, creating parent directories
    ///
    /// # Errors
    /// Returns [`SyncError::Io`] if the file cannot be created or resized
    fn set_len(&self, path: &Path, len: u64) -> Result<()>;
}

/// [`FileIo`] over the local filesystem
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFileIo;

impl FileIo for LocalFileIo {
    fn metadata(&self, path: &Path) -> Result<FileInfo> {
        let meta = std::fs::metadata(path).map_err(|e| SyncError::io(path, e))?;
        if !meta.is_file() {
            return Err(SyncError::io(
                path,
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a regular file"),
            ));
        }
        Ok(FileInfo {
            size: meta.len(),
            modified: meta.modified().map_err(|e| SyncError::io(path, e))?,
        })
    }

    fn read_range(&self, path: &Path, offset: u64, len: u64) -> Result<Vec<u8>> {
        let io = |e| SyncError::io(path, e);
        let mut file = File::open(path).map_err(io)?;
        file.seek(SeekFrom::Start(offset)).map_err(io)?;

        let len = usize::try_from(len).map_err(|_| {
            io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "range too large",
            ))
        })?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf).map_err(io)?;
        Ok(buf)
    }

    fn write_range(&self, path: &Path, offset: u64, data: &[u8]) -> Result<()> {
        let io = |e| SyncError::io(path, e);
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(io)?;
        file.seek(SeekFrom::Start(offset)).map_err(io)?;
        file.write_all(data).map_err(io)?;
        file.flush().map_err(io)
    }

    fn set_len(&self, path: &Path, len: u64) -> Result<()> {
        let io = |e| SyncError::io(path, e);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io)?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(io)?;
        if file.metadata().map_err(io)?.len() != len {
            file.set_len(len).map_err(io)?;
        }
        Ok(())
    }
}

/// Run blocking file work off the async runtime.
/// A panicked task surfaces as an I/O failure on `path`.
pub(crate) async fn run_blocking<T, F>(path: PathBuf, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result,
        Err(e) => Err(SyncError::io(path, std::io::Error::other(e))),
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_read_and_write_ranges() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/data.bin");

        LocalFileIo.set_len(&path, 16).unwrap();
        LocalFileIo.write_range(&path, 4, b"abcd").unwrap();

        let info = LocalFileIo.metadata(&path).unwrap();
        assert_eq!(info.size, 16);
        assert_eq!(LocalFileIo.read_range(&path, 4, 4).unwrap(), b"abcd");
        assert_eq!(LocalFileIo.read_range(&path, 0, 4).unwrap(), vec![0u8; 4]);
    }

    #[test]
    fn test_truncated_read_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("short");
        std::fs::write(&path, b"abc").unwrap();
        assert!(LocalFileIo.read_range(&path, 0, 10).is_err());
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let dir = TempDir::new().unwrap();
        let err = LocalFileIo.metadata(&dir.path().join("nope")).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_directory_is_not_a_file() {
        let dir = TempDir::new().unwrap();
        assert!(LocalFileIo.metadata(dir.path()).is_err());
    }
}
