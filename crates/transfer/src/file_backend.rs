//! Filesystem capability trait and the local implementation.
//!
//! The engine never touches `std::fs`/`tokio::fs` directly; everything goes
//! through [`FileBackend`] so environments without a filesystem can supply
//! their own primitives (or, for upload-only use, an in-memory source).

use std::io::SeekFrom;
use std::path::Path;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::error::TransferError;

/// Result of a `stat` call.
#[derive(Debug, Clone, Copy)]
pub struct FileStat {
    /// Whether the path is a directory.
    pub is_dir: bool,
    /// Size in bytes (0 for directories).
    pub size: u64,
    /// Modification time, milliseconds since the Unix epoch.
    pub last_modified_ms: i64,
}

/// A boxed writer positioned at a specific byte offset.
pub type RandomWriteFile = Pin<Box<dyn tokio::io::AsyncWrite + Send>>;

/// Filesystem operations the transfer engine depends on.
#[async_trait]
pub trait FileBackend: Send + Sync {
    /// Stat a path. Returns `None` if it does not exist.
    async fn stat(&self, path: &Path) -> Result<Option<FileStat>, TransferError>;

    /// Create a directory and all of its parents.
    async fn create_dir_all(&self, path: &Path) -> Result<(), TransferError>;

    /// Create an empty file, truncating any existing content.
    async fn create_file(&self, path: &Path) -> Result<(), TransferError>;

    /// Open a file for writing at `offset`, creating it if missing.
    /// Existing content outside the written range is preserved.
    async fn open_write_at(&self, path: &Path, offset: u64)
        -> Result<RandomWriteFile, TransferError>;

    /// Read exactly `length` bytes starting at `offset`.
    async fn read_range(
        &self,
        path: &Path,
        offset: u64,
        length: u64,
    ) -> Result<Bytes, TransferError>;

    /// Rename a file, replacing the destination if present.
    async fn rename(&self, from: &Path, to: &Path) -> Result<(), TransferError>;

    /// Remove a file.
    async fn remove_file(&self, path: &Path) -> Result<(), TransferError>;

    /// Read a whole file as UTF-8. Returns `None` if it does not exist.
    async fn read_to_string(&self, path: &Path) -> Result<Option<String>, TransferError>;

    /// Write a whole file atomically (scratch file + rename) so readers
    /// never observe a partial document.
    async fn write_atomic(&self, path: &Path, contents: &str) -> Result<(), TransferError>;
}

/// `FileBackend` backed by the local filesystem through `tokio::fs`.
#[derive(Debug, Default, Clone)]
pub struct LocalFileBackend;

impl LocalFileBackend {
    /// Create a new local backend.
    pub fn new() -> Self {
        Self
    }
}

fn io_err(path: &Path, err: std::io::Error) -> TransferError {
    TransferError::io(path.display().to_string(), err)
}

#[async_trait]
impl FileBackend for LocalFileBackend {
    async fn stat(&self, path: &Path) -> Result<Option<FileStat>, TransferError> {
        match tokio::fs::metadata(path).await {
            Ok(meta) => {
                let last_modified_ms: i64 = meta
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                    .map(|d| d.as_millis() as i64)
                    .unwrap_or(0);
                Ok(Some(FileStat {
                    is_dir: meta.is_dir(),
                    size: meta.len(),
                    last_modified_ms,
                }))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(io_err(path, err)),
        }
    }

    async fn create_dir_all(&self, path: &Path) -> Result<(), TransferError> {
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|e| io_err(path, e))
    }

    async fn create_file(&self, path: &Path) -> Result<(), TransferError> {
        tokio::fs::File::create(path)
            .await
            .map(|_| ())
            .map_err(|e| io_err(path, e))
    }

    async fn open_write_at(
        &self,
        path: &Path,
        offset: u64,
    ) -> Result<RandomWriteFile, TransferError> {
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .await
            .map_err(|e| io_err(path, e))?;

        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| io_err(path, e))?;

        Ok(Box::pin(file))
    }

    async fn read_range(
        &self,
        path: &Path,
        offset: u64,
        length: u64,
    ) -> Result<Bytes, TransferError> {
        if length == 0 {
            return Ok(Bytes::new());
        }

        let mut file = tokio::fs::File::open(path)
            .await
            .map_err(|e| io_err(path, e))?;

        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| io_err(path, e))?;

        let mut buffer: Vec<u8> = vec![0u8; length as usize];
        file.read_exact(&mut buffer)
            .await
            .map_err(|e| io_err(path, e))?;

        Ok(Bytes::from(buffer))
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<(), TransferError> {
        tokio::fs::rename(from, to)
            .await
            .map_err(|e| io_err(from, e))
    }

    async fn remove_file(&self, path: &Path) -> Result<(), TransferError> {
        tokio::fs::remove_file(path)
            .await
            .map_err(|e| io_err(path, e))
    }

    async fn read_to_string(&self, path: &Path) -> Result<Option<String>, TransferError> {
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => Ok(Some(contents)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(io_err(path, err)),
        }
    }

    async fn write_atomic(&self, path: &Path, contents: &str) -> Result<(), TransferError> {
        let mut scratch = path.as_os_str().to_owned();
        scratch.push(".tmp");
        let scratch = std::path::PathBuf::from(scratch);

        let mut file = tokio::fs::File::create(&scratch)
            .await
            .map_err(|e| io_err(&scratch, e))?;
        file.write_all(contents.as_bytes())
            .await
            .map_err(|e| io_err(&scratch, e))?;
        file.flush().await.map_err(|e| io_err(&scratch, e))?;
        drop(file);

        tokio::fs::rename(&scratch, path)
            .await
            .map_err(|e| io_err(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_stat_missing_and_dir() {
        let dir: TempDir = TempDir::new().unwrap();
        let backend: LocalFileBackend = LocalFileBackend::new();

        let missing = backend.stat(&dir.path().join("nope")).await.unwrap();
        assert!(missing.is_none());

        let stat: FileStat = backend.stat(dir.path()).await.unwrap().unwrap();
        assert!(stat.is_dir);
    }

    #[tokio::test]
    async fn test_write_at_offsets_assembles_file() {
        let dir: TempDir = TempDir::new().unwrap();
        let backend: LocalFileBackend = LocalFileBackend::new();
        let path: PathBuf = dir.path().join("out.bin");

        backend.create_file(&path).await.unwrap();

        // Write the second half before the first.
        let mut writer = backend.open_write_at(&path, 5).await.unwrap();
        writer.write_all(b" world").await.unwrap();
        writer.flush().await.unwrap();
        drop(writer);

        let mut writer = backend.open_write_at(&path, 0).await.unwrap();
        writer.write_all(b"hello").await.unwrap();
        writer.flush().await.unwrap();
        drop(writer);

        let content: Vec<u8> = std::fs::read(&path).unwrap();
        assert_eq!(&content, b"hello world");
    }

    #[tokio::test]
    async fn test_create_file_truncates() {
        let dir: TempDir = TempDir::new().unwrap();
        let backend: LocalFileBackend = LocalFileBackend::new();
        let path: PathBuf = dir.path().join("trunc.bin");

        std::fs::write(&path, b"stale content").unwrap();
        backend.create_file(&path).await.unwrap();

        let stat: FileStat = backend.stat(&path).await.unwrap().unwrap();
        assert_eq!(stat.size, 0);
    }

    #[tokio::test]
    async fn test_read_range() {
        let dir: TempDir = TempDir::new().unwrap();
        let backend: LocalFileBackend = LocalFileBackend::new();
        let path: PathBuf = dir.path().join("src.bin");
        std::fs::write(&path, b"0123456789").unwrap();

        let bytes: Bytes = backend.read_range(&path, 3, 4).await.unwrap();
        assert_eq!(&bytes[..], b"3456");

        let empty: Bytes = backend.read_range(&path, 0, 0).await.unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn test_write_atomic_roundtrip() {
        let dir: TempDir = TempDir::new().unwrap();
        let backend: LocalFileBackend = LocalFileBackend::new();
        let path: PathBuf = dir.path().join("doc.json");

        backend.write_atomic(&path, "{\"a\":1}").await.unwrap();
        let read: String = backend.read_to_string(&path).await.unwrap().unwrap();
        assert_eq!(read, "{\"a\":1}");

        // No scratch file left behind.
        assert!(!dir.path().join("doc.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_read_to_string_missing() {
        let dir: TempDir = TempDir::new().unwrap();
        let backend: LocalFileBackend = LocalFileBackend::new();
        let read = backend.read_to_string(&dir.path().join("gone")).await.unwrap();
        assert!(read.is_none());
    }
}
