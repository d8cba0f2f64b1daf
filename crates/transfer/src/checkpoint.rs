//! Checkpoint documents and the checkpoint store.
//!
//! A checkpoint is a persisted record of per-part completion enabling
//! resumption across process restarts. The on-disk format is JSON (UTF-8,
//! 2-space indent) and the field names here are part of the wire contract;
//! a checkpoint written by one build must load in the next.
//!
//! The store only concerns itself with bytes on disk: load, atomic persist,
//! best-effort removal, and path resolution. Schema validation against a
//! fresh `HEAD` (or a fresh local stat for upload) is the engine's job.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tos_transfer_common::crc64;
use tos_transfer_common::CHECKPOINT_FILE_SUFFIX;

use crate::error::TransferError;
use crate::file_backend::FileBackend;
use crate::planner::PartTask;

/// Snapshot of the remote object captured at `HEAD` time, used to detect
/// mid-transfer object mutation when resuming.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectInfo {
    pub etag: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash_crc64ecma: Option<String>,
    pub object_size: u64,
    pub last_modified: String,
}

/// Local file paths involved in a download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadFileInfo {
    pub file_path: String,
    pub temp_file_path: String,
}

/// Snapshot of the local source file captured when an upload starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadFileInfo {
    pub file_path: String,
    pub file_size: u64,
    /// Modification time, milliseconds since the Unix epoch.
    pub last_modified: i64,
}

/// Per-part completion record for a download.
///
/// `range_end` is inclusive; the single part of a zero-size object is
/// recorded with `range_end == -1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadPartRecord {
    pub part_number: u32,
    pub range_start: u64,
    pub range_end: i64,
    pub hash_crc64ecma: String,
    pub is_completed: bool,
}

/// Per-part completion record for an upload; additionally carries the
/// server-assigned part etag needed by CompleteMultipartUpload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadPartRecord {
    pub part_number: u32,
    pub range_start: u64,
    pub range_end: i64,
    pub hash_crc64ecma: String,
    pub is_completed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

/// Length in bytes of the inclusive range `[start, end]`, zero when the
/// record describes the empty part of a zero-size object.
fn range_len(range_start: u64, range_end: i64) -> u64 {
    (range_end - range_start as i64 + 1).max(0) as u64
}

impl DownloadPartRecord {
    /// Create an uncompleted record for a planned task.
    pub fn pending(task: &PartTask) -> Self {
        Self {
            part_number: task.part_number,
            range_start: task.offset,
            range_end: task.range_end(),
            hash_crc64ecma: "0".into(),
            is_completed: false,
        }
    }

    /// Length in bytes of this part.
    pub fn length(&self) -> u64 {
        range_len(self.range_start, self.range_end)
    }
}

impl UploadPartRecord {
    /// Create an uncompleted record for a planned task.
    pub fn pending(task: &PartTask) -> Self {
        Self {
            part_number: task.part_number,
            range_start: task.offset,
            range_end: task.range_end(),
            hash_crc64ecma: "0".into(),
            is_completed: false,
            etag: None,
        }
    }

    /// Length in bytes of this part.
    pub fn length(&self) -> u64 {
        range_len(self.range_start, self.range_end)
    }
}

/// Persisted state of a resumable download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadCheckpoint {
    pub bucket: String,
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version_id: Option<String>,
    pub part_size: u64,
    pub object_info: ObjectInfo,
    pub file_info: DownloadFileInfo,
    pub parts_info: Vec<DownloadPartRecord>,
}

/// Persisted state of a resumable multipart upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadCheckpoint {
    pub bucket: String,
    pub key: String,
    pub part_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_id: Option<String>,
    pub file_info: UploadFileInfo,
    pub parts_info: Vec<UploadPartRecord>,
}

impl DownloadCheckpoint {
    /// Sum of the lengths of completed parts.
    pub fn completed_bytes(&self) -> u64 {
        self.parts_info
            .iter()
            .filter(|p| p.is_completed)
            .map(|p| p.length())
            .sum()
    }

    /// Part numbers already completed.
    pub fn completed_part_numbers(&self) -> Vec<u32> {
        let mut numbers: Vec<u32> = self
            .parts_info
            .iter()
            .filter(|p| p.is_completed)
            .map(|p| p.part_number)
            .collect();
        numbers.sort_unstable();
        numbers
    }

    /// Insert or replace the record for `record.part_number`, keeping
    /// `parts_info` sorted ascending and unique by part number.
    pub fn upsert(&mut self, record: DownloadPartRecord) {
        match self
            .parts_info
            .binary_search_by_key(&record.part_number, |p| p.part_number)
        {
            Ok(index) => self.parts_info[index] = record,
            Err(index) => self.parts_info.insert(index, record),
        }
    }

    /// Combine the per-part digests, in part order, into the whole-object
    /// CRC64 digest.
    pub fn combined_crc64(&self) -> Result<String, TransferError> {
        combine_part_digests(
            self.parts_info
                .iter()
                .map(|p| (p.hash_crc64ecma.as_str(), p.length())),
        )
    }
}

impl UploadCheckpoint {
    /// Sum of the lengths of completed parts.
    pub fn completed_bytes(&self) -> u64 {
        self.parts_info
            .iter()
            .filter(|p| p.is_completed)
            .map(|p| p.length())
            .sum()
    }

    /// Insert or replace the record for `record.part_number`, keeping
    /// `parts_info` sorted ascending and unique by part number.
    pub fn upsert(&mut self, record: UploadPartRecord) {
        match self
            .parts_info
            .binary_search_by_key(&record.part_number, |p| p.part_number)
        {
            Ok(index) => self.parts_info[index] = record,
            Err(index) => self.parts_info.insert(index, record),
        }
    }

    /// Combine the per-part digests, in part order, into the whole-object
    /// CRC64 digest.
    pub fn combined_crc64(&self) -> Result<String, TransferError> {
        combine_part_digests(
            self.parts_info
                .iter()
                .map(|p| (p.hash_crc64ecma.as_str(), p.length())),
        )
    }
}

fn combine_part_digests<'a>(
    parts: impl Iterator<Item = (&'a str, u64)>,
) -> Result<String, TransferError> {
    let mut acc: String = "0".into();
    for (digest, length) in parts {
        acc = crc64::combine_digests(&acc, digest, length).map_err(|bad| {
            TransferError::invalid_input(format!("checkpoint carries non-decimal CRC64 {bad:?}"))
        })?;
    }
    Ok(acc)
}

/// Caller-supplied checkpoint: a file path to persist through, or an
/// in-memory document (no persistence).
#[derive(Debug, Clone)]
pub enum CheckpointInput<T> {
    /// Load from and persist to this path. A directory (or a path with a
    /// trailing separator) selects directory mode, where the file name is
    /// derived from the transfer identity.
    Path(PathBuf),
    /// Resume from this document without touching disk.
    Document(T),
}

/// Where a checkpoint path resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointLocation {
    /// A concrete file path.
    File(PathBuf),
    /// A directory; the file name is derived per transfer, and for upload
    /// only once the upload id is known.
    Directory(PathBuf),
}

/// Compute the directory-mode checkpoint file name.
///
/// `discriminator` is the version id for download and the upload id for
/// upload. Path separators are stripped so object keys with `/` stay a
/// single file name.
pub fn default_checkpoint_file_name(bucket: &str, key: &str, discriminator: Option<&str>) -> String {
    let raw: String = format!(
        "{}_{}.{}{}",
        bucket,
        key,
        discriminator.unwrap_or(""),
        CHECKPOINT_FILE_SUFFIX
    );
    raw.chars().filter(|c| *c != '/' && *c != '\\').collect()
}

/// Load/persist checkpoint documents through a [`FileBackend`].
pub struct CheckpointStore<'a, F: FileBackend> {
    backend: &'a F,
}

impl<'a, F: FileBackend> CheckpointStore<'a, F> {
    /// Create a store over a backend.
    pub fn new(backend: &'a F) -> Self {
        Self { backend }
    }

    /// Resolve a caller-supplied checkpoint path.
    ///
    /// A trailing separator or an existing directory selects directory
    /// mode; anything else is used as a file path and its parent
    /// directories are created.
    pub async fn resolve(&self, path: &Path) -> Result<CheckpointLocation, TransferError> {
        let raw: String = path.to_string_lossy().into_owned();
        let trailing_separator: bool = raw.ends_with('/') || raw.ends_with('\\');

        let is_dir: bool = match self.backend.stat(path).await? {
            Some(stat) => stat.is_dir,
            None => false,
        };

        if trailing_separator || is_dir {
            return Ok(CheckpointLocation::Directory(path.to_path_buf()));
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                self.backend.create_dir_all(parent).await?;
            }
        }
        Ok(CheckpointLocation::File(path.to_path_buf()))
    }

    /// Load a checkpoint document.
    ///
    /// Returns `None` if the file is absent and `CorruptCheckpoint` if it
    /// exists but does not parse; the caller decides whether to discard.
    pub async fn load<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>, TransferError> {
        let Some(contents) = self.backend.read_to_string(path).await? else {
            return Ok(None);
        };

        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|err| TransferError::CorruptCheckpoint {
                path: path.display().to_string(),
                message: err.to_string(),
            })
    }

    /// Atomically persist a checkpoint document as pretty-printed JSON.
    ///
    /// Callers serialize their persists; the store performs exactly one
    /// atomic write per call.
    pub async fn persist<T: Serialize>(&self, path: &Path, doc: &T) -> Result<(), TransferError> {
        let contents: String = serde_json::to_string_pretty(doc).map_err(|err| {
            TransferError::invalid_input(format!("checkpoint not serializable: {err}"))
        })?;
        self.backend.write_atomic(path, &contents).await
    }

    /// Remove a checkpoint file, best-effort. Failure is logged and never
    /// fails the transfer.
    pub async fn remove(&self, path: &Path) {
        if let Err(err) = self.backend.remove_file(path).await {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "failed to remove checkpoint file"
            );
        }
    }
}
