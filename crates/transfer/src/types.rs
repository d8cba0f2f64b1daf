//! Shared data structures for transfer operations.

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;
use tos_transfer_common::{EventCallback, ProgressCallback, DEFAULT_PART_SIZE, DEFAULT_TASK_NUM};

use crate::checkpoint::{CheckpointInput, DownloadCheckpoint, UploadCheckpoint};
use crate::error::TransferError;
use crate::events::{DataTransferStatus, DownloadEvent, UploadEvent};
use crate::traits::{FileRenamer, RateLimiter};

/// Object type header value marking a symlink object.
pub const OBJECT_TYPE_SYMLINK: &str = "Symlink";

/// Immutable handle of a remote object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectIdentity {
    pub bucket: String,
    pub key: String,
    pub version_id: Option<String>,
}

impl ObjectIdentity {
    /// Create an identity without a version.
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            version_id: None,
        }
    }
}

/// Identity headers captured from `HEAD object`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadObjectOutput {
    pub etag: String,
    pub content_length: u64,
    pub last_modified: String,
    /// `x-tos-hash-crc64ecma`, absent when the server did not compute one.
    pub hash_crc64ecma: Option<String>,
    /// `x-tos-object-type`.
    pub object_type: Option<String>,
    /// Raw `x-tos-symlink-target-size`; parsed only for symlink objects.
    pub symlink_target_size: Option<String>,
}

impl HeadObjectOutput {
    /// The size to transfer: the target size for symlink objects
    /// (parsed strictly, a non-numeric header is an error), the content
    /// length otherwise.
    pub fn resolved_object_size(&self) -> Result<u64, TransferError> {
        if self.object_type.as_deref() != Some(OBJECT_TYPE_SYMLINK) {
            return Ok(self.content_length);
        }

        let raw: &str = self.symlink_target_size.as_deref().ok_or_else(|| {
            TransferError::Request {
                status_code: None,
                message: "symlink object without x-tos-symlink-target-size".into(),
                retryable: false,
            }
        })?;
        raw.parse().map_err(|_| TransferError::Request {
            status_code: None,
            message: format!("non-numeric x-tos-symlink-target-size {raw:?}"),
            retryable: false,
        })
    }
}

/// Streamed response body: chunks of bytes or a transport error.
pub type BodyStream = BoxStream<'static, Result<Bytes, TransferError>>;

/// Ranged `GET` request for one part.
pub struct GetRangeRequest {
    pub identity: ObjectIdentity,
    /// First byte of the range.
    pub range_start: u64,
    /// Last byte of the range, inclusive.
    pub range_end: u64,
    /// Etag precondition detecting mid-transfer object mutation.
    pub if_match: Option<String>,
    /// Server-side throttle, bits per second.
    pub traffic_limit: Option<u64>,
    /// Client-side token bucket.
    pub rate_limiter: Option<Arc<dyn RateLimiter>>,
}

/// Response of a ranged `GET`.
pub struct GetRangeOutput {
    pub body: BodyStream,
}

/// Response of `CreateMultipartUpload`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateMultipartUploadOutput {
    pub upload_id: String,
}

/// One part body to upload.
pub struct UploadPartRequest {
    pub identity: ObjectIdentity,
    pub upload_id: String,
    pub part_number: u32,
    pub body: Bytes,
    /// Server-side throttle, bits per second.
    pub traffic_limit: Option<u64>,
    /// Client-side token bucket.
    pub rate_limiter: Option<Arc<dyn RateLimiter>>,
}

/// Response of `UploadPart`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadPartOutput {
    pub etag: String,
    pub hash_crc64ecma: Option<String>,
}

/// A completed part reference for `CompleteMultipartUpload`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedPart {
    pub part_number: u32,
    pub etag: String,
}

/// Input of `complete_multipart_upload`.
///
/// `complete_all` and a non-empty `parts` list are mutually exclusive; the
/// engine rejects the combination before issuing any request.
#[derive(Debug, Clone)]
pub struct CompleteMultipartUploadInput {
    pub bucket: String,
    pub key: String,
    pub upload_id: String,
    pub parts: Vec<UploadedPart>,
    /// Send `x-tos-complete-all: yes` with no parts body.
    pub complete_all: bool,
    pub callback: Option<String>,
    pub callback_var: Option<String>,
    /// Pass-through of `x-tos-forbid-overwrite`.
    pub forbid_overwrite: bool,
}

impl CompleteMultipartUploadInput {
    /// Create an input completing the given parts.
    pub fn new(
        bucket: impl Into<String>,
        key: impl Into<String>,
        upload_id: impl Into<String>,
        parts: Vec<UploadedPart>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            upload_id: upload_id.into(),
            parts,
            complete_all: false,
            callback: None,
            callback_var: None,
            forbid_overwrite: false,
        }
    }
}

/// Output of `CompleteMultipartUpload`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompleteMultipartUploadOutput {
    pub bucket: String,
    pub key: String,
    pub etag: String,
    pub location: String,
    pub version_id: Option<String>,
    pub hash_crc64ecma: Option<String>,
    /// Present only in complete-all mode without a callback.
    pub completed_parts: Option<Vec<UploadedPart>>,
    /// Present only when a callback was supplied.
    pub callback_result: Option<String>,
}

/// Input of [`Downloader::download_file`](crate::download::Downloader::download_file).
pub struct DownloadInput {
    pub bucket: String,
    pub key: String,
    pub version_id: Option<String>,
    /// Destination path. A directory (or trailing separator) has the key
    /// appended.
    pub file_path: PathBuf,
    /// Scratch file receiving ranged writes; defaults to
    /// `file_path + ".temp"`.
    pub temp_file_path: Option<PathBuf>,
    pub part_size: u64,
    /// Number of concurrent part workers, clamped to at least 1.
    pub task_num: usize,
    pub checkpoint: Option<CheckpointInput<DownloadCheckpoint>>,
    /// Verify the combined part CRC against the server-declared object
    /// CRC after all parts complete.
    pub enable_crc: bool,
    pub traffic_limit: Option<u64>,
    pub rate_limiter: Option<Arc<dyn RateLimiter>>,
    pub cancel_token: Option<CancellationToken>,
    pub progress: Option<Arc<dyn ProgressCallback<DownloadCheckpoint>>>,
    pub data_transfer_status_change: Option<Arc<dyn EventCallback<DataTransferStatus>>>,
    pub download_event_change: Option<Arc<dyn EventCallback<DownloadEvent>>>,
    /// Replacement for the final temp-file rename.
    pub rename_file: Option<Arc<dyn FileRenamer>>,
}

impl DownloadInput {
    /// Create an input with defaults for everything optional.
    pub fn new(
        bucket: impl Into<String>,
        key: impl Into<String>,
        file_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            version_id: None,
            file_path: file_path.into(),
            temp_file_path: None,
            part_size: DEFAULT_PART_SIZE,
            task_num: DEFAULT_TASK_NUM,
            checkpoint: None,
            enable_crc: true,
            traffic_limit: None,
            rate_limiter: None,
            cancel_token: None,
            progress: None,
            data_transfer_status_change: None,
            download_event_change: None,
            rename_file: None,
        }
    }

    /// Set the object version to download.
    pub fn with_version_id(mut self, version_id: impl Into<String>) -> Self {
        self.version_id = Some(version_id.into());
        self
    }

    /// Set the part size.
    pub fn with_part_size(mut self, part_size: u64) -> Self {
        self.part_size = part_size;
        self
    }

    /// Set the worker count.
    pub fn with_task_num(mut self, task_num: usize) -> Self {
        self.task_num = task_num;
        self
    }

    /// Set the scratch file path.
    pub fn with_temp_file_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.temp_file_path = Some(path.into());
        self
    }

    /// Persist and resume through a checkpoint path.
    pub fn with_checkpoint_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.checkpoint = Some(CheckpointInput::Path(path.into()));
        self
    }

    /// Resume from an in-memory checkpoint (no persistence).
    pub fn with_checkpoint_document(mut self, doc: DownloadCheckpoint) -> Self {
        self.checkpoint = Some(CheckpointInput::Document(doc));
        self
    }

    /// Enable or disable CRC verification.
    pub fn with_enable_crc(mut self, enable_crc: bool) -> Self {
        self.enable_crc = enable_crc;
        self
    }

    /// Set the server-side throttle in bits per second.
    pub fn with_traffic_limit(mut self, traffic_limit: u64) -> Self {
        self.traffic_limit = Some(traffic_limit);
        self
    }

    /// Set the client-side rate limiter.
    pub fn with_rate_limiter(mut self, rate_limiter: Arc<dyn RateLimiter>) -> Self {
        self.rate_limiter = Some(rate_limiter);
        self
    }

    /// Set the cancellation token.
    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = Some(token);
        self
    }

    /// Set the progress observer.
    pub fn with_progress(mut self, progress: Arc<dyn ProgressCallback<DownloadCheckpoint>>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Set the byte-accounting observer.
    pub fn with_data_transfer_status_change(
        mut self,
        callback: Arc<dyn EventCallback<DataTransferStatus>>,
    ) -> Self {
        self.data_transfer_status_change = Some(callback);
        self
    }

    /// Set the structural event observer.
    pub fn with_download_event_change(
        mut self,
        callback: Arc<dyn EventCallback<DownloadEvent>>,
    ) -> Self {
        self.download_event_change = Some(callback);
        self
    }

    /// Replace the final temp-file rename.
    pub fn with_rename_file(mut self, renamer: Arc<dyn FileRenamer>) -> Self {
        self.rename_file = Some(renamer);
        self
    }
}

/// Output of a completed download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOutput {
    pub etag: String,
    pub hash_crc64ecma: Option<String>,
    pub object_size: u64,
    pub file_path: PathBuf,
}

/// Input of [`Uploader::upload_file`](crate::upload::Uploader::upload_file).
pub struct UploadInput {
    pub bucket: String,
    pub key: String,
    /// Local source file.
    pub file_path: PathBuf,
    pub part_size: u64,
    /// Number of concurrent part workers, clamped to at least 1.
    pub task_num: usize,
    pub checkpoint: Option<CheckpointInput<UploadCheckpoint>>,
    /// Verify the combined part CRC against the server CRC returned by
    /// `CompleteMultipartUpload`.
    pub enable_crc: bool,
    /// Pass-through of `x-tos-forbid-overwrite` on complete.
    pub forbid_overwrite: bool,
    pub traffic_limit: Option<u64>,
    pub rate_limiter: Option<Arc<dyn RateLimiter>>,
    pub cancel_token: Option<CancellationToken>,
    pub progress: Option<Arc<dyn ProgressCallback<UploadCheckpoint>>>,
    pub data_transfer_status_change: Option<Arc<dyn EventCallback<DataTransferStatus>>>,
    pub upload_event_change: Option<Arc<dyn EventCallback<UploadEvent>>>,
}

impl UploadInput {
    /// Create an input with defaults for everything optional.
    pub fn new(
        bucket: impl Into<String>,
        key: impl Into<String>,
        file_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            file_path: file_path.into(),
            part_size: DEFAULT_PART_SIZE,
            task_num: DEFAULT_TASK_NUM,
            checkpoint: None,
            enable_crc: true,
            forbid_overwrite: false,
            traffic_limit: None,
            rate_limiter: None,
            cancel_token: None,
            progress: None,
            data_transfer_status_change: None,
            upload_event_change: None,
        }
    }

    /// Set the part size.
    pub fn with_part_size(mut self, part_size: u64) -> Self {
        self.part_size = part_size;
        self
    }

    /// Set the worker count.
    pub fn with_task_num(mut self, task_num: usize) -> Self {
        self.task_num = task_num;
        self
    }

    /// Persist and resume through a checkpoint path.
    pub fn with_checkpoint_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.checkpoint = Some(CheckpointInput::Path(path.into()));
        self
    }

    /// Resume from an in-memory checkpoint (no persistence).
    pub fn with_checkpoint_document(mut self, doc: UploadCheckpoint) -> Self {
        self.checkpoint = Some(CheckpointInput::Document(doc));
        self
    }

    /// Enable or disable CRC verification.
    pub fn with_enable_crc(mut self, enable_crc: bool) -> Self {
        self.enable_crc = enable_crc;
        self
    }

    /// Refuse to overwrite an existing object on complete.
    pub fn with_forbid_overwrite(mut self, forbid_overwrite: bool) -> Self {
        self.forbid_overwrite = forbid_overwrite;
        self
    }

    /// Set the server-side throttle in bits per second.
    pub fn with_traffic_limit(mut self, traffic_limit: u64) -> Self {
        self.traffic_limit = Some(traffic_limit);
        self
    }

    /// Set the client-side rate limiter.
    pub fn with_rate_limiter(mut self, rate_limiter: Arc<dyn RateLimiter>) -> Self {
        self.rate_limiter = Some(rate_limiter);
        self
    }

    /// Set the cancellation token.
    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = Some(token);
        self
    }

    /// Set the progress observer.
    pub fn with_progress(mut self, progress: Arc<dyn ProgressCallback<UploadCheckpoint>>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Set the byte-accounting observer.
    pub fn with_data_transfer_status_change(
        mut self,
        callback: Arc<dyn EventCallback<DataTransferStatus>>,
    ) -> Self {
        self.data_transfer_status_change = Some(callback);
        self
    }

    /// Set the structural event observer.
    pub fn with_upload_event_change(
        mut self,
        callback: Arc<dyn EventCallback<UploadEvent>>,
    ) -> Self {
        self.upload_event_change = Some(callback);
        self
    }
}

/// Output of a completed upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOutput {
    pub bucket: String,
    pub key: String,
    pub upload_id: String,
    pub etag: String,
    pub location: String,
    pub version_id: Option<String>,
    pub hash_crc64ecma: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head(object_type: Option<&str>, target_size: Option<&str>) -> HeadObjectOutput {
        HeadObjectOutput {
            etag: "\"abc\"".into(),
            content_length: 42,
            last_modified: "Wed, 01 Jan 2025 00:00:00 GMT".into(),
            hash_crc64ecma: None,
            object_type: object_type.map(Into::into),
            symlink_target_size: target_size.map(Into::into),
        }
    }

    #[test]
    fn test_resolved_size_plain_object() {
        assert_eq!(head(None, None).resolved_object_size().unwrap(), 42);
    }

    #[test]
    fn test_resolved_size_symlink() {
        let output = head(Some(OBJECT_TYPE_SYMLINK), Some("1024"));
        assert_eq!(output.resolved_object_size().unwrap(), 1024);
    }

    #[test]
    fn test_resolved_size_symlink_non_numeric() {
        let output = head(Some(OBJECT_TYPE_SYMLINK), Some("10 bytes"));
        assert!(output.resolved_object_size().is_err());

        let output = head(Some(OBJECT_TYPE_SYMLINK), None);
        assert!(output.resolved_object_size().is_err());
    }

    #[test]
    fn test_download_input_defaults() {
        let input: DownloadInput = DownloadInput::new("bkt", "key", "/tmp/file");
        assert_eq!(input.part_size, DEFAULT_PART_SIZE);
        assert_eq!(input.task_num, DEFAULT_TASK_NUM);
        assert!(input.enable_crc);
        assert!(input.checkpoint.is_none());
    }

    #[test]
    fn test_upload_input_builder() {
        let input: UploadInput = UploadInput::new("bkt", "key", "/tmp/file")
            .with_part_size(1024)
            .with_task_num(4)
            .with_enable_crc(false)
            .with_forbid_overwrite(true);
        assert_eq!(input.part_size, 1024);
        assert_eq!(input.task_num, 4);
        assert!(!input.enable_crc);
        assert!(input.forbid_overwrite);
    }
}
