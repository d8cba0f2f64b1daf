//! Resumable parallel object transfer engine for TOS-compatible object
//! storage.
//!
//! This crate provides the two symmetric halves of a large-object transfer
//! client - multipart upload of a local file and ranged parallel download
//! to a local file - with:
//!
//! - **Checkpointing** - per-part completion persisted as JSON so a
//!   transfer resumes across process restarts
//! - **Bounded concurrency** - `task_num` cooperative workers draining a
//!   shared part queue
//! - **Progress and event reporting** - three synchronous observer
//!   streams with a precise ordering contract
//! - **Cancellation** - a token observed before claiming work, per chunk,
//!   and after each part's write
//! - **Rate limiting** - a server-side traffic-limit header and a
//!   client-side token bucket, both passed through to the request layer
//! - **Integrity** - per-part streaming CRC64 (ECMA-182) combined into a
//!   whole-object digest and compared against the server's
//!
//! The HTTP client itself is an external collaborator: the engine consumes
//! the [`ObjectClient`] trait and stays agnostic of signing, naming
//! validation, and retry policy. Filesystem access goes through the
//! [`FileBackend`] capability; [`LocalFileBackend`] covers ordinary hosts.
//!
//! # Example
//!
//! ```ignore
//! use tos_transfer::{DownloadInput, Downloader, LocalFileBackend};
//!
//! let backend = LocalFileBackend::new();
//! let downloader = Downloader::new(&client, &backend);
//! let output = downloader
//!     .download_file(
//!         DownloadInput::new("media", "videos/clip.mp4", "/data/clip.mp4")
//!             .with_task_num(8)
//!             .with_checkpoint_path("/data/checkpoints/"),
//!     )
//!     .await?;
//! ```

mod checkpoint;
mod download;
mod error;
mod events;
mod file_backend;
mod planner;
mod traits;
mod types;
mod upload;

pub use checkpoint::{
    default_checkpoint_file_name, CheckpointInput, CheckpointLocation, CheckpointStore,
    DownloadCheckpoint, DownloadFileInfo, DownloadPartRecord, ObjectInfo, UploadCheckpoint,
    UploadFileInfo, UploadPartRecord,
};
pub use download::Downloader;
pub use error::TransferError;
pub use events::{
    DataTransferStatus, DataTransferType, DownloadEvent, DownloadEventType, DownloadPartInfo,
    ProgressReporter, UploadEvent, UploadEventType, UploadPartInfo,
};
pub use file_backend::{FileBackend, FileStat, LocalFileBackend, RandomWriteFile};
pub use planner::{check_upload_part_count, part_count, plan, PartTask};
pub use traits::{FileRenamer, ObjectClient, RateLimiter};
pub use types::{
    BodyStream, CompleteMultipartUploadInput, CompleteMultipartUploadOutput,
    CreateMultipartUploadOutput, DownloadInput, DownloadOutput, GetRangeOutput, GetRangeRequest,
    HeadObjectOutput, ObjectIdentity, UploadInput, UploadOutput, UploadPartOutput,
    UploadPartRequest, UploadedPart, OBJECT_TYPE_SYMLINK,
};
pub use upload::{complete_multipart_upload, Uploader};

// Re-export the observer plumbing so callers can build callbacks without
// naming the common crate.
pub use tos_transfer_common::{
    event_fn, progress_fn, EventCallback, FnEvent, FnProgress, NoOpObserver, ProgressCallback,
};
