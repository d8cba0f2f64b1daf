//! Trait seams toward the object store and the caller.

use std::path::Path;

use async_trait::async_trait;

use crate::error::TransferError;
use crate::types::{
    CompleteMultipartUploadInput, CompleteMultipartUploadOutput, CreateMultipartUploadOutput,
    GetRangeOutput, GetRangeRequest, HeadObjectOutput, ObjectIdentity, UploadPartRequest,
    UploadPartOutput,
};

/// The request interface the engine consumes.
///
/// Implementations own signing, naming validation, and request retry
/// policy. The engine only sequences these calls and interprets their
/// results; statuses 403/404/405 on part requests are treated as abort
/// conditions rather than transient failures.
#[async_trait]
pub trait ObjectClient: Send + Sync {
    /// `HEAD` the object and return its identity headers.
    async fn head_object(&self, identity: &ObjectIdentity)
        -> Result<HeadObjectOutput, TransferError>;

    /// `GET` a byte range of the object as a chunk stream.
    async fn get_object_range(
        &self,
        request: GetRangeRequest,
    ) -> Result<GetRangeOutput, TransferError>;

    /// Start a multipart upload and return its upload id.
    async fn create_multipart_upload(
        &self,
        identity: &ObjectIdentity,
    ) -> Result<CreateMultipartUploadOutput, TransferError>;

    /// Upload one part body.
    async fn upload_part(&self, request: UploadPartRequest)
        -> Result<UploadPartOutput, TransferError>;

    /// Finalize a multipart upload. In complete-all mode the client sends
    /// the `x-tos-complete-all: yes` header and no parts body.
    async fn complete_multipart_upload(
        &self,
        request: CompleteMultipartUploadInput,
    ) -> Result<CompleteMultipartUploadOutput, TransferError>;
}

/// Client-side token bucket honored by the HTTP layer.
///
/// `acquire` suspends until `bytes` may be transferred. Implementations
/// decide granularity; the engine hands the limiter to the client with
/// every part request.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Wait until `bytes` may be sent or received.
    async fn acquire(&self, bytes: u64);
}

/// Caller-supplied replacement for the final temp-file rename.
#[async_trait]
pub trait FileRenamer: Send + Sync {
    /// Move the completed temp file into place at the destination.
    async fn rename(&self, from: &Path, to: &Path) -> Result<(), TransferError>;
}
