//! Upload orchestration.
//!
//! Multipart upload of a local file, symmetric to the download engine:
//! `CreateMultipartUpload` takes the place of `HEAD`, `UploadPart` the
//! place of the ranged `GET`, and `CompleteMultipartUpload` the place of
//! the final rename. Per-part CRC64 digests are combined and compared
//! against the server's whole-object CRC returned by the complete call.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tos_transfer_common::{Crc64, EventCallback, MIN_PART_SIZE};

use crate::checkpoint::{
    default_checkpoint_file_name, CheckpointInput, CheckpointLocation, CheckpointStore,
    UploadCheckpoint, UploadFileInfo, UploadPartRecord,
};
use crate::error::TransferError;
use crate::events::{ProgressReporter, UploadEvent, UploadEventType, UploadPartInfo};
use crate::file_backend::{FileBackend, FileStat};
use crate::planner::{check_upload_part_count, plan, PartTask};
use crate::traits::ObjectClient;
use crate::types::{
    CompleteMultipartUploadInput, CompleteMultipartUploadOutput, ObjectIdentity, UploadInput,
    UploadOutput, UploadPartRequest, UploadedPart,
};

/// Finalize a multipart upload.
///
/// Validates the mutually exclusive `complete_all`/`parts` surface before
/// any request is issued, then delegates to the client.
pub async fn complete_multipart_upload<C: ObjectClient>(
    client: &C,
    input: CompleteMultipartUploadInput,
) -> Result<CompleteMultipartUploadOutput, TransferError> {
    if input.complete_all && !input.parts.is_empty() {
        return Err(TransferError::invalid_input(
            "Should not specify both 'completeAll' and 'parts' params.",
        ));
    }
    client.complete_multipart_upload(input).await
}

/// Drives resumable multipart uploads against any `ObjectClient` and
/// `FileBackend` implementation.
pub struct Uploader<'a, C: ObjectClient, F: FileBackend> {
    /// The client issuing signed requests.
    client: &'a C,
    /// The filesystem capability supplying the part bodies.
    backend: &'a F,
}

/// Live state shared by the part workers of one run. Not persisted.
struct UploadRun<'r, F: FileBackend> {
    identity: ObjectIdentity,
    upload_id: String,
    source_path: PathBuf,
    traffic_limit: Option<u64>,
    rate_limiter: Option<Arc<dyn crate::traits::RateLimiter>>,
    cancel: CancellationToken,
    reporter: ProgressReporter<UploadCheckpoint>,
    store: CheckpointStore<'r, F>,
    /// Single-writer queue for record updates and persists.
    state: tokio::sync::Mutex<UploadCheckpoint>,
    checkpoint_path: Option<PathBuf>,
    events: Option<Arc<dyn EventCallback<UploadEvent>>>,
    first_error: Mutex<Option<TransferError>>,
}

impl<F: FileBackend> UploadRun<'_, F> {
    fn emit_event(
        &self,
        event_type: UploadEventType,
        task: Option<&PartTask>,
        error: Option<&TransferError>,
    ) {
        if let Some(callback) = &self.events {
            callback.on_event(&UploadEvent {
                event_type,
                bucket: self.identity.bucket.clone(),
                key: self.identity.key.clone(),
                upload_id: Some(self.upload_id.clone()),
                file_path: self.source_path.display().to_string(),
                checkpoint_path: self
                    .checkpoint_path
                    .as_ref()
                    .map(|p| p.display().to_string()),
                part: task.map(|t| UploadPartInfo {
                    part_number: t.part_number,
                    offset: t.offset,
                    length: t.length,
                }),
                error: error.map(|e| e.to_string()),
            });
        }
    }

    fn record_first_error(&self, err: TransferError) {
        let mut guard = self.first_error.lock().unwrap();
        if guard.is_none() {
            *guard = Some(err);
        }
    }

    fn take_first_error(&self) -> Option<TransferError> {
        self.first_error.lock().unwrap().take()
    }

    async fn persist_locked(&self, doc: &UploadCheckpoint) -> Result<(), TransferError> {
        match &self.checkpoint_path {
            Some(path) => self.store.persist(path, doc).await,
            None => Ok(()),
        }
    }
}

impl<'a, C: ObjectClient, F: FileBackend> Uploader<'a, C, F> {
    /// Create a new uploader.
    pub fn new(client: &'a C, backend: &'a F) -> Self {
        Self { client, backend }
    }

    /// Upload one local file as a multipart upload, resuming from a valid
    /// checkpoint when one is supplied.
    pub async fn upload_file(&self, input: UploadInput) -> Result<UploadOutput, TransferError> {
        if input.key.is_empty() {
            return Err(TransferError::invalid_input("object key must not be empty"));
        }
        if input.part_size < MIN_PART_SIZE {
            return Err(TransferError::invalid_input(format!(
                "part size must be at least {MIN_PART_SIZE} byte"
            )));
        }

        let source_stat: FileStat = match self.backend.stat(&input.file_path).await? {
            Some(stat) if !stat.is_dir => stat,
            Some(_) => {
                return Err(TransferError::invalid_input(format!(
                    "source {} is a directory",
                    input.file_path.display()
                )))
            }
            None => {
                return Err(TransferError::invalid_input(format!(
                    "source file {} does not exist",
                    input.file_path.display()
                )))
            }
        };
        let file_size: u64 = source_stat.size;
        check_upload_part_count(file_size, input.part_size)?;

        let identity = ObjectIdentity::new(input.bucket.clone(), input.key.clone());

        let store: CheckpointStore<'_, F> = CheckpointStore::new(self.backend);
        let mut checkpoint_dir: Option<PathBuf> = None;
        let (mut doc_opt, mut checkpoint_path): (Option<UploadCheckpoint>, Option<PathBuf>) =
            match &input.checkpoint {
                None => (None, None),
                Some(CheckpointInput::Document(doc)) => (Some(doc.clone()), None),
                Some(CheckpointInput::Path(path)) => match store.resolve(path).await? {
                    CheckpointLocation::File(file) => {
                        let loaded: Option<UploadCheckpoint> = match store.load(&file).await {
                            Ok(doc) => doc,
                            Err(err) => {
                                tracing::warn!(
                                    path = %file.display(),
                                    error = %err,
                                    "discarding unparseable checkpoint; uploading from scratch"
                                );
                                None
                            }
                        };
                        (loaded, Some(file))
                    }
                    CheckpointLocation::Directory(dir) => {
                        // The file name carries the upload id, which is
                        // unknown until CreateMultipartUpload returns.
                        checkpoint_dir = Some(dir);
                        (None, None)
                    }
                },
            };

        if let Some(doc) = doc_opt.take() {
            match validate_checkpoint(&doc, &input, file_size, source_stat.last_modified_ms) {
                Ok(()) => doc_opt = Some(doc),
                Err(reason) => {
                    tracing::warn!(
                        bucket = %input.bucket,
                        key = %input.key,
                        %reason,
                        "discarding invalidated checkpoint; uploading from scratch"
                    );
                }
            }
        }

        let resume: bool = doc_opt.is_some();
        let (doc, upload_id): (UploadCheckpoint, String) = match doc_opt {
            Some(doc) => {
                let upload_id: String = doc
                    .upload_id
                    .clone()
                    .ok_or_else(|| TransferError::invalid_input("checkpoint without upload id"))?;
                (doc, upload_id)
            }
            None => match self.client.create_multipart_upload(&identity).await {
                Ok(created) => {
                    let doc = UploadCheckpoint {
                        bucket: input.bucket.clone(),
                        key: input.key.clone(),
                        part_size: input.part_size,
                        upload_id: Some(created.upload_id.clone()),
                        file_info: UploadFileInfo {
                            file_path: input.file_path.display().to_string(),
                            file_size,
                            last_modified: source_stat.last_modified_ms,
                        },
                        parts_info: Vec::new(),
                    };
                    (doc, created.upload_id)
                }
                Err(err) => {
                    emit_create_event(&input, None, Some(&err));
                    return Err(err);
                }
            },
        };
        if !resume {
            emit_create_event(&input, Some(upload_id.as_str()), None);
        }

        // Substitute the directory-mode placeholder now that the upload id
        // is known.
        if let Some(dir) = checkpoint_dir {
            checkpoint_path = Some(dir.join(default_checkpoint_file_name(
                &input.bucket,
                &input.key,
                Some(upload_id.as_str()),
            )));
        }

        let completed: Vec<u32> = doc
            .parts_info
            .iter()
            .filter(|p| p.is_completed)
            .map(|p| p.part_number)
            .collect();
        let reporter: ProgressReporter<UploadCheckpoint> = ProgressReporter::new(
            input.progress.clone(),
            input.data_transfer_status_change.clone(),
            file_size,
            doc.completed_bytes(),
        );

        let run: UploadRun<'_, F> = UploadRun {
            identity,
            upload_id: upload_id.clone(),
            source_path: input.file_path.clone(),
            traffic_limit: input.traffic_limit,
            rate_limiter: input.rate_limiter.clone(),
            cancel: input.cancel_token.clone().unwrap_or_default(),
            reporter,
            store,
            state: tokio::sync::Mutex::new(doc),
            checkpoint_path,
            events: input.upload_event_change.clone(),
            first_error: Mutex::new(None),
        };

        if !resume {
            run.reporter.emit_started();
        }
        {
            let state = run.state.lock().await;
            run.reporter.emit_initial_progress(&*state);
        }

        let pending: Vec<PartTask> = plan(file_size, input.part_size)
            .into_iter()
            .filter(|t| !completed.contains(&t.part_number))
            .collect();
        let task_num: usize = input.task_num.max(1);

        stream::iter(pending)
            .map(|task| self.run_part(&run, task))
            .buffer_unordered(task_num)
            .collect::<Vec<()>>()
            .await;

        if run.cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        if let Some(err) = run.take_first_error() {
            return Err(err);
        }

        // COMPLETE
        let parts: Vec<UploadedPart> = {
            let state = run.state.lock().await;
            collect_completed_parts(&state)?
        };
        let complete_input = CompleteMultipartUploadInput {
            bucket: input.bucket.clone(),
            key: input.key.clone(),
            upload_id: upload_id.clone(),
            parts,
            complete_all: false,
            callback: None,
            callback_var: None,
            forbid_overwrite: input.forbid_overwrite,
        };
        let completed_output: CompleteMultipartUploadOutput =
            match self.client.complete_multipart_upload(complete_input).await {
                Ok(output) => {
                    run.emit_event(UploadEventType::CompleteMultipartUploadSucceed, None, None);
                    output
                }
                Err(err) => {
                    run.emit_event(
                        UploadEventType::CompleteMultipartUploadFailed,
                        None,
                        Some(&err),
                    );
                    run.reporter.emit_failed();
                    return Err(err);
                }
            };

        // VERIFY: combine the local per-part digests against the server's
        // whole-object CRC. The checkpoint is kept around on mismatch so
        // the caller can inspect which part diverged.
        if input.enable_crc {
            if let Some(server_crc) = completed_output.hash_crc64ecma.as_deref() {
                let computed: String = run.state.lock().await.combined_crc64()?;
                if computed != server_crc {
                    run.reporter.emit_failed();
                    return Err(TransferError::CrcMismatch {
                        expected: server_crc.to_string(),
                        actual: computed,
                    });
                }
            }
        }

        run.reporter.emit_succeed();
        if let Some(path) = &run.checkpoint_path {
            run.store.remove(path).await;
        }
        {
            let state = run.state.lock().await;
            run.reporter.emit_final_progress(&*state);
        }

        Ok(UploadOutput {
            bucket: input.bucket,
            key: input.key,
            upload_id,
            etag: completed_output.etag,
            location: completed_output.location,
            version_id: completed_output.version_id,
            hash_crc64ecma: completed_output.hash_crc64ecma,
        })
    }

    /// One worker iteration: claim, execute, record, report.
    async fn run_part(&self, run: &UploadRun<'_, F>, task: PartTask) {
        if run.cancel.is_cancelled() {
            return;
        }

        match self.execute_part(run, &task).await {
            Ok((digest, etag)) => {
                let persisted: Result<(), TransferError> = {
                    let mut state = run.state.lock().await;
                    state.upsert(UploadPartRecord {
                        part_number: task.part_number,
                        range_start: task.offset,
                        range_end: task.range_end(),
                        hash_crc64ecma: digest,
                        is_completed: true,
                        etag: Some(etag),
                    });
                    run.persist_locked(&state).await
                };
                if let Err(err) = persisted {
                    run.record_first_error(err);
                    return;
                }

                run.reporter.record_rw(task.length);
                run.emit_event(UploadEventType::UploadPartSucceed, Some(&task), None);
                let state = run.state.lock().await;
                run.reporter.part_completed(task.length, &*state);
            }
            Err(err) if err.is_cancelled() => {}
            Err(err) => {
                {
                    let mut state = run.state.lock().await;
                    state.upsert(UploadPartRecord::pending(&task));
                    if let Err(persist_err) = run.persist_locked(&state).await {
                        tracing::warn!(
                            part = task.part_number,
                            error = %persist_err,
                            "failed to persist checkpoint after part failure"
                        );
                    }
                }

                let event_type: UploadEventType = if err.is_abort() {
                    UploadEventType::UploadPartAborted
                } else {
                    UploadEventType::UploadPartFailed
                };
                run.emit_event(event_type, Some(&task), Some(&err));
                run.record_first_error(err);
            }
        }
    }

    /// Read one part's byte range, digest it, and upload it. Returns the
    /// part's CRC64 digest and the server-assigned etag.
    async fn execute_part(
        &self,
        run: &UploadRun<'_, F>,
        task: &PartTask,
    ) -> Result<(String, String), TransferError> {
        let body: Bytes = self
            .backend
            .read_range(&run.source_path, task.offset, task.length)
            .await?;

        let mut hasher: Crc64 = Crc64::new();
        hasher.update(&body);
        let digest: String = hasher.digest();

        if run.cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        let output = self
            .client
            .upload_part(UploadPartRequest {
                identity: run.identity.clone(),
                upload_id: run.upload_id.clone(),
                part_number: task.part_number,
                body,
                traffic_limit: run.traffic_limit,
                rate_limiter: run.rate_limiter.clone(),
            })
            .await?;

        // When the server echoes a per-part CRC, catch corruption before
        // the complete call instead of after it.
        if let Some(server_crc) = output.hash_crc64ecma.as_deref() {
            if server_crc != digest {
                return Err(TransferError::Request {
                    status_code: None,
                    message: format!(
                        "part {} CRC64 mismatch: server stored {}, sent {}",
                        task.part_number, server_crc, digest
                    ),
                    retryable: true,
                });
            }
        }

        Ok((digest, output.etag))
    }
}

/// Check a loaded checkpoint against the caller's inputs and a fresh stat
/// of the local source. Any mismatch discards the checkpoint.
fn validate_checkpoint(
    doc: &UploadCheckpoint,
    input: &UploadInput,
    file_size: u64,
    last_modified_ms: i64,
) -> Result<(), String> {
    if doc.bucket != input.bucket || doc.key != input.key {
        return Err("checkpoint describes a different object".into());
    }
    if doc.part_size != input.part_size {
        return Err(format!(
            "part size changed from {} to {}",
            doc.part_size, input.part_size
        ));
    }
    if doc.upload_id.is_none() {
        return Err("checkpoint carries no upload id".into());
    }
    if doc.file_info.file_size != file_size || doc.file_info.last_modified != last_modified_ms {
        return Err("source file changed since the checkpoint was written".into());
    }

    let tasks: Vec<PartTask> = plan(file_size, doc.part_size);
    for record in &doc.parts_info {
        let task: Option<&PartTask> = (record.part_number >= 1)
            .then(|| tasks.get(record.part_number as usize - 1))
            .flatten();
        let Some(task) = task else {
            return Err(format!("part {} is out of range", record.part_number));
        };
        if record.range_start != task.offset || record.range_end != task.range_end() {
            return Err(format!(
                "part {} range does not match the plan",
                record.part_number
            ));
        }
        if record.is_completed && record.etag.is_none() {
            return Err(format!("completed part {} has no etag", record.part_number));
        }
    }
    Ok(())
}

/// Ordered `{part_number, etag}` list for the complete call.
fn collect_completed_parts(doc: &UploadCheckpoint) -> Result<Vec<UploadedPart>, TransferError> {
    doc.parts_info
        .iter()
        .map(|record| {
            let etag: String = record.etag.clone().ok_or_else(|| TransferError::Request {
                status_code: None,
                message: format!("part {} completed without an etag", record.part_number),
                retryable: false,
            })?;
            Ok(UploadedPart {
                part_number: record.part_number,
                etag,
            })
        })
        .collect()
}

/// Emit a create-multipart-upload event before the run context exists.
fn emit_create_event(input: &UploadInput, upload_id: Option<&str>, error: Option<&TransferError>) {
    if let Some(callback) = &input.upload_event_change {
        callback.on_event(&UploadEvent {
            event_type: if error.is_none() {
                UploadEventType::CreateMultipartUploadSucceed
            } else {
                UploadEventType::CreateMultipartUploadFailed
            },
            bucket: input.bucket.clone(),
            key: input.key.clone(),
            upload_id: upload_id.map(Into::into),
            file_path: input.file_path.display().to_string(),
            checkpoint_path: None,
            part: None,
            error: error.map(|e| e.to_string()),
        });
    }
}
