//! Download orchestration.
//!
//! This module drives the ranged parallel download of one object to a
//! local file. It handles:
//!
//! - `HEAD`-based object snapshotting (etag, size, server CRC64)
//! - Checkpoint load, validation, and resumption
//! - Part planning and bounded-concurrency scheduling
//! - Per-part streaming CRC64 with ordered byte placement in a temp file
//! - Progress/data-transfer/structural event reporting
//! - Cancellation with in-flight stream teardown
//! - Combined CRC64 verification and atomic finalization
//!
//! # Download flow
//!
//! `HEAD object` → load/validate checkpoint → plan parts → subtract
//! completed parts → run `task_num` workers over the remaining tasks →
//! verify the combined CRC64 → rename the temp file → delete the
//! checkpoint. Workers keep draining the queue after a failure so the
//! checkpoint records as many completed parts as possible; only the first
//! captured error is re-raised after the drain.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::stream::{self, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tos_transfer_common::{Crc64, EventCallback, MIN_PART_SIZE, TEMP_FILE_SUFFIX};

use crate::checkpoint::{
    default_checkpoint_file_name, CheckpointInput, CheckpointLocation, CheckpointStore,
    DownloadCheckpoint, DownloadFileInfo, DownloadPartRecord, ObjectInfo,
};
use crate::error::TransferError;
use crate::events::{DownloadEvent, DownloadEventType, DownloadPartInfo, ProgressReporter};
use crate::file_backend::FileBackend;
use crate::planner::{plan, PartTask};
use crate::traits::ObjectClient;
use crate::types::{
    DownloadInput, DownloadOutput, GetRangeRequest, HeadObjectOutput, ObjectIdentity,
};

/// Drives resumable parallel downloads against any `ObjectClient` and
/// `FileBackend` implementation.
pub struct Downloader<'a, C: ObjectClient, F: FileBackend> {
    /// The client issuing signed requests.
    client: &'a C,
    /// The filesystem capability receiving the bytes.
    backend: &'a F,
}

/// Live state shared by the part workers of one run. Not persisted.
struct DownloadRun<'r, F: FileBackend> {
    identity: ObjectIdentity,
    etag: String,
    dest_path: PathBuf,
    temp_path: PathBuf,
    traffic_limit: Option<u64>,
    rate_limiter: Option<Arc<dyn crate::traits::RateLimiter>>,
    cancel: CancellationToken,
    reporter: ProgressReporter<DownloadCheckpoint>,
    store: CheckpointStore<'r, F>,
    /// Single-writer queue: record updates and persists happen under this
    /// lock, one at a time, so the on-disk checkpoint never leads the
    /// temp file.
    state: tokio::sync::Mutex<DownloadCheckpoint>,
    checkpoint_path: Option<PathBuf>,
    events: Option<Arc<dyn EventCallback<DownloadEvent>>>,
    first_error: Mutex<Option<TransferError>>,
}

impl<F: FileBackend> DownloadRun<'_, F> {
    fn emit_event(
        &self,
        event_type: DownloadEventType,
        task: Option<&PartTask>,
        error: Option<&TransferError>,
    ) {
        if let Some(callback) = &self.events {
            callback.on_event(&DownloadEvent {
                event_type,
                bucket: self.identity.bucket.clone(),
                key: self.identity.key.clone(),
                version_id: self.identity.version_id.clone(),
                file_path: self.dest_path.display().to_string(),
                temp_file_path: Some(self.temp_path.display().to_string()),
                checkpoint_path: self
                    .checkpoint_path
                    .as_ref()
                    .map(|p| p.display().to_string()),
                part: task.map(|t| DownloadPartInfo {
                    part_number: t.part_number,
                    range_start: t.offset,
                    range_end: t.range_end(),
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

    async fn persist_locked(&self, doc: &DownloadCheckpoint) -> Result<(), TransferError> {
        match &self.checkpoint_path {
            Some(path) => self.store.persist(path, doc).await,
            None => Ok(()),
        }
    }
}

impl<'a, C: ObjectClient, F: FileBackend> Downloader<'a, C, F> {
    /// Create a new downloader.
    pub fn new(client: &'a C, backend: &'a F) -> Self {
        Self { client, backend }
    }

    /// Download one object to a local file, resuming from a valid
    /// checkpoint when one is supplied.
    pub async fn download_file(
        &self,
        input: DownloadInput,
    ) -> Result<DownloadOutput, TransferError> {
        if input.key.is_empty() {
            return Err(TransferError::invalid_input("object key must not be empty"));
        }
        if input.part_size < MIN_PART_SIZE {
            return Err(TransferError::invalid_input(format!(
                "part size must be at least {MIN_PART_SIZE} byte"
            )));
        }

        let identity = ObjectIdentity {
            bucket: input.bucket.clone(),
            key: input.key.clone(),
            version_id: input.version_id.clone(),
        };

        let head: HeadObjectOutput = self.client.head_object(&identity).await?;
        let object_size: u64 = head.resolved_object_size()?;

        let dest_path: PathBuf = self.resolve_destination(&input).await?;
        let temp_path_default: PathBuf = match &input.temp_file_path {
            Some(path) => path.clone(),
            None => append_suffix(&dest_path, TEMP_FILE_SUFFIX),
        };

        let store: CheckpointStore<'_, F> = CheckpointStore::new(self.backend);
        let (mut doc_opt, checkpoint_path): (Option<DownloadCheckpoint>, Option<PathBuf>) =
            match &input.checkpoint {
                None => (None, None),
                Some(CheckpointInput::Document(doc)) => (Some(doc.clone()), None),
                Some(CheckpointInput::Path(path)) => {
                    let file_path: PathBuf = match store.resolve(path).await? {
                        CheckpointLocation::File(file) => file,
                        CheckpointLocation::Directory(dir) => dir.join(
                            default_checkpoint_file_name(
                                &input.bucket,
                                &input.key,
                                input.version_id.as_deref(),
                            ),
                        ),
                    };
                    let loaded: Option<DownloadCheckpoint> =
                        match store.load(&file_path).await {
                            Ok(doc) => doc,
                            Err(err) => {
                                tracing::warn!(
                                    path = %file_path.display(),
                                    error = %err,
                                    "discarding unparseable checkpoint; downloading from scratch"
                                );
                                None
                            }
                        };
                    (loaded, Some(file_path))
                }
            };

        if let Some(doc) = doc_opt.take() {
            match self
                .validate_checkpoint(&doc, &input, &head, object_size)
                .await
            {
                Ok(()) => doc_opt = Some(doc),
                Err(reason) => {
                    tracing::warn!(
                        bucket = %input.bucket,
                        key = %input.key,
                        %reason,
                        "discarding invalidated checkpoint; downloading from scratch"
                    );
                }
            }
        }

        let resume: bool = doc_opt.is_some();
        let temp_path: PathBuf = match &doc_opt {
            Some(doc) => PathBuf::from(&doc.file_info.temp_file_path),
            None => temp_path_default,
        };

        let doc: DownloadCheckpoint = match doc_opt {
            Some(doc) => doc,
            None => DownloadCheckpoint {
                bucket: input.bucket.clone(),
                key: input.key.clone(),
                version_id: input.version_id.clone(),
                part_size: input.part_size,
                object_info: ObjectInfo {
                    etag: head.etag.clone(),
                    hash_crc64ecma: head.hash_crc64ecma.clone(),
                    object_size,
                    last_modified: head.last_modified.clone(),
                },
                file_info: DownloadFileInfo {
                    file_path: dest_path.display().to_string(),
                    temp_file_path: temp_path.display().to_string(),
                },
                parts_info: Vec::new(),
            },
        };

        let completed: Vec<u32> = doc.completed_part_numbers();
        let reporter: ProgressReporter<DownloadCheckpoint> = ProgressReporter::new(
            input.progress.clone(),
            input.data_transfer_status_change.clone(),
            object_size,
            doc.completed_bytes(),
        );

        let run: DownloadRun<'_, F> = DownloadRun {
            identity,
            etag: head.etag.clone(),
            dest_path: dest_path.clone(),
            temp_path: temp_path.clone(),
            traffic_limit: input.traffic_limit,
            rate_limiter: input.rate_limiter.clone(),
            cancel: input.cancel_token.clone().unwrap_or_default(),
            reporter,
            store,
            state: tokio::sync::Mutex::new(doc),
            checkpoint_path,
            events: input.download_event_change.clone(),
            first_error: Mutex::new(None),
        };

        // PREPARE_FILES: a fresh run starts from an empty temp file.
        if !resume {
            if let Err(err) = self.backend.create_file(&run.temp_path).await {
                run.emit_event(DownloadEventType::CreateTempFileFailed, None, Some(&err));
                return Err(err);
            }
            run.emit_event(DownloadEventType::CreateTempFileSucceed, None, None);
        }

        // RUN entry: Started marks a new transfer attempt, not a resume.
        if !resume {
            run.reporter.emit_started();
        }
        {
            let state = run.state.lock().await;
            run.reporter.emit_initial_progress(&*state);
        }

        let pending: Vec<PartTask> = plan(object_size, input.part_size)
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

        // VERIFY
        if input.enable_crc {
            if let Some(server_crc) = head.hash_crc64ecma.as_deref() {
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

        // FINALIZE
        let rename_result: Result<(), TransferError> = match &input.rename_file {
            Some(renamer) => renamer.rename(&run.temp_path, &dest_path).await,
            None => self.backend.rename(&run.temp_path, &dest_path).await,
        };
        if let Err(err) = rename_result {
            run.emit_event(DownloadEventType::RenameTempFileFailed, None, Some(&err));
            run.reporter.emit_failed();
            return Err(err);
        }
        run.emit_event(DownloadEventType::RenameTempFileSucceed, None, None);
        run.reporter.emit_succeed();

        if let Some(path) = &run.checkpoint_path {
            run.store.remove(path).await;
        }
        {
            let state = run.state.lock().await;
            run.reporter.emit_final_progress(&*state);
        }

        Ok(DownloadOutput {
            etag: head.etag,
            hash_crc64ecma: head.hash_crc64ecma,
            object_size,
            file_path: dest_path,
        })
    }

    /// Append the key when the caller's destination is a directory.
    async fn resolve_destination(&self, input: &DownloadInput) -> Result<PathBuf, TransferError> {
        let raw: String = input.file_path.to_string_lossy().into_owned();
        let trailing_separator: bool = raw.ends_with('/') || raw.ends_with('\\');
        let is_dir: bool = matches!(
            self.backend.stat(&input.file_path).await?,
            Some(stat) if stat.is_dir
        );

        let dest: PathBuf = if trailing_separator || is_dir {
            input.file_path.join(&input.key)
        } else {
            input.file_path.clone()
        };

        if let Some(parent) = dest.parent() {
            if !parent.as_os_str().is_empty() {
                self.backend.create_dir_all(parent).await?;
            }
        }
        Ok(dest)
    }

    /// Check a loaded checkpoint against the fresh `HEAD` and the caller's
    /// inputs. Any mismatch discards the checkpoint.
    async fn validate_checkpoint(
        &self,
        doc: &DownloadCheckpoint,
        input: &DownloadInput,
        head: &HeadObjectOutput,
        object_size: u64,
    ) -> Result<(), String> {
        if doc.bucket != input.bucket
            || doc.key != input.key
            || doc.version_id != input.version_id
        {
            return Err("checkpoint describes a different object".into());
        }
        if doc.part_size != input.part_size {
            return Err(format!(
                "part size changed from {} to {}",
                doc.part_size, input.part_size
            ));
        }

        let info: &ObjectInfo = &doc.object_info;
        if info.etag != head.etag
            || info.object_size != object_size
            || info.last_modified != head.last_modified
        {
            return Err("object changed since the checkpoint was written".into());
        }

        let temp: &Path = Path::new(&doc.file_info.temp_file_path);
        match self.backend.stat(temp).await {
            Ok(Some(stat)) if !stat.is_dir => {}
            _ => return Err("temp file is missing".into()),
        }

        // The records must line up with the plan for this object.
        let tasks: Vec<PartTask> = plan(object_size, doc.part_size);
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
        }
        Ok(())
    }

    /// One worker iteration: claim, execute, record, report.
    async fn run_part(&self, run: &DownloadRun<'_, F>, task: PartTask) {
        // Observation site one: before claiming a task.
        if run.cancel.is_cancelled() {
            return;
        }

        let mut counted: u64 = 0;
        match self.execute_part(run, &task, &mut counted).await {
            Ok(digest) => {
                let persisted: Result<(), TransferError> = {
                    let mut state = run.state.lock().await;
                    state.upsert(DownloadPartRecord {
                        part_number: task.part_number,
                        range_start: task.offset,
                        range_end: task.range_end(),
                        hash_crc64ecma: digest,
                        is_completed: true,
                    });
                    run.persist_locked(&state).await
                };
                if let Err(err) = persisted {
                    run.record_first_error(err);
                    return;
                }

                run.emit_event(DownloadEventType::DownloadPartSucceed, Some(&task), None);
                let state = run.state.lock().await;
                run.reporter.part_completed(task.length, &*state);
            }
            Err(err) if err.is_cancelled() => {
                // The run surfaces Cancelled after the drain; nothing to
                // record, the checkpoint and temp file stay intact.
            }
            Err(err) => {
                if counted > 0 {
                    run.reporter.rollback(counted);
                }
                {
                    let mut state = run.state.lock().await;
                    state.upsert(DownloadPartRecord::pending(&task));
                    if let Err(persist_err) = run.persist_locked(&state).await {
                        tracing::warn!(
                            part = task.part_number,
                            error = %persist_err,
                            "failed to persist checkpoint after part failure"
                        );
                    }
                }

                let event_type: DownloadEventType = if err.is_abort() {
                    DownloadEventType::DownloadPartAborted
                } else {
                    DownloadEventType::DownloadPartFailed
                };
                run.emit_event(event_type, Some(&task), Some(&err));
                run.record_first_error(err);
            }
        }
    }

    /// Fetch one part and place its bytes at the part offset in the temp
    /// file, digesting as they stream. Returns the part's CRC64 digest.
    async fn execute_part(
        &self,
        run: &DownloadRun<'_, F>,
        task: &PartTask,
        counted: &mut u64,
    ) -> Result<String, TransferError> {
        if task.length == 0 {
            // The empty part of a zero-size object: nothing to fetch.
            return Ok("0".into());
        }

        let request = GetRangeRequest {
            identity: run.identity.clone(),
            range_start: task.offset,
            range_end: task.offset + task.length - 1,
            if_match: Some(run.etag.clone()),
            traffic_limit: run.traffic_limit,
            rate_limiter: run.rate_limiter.clone(),
        };
        let mut body = self.client.get_object_range(request).await?.body;

        let mut writer = self.backend.open_write_at(&run.temp_path, task.offset).await?;
        let mut hasher: Crc64 = Crc64::new();

        while let Some(chunk) = body.next().await {
            // Observation site two: each chunk of the pipe.
            if run.cancel.is_cancelled() {
                drop(body);
                let _ = writer.shutdown().await;
                return Err(TransferError::Cancelled);
            }

            let chunk: Bytes = chunk?;
            if chunk.is_empty() {
                continue;
            }
            writer
                .write_all(&chunk)
                .await
                .map_err(|e| TransferError::io(run.temp_path.display().to_string(), e))?;
            hasher.update(&chunk);
            *counted += chunk.len() as u64;
            run.reporter.record_rw(chunk.len() as u64);
        }

        writer
            .shutdown()
            .await
            .map_err(|e| TransferError::io(run.temp_path.display().to_string(), e))?;
        drop(writer);

        // Observation site three: after the part's write completes.
        if run.cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        if *counted != task.length {
            return Err(TransferError::Request {
                status_code: None,
                message: format!(
                    "range for part {} returned {} bytes, expected {}",
                    task.part_number, counted, task.length
                ),
                retryable: true,
            });
        }

        Ok(hasher.digest())
    }
}

/// `path` with `suffix` appended to its final component.
fn append_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(suffix);
    PathBuf::from(os)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_suffix() {
        assert_eq!(
            append_suffix(Path::new("/tmp/a.bin"), TEMP_FILE_SUFFIX),
            PathBuf::from("/tmp/a.bin.temp")
        );
    }
}
