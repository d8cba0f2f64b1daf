//! Download engine scenarios against an in-memory object store.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use tos_transfer::{
    event_fn, progress_fn, CompleteMultipartUploadInput, CompleteMultipartUploadOutput,
    CreateMultipartUploadOutput, DataTransferStatus, DataTransferType, DownloadCheckpoint,
    DownloadEvent, DownloadEventType, DownloadInput, Downloader, GetRangeOutput, GetRangeRequest,
    HeadObjectOutput, LocalFileBackend, ObjectClient, ObjectIdentity, TransferError,
    UploadPartOutput, UploadPartRequest,
};
use tos_transfer_common::crc64_bytes;

const MIB: u64 = 1024 * 1024;

/// In-memory object store serving ranged reads of a single object.
struct MockObjectStore {
    data: Vec<u8>,
    etag: String,
    last_modified: String,
    crc64: Option<String>,
    /// Granularity of the streamed response chunks.
    chunk_size: usize,
    /// Flip the first byte of the part starting at this offset.
    corrupt_range_start: Option<u64>,
    /// Always fail parts starting at these offsets with the given status.
    fail_ranges: HashMap<u64, u16>,
    head_calls: AtomicU64,
    get_calls: AtomicU64,
}

impl MockObjectStore {
    fn new(data: Vec<u8>) -> Self {
        let crc64: String = crc64_bytes(&data).to_string();
        Self {
            data,
            etag: "\"mock-etag-1\"".into(),
            last_modified: "Wed, 01 Jan 2025 00:00:00 GMT".into(),
            crc64: Some(crc64),
            chunk_size: 64 * 1024,
            corrupt_range_start: None,
            fail_ranges: HashMap::new(),
            head_calls: AtomicU64::new(0),
            get_calls: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl ObjectClient for MockObjectStore {
    async fn head_object(
        &self,
        _identity: &ObjectIdentity,
    ) -> Result<HeadObjectOutput, TransferError> {
        self.head_calls.fetch_add(1, Ordering::SeqCst);
        Ok(HeadObjectOutput {
            etag: self.etag.clone(),
            content_length: self.data.len() as u64,
            last_modified: self.last_modified.clone(),
            hash_crc64ecma: self.crc64.clone(),
            object_type: None,
            symlink_target_size: None,
        })
    }

    async fn get_object_range(
        &self,
        request: GetRangeRequest,
    ) -> Result<GetRangeOutput, TransferError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        assert_eq!(request.if_match.as_deref(), Some(self.etag.as_str()));

        if let Some(status) = self.fail_ranges.get(&request.range_start) {
            return Err(TransferError::Request {
                status_code: Some(*status),
                message: "injected part failure".into(),
                retryable: *status >= 500,
            });
        }

        let start: usize = request.range_start as usize;
        let end: usize = request.range_end as usize;
        let mut slice: Vec<u8> = self.data[start..=end].to_vec();
        if self.corrupt_range_start == Some(request.range_start) {
            slice[0] ^= 0xff;
        }

        let chunks: Vec<Result<Bytes, TransferError>> = slice
            .chunks(self.chunk_size)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Ok(GetRangeOutput {
            body: stream::iter(chunks).boxed(),
        })
    }

    async fn create_multipart_upload(
        &self,
        _identity: &ObjectIdentity,
    ) -> Result<CreateMultipartUploadOutput, TransferError> {
        unreachable!("download scenarios never start uploads")
    }

    async fn upload_part(
        &self,
        _request: UploadPartRequest,
    ) -> Result<UploadPartOutput, TransferError> {
        unreachable!("download scenarios never upload parts")
    }

    async fn complete_multipart_upload(
        &self,
        _request: CompleteMultipartUploadInput,
    ) -> Result<CompleteMultipartUploadOutput, TransferError> {
        unreachable!("download scenarios never complete uploads")
    }
}

/// Deterministic test payload.
fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[derive(Clone, Default)]
struct Recording {
    percents: Arc<Mutex<Vec<f64>>>,
    statuses: Arc<Mutex<Vec<DataTransferStatus>>>,
    events: Arc<Mutex<Vec<DownloadEventType>>>,
}

impl Recording {
    fn attach(&self, input: DownloadInput) -> DownloadInput {
        let percents = self.percents.clone();
        let statuses = self.statuses.clone();
        let events = self.events.clone();
        input
            .with_progress(Arc::new(progress_fn(
                move |percent: f64, _cp: &DownloadCheckpoint| {
                    percents.lock().unwrap().push(percent);
                },
            )))
            .with_data_transfer_status_change(Arc::new(event_fn(
                move |status: &DataTransferStatus| {
                    statuses.lock().unwrap().push(*status);
                },
            )))
            .with_download_event_change(Arc::new(event_fn(move |event: &DownloadEvent| {
                events.lock().unwrap().push(event.event_type);
            })))
    }

    fn percents(&self) -> Vec<f64> {
        self.percents.lock().unwrap().clone()
    }

    fn statuses(&self) -> Vec<DataTransferStatus> {
        self.statuses.lock().unwrap().clone()
    }

    fn events(&self) -> Vec<DownloadEventType> {
        self.events.lock().unwrap().clone()
    }
}

fn assert_close(actual: f64, expected: f64) {
    assert!(
        (actual - expected).abs() < 1e-9,
        "expected {expected}, got {actual}"
    );
}

fn load_checkpoint(path: &std::path::Path) -> DownloadCheckpoint {
    serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
}

#[tokio::test]
async fn test_empty_object() {
    let dir: TempDir = TempDir::new().unwrap();
    let client: MockObjectStore = MockObjectStore::new(Vec::new());
    let backend: LocalFileBackend = LocalFileBackend::new();
    let dest: PathBuf = dir.path().join("empty.bin");
    let recording: Recording = Recording::default();

    let output = Downloader::new(&client, &backend)
        .download_file(recording.attach(DownloadInput::new("media", "empty.bin", &dest)))
        .await
        .unwrap();

    assert_eq!(output.object_size, 0);
    assert_eq!(std::fs::metadata(&dest).unwrap().len(), 0);

    assert_eq!(recording.percents(), vec![0.0, 1.0]);
    let types: Vec<DataTransferType> = recording
        .statuses()
        .iter()
        .map(|s| s.status_type)
        .collect();
    assert_eq!(
        types,
        vec![DataTransferType::Started, DataTransferType::Succeed]
    );
}

#[tokio::test]
async fn test_parallel_download_progress_ladder() {
    let dir: TempDir = TempDir::new().unwrap();
    let data: Vec<u8> = pattern(10 * MIB as usize);
    let client: MockObjectStore = MockObjectStore::new(data.clone());
    let backend: LocalFileBackend = LocalFileBackend::new();
    let dest: PathBuf = dir.path().join("large.bin");
    let recording: Recording = Recording::default();

    Downloader::new(&client, &backend)
        .download_file(recording.attach(
            DownloadInput::new("media", "large.bin", &dest)
                .with_part_size(MIB)
                .with_task_num(10),
        ))
        .await
        .unwrap();

    assert_eq!(std::fs::read(&dest).unwrap(), data);
    assert_eq!(client.get_calls.load(Ordering::SeqCst), 10);

    // Exact ladder: 0.0, 0.1, ..., 0.9, then 1.0 only after the rename.
    let percents: Vec<f64> = recording.percents();
    assert_eq!(percents.len(), 11);
    for (i, percent) in percents.iter().enumerate().take(10) {
        assert_close(*percent, i as f64 / 10.0);
    }
    assert_eq!(*percents.last().unwrap(), 1.0);

    let statuses: Vec<DataTransferStatus> = recording.statuses();
    assert_eq!(statuses[0].status_type, DataTransferType::Started);
    assert_eq!(
        statuses.last().unwrap().status_type,
        DataTransferType::Succeed
    );

    // Rw accounting: cumulative, sums to the object size, ends at total.
    let rw: Vec<DataTransferStatus> = statuses
        .iter()
        .filter(|s| s.status_type == DataTransferType::Rw)
        .copied()
        .collect();
    for window in rw.windows(2) {
        assert_eq!(
            window[1].consumed_bytes,
            window[0].consumed_bytes + window[1].rw_once_bytes
        );
    }
    let total_rw: u64 = rw.iter().map(|s| s.rw_once_bytes).sum();
    assert_eq!(total_rw, 10 * MIB);
    assert_eq!(rw.last().unwrap().consumed_bytes, 10 * MIB);
    assert!(rw.iter().all(|s| s.rw_once_bytes > 0));
}

#[tokio::test]
async fn test_odd_part_size_progress() {
    let dir: TempDir = TempDir::new().unwrap();
    let size: u64 = 10 * MIB;
    let part_size: u64 = 7177;
    let data: Vec<u8> = pattern(size as usize);
    let client: MockObjectStore = MockObjectStore::new(data.clone());
    let backend: LocalFileBackend = LocalFileBackend::new();
    let dest: PathBuf = dir.path().join("odd.bin");
    let recording: Recording = Recording::default();

    Downloader::new(&client, &backend)
        .download_file(recording.attach(
            DownloadInput::new("media", "odd.bin", &dest)
                .with_part_size(part_size)
                .with_task_num(1),
        ))
        .await
        .unwrap();

    assert_eq!(std::fs::read(&dest).unwrap(), data);

    let percents: Vec<f64> = recording.percents();
    let part_count: u64 = size.div_ceil(part_size);
    // Initial 0.0, one value per part except the final one, then 1.0.
    assert_eq!(percents.len() as u64, part_count + 1);
    assert_close(percents[0], 0.0);
    for (k, percent) in percents.iter().enumerate().skip(1).take(part_count as usize - 1) {
        assert_close(*percent, (part_size * k as u64) as f64 / size as f64);
    }
    let ones: usize = percents.iter().filter(|p| **p == 1.0).count();
    assert_eq!(ones, 1);
    assert_eq!(*percents.last().unwrap(), 1.0);
    for window in percents.windows(2) {
        assert!(window[0] <= window[1]);
    }
}

#[tokio::test]
async fn test_pause_and_resume() {
    let dir: TempDir = TempDir::new().unwrap();
    let data: Vec<u8> = pattern(10 * MIB as usize);
    let client: MockObjectStore = MockObjectStore::new(data.clone());
    let backend: LocalFileBackend = LocalFileBackend::new();
    let dest: PathBuf = dir.path().join("resumable.bin");
    let checkpoint_path: PathBuf = dir.path().join("resumable.checkpoint.json");

    // Cancel once four parts have succeeded.
    let token: CancellationToken = CancellationToken::new();
    let cancel = token.clone();
    let succeeded: Arc<AtomicU64> = Arc::new(AtomicU64::new(0));
    let counter = succeeded.clone();

    let result = Downloader::new(&client, &backend)
        .download_file(
            DownloadInput::new("media", "resumable.bin", &dest)
                .with_part_size(MIB)
                .with_task_num(1)
                .with_checkpoint_path(&checkpoint_path)
                .with_cancel_token(token)
                .with_download_event_change(Arc::new(event_fn(move |event: &DownloadEvent| {
                    if event.event_type == DownloadEventType::DownloadPartSucceed
                        && counter.fetch_add(1, Ordering::SeqCst) + 1 == 4
                    {
                        cancel.cancel();
                    }
                }))),
        )
        .await;
    assert!(matches!(result, Err(TransferError::Cancelled)));

    // Checkpoint and temp survive the cancellation.
    let paused: DownloadCheckpoint = load_checkpoint(&checkpoint_path);
    let completed_before: u64 = paused
        .parts_info
        .iter()
        .filter(|p| p.is_completed)
        .count() as u64;
    assert!(completed_before >= 4);
    assert!(dir.path().join("resumable.bin.temp").exists());
    assert!(!dest.exists());

    // Resume from the persisted checkpoint.
    let recording: Recording = Recording::default();
    Downloader::new(&client, &backend)
        .download_file(
            recording.attach(
                DownloadInput::new("media", "resumable.bin", &dest)
                    .with_part_size(MIB)
                    .with_task_num(1)
                    .with_checkpoint_path(&checkpoint_path),
            ),
        )
        .await
        .unwrap();

    let resumed_successes: u64 = recording
        .events()
        .iter()
        .filter(|e| **e == DownloadEventType::DownloadPartSucceed)
        .count() as u64;
    assert_eq!(resumed_successes, 10 - completed_before);

    // No Started on a pure resume; the first Rw signals resumption.
    assert!(recording
        .statuses()
        .iter()
        .all(|s| s.status_type != DataTransferType::Started));
    assert_close(recording.percents()[0], completed_before as f64 / 10.0);

    assert_eq!(std::fs::read(&dest).unwrap(), data);
    assert!(!checkpoint_path.exists());
}

#[tokio::test]
async fn test_crc_mismatch_keeps_checkpoint() {
    let dir: TempDir = TempDir::new().unwrap();
    let data: Vec<u8> = pattern(4 * MIB as usize);
    let mut client: MockObjectStore = MockObjectStore::new(data);
    client.corrupt_range_start = Some(2 * MIB);
    let backend: LocalFileBackend = LocalFileBackend::new();
    let dest: PathBuf = dir.path().join("corrupt.bin");
    let checkpoint_path: PathBuf = dir.path().join("corrupt.checkpoint.json");
    let recording: Recording = Recording::default();

    let result = Downloader::new(&client, &backend)
        .download_file(recording.attach(
            DownloadInput::new("media", "corrupt.bin", &dest)
                .with_part_size(MIB)
                .with_task_num(2)
                .with_checkpoint_path(&checkpoint_path),
        ))
        .await;

    assert!(matches!(result, Err(TransferError::CrcMismatch { .. })));
    // Temp is not renamed and the checkpoint is preserved for inspection.
    assert!(!dest.exists());
    assert!(dir.path().join("corrupt.bin.temp").exists());
    assert!(checkpoint_path.exists());
    assert_eq!(
        recording.statuses().last().unwrap().status_type,
        DataTransferType::Failed
    );
}

#[tokio::test]
async fn test_etag_change_invalidates_checkpoint() {
    let dir: TempDir = TempDir::new().unwrap();
    let data: Vec<u8> = pattern(10 * MIB as usize);
    let client: MockObjectStore = MockObjectStore::new(data.clone());
    let backend: LocalFileBackend = LocalFileBackend::new();
    let dest: PathBuf = dir.path().join("mutated.bin");
    let checkpoint_path: PathBuf = dir.path().join("mutated.checkpoint.json");

    let token: CancellationToken = CancellationToken::new();
    let cancel = token.clone();
    let succeeded: Arc<AtomicU64> = Arc::new(AtomicU64::new(0));
    let counter = succeeded.clone();
    let result = Downloader::new(&client, &backend)
        .download_file(
            DownloadInput::new("media", "mutated.bin", &dest)
                .with_part_size(MIB)
                .with_task_num(1)
                .with_checkpoint_path(&checkpoint_path)
                .with_cancel_token(token)
                .with_download_event_change(Arc::new(event_fn(move |event: &DownloadEvent| {
                    if event.event_type == DownloadEventType::DownloadPartSucceed
                        && counter.fetch_add(1, Ordering::SeqCst) + 1 == 2
                    {
                        cancel.cancel();
                    }
                }))),
        )
        .await;
    assert!(matches!(result, Err(TransferError::Cancelled)));
    assert!(checkpoint_path.exists());

    // The object changed between runs: same bytes, different etag.
    let mut mutated: MockObjectStore = MockObjectStore::new(data.clone());
    mutated.etag = "\"mock-etag-2\"".into();

    Downloader::new(&mutated, &backend)
        .download_file(
            DownloadInput::new("media", "mutated.bin", &dest)
                .with_part_size(MIB)
                .with_task_num(1)
                .with_checkpoint_path(&checkpoint_path),
        )
        .await
        .unwrap();

    // Every part was refetched; nothing was trusted from the checkpoint.
    assert_eq!(mutated.get_calls.load(Ordering::SeqCst), 10);
    assert_eq!(std::fs::read(&dest).unwrap(), data);
}

#[tokio::test]
async fn test_first_error_raised_after_drain() {
    let dir: TempDir = TempDir::new().unwrap();
    let data: Vec<u8> = pattern(10 * MIB as usize);
    let mut client: MockObjectStore = MockObjectStore::new(data);
    client.fail_ranges.insert(4 * MIB, 500);
    let backend: LocalFileBackend = LocalFileBackend::new();
    let dest: PathBuf = dir.path().join("halting.bin");
    let checkpoint_path: PathBuf = dir.path().join("halting.checkpoint.json");
    let recording: Recording = Recording::default();

    let result = Downloader::new(&client, &backend)
        .download_file(recording.attach(
            DownloadInput::new("media", "halting.bin", &dest)
                .with_part_size(MIB)
                .with_task_num(3)
                .with_checkpoint_path(&checkpoint_path),
        ))
        .await;

    match result {
        Err(TransferError::Request { status_code, .. }) => {
            assert_eq!(status_code, Some(500));
        }
        other => panic!("expected the injected request error, got {other:?}"),
    }

    // The queue drained: every other part completed and was recorded.
    let doc: DownloadCheckpoint = load_checkpoint(&checkpoint_path);
    let completed: usize = doc.parts_info.iter().filter(|p| p.is_completed).count();
    assert_eq!(completed, 9);
    let failed = doc
        .parts_info
        .iter()
        .find(|p| p.range_start == 4 * MIB)
        .unwrap();
    assert!(!failed.is_completed);

    let events: Vec<DownloadEventType> = recording.events();
    assert_eq!(
        events
            .iter()
            .filter(|e| **e == DownloadEventType::DownloadPartFailed)
            .count(),
        1
    );
    // A run aborted by part errors produces no terminal transfer event.
    assert!(recording.statuses().iter().all(|s| {
        s.status_type != DataTransferType::Succeed && s.status_type != DataTransferType::Failed
    }));
    assert!(!dest.exists());
}

#[tokio::test]
async fn test_abort_status_emits_part_aborted() {
    let dir: TempDir = TempDir::new().unwrap();
    let data: Vec<u8> = pattern(2 * MIB as usize);
    let mut client: MockObjectStore = MockObjectStore::new(data);
    client.fail_ranges.insert(0, 404);
    let backend: LocalFileBackend = LocalFileBackend::new();
    let recording: Recording = Recording::default();

    let result = Downloader::new(&client, &backend)
        .download_file(recording.attach(
            DownloadInput::new("media", "gone.bin", dir.path().join("gone.bin"))
                .with_part_size(MIB)
                .with_task_num(2),
        ))
        .await;

    assert!(result.is_err());
    assert!(recording
        .events()
        .contains(&DownloadEventType::DownloadPartAborted));
}

#[tokio::test]
async fn test_directory_destination_appends_key() {
    let dir: TempDir = TempDir::new().unwrap();
    let data: Vec<u8> = pattern(1000);
    let client: MockObjectStore = MockObjectStore::new(data.clone());
    let backend: LocalFileBackend = LocalFileBackend::new();

    let output = Downloader::new(&client, &backend)
        .download_file(
            DownloadInput::new("media", "videos/clip.bin", dir.path()).with_part_size(256),
        )
        .await
        .unwrap();

    assert_eq!(output.file_path, dir.path().join("videos/clip.bin"));
    assert_eq!(std::fs::read(&output.file_path).unwrap(), data);
}

#[tokio::test]
async fn test_temp_file_events() {
    let dir: TempDir = TempDir::new().unwrap();
    let data: Vec<u8> = pattern(100);
    let client: MockObjectStore = MockObjectStore::new(data);
    let backend: LocalFileBackend = LocalFileBackend::new();
    let recording: Recording = Recording::default();

    Downloader::new(&client, &backend)
        .download_file(recording.attach(DownloadInput::new(
            "media",
            "small.bin",
            dir.path().join("small.bin"),
        )))
        .await
        .unwrap();

    let events: Vec<DownloadEventType> = recording.events();
    assert_eq!(events[0], DownloadEventType::CreateTempFileSucceed);
    assert_eq!(
        *events.last().unwrap(),
        DownloadEventType::RenameTempFileSucceed
    );
}
