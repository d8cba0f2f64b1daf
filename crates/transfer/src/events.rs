//! Observer event types and the progress reporter.
//!
//! Three observer streams exist per transfer: coarse progress (a fraction
//! plus a checkpoint snapshot), byte-level data-transfer accounting, and
//! structural events (temp file lifecycle, per-part outcomes, finalize).
//! The reporter serializes its emissions so callbacks observe monotonic
//! counters even with many concurrent part workers.

use std::sync::Arc;
use std::sync::Mutex;

use tos_transfer_common::{EventCallback, ProgressCallback};

/// Kind of a data-transfer status event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataTransferType {
    /// A fresh transfer attempt started (not emitted on resume).
    Started,
    /// A chunk of bytes moved.
    Rw,
    /// The transfer finalized successfully.
    Succeed,
    /// Finalization failed or integrity verification failed.
    Failed,
}

/// Byte-accounting event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataTransferStatus {
    pub status_type: DataTransferType,
    /// Bytes moved by this event; non-zero only for `Rw`.
    pub rw_once_bytes: u64,
    /// Bytes moved so far, monotonic across the run.
    pub consumed_bytes: u64,
    /// Object size.
    pub total_bytes: u64,
}

/// Structural download events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadEventType {
    CreateTempFileSucceed,
    CreateTempFileFailed,
    DownloadPartSucceed,
    DownloadPartFailed,
    /// The server rejected the part outright (403/404/405).
    DownloadPartAborted,
    RenameTempFileSucceed,
    RenameTempFileFailed,
}

/// Byte range of the part an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadPartInfo {
    pub part_number: u32,
    pub range_start: u64,
    /// Inclusive; `-1` for the single part of a zero-size object.
    pub range_end: i64,
}

/// A structural event in a download's lifecycle.
#[derive(Debug, Clone)]
pub struct DownloadEvent {
    pub event_type: DownloadEventType,
    pub bucket: String,
    pub key: String,
    pub version_id: Option<String>,
    pub file_path: String,
    pub temp_file_path: Option<String>,
    pub checkpoint_path: Option<String>,
    pub part: Option<DownloadPartInfo>,
    pub error: Option<String>,
}

/// Structural upload events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadEventType {
    CreateMultipartUploadSucceed,
    CreateMultipartUploadFailed,
    UploadPartSucceed,
    UploadPartFailed,
    /// The server rejected the part outright (403/404/405).
    UploadPartAborted,
    CompleteMultipartUploadSucceed,
    CompleteMultipartUploadFailed,
}

/// Byte range of the part an upload event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadPartInfo {
    pub part_number: u32,
    pub offset: u64,
    pub length: u64,
}

/// A structural event in an upload's lifecycle.
#[derive(Debug, Clone)]
pub struct UploadEvent {
    pub event_type: UploadEventType,
    pub bucket: String,
    pub key: String,
    pub upload_id: Option<String>,
    pub file_path: String,
    pub checkpoint_path: Option<String>,
    pub part: Option<UploadPartInfo>,
    pub error: Option<String>,
}

#[derive(Debug, Default)]
struct Counters {
    /// Chunk-level bytes moved, adjusted back down when an attempt fails.
    consumed: u64,
    /// Part-level bytes completed; only advances on part success, so the
    /// progress fractions are exact part multiples.
    progressed: u64,
}

/// Derives the progress and data-transfer streams for one run.
///
/// The ordering contract:
/// - one initial progress emission at run entry (the resumed fraction, 0.0
///   for fresh runs);
/// - `Started` only for fresh runs, before any `Rw`;
/// - one progress emission per completed part, except the completion that
///   reaches the object size - the final `1.0` is deferred until after
///   verification and finalization;
/// - exactly one terminal data-transfer event, none on cancellation.
pub struct ProgressReporter<C> {
    progress: Option<Arc<dyn ProgressCallback<C>>>,
    data_transfer: Option<Arc<dyn EventCallback<DataTransferStatus>>>,
    total_bytes: u64,
    counters: Mutex<Counters>,
}

impl<C> ProgressReporter<C> {
    /// Create a reporter with both counters seeded from the bytes already
    /// completed in a resumed checkpoint (zero for a fresh run).
    pub fn new(
        progress: Option<Arc<dyn ProgressCallback<C>>>,
        data_transfer: Option<Arc<dyn EventCallback<DataTransferStatus>>>,
        total_bytes: u64,
        completed_bytes: u64,
    ) -> Self {
        Self {
            progress,
            data_transfer,
            total_bytes,
            counters: Mutex::new(Counters {
                consumed: completed_bytes,
                progressed: completed_bytes,
            }),
        }
    }

    fn emit_data_transfer(&self, status_type: DataTransferType, rw_once: u64, consumed: u64) {
        if let Some(callback) = &self.data_transfer {
            callback.on_event(&DataTransferStatus {
                status_type,
                rw_once_bytes: rw_once,
                consumed_bytes: consumed,
                total_bytes: self.total_bytes,
            });
        }
    }

    fn percent(&self, progressed: u64) -> f64 {
        if self.total_bytes == 0 {
            0.0
        } else {
            progressed as f64 / self.total_bytes as f64
        }
    }

    /// Emit `Started`. Called once, for fresh (non-resume) runs only.
    pub fn emit_started(&self) {
        let consumed: u64 = self.counters.lock().unwrap().consumed;
        self.emit_data_transfer(DataTransferType::Started, 0, consumed);
    }

    /// Emit the run-entry progress value.
    pub fn emit_initial_progress(&self, checkpoint: &C) {
        if let Some(callback) = &self.progress {
            let guard = self.counters.lock().unwrap();
            callback.on_progress(self.percent(guard.progressed), checkpoint);
        }
    }

    /// Account a chunk of moved bytes and emit `Rw`.
    pub fn record_rw(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        // The callback is invoked under the counter lock so concurrent
        // workers observe strictly monotonic consumed_bytes.
        let mut guard = self.counters.lock().unwrap();
        guard.consumed += bytes;
        let consumed: u64 = guard.consumed;
        self.emit_data_transfer(DataTransferType::Rw, bytes, consumed);
    }

    /// Take back bytes counted for a failed attempt so a retry reports
    /// them only once.
    pub fn rollback(&self, bytes: u64) {
        let mut guard = self.counters.lock().unwrap();
        guard.consumed = guard.consumed.saturating_sub(bytes);
    }

    /// Account a completed part and emit progress, unless this completion
    /// reaches the object size - that final `1.0` is deferred to
    /// [`emit_final_progress`](Self::emit_final_progress). Returns whether
    /// a progress value was emitted.
    pub fn part_completed(&self, part_length: u64, checkpoint: &C) -> bool {
        let mut guard = self.counters.lock().unwrap();
        guard.progressed += part_length;
        if guard.progressed >= self.total_bytes {
            return false;
        }
        if let Some(callback) = &self.progress {
            callback.on_progress(self.percent(guard.progressed), checkpoint);
        }
        true
    }

    /// Emit the terminal `Succeed` event.
    pub fn emit_succeed(&self) {
        let consumed: u64 = self.counters.lock().unwrap().consumed;
        self.emit_data_transfer(DataTransferType::Succeed, 0, consumed);
    }

    /// Emit the terminal `Failed` event.
    pub fn emit_failed(&self) {
        let consumed: u64 = self.counters.lock().unwrap().consumed;
        self.emit_data_transfer(DataTransferType::Failed, 0, consumed);
    }

    /// Emit the single final `1.0` progress value.
    pub fn emit_final_progress(&self, checkpoint: &C) {
        if let Some(callback) = &self.progress {
            callback.on_progress(1.0, checkpoint);
        }
    }

    /// Bytes moved so far.
    pub fn consumed_bytes(&self) -> u64 {
        self.counters.lock().unwrap().consumed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tos_transfer_common::{event_fn, progress_fn};

    type Recorded = Arc<Mutex<Vec<DataTransferStatus>>>;

    fn recording_reporter(total: u64, completed: u64) -> (ProgressReporter<u32>, Recorded, Arc<Mutex<Vec<f64>>>) {
        let statuses: Recorded = Arc::new(Mutex::new(Vec::new()));
        let statuses_clone: Recorded = statuses.clone();
        let percents: Arc<Mutex<Vec<f64>>> = Arc::new(Mutex::new(Vec::new()));
        let percents_clone = percents.clone();

        let reporter: ProgressReporter<u32> = ProgressReporter::new(
            Some(Arc::new(progress_fn(move |p: f64, _cp: &u32| {
                percents_clone.lock().unwrap().push(p);
            }))),
            Some(Arc::new(event_fn(move |s: &DataTransferStatus| {
                statuses_clone.lock().unwrap().push(*s);
            }))),
            total,
            completed,
        );
        (reporter, statuses, percents)
    }

    #[test]
    fn test_rw_accounting_is_cumulative() {
        let (reporter, statuses, _) = recording_reporter(10, 0);
        reporter.emit_started();
        reporter.record_rw(4);
        reporter.record_rw(0); // ignored
        reporter.record_rw(6);
        reporter.emit_succeed();

        let statuses = statuses.lock().unwrap();
        assert_eq!(statuses.len(), 4);
        assert_eq!(statuses[0].status_type, DataTransferType::Started);
        assert_eq!(statuses[1].rw_once_bytes, 4);
        assert_eq!(statuses[1].consumed_bytes, 4);
        assert_eq!(statuses[2].consumed_bytes, 10);
        assert_eq!(statuses[3].status_type, DataTransferType::Succeed);
        assert_eq!(statuses[3].consumed_bytes, 10);
    }

    #[test]
    fn test_rollback_reverses_failed_attempt() {
        let (reporter, _, _) = recording_reporter(10, 0);
        reporter.record_rw(7);
        reporter.rollback(7);
        assert_eq!(reporter.consumed_bytes(), 0);
    }

    #[test]
    fn test_final_part_defers_progress() {
        let (reporter, _, percents) = recording_reporter(10, 0);
        reporter.emit_initial_progress(&0);
        assert!(reporter.part_completed(4, &0));
        assert!(!reporter.part_completed(6, &0)); // reaches total: deferred
        reporter.emit_final_progress(&0);

        let percents = percents.lock().unwrap();
        assert_eq!(percents.as_slice(), &[0.0, 0.4, 1.0]);
    }

    #[test]
    fn test_zero_size_object_progress() {
        let (reporter, _, percents) = recording_reporter(0, 0);
        reporter.emit_initial_progress(&0);
        assert!(!reporter.part_completed(0, &0));
        reporter.emit_final_progress(&0);

        let percents = percents.lock().unwrap();
        assert_eq!(percents.as_slice(), &[0.0, 1.0]);
    }

    #[test]
    fn test_resume_seeds_counters() {
        let (reporter, statuses, percents) = recording_reporter(10, 6);
        reporter.emit_initial_progress(&0);
        reporter.record_rw(4);
        assert!(!reporter.part_completed(4, &0));

        assert_eq!(percents.lock().unwrap().as_slice(), &[0.6]);
        assert_eq!(statuses.lock().unwrap()[0].consumed_bytes, 10);
    }
}
