//! Shared constants used across tos-transfer crates.

/// Default part size for multipart transfers (20 MiB).
pub const DEFAULT_PART_SIZE: u64 = 20 * 1024 * 1024;

/// Smallest accepted part size in bytes.
pub const MIN_PART_SIZE: u64 = 1;

/// Maximum number of parts a multipart upload may carry.
/// Plans that would exceed this are rejected before any request is issued.
pub const MAX_UPLOAD_PARTS: u64 = 10_000;

/// Default number of concurrent part workers.
pub const DEFAULT_TASK_NUM: usize = 1;

/// Suffix appended to the destination path for the scratch download file.
pub const TEMP_FILE_SUFFIX: &str = ".temp";

/// Suffix of checkpoint files written in directory mode.
pub const CHECKPOINT_FILE_SUFFIX: &str = ".json";

/// HTTP statuses on which a part request is abandoned rather than retried.
pub const ABORT_STATUS_CODES: [u16; 3] = [403, 404, 405];
