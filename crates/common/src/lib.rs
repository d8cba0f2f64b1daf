//! Shared types and utilities for tos-transfer.
//!
//! This crate provides common functionality used across the tos-transfer
//! crates:
//! - CRC64 (ECMA-182) streaming digest and GF(2) checksum combination
//! - Generic observer callback traits
//! - Shared constants

pub mod constants;
pub mod crc64;
pub mod observer;

// Re-export commonly used items at crate root
pub use constants::*;
pub use crc64::{combine, combine_digests, crc64_bytes, Crc64};
pub use observer::{
    event_fn, progress_fn, EventCallback, FnEvent, FnProgress, NoOpObserver, ProgressCallback,
};
