//! Append-only storage log
//!
//! Every mutation of the store is appended to a single log file as a framed
//! [`LogEvent`]. The in-memory cache is rebuilt by replaying the file from the
//! start; later records for a key override earlier ones.
//!
//! ## Features
//!
//! - One dedicated writer task per log, so records land in post order
//! - Lazy event construction: encoding runs on the writer task
//! - Explicit durable sync via `flush`
//! - Tolerant replay: a record torn by a crash ends replay instead of failing it
//!
//! ## Storage Format
//!
//! Each log file contains length-prefixed, JSON-serialized events:
//! ```text
//! [8 bytes: len (u64 LE)][len bytes: event JSON][8 bytes: len][...]
//! ```

pub mod event;
mod reader;
mod writer;

pub use event::LogEvent;
pub use reader::{DEFAULT_MAX_RECORD_SIZE, Replay, ReplayedRecord, ScanSummary};
pub use writer::StorageLog;

/// Size of the length prefix in front of every record
pub const LENGTH_PREFIX: usize = 8;
