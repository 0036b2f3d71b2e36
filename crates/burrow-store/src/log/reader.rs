//! Log replay
//!
//! Replay walks the file from the start, applying `Set` and `Delete` in file
//! order. A crash mid-append leaves a torn final record; replay stops there and
//! reports the length of the intact prefix so the store can cut the tail off
//! before appending again. A complete record that fails to parse is treated
//! the same way once a session marker has been seen, and as corruption
//! otherwise (the file is probably not a log at all).

use std::collections::HashMap;
use std::path::Path;

use bytes::Bytes;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, BufReader};
use tracing::{debug, info, instrument, warn};

use super::LENGTH_PREFIX;
use super::event::LogEvent;
use super::writer::StorageLog;
use crate::error::{StoreError, StoreResult};
use crate::key::Key;
use crate::registry::TypeTag;

/// Largest record replay will accept by default (64 MiB)
pub const DEFAULT_MAX_RECORD_SIZE: u64 = 64 * 1024 * 1024;

/// Latest surviving record for a key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayedRecord {
    /// Tag the value was written under
    pub tag: TypeTag,
    /// Encoded value
    pub data: Bytes,
}

/// Outcome of scanning a log file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanSummary {
    /// Events decoded, session markers included
    pub records: usize,
    /// Session markers seen
    pub sessions: usize,
    /// Size of the file when scanning started
    pub file_len: u64,
    /// Length of the intact prefix
    pub valid_len: u64,
    /// Whether scanning stopped early at a torn or unreadable tail
    pub torn_tail: bool,
}

/// Result of replaying a log file
#[derive(Debug, Clone, Default)]
pub struct Replay {
    /// Live records by key
    pub entries: HashMap<Key, ReplayedRecord>,
    /// How the scan went
    pub summary: ScanSummary,
}

impl StorageLog {
    /// Replay the log at `path` into its final key → record mapping
    pub async fn read(path: impl AsRef<Path>) -> StoreResult<Replay> {
        Self::read_with_limit(path, DEFAULT_MAX_RECORD_SIZE).await
    }

    /// Replay with an explicit maximum record size
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub async fn read_with_limit(
        path: impl AsRef<Path>,
        max_record_size: u64,
    ) -> StoreResult<Replay> {
        let mut entries = HashMap::new();

        let summary = Self::scan(path, max_record_size, |_, event| match event {
            LogEvent::Session {
                id,
                timestamp_millis,
            } => {
                debug!(session = %id, timestamp_millis, "Replaying session marker");
            }
            LogEvent::Set { tag, key, data } => {
                entries.insert(key, ReplayedRecord { tag, data });
            }
            LogEvent::Delete { key, .. } => {
                entries.remove(&key);
            }
        })
        .await?;

        info!(
            records = summary.records,
            sessions = summary.sessions,
            live_keys = entries.len(),
            torn_tail = summary.torn_tail,
            "Replayed storage log"
        );

        Ok(Replay { entries, summary })
    }

    /// Visit every intact event in file order together with its offset
    pub async fn scan<F>(
        path: impl AsRef<Path>,
        max_record_size: u64,
        mut visit: F,
    ) -> StoreResult<ScanSummary>
    where
        F: FnMut(u64, LogEvent),
    {
        let path = path.as_ref();
        let file = File::open(path)
            .await
            .map_err(|e| StoreError::io(format!("open {}: {}", path.display(), e)))?;
        let file_len = file.metadata().await?.len();
        let mut reader = BufReader::new(file);

        let mut summary = ScanSummary {
            file_len,
            ..Default::default()
        };
        let mut offset = 0u64;

        while offset < file_len {
            let remaining = file_len - offset;
            if remaining < LENGTH_PREFIX as u64 {
                warn!(offset, remaining, "Torn length prefix, stopping replay");
                summary.torn_tail = true;
                break;
            }

            let mut len_buf = [0u8; LENGTH_PREFIX];
            reader.read_exact(&mut len_buf).await?;
            let len = u64::from_le_bytes(len_buf);

            let available = remaining - LENGTH_PREFIX as u64;

            // A complete record over the limit is corruption, never a torn tail
            if len > max_record_size && len <= available {
                return Err(StoreError::corrupted(
                    offset,
                    format!(
                        "record of {} bytes exceeds the {} byte limit",
                        len, max_record_size
                    ),
                ));
            }

            if len == 0 || len > max_record_size {
                tolerate_corruption(
                    &summary,
                    offset,
                    format!("implausible record length {}", len),
                )?;
                summary.torn_tail = true;
                break;
            }

            if len > available {
                warn!(offset, len, available, "Torn record, stopping replay");
                summary.torn_tail = true;
                break;
            }

            let mut payload = vec![0u8; len as usize];
            reader.read_exact(&mut payload).await?;

            match LogEvent::from_payload(&payload) {
                Ok(event) => {
                    if matches!(event, LogEvent::Session { .. }) {
                        summary.sessions += 1;
                    }
                    summary.records += 1;
                    visit(offset, event);
                }
                Err(e) => {
                    tolerate_corruption(&summary, offset, e.to_string())?;
                    summary.torn_tail = true;
                    break;
                }
            }

            offset += LENGTH_PREFIX as u64 + len;
        }

        summary.valid_len = offset;
        Ok(summary)
    }

    /// Cut the file back to the intact prefix found by a scan
    pub async fn truncate_torn_tail(
        path: impl AsRef<Path>,
        summary: &ScanSummary,
    ) -> StoreResult<()> {
        if !summary.torn_tail {
            return Ok(());
        }
        let path = path.as_ref();
        let file = OpenOptions::new().write(true).open(path).await?;
        file.set_len(summary.valid_len).await?;
        file.sync_all().await?;

        warn!(
            path = %path.display(),
            discarded = summary.file_len - summary.valid_len,
            valid_len = summary.valid_len,
            "Truncated torn log tail"
        );
        Ok(())
    }
}

/// A bad record after a session marker is a torn tail; before any it is corruption
fn tolerate_corruption(summary: &ScanSummary, offset: u64, reason: String) -> StoreResult<()> {
    if summary.sessions == 0 {
        return Err(StoreError::corrupted(offset, reason));
    }
    warn!(offset, reason = %reason, "Unreadable record, discarding rest of log");
    Ok(())
}
