//! Log compaction
//!
//! Rewrites a log so it holds exactly one `Set` per live key. The new log is
//! built beside the live file (same directory, hence same filesystem) and
//! renamed over it, so the path never names a half-written log.

use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::error::{StoreError, StoreResult};
use crate::key::Key;
use crate::log::{LogEvent, StorageLog};
use crate::registry::{AnyValue, Codec, Registry, TypeTag};
use crate::store::{CacheEntry, CachedValue};

/// Result of a compaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionStats {
    /// Keys written to the new log
    pub live_keys: usize,
    /// Log size before compaction
    pub bytes_before: u64,
    /// Log size after compaction
    pub bytes_after: u64,
    /// When the compaction finished
    pub compacted_at_millis: i64,
}

impl CompactionStats {
    /// Create stats stamped with the current time
    pub fn new(live_keys: usize, bytes_before: u64, bytes_after: u64) -> Self {
        Self {
            live_keys,
            bytes_before,
            bytes_after,
            compacted_at_millis: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Bytes reclaimed (zero if the log grew)
    pub fn bytes_freed(&self) -> u64 {
        self.bytes_before.saturating_sub(self.bytes_after)
    }
}

enum Source {
    Encoded(Bytes),
    Raw(Arc<Codec>, AnyValue),
}

/// Build the factory that writes `entry` as a `Set` record
///
/// Encoded entries reuse their bytes; raw values are encoded when the factory
/// runs. Fails up front if no encoder is registered for the entry's tag.
pub(crate) fn set_event(
    registry: &Registry,
    key: Key,
    entry: &CacheEntry,
) -> StoreResult<impl FnOnce() -> StoreResult<LogEvent> + Send + 'static> {
    let tag = entry.tag.clone();
    let source = match &entry.value {
        CachedValue::Encoded(bytes) => Source::Encoded(bytes.clone()),
        CachedValue::Raw(value) => {
            Source::Raw(Arc::clone(registry.encoder(&tag)?), Arc::clone(value))
        }
    };

    Ok(move || {
        let data = match source {
            Source::Encoded(bytes) => bytes,
            Source::Raw(codec, value) => Bytes::from(codec.encode(&*value)?),
        };
        Ok(LogEvent::Set { tag, key, data })
    })
}

/// Factory for a `Delete` record
pub(crate) fn delete_event(
    tag: TypeTag,
    key: Key,
) -> impl FnOnce() -> StoreResult<LogEvent> + Send + 'static {
    move || Ok(LogEvent::Delete { tag, key })
}

/// Replace the log at `path` with one holding only `snapshot`
///
/// Every value is encoded and written before anything is renamed, so a
/// missing encoder, a failing codec or a record over `max_record_size`
/// leaves the original log untouched. Returns the number of records written.
#[instrument(skip_all, fields(path = %path.display(), keys = snapshot.len()))]
pub(crate) async fn rewrite(
    path: &Path,
    snapshot: Vec<(Key, CacheEntry)>,
    registry: &Registry,
    max_record_size: u64,
) -> StoreResult<usize> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let file_name = path
        .file_name()
        .ok_or_else(|| StoreError::io(format!("{} does not name a file", path.display())))?;

    let scratch = tempfile::Builder::new()
        .prefix(".burrow-compact")
        .tempdir_in(parent)?;
    let temp_path = scratch.path().join(file_name);

    let mut events = Vec::with_capacity(snapshot.len());
    for (key, entry) in &snapshot {
        let factory = set_event(registry, key.clone(), entry)?;
        // Encode now: failures must surface before the swap
        events.push(factory()?);
    }

    let new_log = StorageLog::open_with_limit(&temp_path, true, max_record_size).await?;
    let written = events.len();
    for event in events {
        new_log.post(move || Ok(event))?;
    }
    new_log.close().await?;

    tokio::fs::rename(&temp_path, path).await?;
    // Past the rename the new log is live whether or not the directory syncs
    if let Err(e) = sync_dir(parent).await {
        warn!(error = %e, "Syncing directory after compaction failed");
    }

    debug!(temp = %temp_path.display(), "Swapped compacted log into place");
    info!(records = written, "Compacted storage log");
    Ok(written)
}

#[cfg(unix)]
async fn sync_dir(dir: &Path) -> StoreResult<()> {
    tokio::fs::File::open(dir).await?.sync_all().await?;
    Ok(())
}

#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) -> StoreResult<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::log::DEFAULT_MAX_RECORD_SIZE;

    fn registry() -> Registry {
        let mut builder = Registry::builder();
        builder.register_json::<String>();
        builder.build().unwrap()
    }

    fn raw(value: &str) -> CacheEntry {
        CacheEntry {
            tag: TypeTag::of::<String>(),
            value: CachedValue::Raw(Arc::new(value.to_string())),
        }
    }

    #[test]
    fn test_stats_bytes_freed() {
        assert_eq!(CompactionStats::new(1, 100, 40).bytes_freed(), 60);
        assert_eq!(CompactionStats::new(1, 40, 100).bytes_freed(), 0);
    }

    #[test]
    fn test_set_event_reuses_encoded_bytes() {
        let registry = Registry::builder().build().unwrap();
        let entry = CacheEntry {
            tag: TypeTag::new("unregistered"),
            value: CachedValue::Encoded(Bytes::from_static(b"opaque")),
        };

        // No encoder needed for bytes that are already encoded
        let event = set_event(&registry, Key::from_raw("k"), &entry).unwrap()().unwrap();
        assert_eq!(
            event,
            LogEvent::Set {
                tag: TypeTag::new("unregistered"),
                key: Key::from_raw("k"),
                data: Bytes::from_static(b"opaque"),
            }
        );
    }

    #[test]
    fn test_set_event_requires_encoder_for_raw() {
        let registry = Registry::builder().build().unwrap();
        let result = set_event(&registry, Key::from_raw("k"), &raw("hello"));
        assert!(matches!(result, Err(StoreError::NoEncoderFound(_))));
    }

    #[tokio::test]
    async fn test_rewrite_keeps_only_snapshot() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("store.log");
        let registry = registry();

        let log = StorageLog::open(&path, true).await.unwrap();
        for i in 0..50 {
            let entry = raw(&format!("v{}", i));
            log.post(set_event(&registry, Key::from_raw("k"), &entry).unwrap())
                .unwrap();
        }
        log.close().await.unwrap();
        let before = std::fs::metadata(&path).unwrap().len();

        let snapshot = vec![(Key::from_raw("k"), raw("v49"))];
        let written = rewrite(&path, snapshot, &registry, DEFAULT_MAX_RECORD_SIZE)
            .await
            .unwrap();
        assert_eq!(written, 1);

        let after = std::fs::metadata(&path).unwrap().len();
        assert!(after < before);

        let replay = StorageLog::read(&path).await.unwrap();
        assert_eq!(replay.summary.sessions, 1);
        assert_eq!(replay.summary.records, 2);
        assert_eq!(
            replay.entries[&Key::from_raw("k")].data,
            Bytes::from_static(b"\"v49\"")
        );

        // Scratch directory is gone
        let leftovers: Vec<_> = std::fs::read_dir(temp.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with(".burrow-compact"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_failed_encode_leaves_log_untouched() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("store.log");
        std::fs::write(&path, b"original").unwrap();

        let bad = CacheEntry {
            tag: TypeTag::of::<String>(),
            value: CachedValue::Raw(Arc::new(7u64)),
        };
        let result = rewrite(
            &path,
            vec![(Key::from_raw("k"), bad)],
            &registry(),
            DEFAULT_MAX_RECORD_SIZE,
        )
        .await;

        assert!(matches!(result, Err(StoreError::Serialization(_))));
        assert_eq!(std::fs::read(&path).unwrap(), b"original");
    }

    #[tokio::test]
    async fn test_oversized_record_leaves_log_untouched() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("store.log");
        std::fs::write(&path, b"original").unwrap();

        let big = raw(&"x".repeat(1_000));
        let result = rewrite(&path, vec![(Key::from_raw("k"), big)], &registry(), 256).await;

        assert!(matches!(result, Err(StoreError::LogFailed(_))));
        assert_eq!(std::fs::read(&path).unwrap(), b"original");
    }
}
