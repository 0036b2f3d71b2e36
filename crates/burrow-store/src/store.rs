//! The store facade
//!
//! [`Store`] serves reads and writes from an in-memory cache and appends every
//! mutation to the [`StorageLog`]. All cache access goes through one async
//! mutex, so concurrent callers never see a torn cache and writes to a key
//! reach the log in the order they reached the cache.

use std::any::type_name;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::compaction::{self, CompactionStats};
use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};
use crate::key::Key;
use crate::log::StorageLog;
use crate::observe::{Change, Observer, ObserverRegistry};
use crate::registry::{AnyValue, Registry, RegistryBuilder, TypeTag};

/// A cached value: decoded, or still in the bytes it was replayed from
#[derive(Clone)]
pub(crate) enum CachedValue {
    Raw(AnyValue),
    Encoded(Bytes),
}

/// Cache slot for one key
#[derive(Clone)]
pub(crate) struct CacheEntry {
    pub(crate) tag: TypeTag,
    pub(crate) value: CachedValue,
}

struct State {
    cache: HashMap<Key, CacheEntry>,
    log: Arc<StorageLog>,
    /// Keys touched while a compaction is rewriting the log, with their last tag
    dirty: Option<HashMap<Key, TypeTag>>,
}

impl State {
    fn ensure_writable(&self) -> StoreResult<()> {
        if let Some(reason) = self.log.failure() {
            return Err(StoreError::LogFailed(reason.to_string()));
        }
        if self.log.is_closed() {
            return Err(StoreError::LogClosed);
        }
        Ok(())
    }

    /// Refuse writes once the live writer no longer appends to the file at `path`
    fn abandon_log(&self, cause: &StoreError) {
        self.log
            .poison(format!("compacted log could not be reopened: {}", cause));
    }

    fn touch(&mut self, key: &Key, tag: &TypeTag) {
        if let Some(dirty) = self.dirty.as_mut() {
            dirty.insert(key.clone(), tag.clone());
        }
    }
}

/// Embedded append-only key/value store
///
/// Writes are visible to readers immediately and become durable
/// asynchronously; call [`flush`](Self::flush) when a write must be on disk.
///
/// ```rust,ignore
/// let store = Store::open("data/cache.log", false, |types| {
///     types.register_json::<String>();
/// })
/// .await?;
///
/// store.set("greeting", "hello".to_string()).await?;
/// let greeting: Option<String> = store.get("greeting").await?;
/// ```
pub struct Store {
    config: StoreConfig,
    registry: Arc<Registry>,
    state: Mutex<State>,
    observers: ObserverRegistry,
    compaction: Mutex<()>,
}

impl Store {
    /// Open the store at `path`, registering value types with `registration`
    pub async fn open<F>(
        path: impl AsRef<Path>,
        compact: bool,
        registration: F,
    ) -> StoreResult<Self>
    where
        F: FnOnce(&mut RegistryBuilder),
    {
        let config = StoreConfig::new(path.as_ref()).with_compact_on_open(compact);
        Self::open_with_config(config, registration).await
    }

    /// Open the store described by `config`
    ///
    /// Replays the existing log, if any. Fails without leaving anything open
    /// if a replayed record has no registered decoder, if eager decoding
    /// fails, or if the file is not a readable log.
    #[instrument(skip_all, fields(path = %config.path.display()))]
    pub async fn open_with_config<F>(config: StoreConfig, registration: F) -> StoreResult<Self>
    where
        F: FnOnce(&mut RegistryBuilder),
    {
        config.validate()?;

        let mut builder = Registry::builder();
        registration(&mut builder);
        let registry = Arc::new(builder.build()?);

        if let Some(parent) = config.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let exists = tokio::fs::try_exists(&config.path).await?;
        let mut cache = HashMap::new();

        if exists {
            let replay = StorageLog::read_with_limit(&config.path, config.max_record_size).await?;

            for (key, record) in replay.entries {
                let codec = registry.decoder(&record.tag)?;
                let value = if config.eager_decode {
                    CachedValue::Raw(codec.decode(&record.data)?)
                } else {
                    CachedValue::Encoded(record.data)
                };
                cache.insert(
                    key,
                    CacheEntry {
                        tag: record.tag,
                        value,
                    },
                );
            }

            if !config.compact_on_open {
                StorageLog::truncate_torn_tail(&config.path, &replay.summary).await?;
            }
        } else {
            debug!("No existing log, starting empty");
        }

        let log = if exists && config.compact_on_open {
            let snapshot = cache
                .iter()
                .map(|(key, entry)| (key.clone(), entry.clone()))
                .collect();
            compaction::rewrite(&config.path, snapshot, &registry, config.max_record_size).await?;
            // The rewritten log already opens with this session's marker
            StorageLog::open_with_limit(&config.path, false, config.max_record_size).await?
        } else {
            StorageLog::open_with_limit(&config.path, true, config.max_record_size).await?
        };

        info!(
            keys = cache.len(),
            types = registry.len(),
            compacted = exists && config.compact_on_open,
            "Store opened"
        );

        Ok(Self {
            observers: ObserverRegistry::new(config.observer_capacity),
            config,
            registry,
            state: Mutex::new(State {
                cache,
                log: Arc::new(log),
                dirty: None,
            }),
            compaction: Mutex::new(()),
        })
    }

    /// Read the value stored under `id`
    ///
    /// Returns `Ok(None)` for a missing key and [`StoreError::TypeMismatch`]
    /// if the stored value is not a `V`.
    pub async fn get<K, V>(&self, id: &K) -> StoreResult<Option<V>>
    where
        K: Serialize + ?Sized,
        V: Clone + Send + Sync + 'static,
    {
        let key = Key::encode(id)?;
        self.get_by_key(&key).await
    }

    /// Read the value stored under an already encoded key
    pub async fn get_by_key<V>(&self, key: &Key) -> StoreResult<Option<V>>
    where
        V: Clone + Send + Sync + 'static,
    {
        let mut state = self.state.lock().await;
        let Some(entry) = state.cache.get_mut(key) else {
            return Ok(None);
        };

        let value = match &entry.value {
            CachedValue::Raw(value) => Arc::clone(value),
            CachedValue::Encoded(bytes) => self.registry.decoder(&entry.tag)?.decode(bytes)?,
        };
        if matches!(entry.value, CachedValue::Encoded(_)) {
            trace!(key = %key, tag = %entry.tag, "Promoted cached value");
            entry.value = CachedValue::Raw(Arc::clone(&value));
        }
        let tag = entry.tag.clone();
        drop(state);

        match value.downcast::<V>() {
            Ok(value) => Ok(Some(V::clone(&value))),
            Err(_) => Err(StoreError::TypeMismatch {
                key: key.to_string(),
                expected: type_name::<V>().to_string(),
                found: tag,
            }),
        }
    }

    /// Store `value` under `id`
    ///
    /// The value is visible to readers as soon as this returns; it is encoded
    /// and written to the log in the background. Fails if `V` was never
    /// registered, if `id` cannot be encoded, or if the log no longer accepts
    /// writes (in which case the cache is left untouched).
    pub async fn set<K, V>(&self, id: &K, value: V) -> StoreResult<()>
    where
        K: Serialize + ?Sized,
        V: Send + Sync + 'static,
    {
        let key = Key::encode(id)?;
        self.set_by_key(key, value).await
    }

    /// Store `value` under an already encoded key
    pub async fn set_by_key<V>(&self, key: Key, value: V) -> StoreResult<()>
    where
        V: Send + Sync + 'static,
    {
        let entry = CacheEntry {
            tag: self.registry.tag_for::<V>()?.clone(),
            value: CachedValue::Raw(Arc::new(value)),
        };
        let factory = compaction::set_event(&self.registry, key.clone(), &entry)?;

        let mut state = self.state.lock().await;
        state.ensure_writable()?;

        state.touch(&key, &entry.tag);
        state.cache.insert(key.clone(), entry);
        let posted = state.log.post(factory);
        trace!(key = %key, "Set");

        self.observers.send(Change::Update(key));
        posted
    }

    /// Remove `id`, returning whether it was present
    ///
    /// Deleting a missing key writes nothing and notifies nobody.
    pub async fn delete<K>(&self, id: &K) -> StoreResult<bool>
    where
        K: Serialize + ?Sized,
    {
        let key = Key::encode(id)?;
        self.delete_by_key(&key).await
    }

    /// Remove an already encoded key
    pub async fn delete_by_key(&self, key: &Key) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        state.ensure_writable()?;

        let Some(entry) = state.cache.remove(key) else {
            return Ok(false);
        };
        state.touch(key, &entry.tag);
        let posted = state
            .log
            .post(compaction::delete_event(entry.tag, key.clone()));
        trace!(key = %key, "Deleted");

        self.observers.send(Change::Remove(key.clone()));
        posted.map(|_| true)
    }

    /// Set when `Some`, delete when `None`
    pub async fn assign<K, V>(&self, id: &K, value: Option<V>) -> StoreResult<()>
    where
        K: Serialize + ?Sized,
        V: Send + Sync + 'static,
    {
        match value {
            Some(value) => self.set(id, value).await,
            None => self.delete(id).await.map(|_| ()),
        }
    }

    /// Whether `id` has a value
    pub async fn contains<K>(&self, id: &K) -> StoreResult<bool>
    where
        K: Serialize + ?Sized,
    {
        let key = Key::encode(id)?;
        Ok(self.state.lock().await.cache.contains_key(&key))
    }

    /// All live keys, sorted
    pub async fn keys(&self) -> Vec<Key> {
        let mut keys: Vec<Key> = self.state.lock().await.cache.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Tag of the value stored under `key`
    pub async fn tag_of(&self, key: &Key) -> Option<TypeTag> {
        self.state
            .lock()
            .await
            .cache
            .get(key)
            .map(|entry| entry.tag.clone())
    }

    /// Number of live keys
    pub async fn len(&self) -> usize {
        self.state.lock().await.cache.len()
    }

    /// Whether the store holds no keys
    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.cache.is_empty()
    }

    /// Subscribe to changes on `id`
    pub fn observe<K>(&self, id: &K) -> StoreResult<Observer>
    where
        K: Serialize + ?Sized,
    {
        Ok(self.observe_key(Key::encode(id)?))
    }

    /// Subscribe to changes on an already encoded key
    pub fn observe_key(&self, key: Key) -> Observer {
        self.observers.observe(key)
    }

    /// Number of keys that currently have live observers
    pub fn observed_keys(&self) -> usize {
        self.observers.live()
    }

    /// Number of observation channels the store still tracks, dead ones included
    pub fn observation_entries(&self) -> usize {
        self.observers.len()
    }

    /// Wait until every write issued so far is on disk
    pub async fn flush(&self) -> StoreResult<()> {
        loop {
            let log = Arc::clone(&self.state.lock().await.log);
            let result = log.flush().await;

            // A compaction may have swapped logs while we waited; the writes
            // we were waiting for then live in the new one
            let current = Arc::clone(&self.state.lock().await.log);
            if Arc::ptr_eq(&log, &current) {
                return result;
            }
        }
    }

    /// Size of the log file in bytes, after flushing
    pub async fn size(&self) -> StoreResult<u64> {
        self.flush().await?;
        let metadata = tokio::fs::metadata(&self.config.path).await?;
        Ok(metadata.len())
    }

    /// Rewrite the log down to the current cache contents
    ///
    /// Reads and writes keep being served while the new log is built. Keys
    /// written in the meantime are re-posted to the new log as it goes live.
    #[instrument(skip_all, fields(path = %self.config.path.display()))]
    pub async fn compact(&self) -> StoreResult<CompactionStats> {
        let _exclusive = self.compaction.lock().await;
        let bytes_before = self.size().await?;

        let snapshot: Vec<(Key, CacheEntry)> = {
            let mut state = self.state.lock().await;
            state.ensure_writable()?;
            state.dirty = Some(HashMap::new());
            state
                .cache
                .iter()
                .map(|(key, entry)| (key.clone(), entry.clone()))
                .collect()
        };

        let rewritten = compaction::rewrite(
            &self.config.path,
            snapshot,
            &self.registry,
            self.config.max_record_size,
        )
        .await;

        let mut state = self.state.lock().await;
        let dirty = state.dirty.take().unwrap_or_default();
        let live_keys = rewritten?;

        // The compacted file is now live; the old writer appends to an unlinked file
        let new_log = match self.reopen_compacted(&state, &dirty).await {
            Ok(log) => Arc::new(log),
            Err(e) => {
                error!(error = %e, "Reopening compacted log failed, refusing further writes");
                state.abandon_log(&e);
                return Err(e);
            }
        };
        let old_log = std::mem::replace(&mut state.log, new_log);
        drop(state);

        if let Err(e) = old_log.close().await {
            warn!(error = %e, "Closing superseded log failed");
        }

        let bytes_after = self.size().await?;
        let stats = CompactionStats::new(live_keys, bytes_before, bytes_after);
        info!(
            live_keys,
            replayed_during = dirty.len(),
            bytes_before,
            bytes_after,
            "Compaction finished"
        );
        Ok(stats)
    }

    /// Open the freshly renamed log and re-post keys touched during the rewrite
    async fn reopen_compacted(
        &self,
        state: &State,
        dirty: &HashMap<Key, TypeTag>,
    ) -> StoreResult<StorageLog> {
        let log =
            StorageLog::open_with_limit(&self.config.path, false, self.config.max_record_size)
                .await?;
        for (key, tag) in dirty {
            match state.cache.get(key) {
                Some(entry) => {
                    log.post(compaction::set_event(&self.registry, key.clone(), entry)?)?
                }
                None => log.post(compaction::delete_event(tag.clone(), key.clone()))?,
            }
        }
        Ok(log)
    }

    /// Flush and close the log; later writes fail with [`StoreError::LogClosed`]
    pub async fn close(&self) -> StoreResult<()> {
        let log = Arc::clone(&self.state.lock().await.log);
        log.close().await
    }

    /// Path of the log file
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Configuration the store was opened with
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Registered value types
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.config.path)
            .field("types", &self.registry.len())
            .field("observed_keys", &self.observers.live())
            .finish()
    }
}
