//! # Burrow Store
//!
//! Embedded, single-process, append-only key/value store.
//!
//! Every mutation is appended to a log file; the current state lives in an
//! in-memory cache rebuilt by replaying that log at open. Values are
//! type-erased in the cache and persisted through caller-registered codecs,
//! each identified by a [`TypeTag`] written alongside the record.
//!
//! ## Features
//!
//! - **Store**: `get`/`set`/`delete` served from the cache, durable writes
//!   queued to a dedicated writer task
//! - **StorageLog**: length-prefixed JSON records, ordered writes, explicit
//!   `flush`, replay that tolerates a torn final record
//! - **Registry**: per-type encoders/decoders chosen by tag on replay
//! - **Compaction**: rewrite the log down to live keys and swap it in atomically
//! - **Observation**: per-key change channels held weakly by the store
//!
//! ## Example
//!
//! ```rust,ignore
//! use burrow_store::{Change, Store};
//!
//! #[tokio::main]
//! async fn main() -> burrow_store::StoreResult<()> {
//!     let store = Store::open("data/cache.log", false, |types| {
//!         types.register_json::<String>();
//!     })
//!     .await?;
//!
//!     let mut changes = store.observe("greeting")?;
//!
//!     store.set("greeting", "hello".to_string()).await?;
//!     let greeting: Option<String> = store.get("greeting").await?;
//!     assert_eq!(greeting.as_deref(), Some("hello"));
//!     assert!(matches!(changes.recv().await, Some(Change::Update(_))));
//!
//!     // Make the write durable
//!     store.flush().await?;
//!     Ok(())
//! }
//! ```

pub mod compaction;
pub mod config;
pub mod error;
pub mod key;
pub mod log;
pub mod observe;
pub mod registry;
mod store;

// Re-exports
pub use compaction::CompactionStats;
pub use config::StoreConfig;
pub use error::{StoreError, StoreResult};
pub use key::Key;
pub use log::{LogEvent, Replay, ReplayedRecord, ScanSummary, StorageLog};
pub use observe::{Change, Observer, ObserverRegistry};
pub use registry::{AnyValue, Codec, Registry, RegistryBuilder, TypeTag};
pub use store::Store;
