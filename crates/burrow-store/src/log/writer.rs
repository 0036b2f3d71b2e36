//! Log writer
//!
//! A [`StorageLog`] owns its file through a dedicated background task. Callers
//! post closures that produce events; the task runs them strictly in post
//! order, frames the result and appends it with a single write.

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace};

use super::LENGTH_PREFIX;
use super::event::LogEvent;
use super::reader::DEFAULT_MAX_RECORD_SIZE;
use crate::error::{StoreError, StoreResult};

type EventFactory = Box<dyn FnOnce() -> StoreResult<LogEvent> + Send>;

enum Command {
    Append(EventFactory),
    Flush(oneshot::Sender<StoreResult<()>>),
    Close(oneshot::Sender<StoreResult<()>>),
}

/// Durable, ordered append-only log backed by a single file
///
/// Writes are asynchronous: [`post`](Self::post) returns as soon as the event
/// is queued. Call [`flush`](Self::flush) to wait until everything queued so
/// far has been written and synced.
///
/// If a background write fails the log is poisoned: the failure is logged,
/// later posts and flushes return [`StoreError::LogFailed`], and nothing
/// further is appended.
#[derive(Debug)]
pub struct StorageLog {
    path: PathBuf,
    tx: mpsc::UnboundedSender<Command>,
    failure: Arc<OnceLock<String>>,
}

impl StorageLog {
    /// Open (or create) the log at `path` in append mode
    ///
    /// With `new_session` set, a [`LogEvent::Session`] marker is queued as the
    /// first write. Must be called from within a tokio runtime.
    pub async fn open(path: impl AsRef<Path>, new_session: bool) -> StoreResult<Self> {
        Self::open_with_limit(path, new_session, DEFAULT_MAX_RECORD_SIZE).await
    }

    /// Open with an explicit maximum record size
    ///
    /// A record whose payload exceeds `max_record_size` is never written; it
    /// poisons the log instead, since replay would refuse it.
    pub async fn open_with_limit(
        path: impl AsRef<Path>,
        new_session: bool,
        max_record_size: u64,
    ) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| StoreError::io(format!("open {}: {}", path.display(), e)))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let failure = Arc::new(OnceLock::new());

        tokio::spawn(run_writer(
            path.clone(),
            file,
            max_record_size,
            rx,
            Arc::clone(&failure),
        ));

        info!(path = %path.display(), new_session, "Opened storage log");

        let log = Self { path, tx, failure };
        if new_session {
            log.post(|| Ok(LogEvent::session()))?;
        }
        Ok(log)
    }

    /// Queue an event for writing
    ///
    /// The factory runs later on the writer task. Events are written in the
    /// order they were posted, regardless of which task posted them.
    pub fn post<F>(&self, factory: F) -> StoreResult<()>
    where
        F: FnOnce() -> StoreResult<LogEvent> + Send + 'static,
    {
        if let Some(reason) = self.failure.get() {
            return Err(StoreError::LogFailed(reason.clone()));
        }
        self.tx
            .send(Command::Append(Box::new(factory)))
            .map_err(|_| StoreError::LogClosed)
    }

    /// Wait for every queued write, then sync the file to disk
    pub async fn flush(&self) -> StoreResult<()> {
        let (reply, done) = oneshot::channel();
        self.tx
            .send(Command::Flush(reply))
            .map_err(|_| StoreError::LogClosed)?;
        done.await.map_err(|_| StoreError::LogClosed)?
    }

    /// Flush and close the file
    ///
    /// Closing an already closed log is a no-op.
    pub async fn close(&self) -> StoreResult<()> {
        let (reply, done) = oneshot::channel();
        if self.tx.send(Command::Close(reply)).is_err() {
            return Ok(());
        }
        done.await.unwrap_or(Ok(()))
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the writer task has shut down
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Reason the writer failed, if it has
    pub fn failure(&self) -> Option<&str> {
        self.failure.get().map(String::as_str)
    }

    /// Refuse all further writes, keeping the first recorded failure
    pub(crate) fn poison(&self, reason: impl Into<String>) {
        let _ = self.failure.set(reason.into());
    }
}

async fn run_writer(
    path: PathBuf,
    mut file: File,
    max_record_size: u64,
    mut rx: mpsc::UnboundedReceiver<Command>,
    failure: Arc<OnceLock<String>>,
) {
    let mut appended = 0u64;

    while let Some(command) = rx.recv().await {
        match command {
            Command::Append(factory) => {
                if failure.get().is_some() {
                    continue;
                }
                match append(&mut file, factory, max_record_size).await {
                    Ok(written) => {
                        appended += 1;
                        trace!(bytes = written, "Appended log record");
                    }
                    Err(e) => {
                        error!(
                            path = %path.display(),
                            error = %e,
                            "Log write failed, refusing further writes"
                        );
                        let _ = failure.set(e.to_string());
                    }
                }
            }
            Command::Flush(reply) => {
                let _ = reply.send(sync(&mut file, &failure).await);
            }
            Command::Close(reply) => {
                let result = sync(&mut file, &failure).await;
                let _ = reply.send(result);
                break;
            }
        }
    }

    debug!(path = %path.display(), appended, "Log writer stopped");
}

async fn append(file: &mut File, factory: EventFactory, limit: u64) -> StoreResult<usize> {
    let frame = factory()?.to_frame()?;
    let size = (frame.len() - LENGTH_PREFIX) as u64;
    if size > limit {
        return Err(StoreError::RecordTooLarge { size, limit });
    }
    file.write_all(&frame).await?;
    file.flush().await?;
    Ok(frame.len())
}

async fn sync(file: &mut File, failure: &OnceLock<String>) -> StoreResult<()> {
    if let Some(reason) = failure.get() {
        return Err(StoreError::LogFailed(reason.clone()));
    }
    file.flush().await?;
    file.sync_data().await?;
    Ok(())
}
