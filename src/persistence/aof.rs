//! Append-only file.
//!
//! Each successful SET or HSET is appended as the wire encoding of the
//! request array that carried it. Records are self-delimiting, so the file is
//! just their concatenation:
//!
//! ```text
//! *3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\nbar\r\n*4\r\n$4\r\nHSET\r\n$1\r\nh\r\n...
//! ```
//!
//! At startup the file is replayed from the beginning through the same
//! decoder and command handlers as live traffic. Replay uses a handler with
//! no log attached, so it never appends to the file it is reading.

use crate::commands::{CommandHandler, Request};
use crate::persistence::sync::{sync_file, SyncTask};
use crate::protocol::{ParseError, RespParser, RespValue};
use crate::storage::Store;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Default fsync period.
pub const DEFAULT_FSYNC_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("failed to open AOF {}: {source}", .path.display())]
    Open { path: PathBuf, source: io::Error },

    #[error("AOF write failed: {0}")]
    Write(#[source] io::Error),

    #[error("AOF fsync failed: {0}")]
    Sync(#[source] io::Error),

    #[error("failed to read AOF {}: {source}", .path.display())]
    Read { path: PathBuf, source: io::Error },

    #[error("failed to cut partial record from AOF {}: {source}", .path.display())]
    Truncate { path: PathBuf, source: io::Error },

    #[error("corrupt AOF record at offset {offset}: {source}")]
    Corrupt { offset: usize, source: ParseError },
}

/// Outcome of a replay.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplayStats {
    /// Records dispatched to a handler
    pub applied: usize,
    /// Records skipped (unknown command, bad shape, error reply)
    pub skipped: usize,
    /// Bytes of an incomplete final record, left unapplied
    pub truncated_bytes: usize,
    /// Length of the prefix made of complete records
    pub valid_bytes: usize,
}

/// The append-only log and its fsync task.
pub struct Aof {
    path: PathBuf,
    file: Arc<Mutex<File>>,
    sync_task: Option<SyncTask>,
}

impl Aof {
    /// Opens (creating if needed) the log at `path` and starts the periodic
    /// fsync task. Must be called from within a Tokio runtime.
    pub fn open(path: impl AsRef<Path>, fsync_interval: Duration) -> Result<Self, PersistenceError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| PersistenceError::Open {
                path: path.clone(),
                source,
            })?;

        info!(path = %path.display(), "AOF opened");

        let file = Arc::new(Mutex::new(file));
        let sync_task = SyncTask::start(Arc::clone(&file), fsync_interval);

        Ok(Self {
            path,
            file,
            sync_task: Some(sync_task),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one request frame.
    ///
    /// The bytes reach the OS immediately and stable storage on the next
    /// fsync tick.
    pub fn append(&self, frame: &RespValue) -> Result<(), PersistenceError> {
        let bytes = frame.serialize();
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        file.write_all(&bytes).map_err(PersistenceError::Write)?;
        debug!(bytes = bytes.len(), "AOF record appended");
        Ok(())
    }

    /// Flushes everything appended so far to stable storage.
    pub fn sync(&self) -> Result<(), PersistenceError> {
        sync_file(&self.file).map_err(PersistenceError::Sync)
    }

    /// Rebuilds `store` from the log.
    ///
    /// Appends are held off for the duration of the replay. A partial final
    /// record is cut from the file before appends resume, so the next record
    /// starts on a record boundary.
    pub fn replay(&self, store: Arc<Store>) -> Result<ReplayStats, PersistenceError> {
        let file = self.file.lock().unwrap_or_else(PoisonError::into_inner);

        let data = std::fs::read(&self.path).map_err(|source| PersistenceError::Read {
            path: self.path.clone(),
            source,
        })?;

        let stats = replay_records(&data, &CommandHandler::new(store))?;

        if stats.truncated_bytes > 0 {
            file.set_len(stats.valid_bytes as u64)
                .and_then(|()| file.sync_data())
                .map_err(|source| PersistenceError::Truncate {
                    path: self.path.clone(),
                    source,
                })?;
            warn!(
                path = %self.path.display(),
                len = stats.valid_bytes,
                removed = stats.truncated_bytes,
                "AOF truncated to last complete record"
            );
        }

        info!(
            path = %self.path.display(),
            applied = stats.applied,
            skipped = stats.skipped,
            "AOF replay complete"
        );
        Ok(stats)
    }

    /// Stops the fsync task and performs a final fsync.
    pub async fn shutdown(mut self) -> Result<(), PersistenceError> {
        if let Some(task) = self.sync_task.take() {
            task.stop().await;
        }
        self.sync()
    }
}

/// Decodes and dispatches every record in `data`, in order.
///
/// A trailing partial record (a crash in the middle of an append) is
/// reported in the stats and ignored. Bytes that can never decode are fatal.
pub fn replay_records(data: &[u8], handler: &CommandHandler) -> Result<ReplayStats, PersistenceError> {
    let mut parser = RespParser::new();
    let mut stats = ReplayStats::default();
    let mut offset = 0;

    while offset < data.len() {
        let (frame, used) = match parser.parse(&data[offset..]) {
            Ok(Some(parsed)) => parsed,
            Ok(None) => {
                stats.truncated_bytes = data.len() - offset;
                warn!(
                    offset,
                    bytes = stats.truncated_bytes,
                    "ignoring truncated record at end of AOF"
                );
                break;
            }
            Err(source) => return Err(PersistenceError::Corrupt { offset, source }),
        };

        match Request::from_frame(frame) {
            Ok(request) if request.command().is_some() => {
                let reply = handler.execute(&request);
                if reply.is_error() {
                    warn!(offset, command = %request.name(), reply = %reply, "AOF record rejected");
                    stats.skipped += 1;
                } else {
                    stats.applied += 1;
                }
            }
            Ok(request) => {
                warn!(offset, command = %request.name(), "skipping unknown command in AOF");
                stats.skipped += 1;
            }
            Err(e) => {
                warn!(offset, error = %e, "skipping malformed AOF record");
                stats.skipped += 1;
            }
        }

        offset += used;
    }

    stats.valid_bytes = offset;
    Ok(stats)
}
