//! Periodic fsync of the append-only file.
//!
//! Appends only reach the OS page cache. This task flushes them to stable
//! storage on a fixed interval, bounding what a crash can lose to roughly one
//! interval of writes without paying for an fsync per command.
//!
//! The task belongs to its `Aof`: it is started by `Aof::open`, stopped and
//! joined by `Aof::shutdown`, and signalled to stop if the `Aof` is dropped.

use std::fs::File;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace};

/// Smallest accepted fsync period.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Handle to the running fsync task.
#[derive(Debug)]
pub struct SyncTask {
    shutdown_tx: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl SyncTask {
    /// Spawns the task on the current Tokio runtime.
    pub(crate) fn start(file: Arc<Mutex<File>>, interval: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let interval = interval.max(MIN_INTERVAL);

        let handle = tokio::spawn(sync_loop(file, interval, shutdown_rx));
        info!(interval_ms = interval.as_millis() as u64, "AOF fsync task started");

        Self {
            shutdown_tx,
            handle: Some(handle),
        }
    }

    /// Signals the task and waits for it to finish.
    pub async fn stop(mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "AOF fsync task ended abnormally");
            }
        }
        info!("AOF fsync task stopped");
    }
}

impl Drop for SyncTask {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Flushes file data to stable storage under the file lock.
pub(crate) fn sync_file(file: &Mutex<File>) -> io::Result<()> {
    file.lock().unwrap_or_else(PoisonError::into_inner).sync_data()
}

async fn sync_loop(
    file: Arc<Mutex<File>>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // the first tick completes immediately

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    debug!("AOF fsync task received shutdown signal");
                    return;
                }
            }
        }

        let file = Arc::clone(&file);
        match tokio::task::spawn_blocking(move || sync_file(&file)).await {
            Ok(Ok(())) => trace!("AOF synced"),
            Ok(Err(e)) => error!(error = %e, "AOF fsync failed"),
            Err(e) => error!(error = %e, "AOF fsync task panicked"),
        }
    }
}
