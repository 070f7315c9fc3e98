//! Serialized write queue for the registry database.
//!
//! All registry writes in the process go through one worker thread, so the
//! shared SQLite file sees a single writer per user. Ops are committed in
//! batches (one transaction per batch) to keep the lock window short; a
//! failed batch is replayed item by item so one bad op cannot sink its
//! neighbours.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use rusqlite::Connection;

use crate::db::{self, DbError};
use crate::error::WorkerError;

/// Maximum ops committed in one transaction.
const MAX_BATCH_SIZE: usize = 50;
/// Maximum time the worker waits to fill a batch once it holds an op.
const MAX_BATCH_WINDOW: Duration = Duration::from_secs(1);
/// Queue capacity; submitters block briefly when the worker falls behind.
const QUEUE_CAPACITY: usize = 256;

/// One queued registry operation. The closure must be replayable: a batch
/// that fails is retried item by item.
pub struct RegistryOp {
    apply: Box<dyn Fn(&Connection) -> Result<(), DbError> + Send>,
    ack: Sender<Result<(), DbError>>,
    label: &'static str,
}

enum Command {
    Op(RegistryOp),
    Flush(Sender<()>),
}

/// Handle to the single write worker.
pub struct WriteQueue {
    sender: Sender<Command>,
    worker: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl WriteQueue {
    /// Spawns the worker against the registry DB at `db_path`.
    pub fn new(db_path: PathBuf) -> Self {
        let (sender, receiver) = bounded::<Command>(QUEUE_CAPACITY);
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);

        let worker = thread::Builder::new()
            .name("registry-writer".to_string())
            .spawn(move || run_worker(db_path, receiver, flag))
            .ok();
        if worker.is_none() {
            log::error!("Failed to spawn registry write worker");
        }

        Self {
            sender,
            worker,
            shutdown,
        }
    }

    /// Enqueues an op and returns the ack receiver. The op runs inside a
    /// batch transaction on the worker thread.
    pub fn submit<F>(&self, label: &'static str, apply: F) -> Result<Receiver<Result<(), DbError>>, WorkerError>
    where
        F: Fn(&Connection) -> Result<(), DbError> + Send + 'static,
    {
        if self.shutdown.load(Ordering::Relaxed) {
            return Err(WorkerError::ChannelClosed);
        }
        let (ack_tx, ack_rx) = bounded(1);
        let op = RegistryOp {
            apply: Box::new(apply),
            ack: ack_tx,
            label,
        };
        self.sender
            .send(Command::Op(op))
            .map_err(|_| WorkerError::ChannelClosed)?;
        Ok(ack_rx)
    }

    /// Enqueues an op and blocks until it is committed or fails.
    pub fn submit_wait<F>(&self, label: &'static str, apply: F) -> Result<(), DbError>
    where
        F: Fn(&Connection) -> Result<(), DbError> + Send + 'static,
    {
        let ack = self
            .submit(label, apply)
            .map_err(|_| DbError::LockPoisoned)?;
        match ack.recv() {
            Ok(result) => result,
            Err(_) => Err(DbError::LockPoisoned),
        }
    }

    /// Waits until everything queued before the call has been committed.
    pub fn flush(&self, timeout: Duration) -> Result<(), WorkerError> {
        let (done_tx, done_rx) = bounded(1);
        self.sender
            .send(Command::Flush(done_tx))
            .map_err(|_| WorkerError::ChannelClosed)?;
        done_rx
            .recv_timeout(timeout)
            .map_err(|_| WorkerError::FlushTimeout(timeout))
    }

    /// Ops waiting in the channel (excludes the batch currently committing).
    pub fn pending(&self) -> usize {
        self.sender.len()
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Signals shutdown and joins the worker. Queued ops are drained first;
    /// the worker exits once the channel is empty and the flag is set.
    pub fn wait(mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                log::error!("Registry write worker panicked");
            }
        }
    }
}

impl Drop for WriteQueue {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

fn run_worker(db_path: PathBuf, receiver: Receiver<Command>, shutdown: Arc<AtomicBool>) {
    log::debug!("Registry write worker started for {}", db_path.display());

    loop {
        let first = match receiver.recv_timeout(Duration::from_millis(100)) {
            Ok(cmd) => cmd,
            Err(RecvTimeoutError::Timeout) => {
                if shutdown.load(Ordering::Relaxed) && receiver.is_empty() {
                    break;
                }
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        };

        let mut batch = Vec::new();
        let mut flushes = Vec::new();
        match first {
            Command::Op(op) => batch.push(op),
            Command::Flush(done) => flushes.push(done),
        }

        // Fill the batch for up to one window, but never past the cap.
        let window_start = Instant::now();
        while batch.len() < MAX_BATCH_SIZE {
            let remaining = MAX_BATCH_WINDOW.saturating_sub(window_start.elapsed());
            if remaining.is_zero() {
                break;
            }
            match receiver.recv_timeout(remaining.min(Duration::from_millis(50))) {
                Ok(Command::Op(op)) => batch.push(op),
                Ok(Command::Flush(done)) => flushes.push(done),
                Err(RecvTimeoutError::Timeout) => {
                    if batch.is_empty() {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
            if batch.is_empty() && !flushes.is_empty() {
                // A bare flush has nothing to wait for.
                break;
            }
        }

        if !batch.is_empty() {
            commit_batch(&db_path, batch);
        }
        for done in flushes {
            let _ = done.send(());
        }
    }

    db::close_connection_after_use();
    log::debug!("Registry write worker stopped");
}

/// Commits a batch in one transaction; on failure replays each op in its
/// own transaction so independent ops still land. Every op is acked with
/// its individual outcome either way.
fn commit_batch(db_path: &std::path::Path, batch: Vec<RegistryOp>) {
    let all = db::with_write_retry(|| {
        let database = db::get_connection(db_path)?;
        database.with_transaction(|conn| {
            for op in &batch {
                (op.apply)(conn)?;
            }
            Ok(())
        })
    });

    match all {
        Ok(()) => {
            log::debug!("Committed write batch of {}", batch.len());
            for op in batch {
                let _ = op.ack.send(Ok(()));
            }
        }
        Err(batch_err) => {
            log::warn!(
                "Write batch of {} failed ({}), replaying item by item",
                batch.len(),
                batch_err
            );
            for op in batch {
                let result = db::with_write_retry(|| {
                    let database = db::get_connection(db_path)?;
                    database.with_transaction(|conn| (op.apply)(conn))
                });
                if let Err(e) = &result {
                    log::error!("Write op '{}' failed: {}", op.label, e);
                }
                let _ = op.ack.send(result);
            }
        }
    }

    // Readers must not serve the pre-commit snapshot.
    db::read_cache::invalidate();
    db::close_connection_after_use();
}
