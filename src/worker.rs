//! Background persistence worker.
//!
//! The worker runs on a dedicated OS thread and is the only owner of the stored
//! name and the only code that touches the image file. Callers talk to it through
//! [`WorkerClient`]; every read carries its own reply channel.

use std::{
    sync::mpsc::{self, RecvTimeoutError},
    thread,
    time::{Duration, Instant},
};

use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::snapshot::{DEFAULT_NAME, SnapshotFile};

pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

const WORKER_THREAD_NAME: &str = "namestore-persist";

#[derive(Debug)]
pub(crate) enum Command {
    Read { reply: oneshot::Sender<String> },
    Write { value: String },
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub flush_interval: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            flush_interval: DEFAULT_FLUSH_INTERVAL,
        }
    }
}

/// Returned when the worker thread is no longer receiving commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStopped;

impl std::fmt::Display for WorkerStopped {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "persistence worker has stopped")
    }
}

impl std::error::Error for WorkerStopped {}

#[derive(Debug, Clone)]
pub struct WorkerClient {
    tx: mpsc::Sender<Command>,
}

impl WorkerClient {
    #[cfg(test)]
    pub(crate) fn detached() -> (Self, mpsc::Receiver<Command>) {
        let (tx, rx) = mpsc::channel();
        (Self { tx }, rx)
    }

    /// Fire-and-forget. A later submission supersedes this one if both are
    /// still pending when the worker wakes up.
    pub fn submit_write(&self, value: String) -> Result<(), WorkerStopped> {
        self.tx
            .send(Command::Write { value })
            .map_err(|_| WorkerStopped)
    }

    pub fn request_read(&self) -> Result<oneshot::Receiver<String>, WorkerStopped> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Read { reply })
            .map_err(|_| WorkerStopped)?;
        Ok(rx)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    pub name: String,
    /// False when the final flush failed and the last change exists only in memory.
    pub persisted: bool,
}

pub struct WorkerHandle {
    client: WorkerClient,
    join: Option<thread::JoinHandle<ShutdownReport>>,
}

impl WorkerHandle {
    pub fn client(&self) -> WorkerClient {
        self.client.clone()
    }

    /// Stops the loop after the commands already queued, flushes if dirty and
    /// joins the thread.
    pub fn shutdown(mut self) -> anyhow::Result<ShutdownReport> {
        self.stop_and_join()
    }

    fn stop_and_join(&mut self) -> anyhow::Result<ShutdownReport> {
        let Some(join) = self.join.take() else {
            anyhow::bail!("persistence worker already joined");
        };
        let _ = self.client.tx.send(Command::Shutdown);
        join.join()
            .map_err(|_| anyhow::anyhow!("persistence worker thread panicked"))
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if self.join.is_some()
            && let Err(err) = self.stop_and_join()
        {
            warn!(%err, "persistence worker did not stop cleanly");
        }
    }
}

pub fn spawn_worker(file: SnapshotFile, options: WorkerOptions) -> anyhow::Result<WorkerHandle> {
    let (tx, rx) = mpsc::channel();
    let join = thread::Builder::new()
        .name(WORKER_THREAD_NAME.to_string())
        .spawn(move || {
            let worker = PersistenceWorker::load(file, options.flush_interval, Instant::now());
            worker.run(rx)
        })?;

    Ok(WorkerHandle {
        client: WorkerClient { tx },
        join: Some(join),
    })
}

/// Pending writes collapse to the most recent one; there is no merge function
/// for a single string, so older intents are dropped.
#[derive(Debug, Default)]
struct PendingWrite {
    latest: Option<String>,
    superseded: usize,
}

impl PendingWrite {
    fn push(&mut self, value: String) {
        if self.latest.replace(value).is_some() {
            self.superseded += 1;
        }
    }
}

#[derive(Debug, Default)]
struct Batch {
    reads: Vec<oneshot::Sender<String>>,
    write: PendingWrite,
    shutdown: bool,
}

impl Batch {
    fn add(&mut self, cmd: Command) {
        match cmd {
            Command::Read { reply } => self.reads.push(reply),
            Command::Write { value } => self.write.push(value),
            Command::Shutdown => self.shutdown = true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushOutcome {
    Clean,
    NotDue,
    Committed,
    Failed,
}

struct PersistenceWorker {
    file: SnapshotFile,
    name: String,
    dirty: bool,
    last_flush_attempt: Instant,
    flush_interval: Duration,
}

impl PersistenceWorker {
    fn load(file: SnapshotFile, flush_interval: Duration, now: Instant) -> Self {
        let name = match file.load() {
            Ok(Some(snapshot)) => {
                info!(path = %file.path().display(), "loaded persisted name");
                snapshot.name
            }
            Ok(None) => {
                debug!(path = %file.path().display(), "no persisted name; using default");
                DEFAULT_NAME.to_string()
            }
            Err(err) => {
                warn!(
                    %err,
                    path = %file.path().display(),
                    "persisted name unreadable; using default"
                );
                DEFAULT_NAME.to_string()
            }
        };

        Self {
            file,
            name,
            dirty: false,
            last_flush_attempt: now,
            flush_interval,
        }
    }

    fn flush_deadline(&self) -> Option<Instant> {
        self.dirty
            .then(|| self.last_flush_attempt + self.flush_interval)
    }

    fn run(mut self, rx: mpsc::Receiver<Command>) -> ShutdownReport {
        loop {
            let first = match self.flush_deadline() {
                Some(deadline) => {
                    match rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
                        Ok(cmd) => Some(cmd),
                        Err(RecvTimeoutError::Timeout) => None,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                None => match rx.recv() {
                    Ok(cmd) => Some(cmd),
                    Err(_) => break,
                },
            };

            let mut batch = Batch::default();
            if let Some(cmd) = first {
                batch.add(cmd);
                while let Ok(cmd) = rx.try_recv() {
                    batch.add(cmd);
                }
            }

            let shutdown = batch.shutdown;
            self.apply(batch);
            self.flush_if_due(Instant::now());

            if shutdown {
                break;
            }
        }

        self.finish()
    }

    /// Reads are answered before the write is installed, so every reply holds a
    /// value that was current at some point.
    fn apply(&mut self, batch: Batch) {
        for reply in batch.reads {
            if reply.send(self.name.clone()).is_err() {
                debug!("read requester went away before reply");
            }
        }

        if let Some(value) = batch.write.latest {
            debug!(
                len = value.len(),
                superseded = batch.write.superseded,
                "installing latest pending write"
            );
            self.name = value;
            self.dirty = true;
        }
    }

    fn flush_if_due(&mut self, now: Instant) -> FlushOutcome {
        if !self.dirty {
            return FlushOutcome::Clean;
        }
        if now.saturating_duration_since(self.last_flush_attempt) < self.flush_interval {
            return FlushOutcome::NotDue;
        }
        self.last_flush_attempt = now;
        self.flush()
    }

    fn flush(&mut self) -> FlushOutcome {
        match self.file.save(&self.name) {
            Ok(()) => {
                self.dirty = false;
                info!(path = %self.file.path().display(), "committed changes to disk");
                FlushOutcome::Committed
            }
            Err(err) => {
                warn!(
                    %err,
                    path = %self.file.path().display(),
                    "flush failed; will retry next interval"
                );
                FlushOutcome::Failed
            }
        }
    }

    fn finish(mut self) -> ShutdownReport {
        if self.dirty {
            self.flush();
        }
        debug!(persisted = !self.dirty, "persistence worker stopped");
        ShutdownReport {
            persisted: !self.dirty,
            name: self.name,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::snapshot::SNAPSHOT_FILE_NAME;

    const INTERVAL: Duration = Duration::from_secs(5);

    fn worker_in(dir: &std::path::Path, now: Instant) -> PersistenceWorker {
        PersistenceWorker::load(SnapshotFile::new(dir.join(SNAPSHOT_FILE_NAME)), INTERVAL, now)
    }

    fn on_disk(dir: &std::path::Path) -> Option<String> {
        SnapshotFile::new(dir.join(SNAPSHOT_FILE_NAME))
            .load()
            .unwrap()
            .map(|s| s.name)
    }

    fn write(value: &str) -> Command {
        Command::Write {
            value: value.to_string(),
        }
    }

    #[test]
    fn load_defaults_when_no_image_exists() {
        let tmp = tempfile::tempdir().unwrap();
        let worker = worker_in(tmp.path(), Instant::now());
        assert_eq!(worker.name, "Default");
        assert!(!worker.dirty);
    }

    #[test]
    fn load_defaults_when_image_is_corrupt() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join(SNAPSHOT_FILE_NAME), b"garbage").unwrap();
        let worker = worker_in(tmp.path(), Instant::now());
        assert_eq!(worker.name, "Default");
    }

    #[test]
    fn load_uses_persisted_image() {
        let tmp = tempfile::tempdir().unwrap();
        SnapshotFile::new(tmp.path().join(SNAPSHOT_FILE_NAME))
            .save("alice")
            .unwrap();
        let worker = worker_in(tmp.path(), Instant::now());
        assert_eq!(worker.name, "alice");
    }

    #[test]
    fn pending_writes_collapse_to_latest() {
        let tmp = tempfile::tempdir().unwrap();
        let mut worker = worker_in(tmp.path(), Instant::now());

        let mut batch = Batch::default();
        batch.add(write("v1"));
        batch.add(write("v2"));
        batch.add(write("v3"));
        assert_eq!(batch.write.superseded, 2);

        worker.apply(batch);
        assert_eq!(worker.name, "v3");
        assert!(worker.dirty);
    }

    #[test]
    fn reads_in_a_batch_see_value_before_install() {
        let tmp = tempfile::tempdir().unwrap();
        let mut worker = worker_in(tmp.path(), Instant::now());

        let (reply, mut rx) = oneshot::channel();
        let mut batch = Batch::default();
        batch.add(write("new"));
        batch.add(Command::Read { reply });
        worker.apply(batch);

        assert_eq!(rx.try_recv().unwrap(), "Default");
        assert_eq!(worker.name, "new");
    }

    #[test]
    fn reads_without_writes_are_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let mut worker = worker_in(tmp.path(), Instant::now());

        let (a, mut rx_a) = oneshot::channel();
        let (b, mut rx_b) = oneshot::channel();
        let mut batch = Batch::default();
        batch.add(Command::Read { reply: a });
        worker.apply(batch);
        let mut batch = Batch::default();
        batch.add(Command::Read { reply: b });
        worker.apply(batch);

        assert_eq!(rx_a.try_recv().unwrap(), rx_b.try_recv().unwrap());
        assert!(!worker.dirty);
    }

    #[test]
    fn dropped_read_requester_does_not_disturb_worker() {
        let tmp = tempfile::tempdir().unwrap();
        let mut worker = worker_in(tmp.path(), Instant::now());

        let (reply, rx) = oneshot::channel();
        drop(rx);
        let mut batch = Batch::default();
        batch.add(Command::Read { reply });
        batch.add(write("after"));
        worker.apply(batch);

        assert_eq!(worker.name, "after");
    }

    #[test]
    fn flush_waits_for_interval() {
        let tmp = tempfile::tempdir().unwrap();
        let start = Instant::now();
        let mut worker = worker_in(tmp.path(), start);

        let mut batch = Batch::default();
        batch.add(write("alice"));
        worker.apply(batch);

        assert_eq!(
            worker.flush_if_due(start + Duration::from_secs(1)),
            FlushOutcome::NotDue
        );
        assert_eq!(on_disk(tmp.path()), None);
        assert_eq!(worker.flush_deadline(), Some(start + INTERVAL));

        assert_eq!(worker.flush_if_due(start + INTERVAL), FlushOutcome::Committed);
        assert_eq!(on_disk(tmp.path()).as_deref(), Some("alice"));
        assert!(!worker.dirty);
        assert_eq!(worker.flush_deadline(), None);
        assert_eq!(worker.flush_if_due(start + INTERVAL * 3), FlushOutcome::Clean);
    }

    #[test]
    fn burst_of_writes_produces_one_flush() {
        let tmp = tempfile::tempdir().unwrap();
        let start = Instant::now();
        let mut worker = worker_in(tmp.path(), start);

        for (i, value) in ["a", "b", "c"].into_iter().enumerate() {
            let mut batch = Batch::default();
            batch.add(write(value));
            worker.apply(batch);
            let at = start + Duration::from_secs(i as u64);
            assert_eq!(worker.flush_if_due(at), FlushOutcome::NotDue);
        }

        assert_eq!(worker.flush_if_due(start + INTERVAL), FlushOutcome::Committed);
        assert_eq!(on_disk(tmp.path()).as_deref(), Some("c"));
    }

    #[test]
    fn failed_flush_keeps_dirty_and_retries_next_interval() {
        let tmp = tempfile::tempdir().unwrap();
        let start = Instant::now();
        let image = tmp.path().join(SNAPSHOT_FILE_NAME);
        fs::create_dir(&image).unwrap();
        let mut worker = worker_in(tmp.path(), start);
        assert_eq!(worker.name, "Default");

        let mut batch = Batch::default();
        batch.add(write("alice"));
        worker.apply(batch);

        assert_eq!(worker.flush_if_due(start + INTERVAL), FlushOutcome::Failed);
        assert!(worker.dirty);
        assert_eq!(worker.flush_deadline(), Some(start + INTERVAL * 2));

        fs::remove_dir(&image).unwrap();
        assert_eq!(
            worker.flush_if_due(start + INTERVAL + Duration::from_secs(1)),
            FlushOutcome::NotDue
        );
        assert_eq!(worker.flush_if_due(start + INTERVAL * 2), FlushOutcome::Committed);
        assert_eq!(on_disk(tmp.path()).as_deref(), Some("alice"));
    }

    #[test]
    fn spawned_worker_serves_reads_and_writes() {
        let tmp = tempfile::tempdir().unwrap();
        let handle = spawn_worker(
            SnapshotFile::new(tmp.path().join(SNAPSHOT_FILE_NAME)),
            WorkerOptions::default(),
        )
        .unwrap();
        let client = handle.client();

        assert_eq!(
            client.request_read().unwrap().blocking_recv().unwrap(),
            "Default"
        );

        client.submit_write("bob".to_string()).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let value = client.request_read().unwrap().blocking_recv().unwrap();
            if value == "bob" {
                break;
            }
            assert_eq!(value, "Default");
            assert!(Instant::now() < deadline, "write was never installed");
            thread::sleep(Duration::from_millis(5));
        }

        assert_eq!(on_disk(tmp.path()), None);
        let report = handle.shutdown().unwrap();
        assert_eq!(
            report,
            ShutdownReport {
                name: "bob".to_string(),
                persisted: true,
            }
        );
        assert_eq!(on_disk(tmp.path()).as_deref(), Some("bob"));
    }

    #[test]
    fn spawned_worker_flushes_on_its_own_after_interval() {
        let tmp = tempfile::tempdir().unwrap();
        let handle = spawn_worker(
            SnapshotFile::new(tmp.path().join(SNAPSHOT_FILE_NAME)),
            WorkerOptions {
                flush_interval: Duration::from_millis(50),
            },
        )
        .unwrap();
        let client = handle.client();

        client.submit_write("carol".to_string()).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while on_disk(tmp.path()).as_deref() != Some("carol") {
            assert!(Instant::now() < deadline, "image was never flushed");
            thread::sleep(Duration::from_millis(10));
        }

        drop(handle);
    }

    #[test]
    fn client_reports_stopped_worker() {
        let tmp = tempfile::tempdir().unwrap();
        let handle = spawn_worker(
            SnapshotFile::new(tmp.path().join(SNAPSHOT_FILE_NAME)),
            WorkerOptions::default(),
        )
        .unwrap();
        let client = handle.client();
        let report = handle.shutdown().unwrap();
        assert!(report.persisted);

        assert_eq!(client.submit_write("late".to_string()), Err(WorkerStopped));
        assert!(client.request_read().is_err());
    }
}
