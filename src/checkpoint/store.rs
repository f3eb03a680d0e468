// SPDX-License-Identifier: Apache-2.0

//! Buffered, crash-tolerant checkpoint store.
//!
//! A single background writer task owns the checkpoint map. Workers send
//! updates through a cloneable [`CheckpointHandle`]; the writer applies them in
//! arrival order and flushes the whole map to disk when either enough updates
//! have accumulated or the flush interval elapses. [`CheckpointStore::shutdown`]
//! performs the final flush and must only be called once no worker can persist
//! anymore.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use flume::{Receiver, Sender};
use tokio::select;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::checkpoint::json_file::{ensure_parent_dir, load_state, write_state};
use crate::checkpoint::schema::{PERSISTED_STATE_VERSION, PersistedStateV1, SourceCheckpoint};
use crate::error::{Error, Result};

/// Default number of buffered updates that triggers a flush
pub const DEFAULT_FLUSH_MAX_UPDATES: usize = 10;

/// Default maximum time between flushes of pending updates
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// Configuration for the checkpoint store
#[derive(Debug, Clone)]
pub struct CheckpointConfig {
    /// Location of the checkpoint file
    pub path: PathBuf,
    /// Number of pending updates that forces a flush
    pub flush_max_updates: usize,
    /// Maximum time pending updates stay in memory
    pub flush_interval: Duration,
    /// Duration of consecutive flush failures after which failures are logged as errors
    pub max_flush_failure_duration: Duration,
    /// Capacity of the update channel between workers and the writer
    pub channel_size: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("checkpoints.json"),
            flush_max_updates: DEFAULT_FLUSH_MAX_UPDATES,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            max_flush_failure_duration: Duration::from_secs(60),
            channel_size: 1024,
        }
    }
}

enum CheckpointCommand {
    Update {
        source: String,
        checkpoint: SourceCheckpoint,
    },
    Shutdown,
}

/// Cloneable handle used by workers to record checkpoint updates.
#[derive(Clone)]
pub struct CheckpointHandle {
    tx: Sender<CheckpointCommand>,
}

impl CheckpointHandle {
    /// Record that `source` has been delivered up to `record_number`.
    ///
    /// The update is buffered by the writer and reaches disk on the next flush.
    /// Fails only once the store has shut down.
    pub async fn persist(
        &self,
        source: &str,
        record_number: u64,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        let cmd = CheckpointCommand::Update {
            source: source.to_string(),
            checkpoint: SourceCheckpoint::new(record_number, timestamp),
        };
        self.tx.send_async(cmd).await.map_err(|_| Error::ChannelSend)
    }
}

/// Owner of the checkpoint file and its background writer.
pub struct CheckpointStore {
    path: PathBuf,
    states: HashMap<String, SourceCheckpoint>,
    handle: CheckpointHandle,
    writer: JoinHandle<Result<()>>,
}

impl CheckpointStore {
    /// Read existing state and start the background writer.
    ///
    /// Must be called from within a tokio runtime. Errors here are fatal for the
    /// agent: without a readable store, delivery positions cannot be trusted.
    pub fn open(config: CheckpointConfig) -> Result<Self> {
        if config.flush_max_updates == 0 {
            return Err(Error::Config(
                "checkpoint flush update threshold must be at least 1".to_string(),
            ));
        }
        if config.flush_interval.is_zero() {
            return Err(Error::Config(
                "checkpoint flush interval must be greater than zero".to_string(),
            ));
        }

        let states = load_state(&config.path)?
            .map(|state| state.sources)
            .unwrap_or_default();
        ensure_parent_dir(&config.path)?;

        info!(
            path = %config.path.display(),
            sources = states.len(),
            "State will be read from and persisted to checkpoint file"
        );

        let (tx, rx) = flume::bounded(config.channel_size.max(1));
        let writer = CheckpointWriter::new(config.clone(), states.clone(), rx);
        let writer = tokio::spawn(writer.run());

        Ok(Self {
            path: config.path,
            states,
            handle: CheckpointHandle { tx },
            writer,
        })
    }

    /// Checkpoints as they were persisted when the store was opened.
    pub fn load(&self) -> HashMap<String, SourceCheckpoint> {
        self.states.clone()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn handle(&self) -> CheckpointHandle {
        self.handle.clone()
    }

    /// Flush buffered updates and stop the writer.
    pub async fn shutdown(self) -> Result<()> {
        debug!("Shutting down checkpoint store");

        // The writer only exits on this command (or once every handle is
        // dropped), so a failed send means it is already gone.
        let _ = self.handle.tx.send_async(CheckpointCommand::Shutdown).await;
        drop(self.handle);

        match self.writer.await {
            Ok(res) => res,
            Err(e) => Err(Error::Persistence(format!(
                "checkpoint writer task failed: {}",
                e
            ))),
        }
    }
}

/// Background task applying updates and flushing them to disk.
struct CheckpointWriter {
    config: CheckpointConfig,
    states: HashMap<String, SourceCheckpoint>,
    rx: Receiver<CheckpointCommand>,
    /// Updates applied since the last successful flush
    pending: usize,
    /// When the current run of flush failures started
    flush_first_failure: Option<Instant>,
}

impl CheckpointWriter {
    fn new(
        config: CheckpointConfig,
        states: HashMap<String, SourceCheckpoint>,
        rx: Receiver<CheckpointCommand>,
    ) -> Self {
        Self {
            config,
            states,
            rx,
            pending: 0,
            flush_first_failure: None,
        }
    }

    async fn run(mut self) -> Result<()> {
        let period = self.config.flush_interval;
        let mut flush_timer = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        flush_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                biased;

                _ = flush_timer.tick() => {
                    if self.pending > 0 {
                        debug!(pending = self.pending, "Flush interval elapsed");
                        self.flush();
                    }
                }

                cmd = self.rx.recv_async() => {
                    match cmd {
                        Ok(CheckpointCommand::Update { source, checkpoint }) => {
                            self.apply(source, checkpoint);
                            // While failing, retries are left to the timer.
                            if self.pending >= self.config.flush_max_updates
                                && self.flush_first_failure.is_none()
                            {
                                self.flush();
                                flush_timer.reset();
                            }
                        }
                        Ok(CheckpointCommand::Shutdown) => {
                            debug!("Checkpoint writer received shutdown");
                            break;
                        }
                        Err(_) => {
                            debug!("All checkpoint handles dropped, stopping writer");
                            break;
                        }
                    }
                }
            }
        }

        while let Ok(cmd) = self.rx.try_recv() {
            if let CheckpointCommand::Update { source, checkpoint } = cmd {
                self.apply(source, checkpoint);
            }
        }

        if self.pending == 0 {
            debug!("No pending checkpoint updates at shutdown");
            return Ok(());
        }

        match self.write() {
            Ok(()) => {
                info!(
                    sources = self.states.len(),
                    "Final checkpoint completed successfully"
                );
                Ok(())
            }
            Err(e) => {
                error!(
                    pending = self.pending,
                    "Failed to perform final checkpoint: {}", e
                );
                Err(e)
            }
        }
    }

    fn apply(&mut self, source: String, checkpoint: SourceCheckpoint) {
        if let Some(current) = self.states.get(&source) {
            if checkpoint.record_number < current.record_number {
                warn!(
                    source = %source,
                    current = current.record_number,
                    update = checkpoint.record_number,
                    "Ignoring checkpoint update that would move position backwards"
                );
                return;
            }
        }

        self.states.insert(source, checkpoint);
        self.pending += 1;
    }

    /// Flush pending updates, keeping them buffered on failure.
    fn flush(&mut self) {
        match self.write() {
            Ok(()) => {
                if self.flush_first_failure.take().is_some() {
                    info!("Checkpoint flush succeeded after previous failures");
                }
                debug!(
                    updates = self.pending,
                    sources = self.states.len(),
                    "Checkpoint flushed"
                );
                self.pending = 0;
            }
            Err(e) => {
                let first_failure = *self.flush_first_failure.get_or_insert_with(Instant::now);
                let failing_for = first_failure.elapsed();

                if failing_for >= self.config.max_flush_failure_duration {
                    error!(
                        pending = self.pending,
                        failing_for = ?failing_for,
                        "Checkpoint flush keeps failing, updates remain buffered: {}", e
                    );
                } else {
                    warn!(
                        pending = self.pending,
                        failing_for = ?failing_for,
                        "Checkpoint flush failed, will retry: {}", e
                    );
                }
            }
        }
    }

    fn write(&self) -> Result<()> {
        let state = PersistedStateV1 {
            version: PERSISTED_STATE_VERSION,
            sources: self.states.clone(),
        };
        write_state(&self.config.path, &state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tracing_test::traced_test;

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(secs, 0).unwrap()
    }

    fn test_config(temp_dir: &TempDir) -> CheckpointConfig {
        CheckpointConfig {
            path: temp_dir.path().join("checkpoints.json"),
            flush_max_updates: 100,
            flush_interval: Duration::from_secs(3600),
            max_flush_failure_duration: Duration::from_secs(60),
            channel_size: 16,
        }
    }

    fn read_sources(path: &Path) -> HashMap<String, SourceCheckpoint> {
        load_state(path)
            .unwrap()
            .map(|s| s.sources)
            .unwrap_or_default()
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        for _ in 0..500 {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_open_without_file_loads_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let store = CheckpointStore::open(test_config(&temp_dir)).unwrap();

        assert!(store.load().is_empty());
        store.shutdown().await.unwrap();

        // Nothing was persisted, so no file is written
        assert!(!temp_dir.path().join("checkpoints.json").exists());
    }

    #[tokio::test]
    async fn test_open_fails_on_corrupted_file() {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(&temp_dir);
        std::fs::write(&config.path, "{ definitely not json").unwrap();

        let result = CheckpointStore::open(config);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_open_rejects_zero_threshold() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = test_config(&temp_dir);
        config.flush_max_updates = 0;

        assert!(matches!(CheckpointStore::open(config), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_updates_buffered_until_shutdown() {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(&temp_dir);
        let path = config.path.clone();

        let store = CheckpointStore::open(config).unwrap();
        let handle = store.handle();
        handle.persist("App", 2, ts(20)).await.unwrap();
        handle.persist("App", 3, ts(30)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!path.exists(), "updates should stay buffered");

        store.shutdown().await.unwrap();

        let sources = read_sources(&path);
        assert_eq!(sources["App"], SourceCheckpoint::new(3, ts(30)));
    }

    #[tokio::test]
    async fn test_flush_on_update_count() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = test_config(&temp_dir);
        config.flush_max_updates = 2;
        let path = config.path.clone();

        let store = CheckpointStore::open(config).unwrap();
        let handle = store.handle();

        handle.persist("App", 1, ts(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!path.exists());

        handle.persist("Sys", 7, ts(70)).await.unwrap();
        assert!(wait_until(|| path.exists()).await, "threshold flush expected");

        let sources = read_sources(&path);
        assert_eq!(sources["App"].record_number, 1);
        assert_eq!(sources["Sys"].record_number, 7);

        store.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_flush_on_interval() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = test_config(&temp_dir);
        config.flush_interval = Duration::from_millis(50);
        let path = config.path.clone();

        let store = CheckpointStore::open(config).unwrap();
        store.handle().persist("App", 5, ts(50)).await.unwrap();

        assert!(
            wait_until(|| read_sources(&path).contains_key("App")).await,
            "interval flush expected"
        );

        store.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_reopen_preserves_other_sources() {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(&temp_dir);
        let path = config.path.clone();

        let store = CheckpointStore::open(config.clone()).unwrap();
        store.handle().persist("App", 10, ts(100)).await.unwrap();
        store.handle().persist("Old", 99, ts(990)).await.unwrap();
        store.shutdown().await.unwrap();

        let store = CheckpointStore::open(config).unwrap();
        let loaded = store.load();
        assert_eq!(loaded["App"].record_number, 10);
        assert_eq!(loaded["Old"].record_number, 99);

        store.handle().persist("App", 11, ts(110)).await.unwrap();
        store.shutdown().await.unwrap();

        let sources = read_sources(&path);
        assert_eq!(sources["App"].record_number, 11);
        assert_eq!(sources["Old"].record_number, 99);
    }

    #[tokio::test]
    async fn test_regressing_update_is_ignored() {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(&temp_dir);
        let path = config.path.clone();

        let store = CheckpointStore::open(config).unwrap();
        let handle = store.handle();
        handle.persist("App", 10, ts(100)).await.unwrap();
        handle.persist("App", 4, ts(40)).await.unwrap();
        store.shutdown().await.unwrap();

        assert_eq!(read_sources(&path)["App"], SourceCheckpoint::new(10, ts(100)));
    }

    #[tokio::test]
    async fn test_persist_after_shutdown_fails() {
        let temp_dir = TempDir::new().unwrap();
        let store = CheckpointStore::open(test_config(&temp_dir)).unwrap();
        let handle = store.handle();
        store.shutdown().await.unwrap();

        let result = handle.persist("App", 1, ts(1)).await;
        assert!(matches!(result, Err(Error::ChannelSend)));
    }

    #[tokio::test]
    async fn test_failed_flush_retains_updates() {
        let temp_dir = TempDir::new().unwrap();
        let state_dir = temp_dir.path().join("state");
        let mut config = test_config(&temp_dir);
        config.path = state_dir.join("checkpoints.json");
        config.flush_max_updates = 1;
        let path = config.path.clone();

        let store = CheckpointStore::open(config).unwrap();

        // Replace the state directory with a plain file so writes fail
        std::fs::remove_dir(&state_dir).unwrap();
        std::fs::write(&state_dir, b"blocker").unwrap();

        store.handle().persist("App", 3, ts(30)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Restore the directory; the buffered update must still be written
        std::fs::remove_file(&state_dir).unwrap();
        std::fs::create_dir(&state_dir).unwrap();

        store.shutdown().await.unwrap();
        assert_eq!(read_sources(&path)["App"].record_number, 3);
    }

    #[test]
    #[traced_test]
    fn test_flush_failures_escalate_after_max_duration() {
        let temp_dir = TempDir::new().unwrap();
        let state_dir = temp_dir.path().join("state");
        // A plain file where the directory should be makes every write fail
        std::fs::write(&state_dir, b"blocker").unwrap();

        let mut config = test_config(&temp_dir);
        config.path = state_dir.join("checkpoints.json");
        config.max_flush_failure_duration = Duration::from_millis(50);
        let path = config.path.clone();

        let (_tx, rx) = flume::bounded(1);
        let mut writer = CheckpointWriter::new(config, HashMap::new(), rx);
        writer.apply("App".to_string(), SourceCheckpoint::new(1, ts(10)));

        writer.flush();
        assert!(logs_contain("Checkpoint flush failed, will retry"));
        assert!(!logs_contain("Checkpoint flush keeps failing"));
        assert_eq!(writer.pending, 1);

        std::thread::sleep(Duration::from_millis(60));
        writer.flush();
        assert!(logs_contain("Checkpoint flush keeps failing"));
        assert_eq!(writer.pending, 1);

        std::fs::remove_file(&state_dir).unwrap();
        std::fs::create_dir(&state_dir).unwrap();
        writer.flush();
        assert!(logs_contain("Checkpoint flush succeeded after previous failures"));
        assert_eq!(writer.pending, 0);
        assert!(writer.flush_first_failure.is_none());
        assert_eq!(read_sources(&path)["App"].record_number, 1);
    }
}
