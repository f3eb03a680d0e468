// SPDX-License-Identifier: Apache-2.0

//! Lifecycle of the polling workers and the checkpoint store.
//!
//! Startup reads persisted checkpoints once and spawns one worker per source.
//! Workers are independent; the coordinator waits for all of them. Once the
//! cancellation token fires, remaining workers get a bounded amount of time to
//! exit, and only after every worker is gone is the store shut down, so the
//! final flush cannot race a late update.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::select;
use tokio::task::{Id, JoinError, JoinSet};
use tokio::time::timeout_at;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::checkpoint::CheckpointStore;
use crate::error::{Error, Result};
use crate::publish::Publisher;
use crate::source::EventSource;
use crate::worker::{PollingWorker, WorkerConfig, WorkerReport};

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub worker: WorkerConfig,
    /// Upper bound on waiting for workers after shutdown is requested
    pub shutdown_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            worker: WorkerConfig::default(),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

/// Outcome of a full run.
#[derive(Debug)]
pub struct RunReport {
    /// Reports of workers that exited on their own, in completion order
    pub workers: Vec<WorkerReport>,
    /// Sources whose workers had to be aborted at shutdown
    pub aborted: Vec<String>,
    pub published: u64,
    pub ignored: u64,
    pub uptime: Duration,
}

impl RunReport {
    pub fn worker(&self, source: &str) -> Option<&WorkerReport> {
        self.workers.iter().find(|r| r.source == source)
    }
}

pub struct Coordinator {
    sources: Vec<Box<dyn EventSource>>,
    publisher: Arc<dyn Publisher>,
    store: CheckpointStore,
    config: CoordinatorConfig,
}

impl Coordinator {
    pub fn new(
        sources: Vec<Box<dyn EventSource>>,
        publisher: Arc<dyn Publisher>,
        store: CheckpointStore,
        config: CoordinatorConfig,
    ) -> Result<Self> {
        let mut names = HashSet::new();
        for source in &sources {
            if !names.insert(source.name()) {
                return Err(Error::Config(format!(
                    "duplicate source name: {}",
                    source.name()
                )));
            }
        }

        Ok(Self {
            sources,
            publisher,
            store,
            config,
        })
    }

    /// Run every worker to completion, then shut the checkpoint store down.
    pub async fn run(self, cancel: CancellationToken) -> Result<RunReport> {
        let started = Instant::now();
        let Coordinator {
            sources,
            publisher,
            store,
            config,
        } = self;

        let persisted = store.load();
        let mut workers = JoinSet::new();
        let mut names: HashMap<Id, String> = HashMap::new();

        for source in sources {
            let name = source.name().to_string();
            let start = persisted.get(&name).copied();
            info!(
                source = %name,
                checkpoint = ?start.map(|c| c.record_number),
                "Starting worker"
            );

            let worker = PollingWorker::new(
                source,
                publisher.clone(),
                store.handle(),
                config.worker.clone(),
            );
            let handle = workers.spawn(worker.run(start, cancel.clone()));
            names.insert(handle.id(), name);
        }

        let mut reports = Vec::with_capacity(names.len());
        let mut aborted = Vec::new();

        loop {
            select! {
                res = workers.join_next() => {
                    match res {
                        Some(res) => collect(res, &names, &mut reports),
                        None => {
                            info!("All workers have stopped");
                            break;
                        }
                    }
                }
                _ = cancel.cancelled() => {
                    info!(
                        remaining = workers.len(),
                        timeout = ?config.shutdown_timeout,
                        "Shutdown requested, waiting for workers"
                    );
                    let stop_at = tokio::time::Instant::now() + config.shutdown_timeout;
                    join_with_deadline(&mut workers, stop_at, &names, &mut reports, &mut aborted)
                        .await;
                    break;
                }
            }
        }

        if let Err(e) = store.shutdown().await {
            error!("Checkpoint store shutdown failed: {}", e);
        }

        let report = RunReport {
            published: reports.iter().map(|r| r.published).sum(),
            ignored: reports.iter().map(|r| r.ignored).sum(),
            workers: reports,
            aborted,
            uptime: started.elapsed(),
        };
        log_report(&report);

        Ok(report)
    }
}

fn collect(
    res: std::result::Result<WorkerReport, JoinError>,
    names: &HashMap<Id, String>,
    reports: &mut Vec<WorkerReport>,
) {
    match res {
        Ok(report) => {
            info!(
                source = %report.source,
                exit = ?report.exit,
                published = report.published,
                "Worker finished"
            );
            reports.push(report);
        }
        Err(e) => {
            let source = names.get(&e.id()).map(String::as_str).unwrap_or("unknown");
            error!(source = %source, "Worker task failed: {:?}", e);
        }
    }
}

/// Join remaining workers until `stop_at`, aborting any that are still running.
async fn join_with_deadline(
    workers: &mut JoinSet<WorkerReport>,
    stop_at: tokio::time::Instant,
    names: &HashMap<Id, String>,
    reports: &mut Vec<WorkerReport>,
    aborted: &mut Vec<String>,
) {
    loop {
        match timeout_at(stop_at, workers.join_next()).await {
            Ok(Some(res)) => collect(res, names, reports),
            Ok(None) => return,
            Err(_) => break,
        }
    }

    warn!(
        remaining = workers.len(),
        "Timed out waiting for workers to stop, aborting them"
    );
    workers.abort_all();
    while let Some(res) = workers.join_next().await {
        match res {
            Ok(report) => reports.push(report),
            Err(e) if e.is_cancelled() => {
                let source = names.get(&e.id()).cloned().unwrap_or_default();
                warn!(source = %source, "Worker aborted");
                aborted.push(source);
            }
            Err(e) => error!("Worker task failed: {:?}", e),
        }
    }
}

fn log_report(report: &RunReport) {
    for worker in &report.workers {
        info!(
            source = %worker.source,
            published = worker.published,
            ignored = worker.ignored,
            exit = ?worker.exit,
            "Source totals"
        );
    }
    info!(
        published = report.published,
        ignored = report.ignored,
        uptime = %humantime::format_duration(Duration::from_secs(report.uptime.as_secs())),
        "Run totals"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointConfig;
    use crate::testing::{RecordingPublisher, ScriptedSource};
    use tempfile::TempDir;

    fn open_store(temp_dir: &TempDir) -> CheckpointStore {
        CheckpointStore::open(CheckpointConfig {
            path: temp_dir.path().join("checkpoints.json"),
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_rejects_duplicate_source_names() {
        let temp_dir = TempDir::new().unwrap();
        let sources: Vec<Box<dyn EventSource>> = vec![
            Box::new(ScriptedSource::new("App")),
            Box::new(ScriptedSource::new("App")),
        ];

        let result = Coordinator::new(
            sources,
            Arc::new(RecordingPublisher::new()),
            open_store(&temp_dir),
            CoordinatorConfig::default(),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_returns_when_all_workers_exit() {
        let temp_dir = TempDir::new().unwrap();
        let sources: Vec<Box<dyn EventSource>> = vec![
            Box::new(ScriptedSource::new("App").with_open_error("missing")),
            Box::new(ScriptedSource::new("Sys").with_batch(&[1]).with_read_error("gone")),
        ];

        let coordinator = Coordinator::new(
            sources,
            Arc::new(RecordingPublisher::new()),
            open_store(&temp_dir),
            CoordinatorConfig::default(),
        )
        .unwrap();
        let report = coordinator.run(CancellationToken::new()).await.unwrap();

        assert_eq!(report.workers.len(), 2);
        assert_eq!(report.published, 1);
        assert!(report.aborted.is_empty());
    }

    #[tokio::test]
    async fn test_aborts_workers_stuck_past_timeout() {
        let temp_dir = TempDir::new().unwrap();
        let sources: Vec<Box<dyn EventSource>> =
            vec![Box::new(ScriptedSource::new("Slow").with_batch(&[1]))];
        let publisher = RecordingPublisher::new().with_delay(Duration::from_secs(3600));

        let config = CoordinatorConfig {
            worker: WorkerConfig {
                poll_interval: Duration::from_millis(10),
                ..Default::default()
            },
            shutdown_timeout: Duration::from_millis(50),
        };
        let coordinator =
            Coordinator::new(sources, Arc::new(publisher), open_store(&temp_dir), config).unwrap();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(coordinator.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let report = task.await.unwrap().unwrap();
        assert_eq!(report.aborted, vec!["Slow".to_string()]);
        assert_eq!(report.published, 0);
    }
}
