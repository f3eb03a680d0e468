// SPDX-License-Identifier: Apache-2.0

//! Per-source polling worker.
//!
//! A worker opens its source at the last checkpoint and then loops
//! read -> transform -> publish -> checkpoint until shutdown is requested or
//! the source fails. The checkpoint only advances after the publisher has
//! accepted the batch, and always to the last record of that batch.

use std::sync::Arc;
use std::time::Duration;

use opentelemetry::KeyValue;
use opentelemetry::metrics::Counter;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::checkpoint::{CheckpointHandle, SourceCheckpoint};
use crate::event::Event;
use crate::metrics::get_meter;
use crate::publish::Publisher;
use crate::source::EventSource;

/// Default delay before polling again after an empty read
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Delay before polling again after an empty read
    pub poll_interval: Duration,
    /// Consecutive read failures tolerated before the source is abandoned
    pub max_read_retries: u32,
    /// Delay between read attempts after a failure
    pub read_retry_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_read_retries: 0,
            read_retry_backoff: Duration::from_secs(1),
        }
    }
}

/// Why a worker stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Shutdown was requested
    Shutdown,
    /// The source could not be opened
    OpenFailed,
    /// Reading from the source failed
    ReadFailed,
    /// The publisher refused a batch because shutdown is in progress
    PublishRefused,
    /// The checkpoint store stopped accepting updates
    CheckpointUnavailable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerReport {
    pub source: String,
    /// Events accepted by the publisher
    pub published: u64,
    /// Events read but not delivered
    pub ignored: u64,
    pub exit: WorkerExit,
}

struct WorkerMetrics {
    published: Counter<u64>,
    ignored: Counter<u64>,
    tags: [KeyValue; 1],
}

impl WorkerMetrics {
    fn new(source: &str) -> Self {
        Self {
            published: get_meter()
                .u64_counter("logship_published_events")
                .with_description("Number of events accepted by the publisher.")
                .with_unit("events")
                .build(),
            ignored: get_meter()
                .u64_counter("logship_ignored_events")
                .with_description("Number of events read from a source but not delivered.")
                .with_unit("events")
                .build(),
            tags: [KeyValue::new("source", source.to_string())],
        }
    }

    fn add_published(&self, count: u64) {
        if count > 0 {
            self.published.add(count, &self.tags);
        }
    }

    fn add_ignored(&self, count: u64) {
        if count > 0 {
            self.ignored.add(count, &self.tags);
        }
    }
}

pub struct PollingWorker {
    source: Box<dyn EventSource>,
    publisher: Arc<dyn Publisher>,
    checkpoints: CheckpointHandle,
    config: WorkerConfig,
}

impl PollingWorker {
    pub fn new(
        source: Box<dyn EventSource>,
        publisher: Arc<dyn Publisher>,
        checkpoints: CheckpointHandle,
        config: WorkerConfig,
    ) -> Self {
        Self {
            source,
            publisher,
            checkpoints,
            config,
        }
    }

    /// Drive the source from `start` until shutdown or failure.
    ///
    /// Failures are reported through the returned [`WorkerReport`] and logs;
    /// they never affect other workers.
    pub async fn run(
        mut self,
        start: Option<SourceCheckpoint>,
        cancel: CancellationToken,
    ) -> WorkerReport {
        let name = self.source.name().to_string();
        let metrics = WorkerMetrics::new(&name);
        let mut report = WorkerReport {
            source: name.clone(),
            published: 0,
            ignored: 0,
            exit: WorkerExit::Shutdown,
        };

        let start_at = start.map(|c| c.record_number);
        if let Err(e) = self.source.open(start_at).await {
            warn!(
                source = %name,
                "Open() error. No events will be read from this source: {}", e
            );
            report.exit = WorkerExit::OpenFailed;
            return report;
        }
        debug!(source = %name, start_at = ?start_at, "Source opened successfully");

        report.exit = self.poll(&name, &metrics, &mut report, &cancel).await;

        info!(source = %name, exit = ?report.exit, "Stop processing");
        if let Err(e) = self.source.close().await {
            warn!(source = %name, "Close() error: {}", e);
        }

        report
    }

    async fn poll(
        &mut self,
        name: &str,
        metrics: &WorkerMetrics,
        report: &mut WorkerReport,
        cancel: &CancellationToken,
    ) -> WorkerExit {
        let mut read_failures: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return WorkerExit::Shutdown;
            }

            let records = match self.source.read().await {
                Ok(records) => {
                    read_failures = 0;
                    records
                }
                Err(e) => {
                    if read_failures >= self.config.max_read_retries {
                        warn!(source = %name, "Read() error: {}", e);
                        return WorkerExit::ReadFailed;
                    }
                    read_failures += 1;
                    warn!(
                        source = %name,
                        attempt = read_failures,
                        max_retries = self.config.max_read_retries,
                        "Read() error, retrying: {}", e
                    );
                    if !sleep_or_cancel(self.config.read_retry_backoff, cancel).await {
                        return WorkerExit::Shutdown;
                    }
                    continue;
                }
            };
            debug!(source = %name, records = records.len(), "Read() returned records");

            let Some(last) = records.last() else {
                if !sleep_or_cancel(self.config.poll_interval, cancel).await {
                    return WorkerExit::Shutdown;
                }
                continue;
            };
            let (last_record, last_timestamp) = (last.record_number, last.timestamp);

            let events: Vec<Event> = records.iter().map(|r| r.to_event(name)).collect();
            let count = events.len() as u64;

            if !self.publisher.publish(events).await {
                // Only refused during shutdown: the batch is not delivered and
                // the checkpoint stays where it is.
                debug!(
                    source = %name,
                    events = count,
                    "Publish refused during shutdown, not advancing checkpoint"
                );
                metrics.add_ignored(count);
                report.ignored += count;
                return WorkerExit::PublishRefused;
            }

            metrics.add_published(count);
            report.published += count;
            info!(source = %name, events = count, "Successfully published events");

            if let Err(e) = self
                .checkpoints
                .persist(name, last_record, last_timestamp)
                .await
            {
                error!(source = %name, "Unable to record checkpoint, stopping: {}", e);
                return WorkerExit::CheckpointUnavailable;
            }
        }
    }
}

/// Sleep for `duration`, returning false if cancelled first.
async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
