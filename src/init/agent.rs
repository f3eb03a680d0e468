// SPDX-License-Identifier: Apache-2.0

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::checkpoint::{CheckpointConfig, CheckpointStore};
use crate::coordinator::{Coordinator, CoordinatorConfig, RunReport};
use crate::error::{Error, Result};
use crate::publish::{JsonLinesPublisher, PublishOutput, Publisher};
use crate::source::{EventSource, JsonLinesSource, JsonLinesSourceConfig};

/// Fully resolved agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub sources: Vec<JsonLinesSourceConfig>,
    pub checkpoint: CheckpointConfig,
    pub coordinator: CoordinatorConfig,
    pub output: PublishOutput,
    pub publish_retry_backoff: Duration,
}

impl AgentConfig {
    pub fn validate(&self) -> Result<()> {
        if self.sources.is_empty() {
            return Err(Error::Config("at least one source is required".to_string()));
        }

        let mut names = HashSet::new();
        for source in &self.sources {
            if source.name.is_empty() {
                return Err(Error::Config("source name must not be empty".to_string()));
            }
            if !names.insert(source.name.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate source name: {}",
                    source.name
                )));
            }
            if source.max_batch_size == 0 {
                return Err(Error::Config(format!(
                    "source {}: max batch size must be at least 1",
                    source.name
                )));
            }
        }

        if self.coordinator.worker.poll_interval.is_zero() {
            return Err(Error::Config(
                "poll interval must be greater than zero".to_string(),
            ));
        }
        if self.checkpoint.flush_max_updates == 0 {
            return Err(Error::Config(
                "checkpoint flush update threshold must be at least 1".to_string(),
            ));
        }
        if self.checkpoint.flush_interval.is_zero() {
            return Err(Error::Config(
                "checkpoint flush interval must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}

pub struct Agent {
    config: AgentConfig,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Self {
        Self { config }
    }

    /// Run until every source has stopped or `agent_cancel` fires.
    ///
    /// Errors are only returned for failures during startup; once the
    /// workers are running, problems are logged and reflected in the report.
    pub async fn run(self, agent_cancel: CancellationToken) -> Result<RunReport> {
        let config = self.config;
        config.validate()?;

        info!(
            version = env!("CARGO_PKG_VERSION"),
            sources = config.sources.len(),
            "Starting logship."
        );

        let store = CheckpointStore::open(config.checkpoint.clone())?;

        let publisher: Arc<dyn Publisher> = Arc::new(JsonLinesPublisher::new(
            config.output.clone(),
            config.publish_retry_backoff,
            agent_cancel.clone(),
        ));

        let sources: Vec<Box<dyn EventSource>> = config
            .sources
            .into_iter()
            .map(|c| Box::new(JsonLinesSource::new(c)) as Box<dyn EventSource>)
            .collect();

        let coordinator = Coordinator::new(sources, publisher, store, config.coordinator)?;
        let report = coordinator.run(agent_cancel).await?;

        info!("logship stopped.");
        Ok(report)
    }
}
