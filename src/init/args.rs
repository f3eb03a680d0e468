// SPDX-License-Identifier: Apache-2.0

use clap::{Args, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

use crate::checkpoint::{CheckpointConfig, DEFAULT_FLUSH_MAX_UPDATES};
use crate::coordinator::CoordinatorConfig;
use crate::init::agent::AgentConfig;
use crate::init::parse;
use crate::publish::PublishOutput;
use crate::source::{JsonLinesSourceConfig, StartAt};
use crate::worker::WorkerConfig;

/// Where to start reading sources that have no checkpoint
#[derive(Copy, Clone, Debug, Default, ValueEnum, PartialEq, Eq)]
pub enum StartAtArg {
    /// Start at the beginning of the file
    #[default]
    Beginning,
    /// Start at the end of the file (tail mode)
    End,
}

impl From<StartAtArg> for StartAt {
    fn from(s: StartAtArg) -> Self {
        match s {
            StartAtArg::Beginning => StartAt::Beginning,
            StartAtArg::End => StartAt::End,
        }
    }
}

#[derive(Debug, Args, Clone)]
pub struct AgentRun {
    /// Sources to read, as NAME=PATH (repeat or comma-separate for several)
    #[arg(long = "source", env = "LOGSHIP_SOURCES", value_parser = parse::parse_source, value_delimiter = ',', required = true)]
    pub sources: Vec<(String, PathBuf)>,

    /// Where to start reading sources without a checkpoint: beginning or end
    #[arg(
        value_enum,
        long,
        env = "LOGSHIP_SOURCE_START_AT",
        default_value = "beginning"
    )]
    pub source_start_at: StartAtArg,

    /// Maximum number of records returned by a single read
    #[arg(long, env = "LOGSHIP_SOURCE_MAX_BATCH_SIZE", default_value = "100")]
    pub source_max_batch_size: usize,

    /// Delay between reads that return no records
    #[arg(long, env = "LOGSHIP_POLL_INTERVAL", default_value = "1s", value_parser = humantime::parse_duration)]
    pub poll_interval: Duration,

    /// Number of times a failed read is retried before the source is abandoned
    #[arg(long, env = "LOGSHIP_MAX_READ_RETRIES", default_value = "0")]
    pub max_read_retries: u32,

    /// Delay between read retries
    #[arg(long, env = "LOGSHIP_READ_RETRY_BACKOFF", default_value = "1s", value_parser = humantime::parse_duration)]
    pub read_retry_backoff: Duration,

    /// Checkpoint file, relative paths are resolved against --data-path
    #[arg(
        long,
        env = "LOGSHIP_CHECKPOINT_PATH",
        default_value = "checkpoints.json"
    )]
    pub checkpoint_path: PathBuf,

    /// Data directory
    #[arg(long, env = "LOGSHIP_DATA_PATH", default_value = "/var/lib/logship")]
    pub data_path: PathBuf,

    /// Flush checkpoints after this many buffered updates
    #[arg(long, env = "LOGSHIP_CHECKPOINT_FLUSH_MAX_UPDATES", default_value_t = DEFAULT_FLUSH_MAX_UPDATES)]
    pub checkpoint_flush_max_updates: usize,

    /// Flush buffered checkpoint updates at least this often
    #[arg(long, env = "LOGSHIP_CHECKPOINT_FLUSH_INTERVAL", default_value = "5s", value_parser = humantime::parse_duration)]
    pub checkpoint_flush_interval: Duration,

    /// Log flush failures as errors once they have persisted this long
    #[arg(long, env = "LOGSHIP_CHECKPOINT_MAX_FLUSH_FAILURE_DURATION", default_value = "60s", value_parser = humantime::parse_duration)]
    pub checkpoint_max_flush_failure_duration: Duration,

    /// Publish destination, "-" for stdout or a file path
    #[arg(long, env = "LOGSHIP_OUTPUT", default_value = "-")]
    pub output: PublishOutput,

    /// Delay between publish retries
    #[arg(long, env = "LOGSHIP_PUBLISH_RETRY_BACKOFF", default_value = "1s", value_parser = humantime::parse_duration)]
    pub publish_retry_backoff: Duration,

    /// Upper bound on waiting for sources to stop at shutdown
    #[arg(long, env = "LOGSHIP_SHUTDOWN_TIMEOUT", default_value = "10s", value_parser = humantime::parse_duration)]
    pub shutdown_timeout: Duration,
}

impl AgentRun {
    pub fn build_config(&self) -> AgentConfig {
        let sources = self
            .sources
            .iter()
            .map(|(name, path)| {
                let mut config = JsonLinesSourceConfig::new(name.clone(), path.clone());
                config.start_at = self.source_start_at.into();
                config.max_batch_size = self.source_max_batch_size;
                config
            })
            .collect();

        let checkpoint = CheckpointConfig {
            path: parse::resolve_data_path(&self.data_path, &self.checkpoint_path),
            flush_max_updates: self.checkpoint_flush_max_updates,
            flush_interval: self.checkpoint_flush_interval,
            max_flush_failure_duration: self.checkpoint_max_flush_failure_duration,
            ..Default::default()
        };

        let coordinator = CoordinatorConfig {
            worker: WorkerConfig {
                poll_interval: self.poll_interval,
                max_read_retries: self.max_read_retries,
                read_retry_backoff: self.read_retry_backoff,
            },
            shutdown_timeout: self.shutdown_timeout,
        };

        AgentConfig {
            sources,
            checkpoint,
            coordinator,
            output: self.output.clone(),
            publish_retry_backoff: self.publish_retry_backoff,
        }
    }
}
