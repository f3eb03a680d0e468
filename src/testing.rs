// SPDX-License-Identifier: Apache-2.0

//! Scripted sources and recording publishers for exercising workers and the
//! coordinator without real log files or downstream services.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::event::{Event, EventRecord};
use crate::publish::Publisher;
use crate::source::EventSource;

const BASE_TIMESTAMP: i64 = 1_700_000_000;

/// Build a record whose timestamp is derived from its number.
pub fn record(record_number: u64) -> EventRecord {
    let timestamp = DateTime::<Utc>::from_timestamp(BASE_TIMESTAMP + record_number as i64, 0)
        .unwrap_or_default();
    EventRecord::new(
        record_number,
        timestamp,
        serde_json::json!({ "message": format!("record {}", record_number) }),
    )
}

enum Step {
    Batch(Vec<EventRecord>),
    Fail(String),
}

/// Observations of how a [`ScriptedSource`] was driven.
#[derive(Default)]
pub struct SourceObserver {
    opened_at: Mutex<Option<Option<u64>>>,
    read_calls: AtomicUsize,
    closed: AtomicBool,
}

impl SourceObserver {
    /// `None` if never opened, otherwise the position passed to `open`.
    pub fn opened_at(&self) -> Option<Option<u64>> {
        *self.opened_at.lock().unwrap()
    }

    pub fn read_calls(&self) -> usize {
        self.read_calls.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Source replaying a fixed script of batches and failures.
///
/// Once the script is exhausted every read returns an empty batch. Records at
/// or before the position given to `open` are skipped.
pub struct ScriptedSource {
    name: String,
    steps: VecDeque<Step>,
    open_error: Option<String>,
    close_error: Option<String>,
    start_after: Option<u64>,
    observer: Arc<SourceObserver>,
}

impl ScriptedSource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: VecDeque::new(),
            open_error: None,
            close_error: None,
            start_after: None,
            observer: Arc::new(SourceObserver::default()),
        }
    }

    pub fn with_batch(mut self, record_numbers: &[u64]) -> Self {
        let batch = record_numbers.iter().map(|n| record(*n)).collect();
        self.steps.push_back(Step::Batch(batch));
        self
    }

    pub fn with_read_error(mut self, msg: impl Into<String>) -> Self {
        self.steps.push_back(Step::Fail(msg.into()));
        self
    }

    pub fn with_open_error(mut self, msg: impl Into<String>) -> Self {
        self.open_error = Some(msg.into());
        self
    }

    pub fn with_close_error(mut self, msg: impl Into<String>) -> Self {
        self.close_error = Some(msg.into());
        self
    }

    pub fn observer(&self) -> Arc<SourceObserver> {
        self.observer.clone()
    }
}

#[async_trait]
impl EventSource for ScriptedSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&mut self, record_number: Option<u64>) -> Result<()> {
        if let Some(msg) = &self.open_error {
            return Err(Error::Source(msg.clone()));
        }
        *self.observer.opened_at.lock().unwrap() = Some(record_number);
        self.start_after = record_number;
        Ok(())
    }

    async fn read(&mut self) -> Result<Vec<EventRecord>> {
        self.observer.read_calls.fetch_add(1, Ordering::SeqCst);
        match self.steps.pop_front() {
            None => Ok(Vec::new()),
            Some(Step::Fail(msg)) => Err(Error::Source(msg)),
            Some(Step::Batch(records)) => Ok(records
                .into_iter()
                .filter(|r| self.start_after.is_none_or(|p| r.record_number > p))
                .collect()),
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.observer.closed.store(true, Ordering::SeqCst);
        match &self.close_error {
            Some(msg) => Err(Error::Source(msg.clone())),
            None => Ok(()),
        }
    }
}

/// Publisher that records every accepted batch.
pub struct RecordingPublisher {
    batches: Mutex<Vec<Vec<Event>>>,
    calls: AtomicUsize,
    accept_limit: Option<usize>,
    delay: Duration,
}

impl Default for RecordingPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self {
            batches: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            accept_limit: None,
            delay: Duration::ZERO,
        }
    }

    /// Accept the first `n` publish calls and refuse every later one.
    pub fn refusing_after(mut self, n: usize) -> Self {
        self.accept_limit = Some(n);
        self
    }

    /// Simulate a slow downstream.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Record numbers of each accepted batch from `source`.
    pub fn published_numbers(&self, source: &str) -> Vec<Vec<u64>> {
        self.batches
            .lock()
            .unwrap()
            .iter()
            .filter(|b| b.first().is_some_and(|e| e.source == source))
            .map(|b| b.iter().map(|e| e.record_number).collect())
            .collect()
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(&self, events: Vec<Event>) -> bool {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.accept_limit.is_some_and(|limit| call >= limit) {
            return false;
        }

        self.batches.lock().unwrap().push(events);
        true
    }
}
