// SPDX-License-Identifier: Apache-2.0

//! Event sources read by the polling workers.

pub mod jsonl;

use async_trait::async_trait;

use crate::error::Result;
use crate::event::EventRecord;

pub use jsonl::{JsonLinesSource, JsonLinesSourceConfig, StartAt};

/// A log source read in batches.
///
/// Implementations are driven by exactly one worker, so methods take `&mut self`.
#[async_trait]
pub trait EventSource: Send {
    /// Unique name of the source, used as its checkpoint key.
    fn name(&self) -> &str;

    /// Prepare to read records after `record_number`.
    ///
    /// `None` means no checkpoint exists and the source picks its own default.
    async fn open(&mut self, record_number: Option<u64>) -> Result<()>;

    /// Return the next batch of records in source order.
    ///
    /// Must not block for long. An empty batch means nothing is available yet.
    async fn read(&mut self) -> Result<Vec<EventRecord>>;

    async fn close(&mut self) -> Result<()>;
}
