// SPDX-License-Identifier: Apache-2.0

//! Downstream publishing of structured events.

pub mod jsonl;

use async_trait::async_trait;

use crate::event::Event;

pub use jsonl::{JsonLinesPublisher, PublishOutput};

/// Synchronous, guaranteed delivery of event batches.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Deliver `events`, returning once they are durably accepted.
    ///
    /// Implementations keep retrying until delivery succeeds. `false` is only
    /// returned when shutdown interrupts delivery, in which case the batch must
    /// be treated as not delivered.
    async fn publish(&self, events: Vec<Event>) -> bool;
}
