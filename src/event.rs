// SPDX-License-Identifier: Apache-2.0

//! Records produced by sources and the structured events handed to publishers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single record read from a source.
///
/// Record numbers are non-decreasing within one source and double as the
/// resume position stored in the checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub record_number: u64,
    pub timestamp: DateTime<Utc>,
    pub body: serde_json::Value,
}

impl EventRecord {
    pub fn new(record_number: u64, timestamp: DateTime<Utc>, body: serde_json::Value) -> Self {
        Self {
            record_number,
            timestamp,
            body,
        }
    }

    /// Convert to the structured form accepted by publishers.
    pub fn to_event(&self, source: &str) -> Event {
        Event {
            timestamp: self.timestamp,
            source: source.to_string(),
            record_number: self.record_number,
            body: self.body.clone(),
        }
    }
}

/// Structured event as delivered downstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "@timestamp")]
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub record_number: u64,
    pub body: serde_json::Value,
}
