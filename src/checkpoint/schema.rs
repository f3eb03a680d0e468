// SPDX-License-Identifier: Apache-2.0

//! Persisted layout of the checkpoint file.
//!
//! v1 stores one entry per source name:
//!
//! ```json
//! {
//!   "version": 1,
//!   "sources": {
//!     "App": { "record_number": 1024, "timestamp": "2024-05-01T10:00:00Z" }
//!   }
//! }
//! ```

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current schema version for persisted state
pub const PERSISTED_STATE_VERSION: u8 = 1;

/// Last acknowledged position of a single source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceCheckpoint {
    /// Identifier of the last record whose batch was published
    pub record_number: u64,
    /// Timestamp of that record
    pub timestamp: DateTime<Utc>,
}

impl SourceCheckpoint {
    pub fn new(record_number: u64, timestamp: DateTime<Utc>) -> Self {
        Self {
            record_number,
            timestamp,
        }
    }
}

/// Persisted state for all sources (v1)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedStateV1 {
    /// Schema version (always 1 for this format)
    pub version: u8,
    /// Map from source name to its checkpoint
    #[serde(default)]
    pub sources: HashMap<String, SourceCheckpoint>,
}

impl Default for PersistedStateV1 {
    fn default() -> Self {
        Self {
            version: PERSISTED_STATE_VERSION,
            sources: HashMap::new(),
        }
    }
}
