// SPDX-License-Identifier: Apache-2.0

//! Durable per-source checkpoints.
//!
//! Uses JSON file storage with atomic writes and a buffered single-writer task.

mod json_file;
mod schema;
mod store;

pub use json_file::{load_state, write_state};
pub use schema::{PERSISTED_STATE_VERSION, PersistedStateV1, SourceCheckpoint};
pub use store::{
    CheckpointConfig, CheckpointHandle, CheckpointStore, DEFAULT_FLUSH_INTERVAL,
    DEFAULT_FLUSH_MAX_UPDATES,
};
