// SPDX-License-Identifier: Apache-2.0

//! JSON file storage for checkpoint state.
//!
//! Writes replace the file atomically: the full state is written to a unique
//! temp file next to the target, synced, then renamed over the target. A
//! reader (or a restarted process) only ever sees the old or the new file.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use crate::checkpoint::schema::{PERSISTED_STATE_VERSION, PersistedStateV1};
use crate::error::{Error, Result};

/// Read the persisted state, if a state file exists.
///
/// A missing file is not an error. A file that cannot be parsed, or that was
/// written by an unknown schema version, is reported as corrupted.
pub fn load_state(path: &Path) -> Result<Option<PersistedStateV1>> {
    if !path.exists() {
        return Ok(None);
    }

    let file = File::open(path)
        .map_err(|e| Error::Persistence(format!("failed to open checkpoint file: {}", e)))?;
    let reader = BufReader::new(file);
    let state: PersistedStateV1 = serde_json::from_reader(reader).map_err(|e| {
        Error::Persistence(format!(
            "checkpoint file {} is corrupted: {}",
            path.display(),
            e
        ))
    })?;

    if state.version != PERSISTED_STATE_VERSION {
        return Err(Error::Persistence(format!(
            "checkpoint file {} has unsupported version {} (expected {})",
            path.display(),
            state.version,
            PERSISTED_STATE_VERSION
        )));
    }

    Ok(Some(state))
}

/// Create the parent directory of `path` if it does not exist yet.
pub fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| {
                Error::Persistence(format!("failed to create checkpoint directory: {}", e))
            })?;
        }
    }
    Ok(())
}

/// Write state to file atomically (write to temp, sync, then rename)
pub fn write_state(path: &Path, state: &PersistedStateV1) -> Result<()> {
    use portable_atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    ensure_parent_dir(path)?;

    let unique_id = COUNTER.fetch_add(1, Ordering::SeqCst);
    let temp_path = path.with_extension(format!("tmp.{}.{}", std::process::id(), unique_id));

    if let Err(e) = write_temp(&temp_path, state) {
        let _ = fs::remove_file(&temp_path);
        return Err(e);
    }

    if let Err(e) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(Error::Persistence(format!(
            "failed to rename checkpoint file: {}",
            e
        )));
    }

    sync_parent_dir(path);

    Ok(())
}

fn write_temp(temp_path: &Path, state: &PersistedStateV1) -> Result<()> {
    let file = File::create(temp_path)
        .map_err(|e| Error::Persistence(format!("failed to create temp file: {}", e)))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, state)
        .map_err(|e| Error::Persistence(format!("failed to write checkpoint: {}", e)))?;
    writer
        .flush()
        .map_err(|e| Error::Persistence(format!("failed to flush checkpoint: {}", e)))?;

    let file = writer
        .into_inner()
        .map_err(|e| Error::Persistence(format!("failed to flush checkpoint: {}", e)))?;
    file.sync_all()
        .map_err(|e| Error::Persistence(format!("failed to sync checkpoint: {}", e)))?;

    Ok(())
}

// Best effort: persists the rename itself on filesystems that need it.
#[cfg(unix)]
fn sync_parent_dir(path: &Path) {
    if let Some(parent) = path.parent() {
        let parent = if parent.as_os_str().is_empty() {
            Path::new(".")
        } else {
            parent
        };
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) {}
