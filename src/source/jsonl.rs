// SPDX-License-Identifier: Apache-2.0

//! JSON-lines file source.
//!
//! Each complete line of the file is one record; its 1-based line number is
//! the record number. Lines that are not JSON are wrapped as
//! `{"message": "<line>"}`. A `timestamp` field holding an RFC 3339 string is
//! used as the record timestamp, otherwise the read time is used.
//!
//! A file that shrinks below the read position, or whose leading bytes change,
//! was truncated or replaced in place and is read again from the start. Record
//! numbers keep increasing across such a restart so checkpoints never move
//! backwards. The same applies when a checkpoint points past the end of the
//! file at open: the file is read from the start, which may deliver lines a
//! second time but never skips any.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::event::EventRecord;
use crate::source::EventSource;

/// Where to start reading when a source has no checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartAt {
    /// Start reading from the beginning of the file
    #[default]
    Beginning,
    /// Start reading from the end of the file (only new content)
    End,
}

/// Configuration for a single JSON-lines source
#[derive(Debug, Clone)]
pub struct JsonLinesSourceConfig {
    pub name: String,
    pub path: PathBuf,
    pub start_at: StartAt,
    /// Maximum number of records returned by one read
    pub max_batch_size: usize,
    /// Lines longer than this many bytes are truncated
    pub max_log_size: usize,
}

impl JsonLinesSourceConfig {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            start_at: StartAt::Beginning,
            max_batch_size: 100,
            max_log_size: 65536,
        }
    }
}

/// Number of leading bytes used to recognise a file replaced in place
const FINGERPRINT_SIZE: u64 = 1000;

pub struct JsonLinesSource {
    config: JsonLinesSourceConfig,
    file: Option<File>,
    /// Byte offset just past the last complete line consumed
    offset: u64,
    /// Record number of the last line consumed
    line_number: u64,
    /// Leading bytes of the consumed part of the file
    fingerprint: Vec<u8>,
}

impl JsonLinesSource {
    pub fn new(config: JsonLinesSourceConfig) -> Self {
        Self {
            config,
            file: None,
            offset: 0,
            line_number: 0,
            fingerprint: Vec::new(),
        }
    }

    /// Skip up to `limit` complete lines from the start of the file.
    /// Returns the number of lines skipped and the byte offset after them.
    fn skip_lines(file: &mut File, limit: Option<u64>) -> io::Result<(u64, u64)> {
        file.seek(SeekFrom::Start(0))?;
        let mut reader = BufReader::new(file);
        let mut discard = Vec::new();
        let mut lines = 0u64;
        let mut offset = 0u64;

        while limit.is_none_or(|l| lines < l) {
            let (n, complete) = read_line_capped(&mut reader, &mut discard, 0)?;
            if !complete {
                break;
            }
            lines += 1;
            offset += n;
        }

        Ok((lines, offset))
    }

    /// First `min(offset, FINGERPRINT_SIZE)` bytes of the file.
    fn fingerprint(file: &mut File, offset: u64) -> io::Result<Vec<u8>> {
        let size = offset.min(FINGERPRINT_SIZE);
        file.seek(SeekFrom::Start(0))?;
        let mut buf = Vec::with_capacity(size as usize);
        file.take(size).read_to_end(&mut buf)?;
        Ok(buf)
    }

    fn was_truncated(file: &mut File, offset: u64, fingerprint: &[u8]) -> io::Result<bool> {
        if file.metadata()?.len() < offset {
            return Ok(true);
        }
        if fingerprint.is_empty() {
            return Ok(false);
        }
        Ok(Self::fingerprint(file, fingerprint.len() as u64)? != fingerprint)
    }

    fn to_record(&self, record_number: u64, raw: &[u8]) -> Option<EventRecord> {
        let mut line = String::from_utf8_lossy(raw).into_owned();
        let trimmed = line.trim_end_matches(['\r', '\n']).len();
        line.truncate(trimmed);
        if line.trim().is_empty() {
            return None;
        }

        if line.len() > self.config.max_log_size {
            let mut end = self.config.max_log_size;
            while !line.is_char_boundary(end) {
                end -= 1;
            }
            line.truncate(end);
        }

        let body = match serde_json::from_str::<serde_json::Value>(&line) {
            Ok(v @ serde_json::Value::Object(_)) => v,
            _ => serde_json::json!({ "message": line }),
        };

        let timestamp = body
            .get("timestamp")
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        Some(EventRecord::new(record_number, timestamp, body))
    }
}

/// Read one line, keeping at most `cap` bytes of it in `buf`.
///
/// Returns the number of bytes consumed and whether the line ended with a
/// newline. The rest of an over-long line is consumed without being buffered.
fn read_line_capped<R: BufRead>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    cap: usize,
) -> io::Result<(u64, bool)> {
    let mut consumed = 0u64;
    loop {
        let available = match reader.fill_buf() {
            Ok(available) => available,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        if available.is_empty() {
            return Ok((consumed, false));
        }

        let (chunk, done) = match available.iter().position(|b| *b == b'\n') {
            Some(i) => (&available[..=i], true),
            None => (available, false),
        };
        let keep = cap.saturating_sub(buf.len()).min(chunk.len());
        buf.extend_from_slice(&chunk[..keep]);

        let n = chunk.len();
        reader.consume(n);
        consumed += n as u64;
        if done {
            return Ok((consumed, true));
        }
    }
}

#[async_trait]
impl EventSource for JsonLinesSource {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn open(&mut self, record_number: Option<u64>) -> Result<()> {
        let mut file = File::open(&self.config.path).map_err(|e| {
            Error::Source(format!(
                "failed to open {}: {}",
                self.config.path.display(),
                e
            ))
        })?;

        let (line_number, offset) = match (record_number, self.config.start_at) {
            (Some(n), _) => {
                let (lines, offset) = Self::skip_lines(&mut file, Some(n))?;
                if lines < n {
                    warn!(
                        source = %self.config.name,
                        checkpoint = n,
                        available = lines,
                        "File holds fewer records than the checkpoint, assuming it was replaced and reading it from the start"
                    );
                    (n, 0)
                } else {
                    (lines, offset)
                }
            }
            (None, StartAt::Beginning) => (0, 0),
            (None, StartAt::End) => Self::skip_lines(&mut file, None)?,
        };

        debug!(
            source = %self.config.name,
            path = %self.config.path.display(),
            line = line_number,
            offset,
            "Opened JSON-lines source"
        );

        self.fingerprint = Self::fingerprint(&mut file, offset)?;
        self.file = Some(file);
        self.offset = offset;
        self.line_number = line_number;
        Ok(())
    }

    async fn read(&mut self) -> Result<Vec<EventRecord>> {
        let max_batch_size = self.config.max_batch_size;
        let max_log_size = self.config.max_log_size;
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| Error::Source("source is not open".to_string()))?;

        let mut offset = self.offset;
        if Self::was_truncated(file, offset, &self.fingerprint)? {
            warn!(
                source = %self.config.name,
                offset,
                "File was truncated or replaced, reading it again from the start"
            );
            offset = 0;
            self.fingerprint.clear();
        }

        file.seek(SeekFrom::Start(offset))?;
        let mut reader = BufReader::new(&mut *file);
        let mut raw_lines = Vec::new();
        while raw_lines.len() < max_batch_size {
            let mut raw = Vec::new();
            let (n, complete) = read_line_capped(&mut reader, &mut raw, max_log_size)?;
            // Partial lines are picked up once the writer finishes them
            if !complete {
                break;
            }
            offset += n;
            raw_lines.push(raw);
        }
        drop(reader);

        if (self.fingerprint.len() as u64) < offset.min(FINGERPRINT_SIZE) {
            self.fingerprint = Self::fingerprint(file, offset)?;
        }
        self.offset = offset;

        let mut records = Vec::with_capacity(raw_lines.len());
        for raw in raw_lines {
            self.line_number += 1;
            if let Some(record) = self.to_record(self.line_number, &raw) {
                records.push(record);
            }
        }

        Ok(records)
    }

    async fn close(&mut self) -> Result<()> {
        self.file = None;
        Ok(())
    }
}
