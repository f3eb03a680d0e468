// SPDX-License-Identifier: Apache-2.0

//! Publisher writing events as JSON lines to stdout or an append-only file.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::select;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::{Error, Result};
use crate::event::Event;
use crate::publish::Publisher;

/// Destination for published events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutput {
    Stdout,
    File(PathBuf),
}

impl FromStr for PublishOutput {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim() {
            "" => Err("output must not be empty".to_string()),
            "-" | "stdout" => Ok(PublishOutput::Stdout),
            path => Ok(PublishOutput::File(PathBuf::from(path))),
        }
    }
}

enum Writer {
    Stdout(tokio::io::Stdout),
    File(tokio::fs::File),
}

impl Writer {
    /// Write `buf[*written..]`, advancing `written` as bytes are accepted.
    async fn write_batch(&mut self, buf: &[u8], written: &mut usize) -> std::io::Result<()> {
        match self {
            Writer::Stdout(out) => write_from(out, buf, written).await,
            Writer::File(file) => {
                write_from(file, buf, written).await?;
                file.sync_data().await
            }
        }
    }
}

/// Write the unwritten tail of `buf` and flush.
///
/// On error `written` holds how much of `buf` already reached the writer, so a
/// retry resumes there instead of duplicating the head of the batch.
async fn write_from<W: AsyncWrite + Unpin>(
    w: &mut W,
    buf: &[u8],
    written: &mut usize,
) -> std::io::Result<()> {
    while *written < buf.len() {
        match w.write(&buf[*written..]).await? {
            0 => return Err(std::io::ErrorKind::WriteZero.into()),
            n => *written += n,
        }
    }
    w.flush().await
}

pub struct JsonLinesPublisher {
    output: PublishOutput,
    writer: Mutex<Option<Writer>>,
    retry_backoff: Duration,
    cancel: CancellationToken,
}

impl JsonLinesPublisher {
    /// Create a publisher. `cancel` interrupts retries once shutdown begins.
    pub fn new(output: PublishOutput, retry_backoff: Duration, cancel: CancellationToken) -> Self {
        Self {
            output,
            writer: Mutex::new(None),
            retry_backoff,
            cancel,
        }
    }

    async fn open(&self) -> Result<Writer> {
        match &self.output {
            PublishOutput::Stdout => Ok(Writer::Stdout(tokio::io::stdout())),
            PublishOutput::File(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .await
                    .map_err(|e| {
                        Error::Publish(format!("failed to open {}: {}", path.display(), e))
                    })?;
                Ok(Writer::File(file))
            }
        }
    }

    async fn try_write(
        &self,
        writer: &mut Option<Writer>,
        buf: &[u8],
        written: &mut usize,
    ) -> Result<()> {
        if writer.is_none() {
            *writer = Some(self.open().await?);
        }

        if let Some(w) = writer.as_mut() {
            if let Err(e) = w.write_batch(buf, written).await {
                // Reopen on the next attempt
                *writer = None;
                return Err(Error::Io(e));
            }
        }
        Ok(())
    }
}

fn encode(events: &[Event]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(events.len() * 256);
    for event in events {
        match serde_json::to_vec(event) {
            Ok(line) => {
                buf.extend_from_slice(&line);
                buf.push(b'\n');
            }
            Err(e) => error!(
                source = %event.source,
                record_number = event.record_number,
                "Unable to encode event, dropping it: {}", e
            ),
        }
    }
    buf
}

#[async_trait]
impl Publisher for JsonLinesPublisher {
    async fn publish(&self, events: Vec<Event>) -> bool {
        let buf = encode(&events);
        if buf.is_empty() {
            return true;
        }

        // Held across retries: no other batch may land inside a partially
        // written one.
        let mut writer = self.writer.lock().await;
        let mut written = 0;
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.try_write(&mut *writer, &buf, &mut written).await {
                Ok(()) => {
                    debug!(events = events.len(), attempt, "Published batch");
                    return true;
                }
                Err(e) => {
                    warn!(
                        attempt,
                        written,
                        total = buf.len(),
                        "Failed to publish batch, retrying: {}", e
                    );
                }
            }

            select! {
                _ = self.cancel.cancelled() => {
                    debug!("Shutdown in progress, abandoning publish");
                    return false;
                }
                _ = tokio::time::sleep(self.retry_backoff) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventRecord;
    use chrono::{DateTime, Utc};
    use tempfile::TempDir;

    fn events(source: &str, numbers: &[u64]) -> Vec<Event> {
        numbers
            .iter()
            .map(|n| {
                let ts = DateTime::<Utc>::from_timestamp(*n as i64, 0).unwrap();
                EventRecord::new(*n, ts, serde_json::json!({"n": n})).to_event(source)
            })
            .collect()
    }

    #[test]
    fn test_parse_output() {
        assert_eq!("-".parse::<PublishOutput>().unwrap(), PublishOutput::Stdout);
        assert_eq!(
            "stdout".parse::<PublishOutput>().unwrap(),
            PublishOutput::Stdout
        );
        assert_eq!(
            "/tmp/out.jsonl".parse::<PublishOutput>().unwrap(),
            PublishOutput::File(PathBuf::from("/tmp/out.jsonl"))
        );
        assert!("".parse::<PublishOutput>().is_err());
    }

    #[tokio::test]
    async fn test_publish_appends_json_lines() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("out.jsonl");
        let publisher = JsonLinesPublisher::new(
            PublishOutput::File(path.clone()),
            Duration::from_millis(10),
            CancellationToken::new(),
        );

        assert!(publisher.publish(events("App", &[1, 2])).await);
        assert!(publisher.publish(events("App", &[3])).await);

        let content = std::fs::read_to_string(&path).unwrap();
        let published: Vec<Event> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        let numbers: Vec<u64> = published.iter().map(|e| e.record_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert_eq!(published[0].source, "App");
    }

    #[tokio::test]
    async fn test_publish_to_stdout() {
        let publisher = JsonLinesPublisher::new(
            PublishOutput::Stdout,
            Duration::from_millis(10),
            CancellationToken::new(),
        );

        assert!(publisher.publish(events("App", &[1])).await);
    }

    #[tokio::test]
    async fn test_publish_returns_false_on_shutdown() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("missing-dir").join("out.jsonl");
        let cancel = CancellationToken::new();
        let publisher = JsonLinesPublisher::new(
            PublishOutput::File(path),
            Duration::from_secs(60),
            cancel.clone(),
        );

        let handle = tokio::spawn(async move { publisher.publish(events("App", &[4, 5])).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        assert!(!handle.await.unwrap());
    }

    #[tokio::test]
    async fn test_publish_completes_when_cancelled_but_writable() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("out.jsonl");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let publisher = JsonLinesPublisher::new(
            PublishOutput::File(path.clone()),
            Duration::from_millis(10),
            cancel,
        );

        assert!(publisher.publish(events("App", &[1])).await);
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 1);
    }

    #[tokio::test]
    async fn test_publish_retries_until_writable() {
        let temp_dir = TempDir::new().unwrap();
        let out_dir = temp_dir.path().join("later");
        let path = out_dir.join("out.jsonl");
        let publisher = std::sync::Arc::new(JsonLinesPublisher::new(
            PublishOutput::File(path.clone()),
            Duration::from_millis(10),
            CancellationToken::new(),
        ));

        let p = publisher.clone();
        let handle = tokio::spawn(async move { p.publish(events("App", &[1])).await });
        tokio::time::sleep(Duration::from_millis(30)).await;
        std::fs::create_dir_all(&out_dir).unwrap();

        assert!(handle.await.unwrap());
        assert!(path.exists());
    }

    /// Sink that accepts a fixed number of bytes and then fails.
    struct FailingSink {
        data: Vec<u8>,
        fail_after: Option<usize>,
    }

    impl AsyncWrite for FailingSink {
        fn poll_write(
            mut self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &[u8],
        ) -> std::task::Poll<std::io::Result<usize>> {
            let room = match self.fail_after {
                Some(limit) => limit.saturating_sub(self.data.len()),
                None => buf.len(),
            };
            if room == 0 {
                return std::task::Poll::Ready(Err(std::io::Error::other("no space left")));
            }
            let n = room.min(buf.len());
            self.data.extend_from_slice(&buf[..n]);
            std::task::Poll::Ready(Ok(n))
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_interrupted_write_resumes_without_duplicating() {
        let buf = encode(&events("App", &[1, 2, 3]));
        let mut sink = FailingSink {
            data: Vec::new(),
            fail_after: Some(10),
        };
        let mut written = 0;

        assert!(write_from(&mut sink, &buf, &mut written).await.is_err());
        assert_eq!(written, 10);

        sink.fail_after = None;
        write_from(&mut sink, &buf, &mut written).await.unwrap();

        assert_eq!(written, buf.len());
        assert_eq!(sink.data, buf);
        let numbers: Vec<u64> = std::str::from_utf8(&sink.data)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str::<Event>(l).unwrap().record_number)
            .collect();
        assert_eq!(numbers, vec![1, 2, 3]);
    }
}
