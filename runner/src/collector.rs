//! Output collector
//!
//! Captures one output stream of a sandboxed process up to a fixed byte ceiling.
//! Bytes past the ceiling are read and discarded so the producer never blocks on
//! a full pipe, and the capture is flagged `truncated`. Optionally forwards the
//! retained bytes to a bounded channel; chunks are dropped when it is full.

use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

const READ_CHUNK: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// A piece of live output forwarded while the process runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub kind: StreamKind,
    pub data: Vec<u8>,
}

/// Bytes retained from one stream
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedStream {
    pub bytes: Vec<u8>,
    pub truncated: bool,
    /// Total bytes produced, including discarded ones
    pub total_bytes: u64,
}

impl CapturedStream {
    pub fn into_string(self) -> String {
        match String::from_utf8(self.bytes) {
            Ok(s) => s,
            Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
        }
    }

    pub fn as_lossy_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.bytes)
    }
}

/// Bounded reader for one stream
pub struct OutputCollector {
    kind: StreamKind,
    limit: usize,
    forward: Option<mpsc::Sender<OutputChunk>>,
}

impl OutputCollector {
    pub fn new(kind: StreamKind, limit: usize) -> Self {
        Self {
            kind,
            limit,
            forward: None,
        }
    }

    pub fn with_forward(mut self, forward: Option<mpsc::Sender<OutputChunk>>) -> Self {
        self.forward = forward;
        self
    }

    /// Read `reader` to EOF, keeping at most `limit` bytes
    pub async fn collect<R: AsyncRead + Unpin>(self, reader: R) -> io::Result<CapturedStream> {
        let shared = Arc::new(Mutex::new(CapturedStream::default()));
        self.collect_into(reader, &shared).await?;
        let captured = std::mem::take(&mut *lock(&shared));
        Ok(captured)
    }

    /// Like [`collect`](Self::collect), appending into `shared` as bytes arrive
    async fn collect_into<R: AsyncRead + Unpin>(
        self,
        mut reader: R,
        shared: &Mutex<CapturedStream>,
    ) -> io::Result<()> {
        let mut chunk = vec![0u8; READ_CHUNK];

        loop {
            let n = reader.read(&mut chunk).await?;
            if n == 0 {
                return Ok(());
            }

            let keep = {
                let mut captured = lock(shared);
                captured.total_bytes += n as u64;
                let room = self.limit - captured.bytes.len();
                let keep = n.min(room);
                if keep < n {
                    captured.truncated = true;
                }
                captured.bytes.extend_from_slice(&chunk[..keep]);
                keep
            };
            if keep == 0 {
                continue;
            }

            if let Some(forward) = &self.forward {
                // Slow consumers lose chunks rather than stall the process
                let _ = forward.try_send(OutputChunk {
                    kind: self.kind,
                    data: chunk[..keep].to_vec(),
                });
            }
        }
    }

    pub fn spawn<R>(self, reader: R) -> CollectorHandle
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let captured = Arc::new(Mutex::new(CapturedStream {
            bytes: Vec::with_capacity(self.limit.min(READ_CHUNK)),
            ..CapturedStream::default()
        }));
        let shared = captured.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = self.collect_into(reader, &shared).await {
                warn!("Output stream read failed: {}", e);
                lock(&shared).truncated = true;
            }
        });
        CollectorHandle {
            task: Some(task),
            captured,
        }
    }
}

fn lock(shared: &Mutex<CapturedStream>) -> MutexGuard<'_, CapturedStream> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A running collector; bytes read so far stay available even if it never ends
pub struct CollectorHandle {
    task: Option<JoinHandle<()>>,
    captured: Arc<Mutex<CapturedStream>>,
}

impl CollectorHandle {
    /// Wait up to `grace` for the stream to close. True once it has.
    pub async fn wait_closed(&mut self, grace: Duration) -> bool {
        let Some(task) = self.task.as_mut() else {
            return true;
        };
        match tokio::time::timeout(grace, task).await {
            Ok(joined) => {
                if let Err(e) = joined {
                    warn!("Output collector task failed: {}", e);
                    lock(&self.captured).truncated = true;
                }
                self.task = None;
                true
            }
            Err(_) => false,
        }
    }

    /// Stop collecting and return what was captured.
    ///
    /// A stream that is still open is abandoned and reported as truncated.
    pub fn into_captured(mut self) -> CapturedStream {
        if let Some(task) = self.task.take() {
            task.abort();
            lock(&self.captured).truncated = true;
        }
        let captured = std::mem::take(&mut *lock(&self.captured));
        captured
    }
}

/// Wait for a spawned collector once the process is gone.
///
/// A descendant that escaped the process group may still hold the pipe open;
/// after `grace` the capture is abandoned, keeping the bytes read so far.
pub async fn finish(mut handle: CollectorHandle, grace: Duration) -> CapturedStream {
    if !handle.wait_closed(grace).await {
        warn!("Output stream still open {:?} after exit, abandoning", grace);
    }
    handle.into_captured()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_collect_under_limit() {
        let collector = OutputCollector::new(StreamKind::Stdout, 64);
        let captured = collector.collect(&b"hello\n"[..]).await.unwrap();

        assert_eq!(captured.bytes, b"hello\n");
        assert!(!captured.truncated);
        assert_eq!(captured.total_bytes, 6);
    }

    #[tokio::test]
    async fn test_truncates_at_exact_ceiling() {
        let data = vec![b'x'; 100_000];
        let collector = OutputCollector::new(StreamKind::Stdout, 1000);
        let captured = collector.collect(&data[..]).await.unwrap();

        assert!(captured.truncated);
        assert_eq!(captured.bytes.len(), 1000);
        assert_eq!(captured.total_bytes, 100_000);
    }

    #[tokio::test]
    async fn test_producer_never_blocks() {
        // A tiny pipe: the writer only finishes if the collector keeps draining
        let (mut writer, reader) = tokio::io::duplex(64);
        let handle = OutputCollector::new(StreamKind::Stderr, 10).spawn(reader);

        writer.write_all(&vec![b'y'; 1 << 20]).await.unwrap();
        drop(writer);

        let captured = finish(handle, Duration::from_secs(5)).await;
        assert_eq!(captured.bytes, vec![b'y'; 10]);
        assert!(captured.truncated);
    }

    #[tokio::test]
    async fn test_forward_drops_when_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let (mut writer, reader) = tokio::io::duplex(4);
        let handle = OutputCollector::new(StreamKind::Stdout, 1024)
            .with_forward(Some(tx))
            .spawn(reader);

        for _ in 0..16 {
            writer.write_all(b"abcd").await.unwrap();
        }
        drop(writer);

        let captured = finish(handle, Duration::from_secs(5)).await;
        assert_eq!(captured.bytes.len(), 64);

        let mut forwarded = 0;
        while let Ok(chunk) = rx.try_recv() {
            assert_eq!(chunk.kind, StreamKind::Stdout);
            forwarded += chunk.data.len();
        }
        assert!(forwarded > 0 && forwarded < 64);
    }

    #[tokio::test]
    async fn test_finish_abandons_open_stream() {
        let (_writer, reader) = tokio::io::duplex(64);
        let handle = OutputCollector::new(StreamKind::Stdout, 16).spawn(reader);

        let captured = finish(handle, Duration::from_millis(50)).await;
        assert!(captured.truncated);
        assert!(captured.bytes.is_empty());
    }

    #[tokio::test]
    async fn test_abandoned_stream_keeps_bytes_read() {
        let (mut writer, reader) = tokio::io::duplex(64);
        let mut handle = OutputCollector::new(StreamKind::Stdout, 1024).spawn(reader);

        writer.write_all(b"important\n").await.unwrap();
        // Writer stays open, like a detached process holding the pipe
        for _ in 0..50 {
            if lock(&handle.captured).total_bytes == 10 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!handle.wait_closed(Duration::from_millis(20)).await);

        let captured = finish(handle, Duration::from_millis(50)).await;
        assert_eq!(captured.bytes, b"important\n");
        assert!(captured.truncated);
        drop(writer);
    }
}
