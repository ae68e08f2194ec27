use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio::task::JoinHandle;

const READ_CHUNK: usize = 8192;

/// Combined stdout/stderr of a sandboxed command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub bytes: Vec<u8>,
    pub truncated: bool,
}

impl CapturedOutput {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Append-only buffer that stops growing at `limit` bytes
#[derive(Debug)]
pub struct BoundedOutput {
    buf: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl BoundedOutput {
    pub fn new(limit: usize) -> Self {
        Self {
            buf: Vec::with_capacity(limit.min(READ_CHUNK)),
            limit,
            truncated: false,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        let room = self.limit.saturating_sub(self.buf.len());
        if chunk.len() > room {
            self.truncated = true;
        }
        self.buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }

    pub fn finish(self) -> CapturedOutput {
        CapturedOutput {
            bytes: self.buf,
            truncated: self.truncated,
        }
    }
}

/// Drains a child's stdout and stderr into one bounded buffer, in arrival order
///
/// Readers keep consuming after the limit is reached so the child never blocks
/// on a full pipe; the excess is dropped.
pub struct OutputCollector {
    sink: Arc<Mutex<BoundedOutput>>,
    readers: Vec<JoinHandle<()>>,
}

impl OutputCollector {
    pub fn attach(child: &mut Child, limit: usize) -> Self {
        let sink = Arc::new(Mutex::new(BoundedOutput::new(limit)));
        let mut readers = Vec::with_capacity(2);

        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(drain(stdout, Arc::clone(&sink))));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(drain(stderr, Arc::clone(&sink))));
        }

        Self { sink, readers }
    }

    /// Waits up to `grace` for the pipes to close, then returns what was captured
    ///
    /// A descendant that escaped termination could hold a pipe open forever;
    /// such readers are aborted rather than awaited.
    pub async fn finish(self, grace: Duration) -> CapturedOutput {
        for mut reader in self.readers {
            if tokio::time::timeout(grace, &mut reader).await.is_err() {
                log::warn!("Output pipe still open after {grace:?}, abandoning reader");
                reader.abort();
            }
        }

        let mut sink = self.sink.lock();
        std::mem::replace(&mut *sink, BoundedOutput::new(0)).finish()
    }
}

async fn drain<R: AsyncRead + Unpin>(mut reader: R, sink: Arc<Mutex<BoundedOutput>>) {
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => sink.lock().push(&chunk[..n]),
            Err(e) => {
                log::debug!("Output pipe read failed: {e}");
                break;
            }
        }
    }
}
