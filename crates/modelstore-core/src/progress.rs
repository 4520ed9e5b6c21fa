//! Throttled progress reporting for long blob transfers.
//!
//! Progress is written to a [`ProgressSink`] as line-delimited JSON
//! [`Message`]s. A [`Reporter`] relays cumulative byte counts from a
//! producer (normally a blob write on the blocking pool) to the sink, at most
//! once per [`ProgressConfig::UPDATE_INTERVAL`] unless a large delta arrives.

use crate::config::ProgressConfig;
use crate::error::{Result, StoreError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// Shared, clonable writer that progress messages go to.
#[derive(Clone)]
pub struct ProgressSink {
    inner: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl ProgressSink {
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl fmt::Debug for ProgressSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressSink").finish_non_exhaustive()
    }
}

impl Write for ProgressSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner
            .lock()
            .map_err(|_| io::Error::other("progress sink lock poisoned"))?
            .write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner
            .lock()
            .map_err(|_| io::Error::other("progress sink lock poisoned"))?
            .flush()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Progress,
    Success,
    Error,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerProgress {
    pub id: String,
    pub size: u64,
    pub current: u64,
}

/// One line of progress output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub message: String,
    /// Total bytes across the whole transfer.
    pub total: u64,
    /// Bytes of the current layer received so far.
    pub pulled: u64,
    pub layer: LayerProgress,
}

/// Formats the human-readable part of a progress message from a byte count.
pub type MessageFormat = fn(u64) -> String;

pub fn pull_message(bytes: u64) -> String {
    format!("Downloaded: {:.2} MB", bytes as f64 / 1024.0 / 1024.0)
}

pub fn write_message<W: Write + ?Sized>(w: &mut W, message: &Message) -> io::Result<()> {
    let mut line = serde_json::to_vec(message).map_err(io::Error::other)?;
    line.push(b'\n');
    w.write_all(&line)?;
    w.flush()
}

pub fn write_progress<W: Write + ?Sized>(
    w: &mut W,
    message: String,
    total: u64,
    layer: &LayerInfo,
    current: u64,
) -> io::Result<()> {
    write_message(
        w,
        &Message {
            kind: MessageType::Progress,
            message,
            total,
            pulled: current,
            layer: LayerProgress {
                id: layer.id.clone(),
                size: layer.size,
                current,
            },
        },
    )
}

pub fn write_success<W: Write + ?Sized>(w: &mut W, message: impl Into<String>) -> io::Result<()> {
    write_message(w, &status(MessageType::Success, message.into()))
}

pub fn write_error<W: Write + ?Sized>(w: &mut W, message: impl Into<String>) -> io::Result<()> {
    write_message(w, &status(MessageType::Error, message.into()))
}

fn status(kind: MessageType, message: String) -> Message {
    Message {
        kind,
        message,
        total: 0,
        pulled: 0,
        layer: LayerProgress::default(),
    }
}

/// The layer a reporter tracks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerInfo {
    /// Layer digest string.
    pub id: String,
    /// Size of this layer in bytes.
    pub size: u64,
    /// Size of every layer in the transfer combined.
    pub total: u64,
}

/// Relays byte counts for one layer to a sink.
///
/// Must be created inside a tokio runtime. Producers send cumulative counts
/// through [`Reporter::updates`] with `try_send`; [`Reporter::wait`] closes
/// the reporter's own handle and returns once every sender is gone and the
/// relay has drained.
pub struct Reporter {
    tx: mpsc::Sender<u64>,
    handle: JoinHandle<io::Result<()>>,
}

impl Reporter {
    pub fn new(sink: ProgressSink, layer: LayerInfo, format: MessageFormat) -> Self {
        let (tx, rx) = mpsc::channel(ProgressConfig::CHANNEL_CAPACITY);
        let handle = tokio::spawn(relay(rx, sink, layer, format));
        Self { tx, handle }
    }

    pub fn updates(&self) -> mpsc::Sender<u64> {
        self.tx.clone()
    }

    /// Wait for the relay to finish. Returns the first sink error, if any.
    pub async fn wait(self) -> Result<()> {
        drop(self.tx);
        match self.handle.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(StoreError::Io {
                message: format!("Failed to write progress: {}", e),
                path: None,
                source: Some(e),
            }),
            Err(e) => Err(StoreError::Other(format!("progress relay failed: {}", e))),
        }
    }
}

async fn relay(
    mut rx: mpsc::Receiver<u64>,
    mut sink: ProgressSink,
    layer: LayerInfo,
    format: MessageFormat,
) -> io::Result<()> {
    let mut last_update: Option<Instant> = None;
    let mut last_complete: u64 = 0;
    let mut error: Option<io::Error> = None;

    while let Some(complete) = rx.recv().await {
        // After a failed write, keep draining so producers never block.
        if error.is_some() {
            continue;
        }

        let now = Instant::now();
        let due = match last_update {
            None => true,
            Some(at) => {
                now.duration_since(at) >= ProgressConfig::UPDATE_INTERVAL
                    || complete.saturating_sub(last_complete) >= ProgressConfig::MIN_BYTES_FOR_UPDATE
            }
        };
        if !due {
            continue;
        }

        if let Err(e) = write_progress(&mut sink, format(complete), layer.total, &layer, complete) {
            debug!("Progress sink failed for layer {}: {}", layer.id, e);
            error = Some(e);
        }
        last_update = Some(now);
        last_complete = complete;
    }

    match error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
