//! In-process real-time stream bus.
//!
//! A [`StreamOutlet`] publishes [`Chunk`]s of [`OutputRecord`] rows under a
//! stream identity ([`StreamInfo`]) that is fixed when the outlet is created.
//! Any number of [`StreamInlet`]s can subscribe; each receives every chunk
//! without one slow inlet blocking the others.  Uses
//! [`tokio::sync::broadcast`] under the hood, so publishing works from plain
//! threads and receiving works from async code.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use mtwlink_types::{BridgeError, OutputRecord};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::sink::PublishSink;

/// Default number of buffered chunks before the oldest are dropped for slow
/// inlets.
pub const DEFAULT_CAPACITY: usize = 64;

/// Identity of a published stream.  Declared once, immutable afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamInfo {
    /// Stream name, e.g. `"XsensRaw"`.
    pub name: String,
    /// Content type, e.g. `"rawAngles"`.
    pub kind: String,
    /// Number of `f32` channels per row.
    pub channel_count: usize,
    /// Nominal sampling rate in Hz (`0.0` for irregular streams).
    pub nominal_rate: f64,
    /// Unique id of this outlet instance.
    pub source_id: Uuid,
}

impl StreamInfo {
    pub fn new(
        name: impl Into<String>,
        kind: impl Into<String>,
        channel_count: usize,
        nominal_rate: f64,
    ) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            channel_count,
            nominal_rate,
            source_id: Uuid::new_v4(),
        }
    }

    /// Reject rows whose width differs from `channel_count`.
    pub fn check_rows(&self, rows: &[OutputRecord]) -> Result<(), BridgeError> {
        match rows
            .iter()
            .position(|row| row.channel_count() != self.channel_count)
        {
            Some(i) => Err(BridgeError::Sink(format!(
                "row {i} has {} channels, stream '{}' declares {}",
                rows[i].channel_count(),
                self.name,
                self.channel_count
            ))),
            None => Ok(()),
        }
    }
}

/// One published batch of rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Monotonic chunk counter, starting at 0 for each outlet.
    pub seq: u64,
    /// Wall-clock time the chunk was published.
    pub timestamp: DateTime<Utc>,
    pub rows: Vec<OutputRecord>,
}

/// Publishing side of the stream bus.  Clones share the channel but keep
/// their own chunk counter.
#[derive(Debug, Clone)]
pub struct StreamOutlet {
    info: Arc<StreamInfo>,
    sender: broadcast::Sender<Arc<Chunk>>,
    seq: u64,
}

impl StreamOutlet {
    /// Create an outlet buffering up to `capacity` chunks per inlet.
    pub fn new(info: StreamInfo, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            info: Arc::new(info),
            sender,
            seq: 0,
        }
    }

    /// Attach a new inlet.  It only sees chunks published after this call.
    pub fn subscribe(&self) -> StreamInlet {
        StreamInlet {
            info: Arc::clone(&self.info),
            receiver: self.sender.subscribe(),
        }
    }

    /// Number of inlets currently attached.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Publish `rows` as one chunk.
    ///
    /// Returns the number of inlets that were handed the chunk.  Publishing
    /// with no inlet attached is normal and returns `Ok(0)`.
    pub fn publish(&mut self, rows: &[OutputRecord]) -> Result<usize, BridgeError> {
        self.info.check_rows(rows)?;
        let chunk = Arc::new(Chunk {
            seq: self.seq,
            timestamp: Utc::now(),
            rows: rows.to_vec(),
        });
        self.seq += 1;
        match self.sender.send(chunk) {
            Ok(n) => Ok(n),
            Err(broadcast::error::SendError(_)) => {
                debug!(stream = %self.info.name, "no inlets attached; chunk discarded");
                Ok(0)
            }
        }
    }
}

impl PublishSink for StreamOutlet {
    fn info(&self) -> &StreamInfo {
        &self.info
    }

    fn push_chunk(&mut self, rows: &[OutputRecord]) -> Result<(), BridgeError> {
        self.publish(rows).map(|_| ())
    }
}

/// Subscribing side of the stream bus.
pub struct StreamInlet {
    info: Arc<StreamInfo>,
    receiver: broadcast::Receiver<Arc<Chunk>>,
}

impl StreamInlet {
    pub fn info(&self) -> &StreamInfo {
        &self.info
    }

    /// Wait for the next chunk.
    ///
    /// Returns `None` once every outlet clone has been dropped.  Chunks lost
    /// because this inlet fell behind are logged and skipped.
    pub async fn recv(&mut self) -> Option<Arc<Chunk>> {
        loop {
            match self.receiver.recv().await {
                Ok(chunk) => return Some(chunk),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(stream = %self.info.name, lagged_by = n, "StreamInlet lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking receive; `None` when no chunk is pending.
    pub fn try_recv(&mut self) -> Option<Arc<Chunk>> {
        loop {
            match self.receiver.try_recv() {
                Ok(chunk) => return Some(chunk),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    warn!(stream = %self.info.name, lagged_by = n, "StreamInlet lagged");
                    continue;
                }
                Err(_) => return None,
            }
        }
    }
}
