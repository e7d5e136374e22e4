//! The publish-sink contract.
//!
//! The control loop never speaks to a transport directly.  It hands fixed
//! batches of [`OutputRecord`]s to a [`PublishSink`]; sinks translate them
//! into whatever the outside world consumes.
//!
//! - [`StreamOutlet`][crate::outlet::StreamOutlet] – in-process broadcast bus.
//! - [`JsonLinesSink`] – one JSON object per chunk, newline delimited, to
//!   any [`Write`] (file, stdout, pipe).

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use chrono::Utc;
use mtwlink_types::{BridgeError, OutputRecord};

use crate::outlet::{Chunk, StreamInfo};

/// Every outbound transport implements this trait.
///
/// # Contract
///
/// * `info` – the stream identity declared at creation; never changes.
/// * `push_chunk` – publish one batch.  Rows must be `info().channel_count`
///   wide.
pub trait PublishSink: Send {
    fn info(&self) -> &StreamInfo;

    fn push_chunk(&mut self, rows: &[OutputRecord]) -> Result<(), BridgeError>;
}

impl<S: PublishSink + ?Sized> PublishSink for Box<S> {
    fn info(&self) -> &StreamInfo {
        (**self).info()
    }

    fn push_chunk(&mut self, rows: &[OutputRecord]) -> Result<(), BridgeError> {
        (**self).push_chunk(rows)
    }
}

/// Writes each chunk as a single line of JSON.
pub struct JsonLinesSink<W: Write + Send> {
    info: StreamInfo,
    writer: W,
    seq: u64,
}

impl JsonLinesSink<BufWriter<File>> {
    /// Create (or truncate) `path` and write the stream header line.
    pub fn create(path: impl AsRef<Path>, info: StreamInfo) -> Result<Self, BridgeError> {
        let path = path.as_ref();
        let file = File::create(path)
            .map_err(|e| BridgeError::Sink(format!("failed to create {}: {e}", path.display())))?;
        Self::new(BufWriter::new(file), info)
    }
}

impl<W: Write + Send> JsonLinesSink<W> {
    /// Wrap `writer`.  The first line written is the [`StreamInfo`] header.
    pub fn new(mut writer: W, info: StreamInfo) -> Result<Self, BridgeError> {
        serde_json::to_writer(&mut writer, &info)
            .map_err(|e| BridgeError::Sink(format!("failed to write stream header: {e}")))?;
        writer
            .write_all(b"\n")
            .map_err(|e| BridgeError::Sink(format!("failed to write stream header: {e}")))?;
        Ok(Self {
            info,
            writer,
            seq: 0,
        })
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> PublishSink for JsonLinesSink<W> {
    fn info(&self) -> &StreamInfo {
        &self.info
    }

    fn push_chunk(&mut self, rows: &[OutputRecord]) -> Result<(), BridgeError> {
        self.info.check_rows(rows)?;
        let chunk = Chunk {
            seq: self.seq,
            timestamp: Utc::now(),
            rows: rows.to_vec(),
        };
        serde_json::to_writer(&mut self.writer, &chunk)
            .map_err(|e| BridgeError::Sink(format!("failed to encode chunk {}: {e}", chunk.seq)))?;
        self.writer
            .write_all(b"\n")
            .and_then(|()| self.writer.flush())
            .map_err(|e| BridgeError::Sink(format!("failed to write chunk {}: {e}", chunk.seq)))?;
        self.seq += 1;
        Ok(())
    }
}
