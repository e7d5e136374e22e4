//! [`BridgeLoop`] – the streaming control loop.
//!
//! Each tick drains at most one sample from every sensor queue, folds the
//! latest known angles of all sensors into one [`OutputRecord`] row and, once
//! `batch_size` rows have accumulated, pushes them to the [`PublishSink`] as a
//! single chunk.
//!
//! # Tick
//!
//! | Step | Action |
//! |---|---|
//! | 1 | For each sensor in index order: if its queue has data, pop the oldest sample and store it as that sensor's latest value. |
//! | 2 | If no sensor produced a value, the tick ends here. |
//! | 3 | Write the latest value of every sensor into row `counter % batch_size`. |
//! | 4 | On `counter % summary_every == 0`, log one summary line per sensor. |
//! | 5 | If row `batch_size - 1` was just written, flush the batch to the sink. |
//! | 6 | Increment the counter. |
//!
//! Sensors that have not delivered yet contribute zeros; sensors that were
//! quiet this tick contribute their previous value.

use std::sync::Arc;
use std::thread;

use mtwlink_hal::{DataSignal, SampleConsumer};
use mtwlink_middleware::PublishSink;
use mtwlink_types::{BridgeError, DeviceId, EulerSample, OutputRecord};
use tracing::{debug, info};

use crate::control::{ControlCommand, ControlReceiver, WaitStrategy};

/// Rows per published chunk.
pub const DEFAULT_BATCH_SIZE: usize = 25;
/// Ticks between summary log blocks.
pub const DEFAULT_SUMMARY_EVERY: u64 = 25;

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeLoopConfig {
    /// Rows per chunk.  Clamped to at least 1.
    pub batch_size: usize,
    /// Log a summary block every this many records.  `0` disables it.
    pub summary_every: u64,
    pub wait: WaitStrategy,
}

impl Default for BridgeLoopConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            summary_every: DEFAULT_SUMMARY_EVERY,
            wait: WaitStrategy::default(),
        }
    }
}

/// Consumer end of one sensor's queue, tagged with the sensor id.
#[derive(Debug)]
pub struct SensorFeed {
    pub id: DeviceId,
    pub consumer: SampleConsumer,
}

impl SensorFeed {
    pub fn new(id: DeviceId, consumer: SampleConsumer) -> Self {
        Self { id, consumer }
    }
}

/// Counters reported when the loop ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    /// Records produced (ticks on which at least one sensor had data).
    pub records: u64,
    /// Samples popped across all queues.
    pub samples: u64,
    /// Chunks pushed to the sink.
    pub chunks: u64,
}

// ─────────────────────────────────────────────────────────────────────────────
// BridgeLoop
// ─────────────────────────────────────────────────────────────────────────────

pub struct BridgeLoop<S: PublishSink> {
    feeds: Vec<SensorFeed>,
    latest: Vec<EulerSample>,
    batch: Vec<OutputRecord>,
    counter: u64,
    sink: S,
    signal: Option<Arc<DataSignal>>,
    config: BridgeLoopConfig,
    stats: LoopStats,
}

impl<S: PublishSink> BridgeLoop<S> {
    pub fn new(feeds: Vec<SensorFeed>, sink: S, config: BridgeLoopConfig) -> Self {
        let sensors = feeds.len();
        let batch_size = config.batch_size.max(1);
        Self {
            feeds,
            latest: vec![EulerSample::default(); sensors],
            batch: vec![OutputRecord::for_sensors(sensors); batch_size],
            counter: 0,
            sink,
            signal: None,
            config: BridgeLoopConfig {
                batch_size,
                ..config
            },
            stats: LoopStats::default(),
        }
    }

    /// Wake on `signal` instead of sleeping blindly when parked.  Pass the
    /// signal the sensor queues were built with.
    pub fn with_signal(mut self, signal: Arc<DataSignal>) -> Self {
        self.signal = Some(signal);
        self
    }

    pub fn stats(&self) -> LoopStats {
        self.stats
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Latest known angles per sensor, in feed order.
    pub fn latest(&self) -> &[EulerSample] {
        &self.latest
    }

    /// Samples discarded by the queues' overflow policy, summed over sensors.
    pub fn dropped_samples(&self) -> u64 {
        self.feeds.iter().map(|f| f.consumer.dropped()).sum()
    }

    /// Consume the loop, handing back the sink and the per-sensor consumers.
    pub fn into_parts(self) -> (S, Vec<SensorFeed>) {
        (self.sink, self.feeds)
    }

    /// Run a single iteration.
    ///
    /// Returns `Ok(true)` when at least one sensor delivered a sample.
    ///
    /// # Errors
    ///
    /// Propagates the sink's error when a flush fails.  The batch buffer is
    /// left as it was; the counter still advances.
    pub fn tick(&mut self) -> Result<bool, BridgeError> {
        let mut fresh = false;
        for (slot, feed) in self.latest.iter_mut().zip(&self.feeds) {
            if !feed.consumer.has_data() {
                continue;
            }
            if let Some(sample) = feed.consumer.pop_oldest() {
                *slot = sample;
                fresh = true;
                self.stats.samples += 1;
            }
        }
        if !fresh {
            return Ok(false);
        }

        let batch_size = self.config.batch_size as u64;
        let row = (self.counter % batch_size) as usize;
        for (i, sample) in self.latest.iter().enumerate() {
            self.batch[row].set_sensor(i, sample);
        }

        if self.config.summary_every > 0 && self.counter % self.config.summary_every == 0 {
            self.log_summary();
        }

        let full = row + 1 == self.config.batch_size;
        self.counter += 1;
        self.stats.records += 1;

        if full {
            self.sink.push_chunk(&self.batch)?;
            self.stats.chunks += 1;
            debug!(chunk = self.stats.chunks, rows = self.batch.len(), "chunk flushed");
        }
        Ok(true)
    }

    /// Tick until `control` says quit.
    ///
    /// `Start` commands arriving while streaming are ignored.
    ///
    /// # Errors
    ///
    /// A sink failure ends the loop and is returned; the caller decides how
    /// to shut down.
    pub fn run(&mut self, control: &ControlReceiver) -> Result<LoopStats, BridgeError> {
        info!(
            sensors = self.feeds.len(),
            batch_size = self.config.batch_size,
            "streaming started"
        );
        loop {
            if control.quit_requested() {
                break;
            }
            if let Some(ControlCommand::Quit) = control.try_recv() {
                break;
            }
            let seen = match self.config.wait {
                WaitStrategy::Park { .. } => self.signal.as_ref().map(|s| s.generation()),
                WaitStrategy::BusyYield => None,
            };
            if !self.tick()? {
                self.idle(seen);
            }
        }
        info!(
            records = self.stats.records,
            chunks = self.stats.chunks,
            "streaming stopped"
        );
        Ok(self.stats)
    }

    fn idle(&self, seen: Option<u64>) {
        match self.config.wait {
            WaitStrategy::BusyYield => thread::yield_now(),
            WaitStrategy::Park { timeout } => match (&self.signal, seen) {
                (Some(signal), Some(seen)) => {
                    signal.wait_past(seen, timeout);
                }
                _ => thread::sleep(timeout),
            },
        }
    }

    fn log_summary(&self) {
        for (i, (feed, sample)) in self.feeds.iter().zip(&self.latest).enumerate() {
            info!(
                target: "mtwlink::data",
                "[{i}]: ID: {}, Roll: {:7.2}, Pitch: {:7.2}, Yaw: {:7.2}",
                feed.id,
                sample.roll,
                sample.pitch,
                sample.yaw
            );
        }
    }
}
