//! [`PacketQueue`] – per-sensor FIFO between a delivery thread and the
//! control loop.
//!
//! The device runtime calls back on its own thread whenever a sensor has a
//! new decoded sample.  That callback only ever pushes; the control loop only
//! ever peeks and pops.  [`PacketQueue::split`] hands out exactly one
//! [`SampleProducer`] and one [`SampleConsumer`] so the single-producer /
//! single-consumer discipline holds by construction.
//!
//! # Depth policy
//!
//! | Policy | Behaviour when the consumer stalls |
//! |---|---|
//! | [`QueuePolicy::Unbounded`] | Grows without limit. |
//! | [`QueuePolicy::DropOldest`] | Evicts the head once `capacity` is reached and counts the loss. |
//!
//! # Example
//!
//! ```rust
//! use mtwlink_hal::packet_queue::{PacketQueue, QueuePolicy};
//! use mtwlink_types::EulerSample;
//!
//! let (producer, consumer) = PacketQueue::new(QueuePolicy::Unbounded).split();
//! producer.push(EulerSample::new(1.0, 2.0, 3.0));
//!
//! assert!(consumer.has_data());
//! let sample = consumer.peek_oldest().unwrap();
//! consumer.pop_oldest();
//! assert_eq!(sample.yaw, 3.0);
//! assert!(!consumer.has_data());
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use mtwlink_types::EulerSample;

/// Samples retained per sensor before the oldest is evicted.  At 75 Hz this
/// is roughly 13 seconds of consumer stall.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// What a queue does when the consumer falls behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePolicy {
    Unbounded,
    DropOldest { capacity: usize },
}

impl Default for QueuePolicy {
    fn default() -> Self {
        QueuePolicy::DropOldest {
            capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl QueuePolicy {
    /// `0` means unbounded.
    pub fn from_capacity(capacity: usize) -> Self {
        if capacity == 0 {
            QueuePolicy::Unbounded
        } else {
            QueuePolicy::DropOldest { capacity }
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// DataSignal
// ────────────────────────────────────────────────────────────────────────────

/// Wake-up primitive shared by every queue feeding one consumer.
///
/// Each push bumps a generation counter.  The consumer records the generation
/// before it scans its queues and, if nothing was found, waits until the
/// generation moves past that value.  A push racing with the scan therefore
/// never gets lost.
///
/// The counter is atomic.  Producers only touch the mutex when a consumer is
/// parked in [`DataSignal::wait_past`].
#[derive(Debug, Default)]
pub struct DataSignal {
    generation: AtomicU64,
    parked: AtomicUsize,
    gate: Mutex<()>,
    cond: Condvar,
}

impl DataSignal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Current generation.  Read it *before* scanning the queues.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Announce that new data is available.
    pub fn raise(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if self.parked.load(Ordering::SeqCst) > 0 {
            // Taking the gate orders this notify after the waiter's
            // predicate check.
            let _gate = lock(&self.gate);
            self.cond.notify_all();
        }
    }

    /// Block until the generation differs from `seen` or `timeout` elapses.
    /// Returns the generation observed on wake-up.
    pub fn wait_past(&self, seen: u64, timeout: Duration) -> u64 {
        let gate = lock(&self.gate);
        self.parked.fetch_add(1, Ordering::SeqCst);
        let (gate, _) = self
            .cond
            .wait_timeout_while(gate, timeout, |_| self.generation() == seen)
            .unwrap_or_else(PoisonError::into_inner);
        self.parked.fetch_sub(1, Ordering::SeqCst);
        drop(gate);
        self.generation()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// PacketQueue
// ────────────────────────────────────────────────────────────────────────────

/// Thread-safe FIFO of decoded samples for a single sensor.
#[derive(Debug)]
pub struct PacketQueue {
    buffer: Mutex<VecDeque<EulerSample>>,
    // Mirror of `buffer.len()` so `has_data` never takes the lock.
    len: AtomicUsize,
    dropped: AtomicU64,
    policy: QueuePolicy,
    signal: Option<Arc<DataSignal>>,
}

impl PacketQueue {
    pub fn new(policy: QueuePolicy) -> Self {
        Self {
            buffer: Mutex::new(VecDeque::new()),
            len: AtomicUsize::new(0),
            dropped: AtomicU64::new(0),
            policy,
            signal: None,
        }
    }

    /// Raise `signal` on every push.
    pub fn with_signal(mut self, signal: Arc<DataSignal>) -> Self {
        self.signal = Some(signal);
        self
    }

    /// Split into the producer handle (for the delivery callback) and the
    /// consumer handle (for the control loop).
    pub fn split(self) -> (SampleProducer, SampleConsumer) {
        let shared = Arc::new(self);
        (
            SampleProducer {
                queue: Arc::clone(&shared),
            },
            SampleConsumer { queue: shared },
        )
    }

    /// Append `sample` to the tail.  Under [`QueuePolicy::DropOldest`] a full
    /// queue evicts its head first.
    pub fn push(&self, sample: EulerSample) {
        {
            let mut buffer = lock(&self.buffer);
            if let QueuePolicy::DropOldest { capacity } = self.policy
                && buffer.len() >= capacity.max(1)
            {
                buffer.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            buffer.push_back(sample);
            self.len.store(buffer.len(), Ordering::Release);
        }
        if let Some(signal) = &self.signal {
            signal.raise();
        }
    }

    /// `true` iff at least one sample is waiting.  Lock-free.
    pub fn has_data(&self) -> bool {
        self.len.load(Ordering::Acquire) > 0
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        !self.has_data()
    }

    /// Copy of the head sample, or `None` when empty.  Never changes the
    /// queue length.
    pub fn peek_oldest(&self) -> Option<EulerSample> {
        lock(&self.buffer).front().copied()
    }

    /// Remove the head sample.  Returns it, or `None` (and does nothing) when
    /// the queue is empty.
    pub fn pop_oldest(&self) -> Option<EulerSample> {
        let mut buffer = lock(&self.buffer);
        let sample = buffer.pop_front();
        self.len.store(buffer.len(), Ordering::Release);
        sample
    }

    /// Number of samples evicted by [`QueuePolicy::DropOldest`].
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn policy(&self) -> QueuePolicy {
        self.policy
    }
}

impl Default for PacketQueue {
    fn default() -> Self {
        Self::new(QueuePolicy::default())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// SPSC handles
// ────────────────────────────────────────────────────────────────────────────

/// Write half of a [`PacketQueue`].  Owned by the sensor subscription.
#[derive(Debug)]
pub struct SampleProducer {
    queue: Arc<PacketQueue>,
}

impl SampleProducer {
    pub fn push(&self, sample: EulerSample) {
        self.queue.push(sample);
    }
}

/// Read half of a [`PacketQueue`].  Owned by the control loop.
#[derive(Debug)]
pub struct SampleConsumer {
    queue: Arc<PacketQueue>,
}

impl SampleConsumer {
    pub fn has_data(&self) -> bool {
        self.queue.has_data()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn peek_oldest(&self) -> Option<EulerSample> {
        self.queue.peek_oldest()
    }

    pub fn pop_oldest(&self) -> Option<EulerSample> {
        self.queue.pop_oldest()
    }

    pub fn dropped(&self) -> u64 {
        self.queue.dropped()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // Every critical section leaves the data consistent, so a panic on the
    // other side does not invalidate it.
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    fn sample(n: u32) -> EulerSample {
        EulerSample::new(n as f32, n as f32 * 0.5, -(n as f32))
    }

    #[test]
    fn pop_yields_samples_in_push_order() {
        let queue = PacketQueue::new(QueuePolicy::Unbounded);
        for n in 0..100 {
            queue.push(sample(n));
        }
        for n in 0..100 {
            assert_eq!(queue.pop_oldest(), Some(sample(n)));
        }
        assert_eq!(queue.pop_oldest(), None);
    }

    #[test]
    fn has_data_tracks_push_pop_balance() {
        let queue = PacketQueue::new(QueuePolicy::Unbounded);
        assert!(!queue.has_data());

        queue.push(sample(1));
        queue.push(sample(2));
        assert!(queue.has_data());

        queue.pop_oldest();
        assert!(queue.has_data());
        queue.pop_oldest();
        assert!(!queue.has_data());

        // A failed pop must not unbalance the count.
        assert!(queue.pop_oldest().is_none());
        queue.push(sample(3));
        assert!(queue.has_data());
    }

    #[test]
    fn peek_does_not_change_length() {
        let queue = PacketQueue::new(QueuePolicy::Unbounded);
        queue.push(sample(7));
        queue.push(sample(8));

        assert_eq!(queue.peek_oldest(), Some(sample(7)));
        assert_eq!(queue.peek_oldest(), Some(sample(7)));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn pop_decrements_by_exactly_one() {
        let queue = PacketQueue::new(QueuePolicy::Unbounded);
        for n in 0..5 {
            queue.push(sample(n));
        }
        for expected in (0..5).rev() {
            queue.pop_oldest();
            assert_eq!(queue.len(), expected);
        }
    }

    #[test]
    fn empty_queue_peek_and_pop_are_none() {
        let queue = PacketQueue::default();
        assert!(queue.peek_oldest().is_none());
        assert!(queue.pop_oldest().is_none());
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn drop_oldest_evicts_head_and_counts() {
        let queue = PacketQueue::new(QueuePolicy::DropOldest { capacity: 3 });
        for n in 0..5 {
            queue.push(sample(n));
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.dropped(), 2);
        assert_eq!(queue.pop_oldest(), Some(sample(2)));
    }

    #[test]
    fn capacity_zero_is_unbounded() {
        assert_eq!(QueuePolicy::from_capacity(0), QueuePolicy::Unbounded);
        assert_eq!(
            QueuePolicy::from_capacity(8),
            QueuePolicy::DropOldest { capacity: 8 }
        );
    }

    #[test]
    fn producer_thread_preserves_fifo_for_consumer() {
        let (producer, consumer) = PacketQueue::new(QueuePolicy::Unbounded).split();
        const COUNT: u32 = 10_000;

        let handle = thread::spawn(move || {
            for n in 0..COUNT {
                producer.push(sample(n));
            }
        });

        let mut next = 0;
        while next < COUNT {
            if consumer.has_data() {
                let head = consumer.peek_oldest().expect("non-empty queue must peek");
                consumer.pop_oldest();
                assert_eq!(head, sample(next));
                next += 1;
            } else {
                thread::yield_now();
            }
        }
        handle.join().unwrap();
        assert!(!consumer.has_data());
    }

    #[test]
    fn dropping_queue_with_pending_samples_is_immediate() {
        let (producer, consumer) = PacketQueue::new(QueuePolicy::Unbounded).split();
        for n in 0..1_000 {
            producer.push(sample(n));
        }
        let started = Instant::now();
        drop(producer);
        drop(consumer);
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn push_raises_shared_signal() {
        let signal = DataSignal::new();
        let (producer, _consumer) = PacketQueue::new(QueuePolicy::Unbounded)
            .with_signal(Arc::clone(&signal))
            .split();

        let seen = signal.generation();
        producer.push(sample(1));
        assert_ne!(signal.generation(), seen);
    }

    #[test]
    fn wait_past_wakes_on_push_from_other_thread() {
        let signal = DataSignal::new();
        let (producer, consumer) = PacketQueue::new(QueuePolicy::Unbounded)
            .with_signal(Arc::clone(&signal))
            .split();

        let seen = signal.generation();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.push(sample(1));
        });

        let woke_at = signal.wait_past(seen, Duration::from_secs(5));
        assert_ne!(woke_at, seen);
        assert!(consumer.has_data());
        handle.join().unwrap();
    }

    #[test]
    fn concurrent_raises_are_all_counted() {
        let signal = DataSignal::new();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let signal = Arc::clone(&signal);
                thread::spawn(move || {
                    for _ in 0..1_000 {
                        signal.raise();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(signal.generation(), 4_000);
    }

    #[test]
    fn wait_past_returns_at_once_when_already_advanced() {
        let signal = DataSignal::new();
        let seen = signal.generation();
        signal.raise();
        let started = Instant::now();
        assert_eq!(signal.wait_past(seen, Duration::from_secs(5)), seen + 1);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn parked_waiter_is_woken_by_every_producer() {
        let signal = DataSignal::new();
        for round in 0..50 {
            let seen = signal.generation();
            let raiser = {
                let signal = Arc::clone(&signal);
                thread::spawn(move || signal.raise())
            };
            let woke_at = signal.wait_past(seen, Duration::from_secs(5));
            assert_ne!(woke_at, seen, "round {round} timed out");
            raiser.join().unwrap();
        }
    }

    #[test]
    fn wait_past_times_out_without_push() {
        let signal = DataSignal::new();
        let seen = signal.generation();
        let started = Instant::now();
        assert_eq!(signal.wait_past(seen, Duration::from_millis(10)), seen);
        assert!(started.elapsed() >= Duration::from_millis(10));
    }
}
