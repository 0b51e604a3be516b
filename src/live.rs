//! Live view plumbing between the reader thread and a display loop.
//!
//! The reader publishes every transformed frame with a non-blocking
//! `try_send` into a bounded channel. The display side drains a bounded batch
//! per refresh tick into fixed-capacity ring buffers. When the display falls
//! behind, the channel fills and new samples are dropped; the reader never
//! waits on the display.
//!
//! ```ignore
//! let feed = Arc::new(LiveFeed::new(256));
//! let mut view = feed.open(500);
//! // reader thread: feed.publish(&frame);
//! // every tick:
//! if let Some(latest) = view.drain(32) {
//!     draw(latest, view.rings());
//! }
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

use crate::protocol::{Channel, Frame, CHANNEL_COUNT};

/// Default number of samples kept per ring.
pub const DEFAULT_RING_CAPACITY: usize = 500;

// ============================================================================
// Ring Buffers
// ============================================================================

/// Fixed-capacity FIFO that evicts its oldest entry when full.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    data: VecDeque<T>,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            data: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Push a value, returning the evicted one if the ring was full.
    pub fn push(&mut self, value: T) -> Option<T> {
        let evicted = if self.data.len() == self.capacity {
            self.data.pop_front()
        } else {
            None
        };
        self.data.push_back(value);
        evicted
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn last(&self) -> Option<&T> {
        self.data.back()
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        self.data.iter()
    }
}

/// Time ring plus one ring per channel, always the same length.
#[derive(Debug, Clone)]
pub struct LiveRingBuffer {
    time: RingBuffer<f64>,
    channels: [RingBuffer<f64>; CHANNEL_COUNT],
}

impl LiveRingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            time: RingBuffer::with_capacity(capacity),
            channels: std::array::from_fn(|_| RingBuffer::with_capacity(capacity)),
        }
    }

    pub fn push(&mut self, elapsed: f64, values: [f64; CHANNEL_COUNT]) {
        self.time.push(elapsed);
        for (ring, value) in self.channels.iter_mut().zip(values) {
            ring.push(value);
        }
    }

    pub fn time(&self) -> &RingBuffer<f64> {
        &self.time
    }

    pub fn channel(&self, channel: Channel) -> &RingBuffer<f64> {
        &self.channels[channel.index()]
    }

    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.time.capacity()
    }

    pub fn clear(&mut self) {
        self.time.clear();
        self.channels.iter_mut().for_each(RingBuffer::clear);
    }
}

// ============================================================================
// Feed
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct LiveSample {
    values: [f64; CHANNEL_COUNT],
    at: Instant,
}

/// Producer side, shared between the reader thread and the view owner.
#[derive(Debug)]
pub struct LiveFeed {
    tx: Sender<LiveSample>,
    rx: Receiver<LiveSample>,
    active: AtomicBool,
    dropped: AtomicU64,
}

impl LiveFeed {
    /// Create a feed whose queue holds at most `queue_capacity` samples.
    pub fn new(queue_capacity: usize) -> Self {
        let (tx, rx) = bounded(queue_capacity.max(1));
        Self {
            tx,
            rx,
            active: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Enqueue a frame without blocking.
    ///
    /// Returns `false` when no view is open or the queue is full; a full queue
    /// keeps its older samples and the new one is counted as dropped.
    pub fn publish(&self, frame: &Frame) -> bool {
        if !self.is_active() {
            return false;
        }
        let sample = LiveSample {
            values: frame.values,
            at: frame.at,
        };
        match self.tx.try_send(sample) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Samples dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn queued(&self) -> usize {
        self.rx.len()
    }

    /// Start a live session with fresh rings of `ring_capacity`.
    pub fn open(self: &Arc<Self>, ring_capacity: usize) -> LiveView {
        self.discard_queued();
        self.active.store(true, Ordering::Release);
        log::debug!("live view opened (ring capacity {ring_capacity})");
        LiveView {
            feed: Arc::clone(self),
            rings: LiveRingBuffer::new(ring_capacity),
            started: Instant::now(),
        }
    }

    /// End the live session. Publishes racing with this may still be lost.
    pub fn close(&self) {
        if self.active.swap(false, Ordering::AcqRel) {
            log::debug!("live view closed");
        }
        self.discard_queued();
    }

    fn discard_queued(&self) -> usize {
        self.rx.try_iter().count()
    }
}

// ============================================================================
// View
// ============================================================================

/// Consumer side of a live session; closes the feed when dropped.
#[derive(Debug)]
pub struct LiveView {
    feed: Arc<LiveFeed>,
    rings: LiveRingBuffer,
    started: Instant,
}

impl LiveView {
    /// Move up to `max_items` queued samples into the rings.
    ///
    /// Returns the newest per-channel values of this batch, or `None` when
    /// nothing was queued.
    pub fn drain(&mut self, max_items: usize) -> Option<[f64; CHANNEL_COUNT]> {
        let mut latest = None;
        for sample in self.feed.rx.try_iter().take(max_items) {
            let elapsed = sample.at.saturating_duration_since(self.started).as_secs_f64();
            self.rings.push(elapsed, sample.values);
            latest = Some(sample.values);
        }
        latest
    }

    /// Empty the rings and restart the live clock.
    pub fn clear(&mut self) {
        self.feed.discard_queued();
        self.rings.clear();
        self.started = Instant::now();
    }

    pub fn rings(&self) -> &LiveRingBuffer {
        &self.rings
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    pub fn feed(&self) -> &Arc<LiveFeed> {
        &self.feed
    }
}

impl Drop for LiveView {
    fn drop(&mut self) {
        self.feed.close();
    }
}
