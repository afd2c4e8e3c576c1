//! Adaptive batch sizing for the scheduler scan loop.
//!
//! Two interchangeable adjusters map a measured response time to the next
//! batch size. Each instance belongs to exactly one shard loop; there is no
//! internal synchronization.

use std::time::{Duration, Instant};

pub trait BatchSizeAdjuster: Send {
    /// Feed one iteration's response time, get the batch size to use next.
    fn adjust(&mut self, response_time: Duration) -> usize;

    fn current(&self) -> usize;
}

/// Step up when responses beat `fast_threshold`, step down past
/// `slow_threshold`, hold otherwise. Adjustments are rate-limited by
/// `min_adjust_interval`.
#[derive(Debug)]
pub struct FixedStepAdjuster {
    batch_size: usize,
    min_batch_size: usize,
    max_batch_size: usize,
    adjust_step: usize,
    min_adjust_interval: Duration,
    last_adjust: Option<Instant>,
    fast_threshold: Duration,
    slow_threshold: Duration,
}

impl FixedStepAdjuster {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        initial_size: usize,
        min_size: usize,
        max_size: usize,
        adjust_step: usize,
        min_adjust_interval: Duration,
        fast_threshold: Duration,
        slow_threshold: Duration,
    ) -> Self {
        Self {
            batch_size: initial_size.clamp(min_size, max_size),
            min_batch_size: min_size,
            max_batch_size: max_size,
            adjust_step,
            min_adjust_interval,
            last_adjust: None,
            fast_threshold,
            slow_threshold,
        }
    }

    fn in_cooldown(&self) -> bool {
        self.last_adjust
            .map(|at| at.elapsed() < self.min_adjust_interval)
            .unwrap_or(false)
    }
}

impl BatchSizeAdjuster for FixedStepAdjuster {
    fn adjust(&mut self, response_time: Duration) -> usize {
        if self.in_cooldown() {
            return self.batch_size;
        }

        if response_time < self.fast_threshold {
            if self.batch_size < self.max_batch_size {
                self.batch_size = (self.batch_size + self.adjust_step).min(self.max_batch_size);
                self.last_adjust = Some(Instant::now());
            }
        } else if response_time > self.slow_threshold && self.batch_size > self.min_batch_size {
            self.batch_size = self
                .batch_size
                .saturating_sub(self.adjust_step)
                .max(self.min_batch_size);
            self.last_adjust = Some(Instant::now());
        }
        // Inside [fast, slow]: leave the size alone.
        self.batch_size
    }

    fn current(&self) -> usize {
        self.batch_size
    }
}

/// Compares each response time to the running average of the last N.
/// Holds the initial size until the history buffer fills once.
#[derive(Debug)]
pub struct RingBufferAdjuster {
    history: DurationRingBuffer,
    batch_size: usize,
    min_batch_size: usize,
    max_batch_size: usize,
    adjust_step: usize,
    cooldown: Duration,
    last_adjust: Option<Instant>,
}

impl RingBufferAdjuster {
    pub fn new(
        initial_size: usize,
        min_size: usize,
        max_size: usize,
        adjust_step: usize,
        cooldown: Duration,
        buffer_size: usize,
    ) -> Self {
        let buffer_size = if buffer_size == 0 { 128 } else { buffer_size };
        Self {
            history: DurationRingBuffer::new(buffer_size),
            batch_size: initial_size.clamp(min_size, max_size),
            min_batch_size: min_size,
            max_batch_size: max_size,
            adjust_step,
            cooldown,
            last_adjust: None,
        }
    }

    fn in_cooldown(&self) -> bool {
        self.last_adjust
            .map(|at| at.elapsed() < self.cooldown)
            .unwrap_or(false)
    }
}

impl BatchSizeAdjuster for RingBufferAdjuster {
    fn adjust(&mut self, response_time: Duration) -> usize {
        self.history.add(response_time);

        // A full round of history is required before the average means much.
        if !self.history.is_full() {
            return self.batch_size;
        }
        if self.in_cooldown() {
            return self.batch_size;
        }

        let avg = self.history.avg();
        if response_time > avg {
            if self.batch_size > self.min_batch_size {
                self.batch_size = self
                    .batch_size
                    .saturating_sub(self.adjust_step)
                    .max(self.min_batch_size);
                self.last_adjust = Some(Instant::now());
            }
        } else if response_time < avg && self.batch_size < self.max_batch_size {
            self.batch_size = (self.batch_size + self.adjust_step).min(self.max_batch_size);
            self.last_adjust = Some(Instant::now());
        }
        self.batch_size
    }

    fn current(&self) -> usize {
        self.batch_size
    }
}

/// Fixed-capacity ring of durations with a running sum, giving O(1) average.
#[derive(Debug)]
struct DurationRingBuffer {
    items: Vec<Duration>,
    pos: usize,
    len: usize,
    sum: Duration,
}

impl DurationRingBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            items: vec![Duration::ZERO; capacity],
            pos: 0,
            len: 0,
            sum: Duration::ZERO,
        }
    }

    fn add(&mut self, value: Duration) {
        if self.len == self.items.len() {
            self.sum -= self.items[self.pos];
        } else {
            self.len += 1;
        }
        self.items[self.pos] = value;
        self.sum += value;
        self.pos = (self.pos + 1) % self.items.len();
    }

    fn is_full(&self) -> bool {
        self.len == self.items.len()
    }

    fn avg(&self) -> Duration {
        if self.len == 0 {
            return Duration::ZERO;
        }
        self.sum / self.len as u32
    }
}
