// SPDX-License-Identifier: MPL-2.0

//! Sorted blocking queue with hysteresis on the buffered timestamp span.

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::fmt;

use parking_lot::Condvar;

use crate::lockorder::{LockLevel, OrderedGuard, OrderedMutex};

/// Items stored in a [`BoundedOrderedQueue`].
///
/// Control items (EOS markers and similar) return `None` from both methods.
pub trait QueueItem {
    /// Timestamp in clock-rate units.
    fn timestamp(&self) -> Option<u32>;

    fn seqnum(&self) -> Option<u16>;
}

#[derive(Debug)]
struct State<T> {
    queue: VecDeque<T>,
    low_threshold: f32,
    high_threshold: f32,
    max_queue_length: u32,
    buffering: bool,
    flushing: bool,
    blocking: bool,
    pops_remaining: usize,
    tail_buffer_duration: u32,
    waiting_threads: u32,
}

impl<T: QueueItem> State<T> {
    fn length_ts_units(&self) -> u32 {
        if self.queue.len() < 2 {
            return 0;
        }

        let (Some(oldest), Some(newest)) = (self.queue.front(), self.queue.back()) else {
            return 0;
        };
        let (Some(oldest), Some(newest)) = (oldest.timestamp(), newest.timestamp()) else {
            return 0;
        };

        newest
            .wrapping_sub(oldest)
            .wrapping_add(self.tail_buffer_duration)
    }

    fn low_level(&self) -> f32 {
        self.low_threshold * self.max_queue_length as f32
    }

    fn high_level(&self) -> f32 {
        self.high_threshold * self.max_queue_length as f32
    }

    fn check_high_threshold(&mut self, cond: &Condvar) {
        if self.buffering && self.length_ts_units() as f32 >= self.high_level() {
            debug!(
                "Leaving buffering mode, span {} >= {}",
                self.length_ts_units(),
                self.high_level()
            );
            self.buffering = false;
            cond.notify_all();
        }
    }

    fn pop_front(&mut self) -> Option<T> {
        let item = self.queue.pop_front()?;

        // Duration of the new oldest item, only known if it directly follows the popped one
        if let Some(oldest) = self.queue.front() {
            self.tail_buffer_duration = match (
                item.seqnum(),
                item.timestamp(),
                oldest.seqnum(),
                oldest.timestamp(),
            ) {
                (Some(seq), Some(ts), Some(next_seq), Some(next_ts))
                    if next_seq == seq.wrapping_add(1) =>
                {
                    next_ts.wrapping_sub(ts)
                }
                _ => 0,
            };
        }

        Some(item)
    }
}

/// A thread-safe queue of timestamped items kept sorted by a caller-supplied order.
///
/// Three independent modes gate [`pop`](Self::pop):
///
/// * flushing: `pop` returns `None` right away until [`unset_flushing`](Self::unset_flushing).
/// * blocking: `pop` waits until [`set_blocking(false)`](Self::set_blocking).
/// * buffering: entered when the timestamp span drops to the low watermark, left once the
///   span reaches the high watermark again.
pub struct BoundedOrderedQueue<T> {
    state: OrderedMutex<State<T>>,
    cond: Condvar,
}

impl<T> fmt::Debug for BoundedOrderedQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("BoundedOrderedQueue").finish_non_exhaustive()
    }
}

impl<T: QueueItem> Default for BoundedOrderedQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: QueueItem> BoundedOrderedQueue<T> {
    pub fn new() -> Self {
        BoundedOrderedQueue {
            state: OrderedMutex::new(
                LockLevel::Queue,
                State {
                    queue: VecDeque::new(),
                    low_threshold: 0.0,
                    high_threshold: 0.0,
                    max_queue_length: 0,
                    buffering: false,
                    flushing: false,
                    blocking: false,
                    pops_remaining: 0,
                    tail_buffer_duration: 0,
                    waiting_threads: 0,
                },
            ),
            cond: Condvar::new(),
        }
    }

    /// Fraction of the maximum span at which buffering starts.
    pub fn set_low_threshold(&self, threshold: f32) {
        assert!((0.0..=1.0).contains(&threshold));
        self.state.lock().low_threshold = threshold;
    }

    /// Fraction of the maximum span at which buffering ends.
    pub fn set_high_threshold(&self, threshold: f32) {
        assert!((0.0..=1.0).contains(&threshold));
        let mut state = self.state.lock();
        state.high_threshold = threshold;
        state.check_high_threshold(&self.cond);
    }

    /// Maximum span in timestamp units the watermarks refer to.
    pub fn set_max_queue_length(&self, max_queue_length: u32) {
        let mut state = self.state.lock();
        state.max_queue_length = max_queue_length;
        state.check_high_threshold(&self.cond);
    }

    pub fn max_queue_length(&self) -> u32 {
        self.state.lock().max_queue_length
    }

    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().queue.is_empty()
    }

    /// Timestamp span between oldest and newest item.
    pub fn length_ts_units(&self) -> u32 {
        self.state.lock().length_ts_units()
    }

    pub fn is_buffering(&self) -> bool {
        self.state.lock().buffering
    }

    /// Number of threads currently blocked in [`pop`](Self::pop).
    pub fn waiting_threads(&self) -> u32 {
        self.state.lock().waiting_threads
    }

    /// Appends `item` after everything else, without looking at its order.
    pub fn push(&self, item: T) {
        let mut state = self.state.lock();
        state.queue.push_back(item);
        state.check_high_threshold(&self.cond);
        self.cond.notify_all();
    }

    /// Inserts `item` at its sorted position according to `compare`.
    ///
    /// The queue is scanned from the oldest item. If `compare` reports equality with an item
    /// already queued, `item` is handed back as a duplicate.
    pub fn push_sorted<F>(&self, item: T, compare: F) -> Result<(), T>
    where
        F: Fn(&T, &T) -> Ordering,
    {
        let mut state = self.state.lock();

        let mut idx = state.queue.len();
        for (i, queued) in state.queue.iter().enumerate() {
            match compare(&item, queued) {
                Ordering::Less => {
                    idx = i;
                    break;
                }
                Ordering::Equal => return Err(item),
                Ordering::Greater => (),
            }
        }

        state.queue.insert(idx, item);
        state.check_high_threshold(&self.cond);
        self.cond.notify_all();

        Ok(())
    }

    fn wait(&self, state: &mut OrderedGuard<'_, State<T>>) {
        state.waiting_threads += 1;
        state.wait(&self.cond);
        state.waiting_threads -= 1;
    }

    /// Removes the oldest item, blocking as long as the queue is empty, blocked or
    /// buffering.
    ///
    /// Returns `None` once the queue is flushing.
    pub fn pop(&self) -> Option<T> {
        let mut state = self.state.lock();

        loop {
            if state.flushing {
                return None;
            }

            if state.blocking || state.queue.is_empty() {
                self.wait(&mut state);
                continue;
            }

            if state.pops_remaining == 0 {
                if state.buffering {
                    trace!("Buffering, waiting for the high watermark");
                    self.wait(&mut state);
                    continue;
                }

                if state.length_ts_units() as f32 <= state.low_level() {
                    // Whatever is queued right now may still be consumed
                    state.buffering = true;
                    state.pops_remaining = state.queue.len();
                    debug!(
                        "Entering buffering mode with span {}, {} pops remaining",
                        state.length_ts_units(),
                        state.pops_remaining
                    );
                }
            }

            break;
        }

        if state.pops_remaining > 0 {
            state.pops_remaining -= 1;
        }

        state.pop_front()
    }

    /// Removes the oldest item if there is one, without blocking.
    pub fn try_pop(&self) -> Option<T> {
        let mut state = self.state.lock();
        if state.flushing {
            return None;
        }
        if state.pops_remaining > 0 {
            state.pops_remaining -= 1;
        }
        state.pop_front()
    }

    /// Calls `f` with the oldest item.
    pub fn peek_front<R>(&self, f: impl FnOnce(Option<&T>) -> R) -> R {
        let state = self.state.lock();
        f(state.queue.front())
    }

    /// Makes every current and future `pop` return `None` and hands back all queued items.
    pub fn set_flushing(&self) -> Vec<T> {
        let mut state = self.state.lock();
        if !state.flushing {
            debug!("Start flushing");
        }
        state.flushing = true;
        state.buffering = false;
        state.pops_remaining = 0;
        state.tail_buffer_duration = 0;
        self.cond.notify_all();

        state.queue.drain(..).collect()
    }

    pub fn unset_flushing(&self) {
        let mut state = self.state.lock();
        if state.flushing {
            debug!("Stop flushing");
        }
        state.flushing = false;
        self.cond.notify_all();
    }

    pub fn is_flushing(&self) -> bool {
        self.state.lock().flushing
    }

    /// Holds back `pop` while `blocking` is set, independently of the queue contents.
    pub fn set_blocking(&self, blocking: bool) {
        let mut state = self.state.lock();
        state.blocking = blocking;
        self.cond.notify_all();
    }

    /// Leaves buffering mode right away, used when no more data is going to arrive.
    pub fn leave_buffering(&self) {
        let mut state = self.state.lock();
        if state.buffering {
            debug!("Forced out of buffering mode");
        }
        state.buffering = false;
        self.cond.notify_all();
    }
}
