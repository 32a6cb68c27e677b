// SPDX-License-Identifier: MPL-2.0

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Condvar, RwLock};

use super::imp::AggregatorInner;
use super::Aggregator;
use crate::buffer::Buffer;
use crate::event::{Event, EventType, Query};
use crate::flow::{FlowError, FlowResult, FlowState};
use crate::lockorder::{LockLevel, OrderedGuard, OrderedMutex};
use crate::peer::Upstream;
use crate::segment::{Format, Segment};
use crate::seqnum::Seqnum;

#[derive(Debug)]
pub(super) enum PadItem {
    Buffer(Buffer),
    Event(Event),
    Query { id: u64, query: Query },
}

#[derive(Debug)]
pub(super) struct PadData {
    /// Oldest item at the front.
    pub(super) queue: VecDeque<PadItem>,
    pub(super) flow: FlowState,
    pub(super) last_flush_start_seqnum: Option<Seqnum>,
    pub(super) last_flush_stop_seqnum: Option<Seqnum>,
    pub(super) first_buffer: bool,
    pub(super) waited_once: bool,
    pub(super) clipped_buffer: Option<Buffer>,
    pub(super) peeked_buffer: Option<Buffer>,
    pub(super) num_buffers: usize,
    pub(super) head_position: Option<Duration>,
    pub(super) tail_position: Option<Duration>,
    pub(super) head_time: Option<Duration>,
    pub(super) tail_time: Option<Duration>,
    pub(super) time_level: Duration,
    /// Segment of the newest queued data.
    pub(super) head_segment: Segment,
    pub(super) negotiated: bool,
    pub(super) eos: bool,
    pub(super) stream_start_pending: bool,
    pub(super) next_query_id: u64,
    pub(super) query_answer: Option<(u64, Query, bool)>,
}

impl PadData {
    fn new() -> Self {
        PadData {
            queue: VecDeque::new(),
            flow: FlowState::Ok,
            last_flush_start_seqnum: None,
            last_flush_stop_seqnum: None,
            first_buffer: true,
            waited_once: false,
            clipped_buffer: None,
            peeked_buffer: None,
            num_buffers: 0,
            head_position: None,
            tail_position: None,
            head_time: None,
            tail_time: None,
            time_level: Duration::ZERO,
            head_segment: Segment::with_format(Format::Undefined),
            negotiated: false,
            eos: false,
            stream_start_pending: false,
            next_query_id: 0,
            query_answer: None,
        }
    }

    pub(super) fn front_is_event_or_query(&self) -> bool {
        self.clipped_buffer.is_none()
            && matches!(
                self.queue.front(),
                Some(PadItem::Event(_)) | Some(PadItem::Query { .. })
            )
    }

    pub(super) fn front_is_buffer(&self) -> bool {
        self.clipped_buffer.is_some() || matches!(self.queue.front(), Some(PadItem::Buffer(_)))
    }

    /// Whether a producer may queue another buffer.
    pub(super) fn has_space(&self, live: bool, latency: Duration) -> bool {
        if self.num_buffers == 0 && self.clipped_buffer.is_none() {
            return true;
        }

        // One buffer being aggregated and one ready for the next iteration
        if live && self.num_buffers < 2 {
            return true;
        }

        if latency.is_zero() {
            return false;
        }

        self.time_level <= latency
    }

    /// Takes the event or query at the consumption end, if no buffer is ahead of it.
    pub(super) fn pop_serialized(&mut self) -> Option<PadItem> {
        if self.front_is_event_or_query() {
            self.queue.pop_front()
        } else {
            None
        }
    }

    /// Whether EOS was received, handled or still queued, and no new stream started since.
    pub(super) fn eos_received(&self) -> bool {
        !self.stream_start_pending
            && (self.eos
                || self.queue.iter().any(
                    |item| matches!(item, PadItem::Event(event) if event.type_() == EventType::Eos),
                ))
    }

    fn buffer_consumed(&mut self, dequeued: bool) {
        if dequeued {
            self.num_buffers -= 1;
        }
    }
}

pub(super) struct PadInner {
    name: String,
    parent: Weak<AggregatorInner>,
    pub(super) stream_lock: OrderedMutex<()>,
    pub(super) flush_lock: OrderedMutex<()>,
    pub(super) data: OrderedMutex<PadData>,
    pub(super) cond: Condvar,
    segment: OrderedMutex<Segment>,
    upstream: RwLock<Option<Arc<dyn Upstream>>>,
}

/// An input of an [`Aggregator`].
///
/// Producers push buffers, events and queries from their own thread. The aggregator's output
/// thread and the [`AggregatorImpl`](super::AggregatorImpl) take buffers out with
/// [`peek_buffer`](Self::peek_buffer) and [`pop_buffer`](Self::pop_buffer).
#[derive(Clone)]
pub struct AggregatorPad(pub(super) Arc<PadInner>);

impl PartialEq for AggregatorPad {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for AggregatorPad {}

impl fmt::Debug for AggregatorPad {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("AggregatorPad")
            .field("name", &self.0.name)
            .finish()
    }
}

impl AggregatorPad {
    pub(super) fn new(name: impl Into<String>, parent: Weak<AggregatorInner>) -> Self {
        AggregatorPad(Arc::new(PadInner {
            name: name.into(),
            parent,
            stream_lock: OrderedMutex::new(LockLevel::PadStream, ()),
            flush_lock: OrderedMutex::new(LockLevel::PadFlush, ()),
            data: OrderedMutex::new(LockLevel::PadData, PadData::new()),
            cond: Condvar::new(),
            segment: OrderedMutex::new(LockLevel::PadObject, Segment::with_format(Format::Undefined)),
            upstream: RwLock::new(None),
        }))
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub(super) fn parent(&self) -> Option<Aggregator> {
        self.0.parent.upgrade().map(Aggregator)
    }

    /// Segment of the data at the consumption end of the queue.
    pub fn segment(&self) -> Segment {
        self.0.segment.lock().clone()
    }

    pub(super) fn set_segment(&self, segment: Segment) {
        *self.0.segment.lock() = segment;
    }

    /// Running time span of the queued data.
    pub fn time_level(&self) -> Duration {
        self.0.data.lock().time_level
    }

    pub fn set_upstream(&self, upstream: Arc<dyn Upstream>) {
        *self.0.upstream.write() = Some(upstream);
    }

    pub(super) fn upstream(&self) -> Option<Arc<dyn Upstream>> {
        self.0.upstream.read().clone()
    }

    /// Queues a buffer, blocking while the queue is full.
    pub fn chain(&self, buffer: Buffer) -> FlowResult {
        let Some(agg) = self.parent() else {
            return Err(FlowError::Flushing);
        };

        let _stream = self.0.stream_lock.lock();
        let _flush = self.0.flush_lock.lock();
        agg.chain_internal(self, buffer, true)
    }

    /// Handles an event from upstream.
    ///
    /// Serialized events are queued with the buffers, the others are handled right away.
    pub fn send_event(&self, event: Event) -> bool {
        let Some(agg) = self.parent() else {
            return false;
        };

        if event.is_serialized() {
            let _stream = self.0.stream_lock.lock();
            agg.sink_event_pre_queue(self, event).is_ok()
        } else {
            agg.0.imp.sink_event(&agg, self, event)
        }
    }

    /// Handles a query from upstream.
    ///
    /// Serialized queries block until everything queued before them was handled.
    pub fn query(&self, query: &mut Query) -> bool {
        let Some(agg) = self.parent() else {
            return false;
        };

        if query.is_serialized() {
            let _stream = self.0.stream_lock.lock();
            agg.sink_query_pre_queue(self, query)
        } else {
            agg.0.imp.sink_query(&agg, self, query)
        }
    }

    pub(super) fn update_time_level(&self, data: &mut PadData, head: bool) {
        if head {
            data.head_time = match data.head_position {
                Some(position) if data.head_segment.format() == Format::Time => {
                    data.head_segment.to_running_time(position)
                }
                _ => None,
            };
            if data.tail_time.is_none() {
                data.tail_time = data.head_time;
            }
        } else {
            let segment = self.0.segment.lock();
            data.tail_time = match data.tail_position {
                Some(position) if segment.format() == Format::Time => {
                    segment.to_running_time(position)
                }
                _ => data.head_time,
            };
        }

        data.time_level = match (data.head_time, data.tail_time) {
            (Some(head), Some(tail)) if tail <= head => head - tail,
            _ => Duration::ZERO,
        };
    }

    pub(super) fn apply_buffer(&self, data: &mut PadData, buffer: &Buffer, head: bool) {
        let timestamp = buffer.dts_or_pts().or(if head {
            data.head_position
        } else {
            data.tail_position
        });
        let timestamp = match (timestamp, buffer.duration()) {
            (Some(timestamp), Some(duration)) => Some(timestamp + duration),
            (timestamp, _) => timestamp,
        };

        if head {
            data.head_position = timestamp;
        } else {
            data.tail_position = timestamp;
        }

        self.update_time_level(data, head);
    }

    /// Drops queued data and moves the pad into the `flow` state.
    ///
    /// A partial flush keeps sticky events other than EOS and SEGMENT.
    pub(super) fn set_flushing(&self, flow: FlowError, full: bool) {
        let mut data = self.0.data.lock();

        data.flow = match (flow, data.flow) {
            (FlowError::NotLinked, FlowState::Err(current)) => {
                FlowState::Err(current.combine(FlowError::NotLinked))
            }
            (flow, _) => FlowState::Err(flow),
        };

        data.queue.retain(|item| match item {
            PadItem::Event(event) if !full => {
                event.is_sticky()
                    && !matches!(event.type_(), EventType::Eos | EventType::Segment)
            }
            _ => false,
        });

        data.num_buffers = 0;
        data.stream_start_pending = false;
        data.clipped_buffer = None;
        debug!("{}: Flushing with {flow:?}, full {full}", self.name());

        self.0.cond.notify_all();
    }

    /// Resets all per-stream state, the pad accepts data again afterwards.
    pub(super) fn reset(&self, data: &mut PadData) {
        data.eos = false;
        data.flow = FlowState::Ok;
        self.set_segment(Segment::with_format(Format::Undefined));
        data.head_segment = Segment::with_format(Format::Undefined);
        data.head_position = None;
        data.tail_position = None;
        data.head_time = None;
        data.tail_time = None;
        data.time_level = Duration::ZERO;
        data.first_buffer = true;
        data.waited_once = false;
        data.stream_start_pending = false;
        data.query_answer = None;
    }

    /// Drops everything queued and makes the pad accept data again.
    pub(super) fn activate(&self) {
        let mut data = self.0.data.lock();
        data.queue.clear();
        data.num_buffers = 0;
        data.clipped_buffer = None;
        data.peeked_buffer = None;
        self.reset(&mut data);
        self.0.cond.notify_all();
    }

    pub(super) fn broadcast(&self) {
        self.0.cond.notify_all();
    }

    pub(super) fn lock_data(&self) -> OrderedGuard<'_, PadData> {
        self.0.data.lock()
    }

    /// Moves the oldest queued buffer through the clip step until one survives.
    fn clip_buffer_unlocked(&self, data: &mut PadData, agg: Option<&Aggregator>) {
        while data.clipped_buffer.is_none() {
            let Some(PadItem::Buffer(_)) = data.queue.front() else {
                break;
            };
            let Some(PadItem::Buffer(buffer)) = data.queue.pop_front() else {
                unreachable!();
            };

            self.apply_buffer(data, &buffer, false);

            let Some(agg) = agg else {
                data.clipped_buffer = Some(buffer);
                break;
            };

            trace!("{}: Clipping {buffer:?}", self.name());
            match agg.0.imp.clip(agg, self, buffer) {
                Some(buffer) => data.clipped_buffer = Some(buffer),
                None => {
                    trace!("{}: Clipping consumed the buffer", self.name());
                    data.buffer_consumed(true);
                    self.0.cond.notify_all();
                }
            }
        }
    }

    /// Takes the next buffer out of the queue.
    ///
    /// A buffer returned by an earlier [`peek_buffer`](Self::peek_buffer) is returned even if
    /// the pad was flushed in the meantime.
    pub fn pop_buffer(&self) -> Option<Buffer> {
        let agg = self.parent();
        let mut data = self.0.data.lock();

        let buffer = if let Some(buffer) = data.peeked_buffer.take() {
            Some(buffer)
        } else if !data.flow.is_ok() {
            None
        } else {
            self.clip_buffer_unlocked(&mut data, agg.as_ref());
            data.clipped_buffer.clone()
        };

        let buffer = buffer?;
        // Only still dequeued if no flush dropped it meanwhile
        let dequeued = data.clipped_buffer.take().is_some();
        data.buffer_consumed(dequeued);
        self.0.cond.notify_all();
        debug!("{}: Consumed {buffer:?}", self.name());

        Some(buffer)
    }

    /// Returns the next buffer without taking it out of the queue.
    ///
    /// Repeated calls return the same buffer until it is popped or dropped.
    pub fn peek_buffer(&self) -> Option<Buffer> {
        let agg = self.parent();
        let mut data = self.0.data.lock();

        if let Some(buffer) = &data.peeked_buffer {
            return Some(buffer.clone());
        }
        if !data.flow.is_ok() {
            return None;
        }

        self.clip_buffer_unlocked(&mut data, agg.as_ref());
        data.peeked_buffer = data.clipped_buffer.clone();
        data.peeked_buffer.clone()
    }

    pub fn has_buffer(&self) -> bool {
        let agg = self.parent();
        let mut data = self.0.data.lock();

        if data.peeked_buffer.is_some() {
            return true;
        }
        if !data.flow.is_ok() {
            return false;
        }

        self.clip_buffer_unlocked(&mut data, agg.as_ref());
        data.clipped_buffer.is_some()
    }

    /// Pops and discards the next buffer, returns whether there was one.
    pub fn drop_buffer(&self) -> bool {
        self.pop_buffer().is_some()
    }

    /// Whether EOS was handled and no buffer is queued ahead of it anymore.
    pub fn is_eos(&self) -> bool {
        self.0.data.lock().eos
    }

    /// Whether this pad is ignored by the readiness check because it never produced data.
    pub fn is_inactive(&self) -> bool {
        let Some(agg) = self.parent() else {
            return false;
        };
        let (ignore_inactive_pads, live) = agg.ignore_inactive_and_live();
        ignore_inactive_pads && live && self.0.data.lock().first_buffer
    }

    pub(super) fn reset_peeked(&self) {
        self.0.data.lock().peeked_buffer = None;
    }

    /// Discards queued buffers the implementation considers too old.
    pub(super) fn skip_buffers(&self, agg: &Aggregator) {
        let mut data = self.0.data.lock();
        if !data.flow.is_ok() {
            return;
        }

        while let Some(PadItem::Buffer(buffer)) = data.queue.front() {
            if !agg.0.imp.skip_buffer(agg, self, buffer) {
                break;
            }
            let Some(PadItem::Buffer(buffer)) = data.queue.pop_front() else {
                unreachable!();
            };
            self.apply_buffer(&mut data, &buffer, false);
            data.buffer_consumed(true);
            debug!("{}: Skipped {buffer:?}", self.name());
            self.0.cond.notify_all();
        }
    }
}
