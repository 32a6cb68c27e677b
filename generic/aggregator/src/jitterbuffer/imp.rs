// SPDX-License-Identifier: MPL-2.0

use std::cmp::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use super::{RtpPacket, Settings, Stats, StreamState};
use crate::buffer::BufferFlags;
use crate::clock::{Clock, ClockId, ClockReturn};
use crate::error::Error;
use crate::event::{Event, EventView};
use crate::flow::{FlowError, FlowResult, FlowState, FlowSuccess};
use crate::lockorder::{LockLevel, OrderedMutex};
use crate::peer::Downstream;
use crate::queue::{BoundedOrderedQueue, QueueItem};
use crate::segment::Segment;
use crate::seqnum::{seqnum_distance, ExtendedTimestamp};

type PtMapFn = dyn Fn(u8) -> Option<u32> + Send + Sync;

#[derive(Debug)]
enum Item {
    Packet { packet: RtpPacket, ext_rtptime: u64 },
    Eos,
}

impl QueueItem for Item {
    fn timestamp(&self) -> Option<u32> {
        match self {
            Item::Packet { packet, .. } => Some(packet.rtptime),
            Item::Eos => None,
        }
    }

    fn seqnum(&self) -> Option<u16> {
        match self {
            Item::Packet { packet, .. } => Some(packet.seqnum),
            Item::Eos => None,
        }
    }
}

// Packets by seqnum, control items after all packets
fn compare_items(a: &Item, b: &Item) -> Ordering {
    match (a.seqnum(), b.seqnum()) {
        (Some(a), Some(b)) => seqnum_distance(a, b).cmp(&0),
        (Some(_), None) => Ordering::Less,
        (None, _) => Ordering::Greater,
    }
}

fn latency_ts_units(latency: Duration, clock_rate: u32) -> u32 {
    (latency.as_nanos() * clock_rate as u128 / 1_000_000_000).min(u32::MAX as u128) as u32
}

#[derive(Debug)]
struct State {
    stream_state: StreamState,
    srcresult: FlowState,
    clock_rate: Option<u32>,
    clock_base: Option<u64>,
    ext_timestamp: ExtendedTimestamp,
    last_released_seq: Option<u16>,
    next_expected_seq: Option<u16>,
    segment: Segment,
    clock: Option<Arc<dyn Clock>>,
    base_time: Duration,
    clock_id: Option<ClockId>,
    waiting_seqnum: Option<u16>,
    // EOS was queued, release everything without waiting
    draining: bool,
    stats: Stats,
}

impl State {
    fn reset(&mut self) {
        self.clock_base = None;
        self.ext_timestamp.reset();
        self.last_released_seq = None;
        self.next_expected_seq = None;
        self.segment = Segment::new();
        self.clock_id = None;
        self.waiting_seqnum = None;
        self.draining = false;
    }

    fn unschedule(&self) {
        if let Some(clock_id) = &self.clock_id {
            trace!("Unscheduling wait for {:?}", clock_id.time());
            clock_id.unschedule();
        }
    }

    /// Position of a packet in the stream, counted from the first packet.
    fn position(&self, ext_rtptime: u64) -> Option<Duration> {
        let clock_rate = self.clock_rate?;
        let clock_base = self.clock_base?;
        let ticks = ext_rtptime.saturating_sub(clock_base);

        Some(Duration::from_nanos(
            (ticks as u128 * 1_000_000_000 / clock_rate as u128) as u64,
        ))
    }
}

pub(super) struct JitterBufferInner {
    settings: Settings,
    state: OrderedMutex<State>,
    queue: BoundedOrderedQueue<Item>,
    downstream: RwLock<Option<Arc<dyn Downstream>>>,
    pt_map: RwLock<Option<Arc<PtMapFn>>>,
    task: Mutex<Option<thread::JoinHandle<()>>>,
}

impl JitterBufferInner {
    pub(super) fn new(settings: Settings) -> Self {
        let queue = BoundedOrderedQueue::new();
        queue.set_low_threshold(settings.low_watermark);
        queue.set_high_threshold(settings.high_watermark);
        if let Some(clock_rate) = settings.clock_rate {
            queue.set_max_queue_length(latency_ts_units(settings.latency, clock_rate));
        }
        // Nothing is accepted before start()
        queue.set_flushing();

        JitterBufferInner {
            state: OrderedMutex::new(
                LockLevel::JitterBufferState,
                State {
                    stream_state: StreamState::Flushing,
                    srcresult: FlowState::Err(FlowError::Flushing),
                    clock_rate: settings.clock_rate,
                    clock_base: None,
                    ext_timestamp: ExtendedTimestamp::default(),
                    last_released_seq: None,
                    next_expected_seq: None,
                    segment: Segment::new(),
                    clock: None,
                    base_time: Duration::ZERO,
                    clock_id: None,
                    waiting_seqnum: None,
                    draining: false,
                    stats: Stats::default(),
                },
            ),
            settings,
            queue,
            downstream: RwLock::new(None),
            pt_map: RwLock::new(None),
            task: Mutex::new(None),
        }
    }

    pub(super) fn set_downstream(&self, downstream: Arc<dyn Downstream>) {
        *self.downstream.write() = Some(downstream);
    }

    pub(super) fn set_clock(&self, clock: Option<Arc<dyn Clock>>, base_time: Duration) {
        let mut state = self.state.lock();
        state.clock = clock;
        state.base_time = base_time;
        state.unschedule();
    }

    pub(super) fn set_pt_map(&self, f: Arc<PtMapFn>) {
        *self.pt_map.write() = Some(f);
    }

    pub(super) fn stats(&self) -> Stats {
        self.state.lock().stats
    }

    pub(super) fn stream_state(&self) -> StreamState {
        self.state.lock().stream_state
    }

    pub(super) fn is_buffering(&self) -> bool {
        self.queue.is_buffering()
    }

    fn configure(&self, state: &mut State, clock_rate: u32) {
        debug!("Configured clock rate {clock_rate}");
        state.clock_rate = Some(clock_rate);
        if state.stream_state == StreamState::Unconfigured {
            state.stream_state = StreamState::Active;
        }
        self.queue
            .set_max_queue_length(latency_ts_units(self.settings.latency, clock_rate));
    }

    pub(super) fn start(this: &Arc<Self>) -> Result<(), Error> {
        let mut task = this.task.lock();
        if task.is_some() {
            return Err(Error::AlreadyStarted);
        }

        {
            let mut state = this.state.lock();
            state.reset();
            state.srcresult = FlowState::Ok;
            state.stream_state = if state.clock_rate.is_some() {
                StreamState::Active
            } else {
                StreamState::Unconfigured
            };
            this.queue.set_blocking(true);
            this.queue.unset_flushing();
        }

        *task = Some(Self::spawn(this)?);
        debug!("Started");

        Ok(())
    }

    fn spawn(this: &Arc<Self>) -> Result<thread::JoinHandle<()>, Error> {
        let inner = this.clone();
        thread::Builder::new()
            .name("jitterbuffer".into())
            .spawn(move || inner.run())
            .map_err(|err| {
                error!("Failed to spawn output thread: {err}");
                Error::ThreadSpawn(err)
            })
    }

    pub(super) fn set_playing(&self, playing: bool) {
        debug!("Playing {playing}");
        self.queue.set_blocking(!playing);
    }

    fn flush_start(&self) {
        {
            let mut state = self.state.lock();
            state.stream_state = StreamState::Flushing;
            state.srcresult = FlowState::Err(FlowError::Flushing);
            let dropped = self.queue.set_flushing();
            debug!("Flushing, dropped {} items", dropped.len());
            state.unschedule();
        }

        self.join();
    }

    fn join(&self) {
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                error!("Output thread panicked");
            }
        }
    }

    pub(super) fn stop(&self) {
        self.flush_start();
        debug!("Stopped");
    }

    pub(super) fn chain(&self, packet: RtpPacket) -> FlowResult {
        let mut state = self.state.lock();

        match state.stream_state {
            StreamState::Flushing => return Err(FlowError::Flushing),
            StreamState::Eos => return Err(FlowError::Eos),
            _ => (),
        }
        if let Some(err) = state.srcresult.err() {
            return Err(err);
        }

        if state.clock_rate.is_none() {
            let pt = packet.payload_type;
            let pt_map = self.pt_map.read().clone();
            let clock_rate = state.unlocked(|| pt_map.and_then(|f| f(pt)));

            match clock_rate {
                Some(clock_rate) if clock_rate > 0 => self.configure(&mut state, clock_rate),
                _ => {
                    warn!("No clock rate for payload type {pt}");
                    return Err(FlowError::NotNegotiated);
                }
            }

            if state.stream_state == StreamState::Flushing {
                return Err(FlowError::Flushing);
            }
        }

        let seqnum = packet.seqnum;
        let ext_rtptime = state.ext_timestamp.next(packet.rtptime);
        state.clock_base.get_or_insert_with(|| {
            debug!("Selected clock base {ext_rtptime}");
            ext_rtptime
        });

        if let Some(last_released) = state.last_released_seq {
            if seqnum_distance(seqnum, last_released) <= 0 {
                debug!("Late packet seqnum {seqnum}, last released seqnum {last_released}");
                state.stats.num_late += 1;
                return Ok(FlowSuccess::Ok);
            }
        }

        if self.settings.drop_on_latency {
            let max = self.queue.max_queue_length();
            if max > 0 && self.queue.length_ts_units() >= max {
                if let Some(Item::Packet { packet: old, .. }) = self.queue.try_pop() {
                    debug!(
                        "Queue full, dropping oldest packet seqnum {} for seqnum {seqnum}",
                        old.seqnum
                    );
                    // Dropped on purpose, not a gap to wait for
                    let next = old.seqnum.wrapping_add(1);
                    if state
                        .next_expected_seq
                        .is_none_or(|expected| seqnum_distance(next, expected) > 0)
                    {
                        state.next_expected_seq = Some(next);
                    }
                }
            }
        }

        // Held out of the queue while the output thread waits for its deadline
        if state.waiting_seqnum == Some(seqnum) {
            debug!("Duplicate packet seqnum {seqnum}");
            state.stats.num_duplicates += 1;
            return Ok(FlowSuccess::Ok);
        }

        let item = Item::Packet {
            packet,
            ext_rtptime,
        };
        if self.queue.push_sorted(item, compare_items).is_err() {
            debug!("Duplicate packet seqnum {seqnum}");
            state.stats.num_duplicates += 1;
            return Ok(FlowSuccess::Ok);
        }
        trace!("Queued packet seqnum {seqnum} ext rtptime {ext_rtptime}");

        // The output thread waits for a later packet, this one may fill the gap
        if state
            .waiting_seqnum
            .is_some_and(|waiting| seqnum_distance(seqnum, waiting) < 0)
        {
            state.unschedule();
        }

        Ok(FlowSuccess::Ok)
    }

    pub(super) fn event(this: &Arc<Self>, event: Event) -> bool {
        debug!("Handling event {event:?}");

        match event.view() {
            EventView::FlushStart => {
                this.flush_start();
                this.push_event(event)
            }
            EventView::FlushStop { .. } => {
                {
                    let mut state = this.state.lock();
                    state.reset();
                    state.srcresult = FlowState::Ok;
                    state.stream_state = if state.clock_rate.is_some() {
                        StreamState::Active
                    } else {
                        StreamState::Unconfigured
                    };
                    this.queue.unset_flushing();
                }

                let ret = this.push_event(event);

                let mut task = this.task.lock();
                if task.is_none() {
                    match Self::spawn(this) {
                        Ok(handle) => *task = Some(handle),
                        Err(_) => return false,
                    }
                }

                ret
            }
            EventView::Eos => {
                let mut state = this.state.lock();
                if state.stream_state == StreamState::Flushing {
                    return false;
                }
                state.draining = true;
                this.queue.push(Item::Eos);
                this.queue.leave_buffering();
                state.unschedule();
                true
            }
            EventView::Caps(caps) => {
                if let Some(clock_rate) = caps.get_u32("clock-rate").filter(|rate| *rate > 0) {
                    let mut state = this.state.lock();
                    this.configure(&mut state, clock_rate);
                }
                this.push_event(event)
            }
            EventView::Segment(segment) => {
                this.state.lock().segment = segment.clone();
                this.push_event(event)
            }
            _ => this.push_event(event),
        }
    }

    fn push_event(&self, event: Event) -> bool {
        let downstream = self.downstream.read().clone();
        match downstream {
            Some(downstream) => downstream.event(event),
            None => false,
        }
    }

    fn push_back(&self, state: &mut State, item: Item) {
        if self.queue.push_sorted(item, compare_items).is_err() {
            debug!("Held back packet was duplicated meanwhile");
            state.stats.num_duplicates += 1;
        }
    }

    fn run(self: Arc<Self>) {
        debug!("Output thread started");

        loop {
            let Some(item) = self.queue.pop() else {
                debug!("Flushing, stopping output thread");
                break;
            };

            let (packet, ext_rtptime) = match item {
                Item::Packet {
                    packet,
                    ext_rtptime,
                } => (packet, ext_rtptime),
                Item::Eos => {
                    self.state.lock().stream_state = StreamState::Eos;
                    debug!("Forwarding EOS");
                    self.push_event(Event::eos());
                    break;
                }
            };

            let mut state = self.state.lock();
            if state.stream_state == StreamState::Flushing {
                continue;
            }

            let seqnum = packet.seqnum;

            // Queued again after its predecessor was already released
            if let Some(last_released) = state.last_released_seq {
                if seqnum_distance(seqnum, last_released) <= 0 {
                    debug!("Dropping seqnum {seqnum}, released up to {last_released} already");
                    if seqnum == last_released {
                        state.stats.num_duplicates += 1;
                    } else {
                        state.stats.num_late += 1;
                    }
                    continue;
                }
            }

            let gap = state.next_expected_seq != Some(seqnum);

            if gap && !state.draining {
                // Something earlier arrived between popping and locking
                let earlier = self.queue.peek_front(|front| {
                    matches!(front, Some(Item::Packet { packet: p, .. })
                        if seqnum_distance(p.seqnum, seqnum) < 0)
                });
                if earlier {
                    self.push_back(&mut state, Item::Packet { packet, ext_rtptime });
                    continue;
                }

                let deadline = match (&state.clock, state.position(ext_rtptime)) {
                    (Some(clock), Some(position)) => {
                        let running_time =
                            state.segment.to_running_time(position).unwrap_or(position);
                        Some((
                            clock.clone(),
                            state.base_time + running_time + self.settings.latency,
                        ))
                    }
                    _ => None,
                };

                if let Some((clock, deadline)) = deadline {
                    trace!(
                        "Waiting for seqnum {seqnum} until {deadline:?}, expected {:?}",
                        state.next_expected_seq
                    );

                    let clock_id = clock.new_single_shot_id(deadline);
                    state.clock_id = Some(clock_id.clone());
                    state.waiting_seqnum = Some(seqnum);

                    let ret = state.unlocked(|| clock_id.wait());

                    state.clock_id = None;
                    state.waiting_seqnum = None;

                    if state.stream_state == StreamState::Flushing {
                        continue;
                    }

                    if ret == ClockReturn::Unscheduled && !state.draining {
                        trace!("Wait for seqnum {seqnum} interrupted by new packet");
                        self.push_back(&mut state, Item::Packet { packet, ext_rtptime });
                        continue;
                    }

                    trace!("Wait for seqnum {seqnum} finished with {ret:?}");
                }
            }

            let discont = match state.next_expected_seq {
                Some(expected) if expected != seqnum => {
                    let lost = seqnum_distance(seqnum, expected);
                    if lost > 0 {
                        debug!("Packets {expected} to {seqnum} considered lost");
                        state.stats.num_lost += lost as u64;
                    }
                    true
                }
                Some(_) => state.last_released_seq.is_none(),
                None => true,
            };

            let next = seqnum.wrapping_add(1);
            // Packets dropped while this one was held may have moved the expectation ahead
            if state
                .next_expected_seq
                .is_none_or(|expected| seqnum_distance(next, expected) > 0)
            {
                state.next_expected_seq = Some(next);
            }
            state.last_released_seq = Some(seqnum);
            state.stats.num_pushed += 1;

            let mut buffer = packet.buffer;
            if discont {
                buffer.set_flags(BufferFlags::DISCONT);
            }
            if buffer.pts().is_none() {
                buffer.set_pts(state.position(ext_rtptime));
            }
            drop(state);

            trace!("Pushing seqnum {seqnum}, discont {discont}");
            let downstream = self.downstream.read().clone();
            let res = match downstream {
                Some(downstream) => downstream.chain(buffer),
                None => Err(FlowError::NotLinked),
            };

            if let Err(err) = res {
                let mut state = self.state.lock();
                if state.stream_state != StreamState::Flushing {
                    state.srcresult = FlowState::Err(err);
                }
                debug!("Pausing output after downstream returned {err:?}");
                break;
            }
        }

        debug!("Output thread stopped");
    }
}
