// SPDX-License-Identifier: MPL-2.0

use std::mem;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, RwLock};

use super::pad::{AggregatorPad, PadData, PadItem};
use super::{Aggregator, AggregatorImpl, AggregatorState, Settings, StartTimeSelection};
use crate::buffer::{Buffer, BufferFlags};
use crate::clock::{Clock, ClockId, ClockReturn};
use crate::error::Error;
use crate::event::{Caps, Event, EventType, EventView, LatencyQuery, Query, TagList};
use crate::flow::{FlowError, FlowResult, FlowState, FlowSuccess};
use crate::lockorder::{LockLevel, OrderedGuard, OrderedMutex};
use crate::peer::Downstream;
use crate::segment::{Format, Segment};
use crate::seqnum::Seqnum;

#[derive(Debug)]
pub(super) struct SrcState {
    running: bool,
    /// Cleared once EOS was pushed downstream.
    send_eos: bool,
    /// EOS was sent to the output by the application.
    got_eos_event: bool,
    /// The output thread returned and has to be spawned again.
    task_paused: bool,
    clock_id: Option<ClockId>,
    peer_latency_live: bool,
    peer_latency_min: Duration,
    peer_latency_max: Option<Duration>,
    has_peer_latency: bool,
    sub_latency_min: Duration,
    sub_latency_max: Option<Duration>,
}

impl Default for SrcState {
    fn default() -> Self {
        SrcState {
            running: false,
            send_eos: false,
            got_eos_event: false,
            task_paused: false,
            clock_id: None,
            peer_latency_live: false,
            peer_latency_min: Duration::ZERO,
            peer_latency_max: None,
            has_peer_latency: false,
            sub_latency_min: Duration::ZERO,
            // Bounded until the implementation reports otherwise
            sub_latency_max: Some(Duration::ZERO),
        }
    }
}

impl SrcState {
    fn reset_peer_latency(&mut self) {
        self.has_peer_latency = false;
        self.peer_latency_live = false;
        self.peer_latency_min = Duration::ZERO;
        self.peer_latency_max = None;
    }
}

#[derive(Debug)]
struct State {
    settings: Settings,
    started: bool,
    pads: Vec<AggregatorPad>,
    max_pad_serial: Option<u32>,
    flushing: bool,
    /// No start time was chosen yet.
    first_buffer: bool,
    send_stream_start: bool,
    send_segment: bool,
    /// Caps to push before the next buffer.
    srccaps: Option<Caps>,
    current_caps: Option<Caps>,
    tags: Option<TagList>,
    tags_changed: bool,
    segment: Segment,
    /// Seqnum of the last input segment, reused on our segment and EOS.
    seqnum: Option<Seqnum>,
    /// Seqnum of the last seek or flush.
    next_seqnum: Option<Seqnum>,
    clock: Option<Arc<dyn Clock>>,
    base_time: Duration,
}

impl State {
    fn reset_flow_values(&mut self) {
        self.send_stream_start = true;
        self.send_segment = true;
        self.segment = Segment::with_format(Format::Time);
        // Set from the first queued buffer
        self.segment.set_position(None);
        self.first_buffer = true;
    }
}

fn is_live_unlocked(src: &SrcState, state: &State) -> bool {
    src.peer_latency_live || state.settings.force_live
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Readiness {
    Ready,
    NotReady,
    /// A serialized event or query has to be handled before any buffer.
    EventOrQuery,
}

enum Step {
    Continue,
    Aggregated(FlowResult),
    Failed(FlowError),
}

pub(super) struct AggregatorInner {
    name: String,
    pub(super) imp: Box<dyn AggregatorImpl>,
    task: OrderedMutex<Option<thread::JoinHandle<()>>>,
    src_stream_lock: OrderedMutex<()>,
    src: OrderedMutex<SrcState>,
    src_cond: Condvar,
    state: OrderedMutex<State>,
    downstream: RwLock<Option<Arc<dyn Downstream>>>,
}

impl AggregatorInner {
    pub(super) fn new(name: String, imp: Box<dyn AggregatorImpl>, settings: Settings) -> Self {
        let mut state = State {
            settings,
            started: false,
            pads: Vec::new(),
            max_pad_serial: None,
            flushing: false,
            first_buffer: true,
            send_stream_start: true,
            send_segment: true,
            srccaps: None,
            current_caps: None,
            tags: None,
            tags_changed: false,
            segment: Segment::new(),
            seqnum: None,
            next_seqnum: None,
            clock: None,
            base_time: Duration::ZERO,
        };
        state.reset_flow_values();

        AggregatorInner {
            name,
            imp,
            task: OrderedMutex::new(LockLevel::Task, None),
            src_stream_lock: OrderedMutex::new(LockLevel::SrcStream, ()),
            src: OrderedMutex::new(LockLevel::Src, SrcState::default()),
            src_cond: Condvar::new(),
            state: OrderedMutex::new(LockLevel::Object, state),
            downstream: RwLock::new(None),
        }
    }

    pub(super) fn name(&self) -> &str {
        &self.name
    }

    /// Wakes up the output thread, including a pending clock wait.
    fn src_broadcast(&self, src: &SrcState) {
        if let Some(clock_id) = &src.clock_id {
            clock_id.unschedule();
        }
        self.src_cond.notify_all();
    }

    pub(super) fn settings(&self) -> Settings {
        self.state.lock().settings.clone()
    }

    pub(super) fn update_settings(&self, f: impl FnOnce(&mut Settings)) {
        let src = self.src.lock();
        f(&mut self.state.lock().settings);
        self.src_broadcast(&src);
    }

    pub(super) fn set_downstream(&self, downstream: Arc<dyn Downstream>) {
        *self.downstream.write() = Some(downstream);
    }

    fn downstream(&self) -> Option<Arc<dyn Downstream>> {
        self.downstream.read().clone()
    }

    pub(super) fn set_clock(&self, clock: Option<Arc<dyn Clock>>) {
        let src = self.src.lock();
        self.state.lock().clock = clock;
        self.src_broadcast(&src);
    }

    pub(super) fn set_base_time(&self, base_time: Duration) {
        let src = self.src.lock();
        self.state.lock().base_time = base_time;
        self.src_broadcast(&src);
    }

    pub(super) fn set_min_upstream_latency(&self, latency: Duration) {
        let mut src = self.src.lock();
        self.state.lock().settings.min_upstream_latency = latency;
        // Applied on the next latency query
        src.has_peer_latency = false;
        self.src_broadcast(&src);
    }

    pub(super) fn pads(&self) -> Vec<AggregatorPad> {
        self.state.lock().pads.clone()
    }

    pub(super) fn current_caps(&self) -> Option<Caps> {
        self.state.lock().current_caps.clone()
    }

    pub(super) fn merge_tags(&self, tags: &TagList) {
        let mut state = self.state.lock();
        state.tags.get_or_insert_with(TagList::new).merge(tags);
        state.tags_changed = true;
    }

    pub(super) fn segment(&self) -> Segment {
        self.state.lock().segment.clone()
    }

    pub(super) fn update_segment(&self, segment: Segment) {
        let mut state = self.state.lock();
        debug!("{}: Updating output segment {segment:?}", self.name);
        state.segment = segment;
        state.send_segment = true;
        // The position is owned by the implementation from now on
        state.first_buffer = false;
    }

    pub(super) fn is_live(&self) -> bool {
        let src = self.src.lock();
        let state = self.state.lock();
        is_live_unlocked(&src, &state)
    }

    pub(super) fn simple_next_time(&self) -> Option<Duration> {
        let state = self.state.lock();
        let position = state
            .segment
            .position()
            .unwrap_or_else(|| state.segment.start());
        state.segment.to_running_time(position)
    }

    fn check_pads_ready(&self, src: &SrcState, state: &mut State) -> Readiness {
        if state.pads.is_empty() {
            trace!("{}: Pads not ready, no pads", self.name);
            return Readiness::NotReady;
        }

        let live = is_live_unlocked(src, state);
        let ignore_inactive_pads = state.settings.ignore_inactive_pads;
        let mut have_buffer = true;
        let mut have_event_or_query = false;
        let mut have_live_buffer = false;
        let mut n_ready = 0;

        for pad in &state.pads {
            let data = pad.lock_data();

            // Everything serialized ahead of the buffers goes first
            if data.front_is_event_or_query() {
                trace!("{}: Have pending serialized event or query", pad.name());
                have_event_or_query = true;
                break;
            }

            if ignore_inactive_pads && live && data.waited_once && data.first_buffer && !data.eos {
                trace!("{}: Ignoring inactive pad", pad.name());
                continue;
            }

            if !data.front_is_buffer() {
                if data.eos {
                    trace!("{}: Have no buffer and already EOS", pad.name());
                    n_ready += 1;
                } else {
                    trace!("{}: Have no buffer and not EOS yet", pad.name());
                    have_buffer = false;
                }
            } else {
                trace!(
                    "{}: Have {:?} queued in {} buffers",
                    pad.name(),
                    data.time_level,
                    data.num_buffers
                );
                // In live mode a single input with data is enough to pick a start time
                if live {
                    have_live_buffer = true;
                    n_ready += 1;
                }
            }
        }

        if have_live_buffer {
            state.first_buffer = false;
        }

        if ignore_inactive_pads && live && n_ready == 0 {
            trace!("{}: Pads not ready, all inactive", self.name);
            return Readiness::NotReady;
        }

        if have_event_or_query {
            return Readiness::EventOrQuery;
        }

        if !have_buffer {
            trace!("{}: Pads not ready yet", self.name);
            return Readiness::NotReady;
        }

        state.first_buffer = false;
        trace!("{}: Pads are ready", self.name);

        Readiness::Ready
    }

    /// Latency as answered by the inputs' upstream peers.
    ///
    /// Only live peers contribute: the minimum is the largest of their minimums and the maximum
    /// the smallest of their maximums.
    fn query_upstream_latency(&self) -> Option<LatencyQuery> {
        let mut res = LatencyQuery::default();

        for pad in self.pads() {
            let Some(upstream) = pad.upstream() else {
                continue;
            };

            let mut query = Query::new_latency();
            if !upstream.query(&mut query) {
                debug!("{}: Latency query failed", pad.name());
                return None;
            }

            let Query::Latency(latency) = query else {
                continue;
            };
            if !latency.live {
                continue;
            }

            res.live = true;
            res.min = res.min.max(latency.min);
            res.max = match (res.max, latency.max) {
                (None, max) => max,
                (Some(current), None) => Some(current),
                (Some(current), Some(max)) => Some(current.min(max)),
            };
        }

        Some(res)
    }
}

impl Aggregator {
    fn push_event_unlocked(&self, event: Event) -> bool {
        let Some(downstream) = self.0.downstream() else {
            debug!("{}: Not linked, dropping {event:?}", self.name());
            return false;
        };

        downstream.event(event)
    }

    fn push_event(&self, event: Event) -> bool {
        if event.is_serialized() {
            let _stream = self.0.src_stream_lock.lock();
            self.push_event_unlocked(event)
        } else {
            self.push_event_unlocked(event)
        }
    }

    /// Pushes the pending stream-start, caps, segment and tags in that order.
    ///
    /// Must be called with the output stream lock held.
    fn push_mandatory_events_unlocked(&self, up_to_caps: bool) {
        let (stream_start, caps) = {
            let mut state = self.0.state.lock();
            (
                mem::replace(&mut state.send_stream_start, false),
                state.srccaps.take(),
            )
        };

        if stream_start {
            let stream_id = format!("agg-{:08x}", rand::random::<u32>());
            info!("{}: Pushing stream start {stream_id}", self.name());
            if !self.push_event_unlocked(Event::stream_start(stream_id)) {
                warn!("{}: Sending stream start event failed", self.name());
            }
        }

        if let Some(caps) = caps {
            info!("{}: Pushing caps {caps}", self.name());
            if !self.push_event_unlocked(Event::caps(caps.clone())) {
                warn!("{}: Sending caps event failed", self.name());
            }
            self.0.state.lock().current_caps = Some(caps);
        }

        if up_to_caps {
            return;
        }

        let (segment, tags) = {
            let mut state = self.0.state.lock();

            let segment = if state.send_segment && !state.flushing {
                let event = Event::segment(state.segment.clone());
                let event = match state.seqnum {
                    Some(seqnum) => event.with_seqnum(seqnum),
                    None => {
                        state.seqnum = Some(event.seqnum());
                        event
                    }
                };
                state.send_segment = false;
                Some(event)
            } else {
                None
            };

            let tags = if state.tags_changed && !state.flushing {
                state.tags_changed = false;
                state.tags.clone().map(Event::tag)
            } else {
                None
            };

            (segment, tags)
        };

        if let Some(segment) = segment {
            debug!("{}: Pushing {segment:?}", self.name());
            self.push_event_unlocked(segment);
        }

        if let Some(tags) = tags {
            debug!("{}: Pushing {tags:?}", self.name());
            self.push_event_unlocked(tags);
        }
    }

    fn push_eos(&self) {
        let _stream = self.0.src_stream_lock.lock();
        self.push_mandatory_events_unlocked(false);

        let seqnum = {
            let mut src = self.0.src.lock();
            src.send_eos = false;
            self.0.state.lock().seqnum
        };

        let event = match seqnum {
            Some(seqnum) => Event::eos().with_seqnum(seqnum),
            None => Event::eos(),
        };

        info!("{}: Pushing EOS", self.name());
        self.push_event_unlocked(event);
    }

    pub(super) fn default_finish_buffer(&self, buffer: Buffer) -> FlowResult {
        let _stream = self.0.src_stream_lock.lock();
        self.push_mandatory_events_unlocked(false);

        {
            let state = self.0.state.lock();
            if state.flushing || !state.started {
                debug!("{}: Not pushing {buffer:?} while flushing", self.name());
                return Err(FlowError::Flushing);
            }
        }

        let Some(downstream) = self.0.downstream() else {
            debug!("{}: Not linked, dropping {buffer:?}", self.name());
            return Err(FlowError::NotLinked);
        };

        trace!("{}: Pushing {buffer:?}", self.name());
        downstream.chain(buffer)
    }

    pub(super) fn set_src_caps_internal(&self, caps: Caps) {
        let _stream = self.0.src_stream_lock.lock();
        self.0.state.lock().srccaps = Some(caps);
        self.push_mandatory_events_unlocked(true);
    }

    pub(super) fn ignore_inactive_and_live(&self) -> (bool, bool) {
        let src = self.0.src.lock();
        let state = self.0.state.lock();
        (
            state.settings.ignore_inactive_pads,
            is_live_unlocked(&src, &state),
        )
    }

    fn start_srcpad_task(&self) -> Result<(), Error> {
        let mut task = self.0.task.lock();

        let paused = self.0.src.lock().task_paused;
        if task.is_some() && !paused {
            debug!("{}: Output thread running already", self.name());
            return Ok(());
        }

        if let Some(handle) = task.take() {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                error!("{}: Output thread panicked", self.name());
            }
        }

        {
            let mut src = self.0.src.lock();
            src.running = true;
            src.task_paused = false;
        }

        info!("{}: Starting output thread", self.name());
        let agg = self.clone();
        let handle = thread::Builder::new()
            .name(format!("{}:src", self.name()))
            .spawn(move || agg.aggregate_func())?;
        *task = Some(handle);

        Ok(())
    }

    /// Stops the output thread, after pushing `flush_start` downstream if any.
    fn stop_srcpad_task(&self, flush_start: Option<Event>) -> bool {
        info!(
            "{}: {} output thread",
            self.name(),
            if flush_start.is_some() {
                "Pausing"
            } else {
                "Stopping"
            }
        );

        {
            let mut src = self.0.src.lock();
            src.running = false;
            self.0.src_broadcast(&src);
        }

        let res = flush_start.map_or(true, |event| self.push_event(event));

        let mut task = self.0.task.lock();
        if let Some(handle) = task.take() {
            if handle.thread().id() == thread::current().id() {
                debug!("{}: Stopping from the output thread", self.name());
            } else if handle.join().is_err() {
                error!("{}: Output thread panicked", self.name());
            }
        }

        res
    }

    fn aggregate_func(&self) {
        let mut src = loop {
            let ret = self.aggregate_loop();

            let mut src = self.0.src.lock();
            if ret != Err(FlowError::Eos) {
                break src;
            }

            let pending_new_stream = self
                .0
                .state
                .lock()
                .pads
                .iter()
                .any(|pad| pad.lock_data().stream_start_pending);
            if !pending_new_stream {
                break src;
            }

            info!("{}: Have pending new stream, keep aggregating", self.name());
            self.0.state.lock().reset_flow_values();
            src.send_eos = true;
        };

        // Either stopping, or an error or EOS that a new stream-start or flush will restart from
        debug!("{}: Pausing output thread", self.name());
        src.task_paused = true;
    }

    fn aggregate_loop(&self) -> FlowResult {
        if !self.0.src.lock().running {
            debug!("{}: Not running anymore", self.name());
            return Ok(FlowSuccess::Ok);
        }

        loop {
            {
                let src = self.0.src.lock();
                if !(src.send_eos && src.running) {
                    return Ok(FlowSuccess::Ok);
                }
            }

            let flow = match self.iterate() {
                Step::Continue | Step::Aggregated(Ok(_)) => continue,
                Step::Aggregated(Err(FlowError::Flushing)) if self.0.state.lock().flushing => {
                    // The flush restarts the thread, the inputs stay as they are
                    return Err(FlowError::Flushing);
                }
                Step::Aggregated(Err(err)) => {
                    if matches!(err, FlowError::Eos | FlowError::Error) {
                        self.push_eos();
                    }
                    err
                }
                Step::Failed(err) => err,
            };

            debug!("{}: Flow return is {flow:?}", self.name());

            if flow == FlowError::Eos {
                // Queued data is kept, a new stream-start on an input restarts the output
                self.flag_inputs_eos();
                return Err(flow);
            }

            for pad in self.pads() {
                pad.set_flushing(flow, true);
            }

            return Err(flow);
        }
    }

    fn iterate(&self) -> Step {
        if let Err(err) = self.do_events_and_queries() {
            return Step::Failed(err);
        }

        if self.0.is_live() {
            for pad in self.pads() {
                pad.skip_buffers(self);
            }
        }

        let got_eos_event = mem::take(&mut self.0.src.lock().got_eos_event);
        if got_eos_event {
            self.push_eos();
            return Step::Continue;
        }

        let (ready, timeout) = self.wait_and_check();
        if !ready {
            self.reset_peeked();
            return Step::Continue;
        }

        // Events that arrived while waiting go before the buffers behind them
        match self.do_events_and_queries() {
            Err(err) => return Step::Failed(err),
            Ok(true) => {
                self.reset_peeked();
                return Step::Continue;
            }
            Ok(false) => (),
        }

        trace!("{}: Aggregating, timeout {timeout}", self.name());
        let ret = self.0.imp.aggregate(self, timeout);
        self.reset_peeked();

        Step::Aggregated(ret)
    }

    /// Makes producers get EOS, except on inputs where a new stream already started.
    fn flag_inputs_eos(&self) {
        let _src = self.0.src.lock();
        let state = self.0.state.lock();

        for pad in &state.pads {
            let mut data = pad.lock_data();
            if !data.stream_start_pending {
                data.flow = FlowState::Err(FlowError::Eos);
                pad.broadcast();
            }
        }
    }

    fn reset_peeked(&self) {
        for pad in self.pads() {
            pad.reset_peeked();
        }
    }

    /// Handles the events and queries queued at the consumption end of every input.
    ///
    /// Returns whether any were handled.
    fn do_events_and_queries(&self) -> Result<bool, FlowError> {
        let mut processed = false;
        let mut ret = Ok(());

        for pad in self.pads() {
            loop {
                let Some(item) = pad.lock_data().pop_serialized() else {
                    break;
                };
                processed = true;

                match item {
                    PadItem::Event(event) => {
                        let is_caps = event.type_() == EventType::Caps;
                        debug!("{}: Handling {event:?}", pad.name());

                        let res = self.0.imp.sink_event(self, &pad, event);

                        let mut data = pad.lock_data();
                        if is_caps {
                            data.negotiated = res;
                            if !res {
                                warn!("{}: Caps not accepted", pad.name());
                                ret = Err(FlowError::NotNegotiated);
                            }
                        }
                        pad.broadcast();
                    }
                    PadItem::Query { id, mut query } => {
                        debug!("{}: Handling {query:?}", pad.name());

                        let res = self.0.imp.sink_query(self, &pad, &mut query);

                        let mut data = pad.lock_data();
                        data.query_answer = Some((id, query, res));
                        pad.broadcast();
                    }
                    PadItem::Buffer(_) => unreachable!(),
                }
            }
        }

        ret.map(|_| processed)
    }

    /// Waits until the inputs are ready or, in live mode, until the deadline of the next output.
    ///
    /// Returns whether to aggregate and whether the deadline passed.
    fn wait_and_check(&self) -> (bool, bool) {
        let start = self.0.imp.next_time(self);

        let mut src = self.0.src.lock();
        let latency = self.latency_unlocked(&mut src);

        match self.0.check_pads_ready(&src, &mut self.0.state.lock()) {
            Readiness::Ready => {
                debug!("{}: All pads have data", self.name());
                return (true, false);
            }
            Readiness::EventOrQuery => {
                debug!("{}: Have serialized event or query to handle first", self.name());
                return (false, false);
            }
            Readiness::NotReady => (),
        }

        if !src.running || !src.send_eos {
            return (false, false);
        }

        let (clock, base_time, selecting_first) = {
            let state = self.0.state.lock();
            (
                state.clock.clone(),
                state.base_time,
                state.first_buffer
                    && state.settings.start_time_selection == StartTimeSelection::First,
            )
        };

        match (latency, clock, start) {
            (Some(latency), Some(clock), Some(start)) if !selecting_first => {
                let time = base_time + start + latency;
                debug!(
                    "{}: Possibly waiting for clock to reach {time:?} (base {base_time:?} start {start:?} latency {latency:?} current {:?})",
                    self.name(),
                    clock.time(),
                );

                let clock_id = clock.new_single_shot_id(time);
                src.clock_id = Some(clock_id.clone());
                let status = src.unlocked(|| clock_id.wait());
                src.clock_id = None;

                debug!("{}: Clock returned {status:?}", self.name());

                if matches!(status, ClockReturn::Ok | ClockReturn::Early) {
                    let state = self.0.state.lock();
                    for pad in &state.pads {
                        pad.lock_data().waited_once = true;
                    }

                    return (true, true);
                }
            }
            _ => {
                // Woken up by new data, flushes or stopping
                trace!("{}: Waiting for data", self.name());
                src.wait(&self.0.src_cond);
            }
        }

        let ready = self.0.check_pads_ready(&src, &mut self.0.state.lock()) == Readiness::Ready;
        (ready, false)
    }

    pub(super) fn latency_internal(&self) -> Option<Duration> {
        let mut src = self.0.src.lock();
        self.latency_unlocked(&mut src)
    }

    fn latency_unlocked(&self, src: &mut OrderedGuard<'_, SrcState>) -> Option<Duration> {
        let force_live = self.0.state.lock().settings.force_live;

        if !src.has_peer_latency {
            let mut query = LatencyQuery::default();
            // When forced live, query again next time
            if !self.query_latency_unlocked(src, &mut query) && !force_live {
                return None;
            }
        }

        if !force_live && (!src.has_peer_latency || !src.peer_latency_live) {
            return None;
        }

        let latency = self.0.state.lock().settings.latency;
        Some(src.peer_latency_min + latency + src.sub_latency_min)
    }

    fn query_latency_unlocked(
        &self,
        src: &mut OrderedGuard<'_, SrcState>,
        query: &mut LatencyQuery,
    ) -> bool {
        let Some(mut upstream) = src.unlocked(|| self.0.query_upstream_latency()) else {
            warn!("{}: Latency query failed", self.name());
            return false;
        };

        let (min_upstream_latency, our_latency) = {
            let state = self.0.state.lock();
            (
                state.settings.min_upstream_latency,
                state.settings.latency,
            )
        };

        if min_upstream_latency > upstream.min {
            let diff = min_upstream_latency - upstream.min;
            upstream.min += diff;
            upstream.max = upstream.max.map(|max| max + diff);
        }

        if let Some(max) = upstream.max {
            if upstream.min > max {
                warn!(
                    "{}: Impossible to configure latency: max {max:?} < min {:?}. Add queues or other buffering elements.",
                    self.name(),
                    upstream.min,
                );
                return false;
            }
        }

        src.peer_latency_live = upstream.live;
        src.peer_latency_min = upstream.min;
        src.peer_latency_max = upstream.max;
        src.has_peer_latency = true;

        let min = upstream.min + our_latency + src.sub_latency_min;
        let max = match (src.sub_latency_max, upstream.max) {
            (Some(sub_max), Some(max)) => Some(max + sub_max + our_latency),
            _ => None,
        };

        self.0.src_broadcast(src);

        debug!(
            "{}: Configured latency live {} min {min:?} max {max:?}",
            self.name(),
            upstream.live
        );

        *query = LatencyQuery {
            live: upstream.live,
            min,
            max,
        };

        true
    }

    pub(super) fn set_latency_property_internal(&self, mut latency: Duration) {
        let src = self.0.src.lock();
        let mut state = self.0.state.lock();

        if src.peer_latency_live {
            // Our own latency has to fit between the upstream minimum and maximum
            let min = src.peer_latency_min + latency + src.sub_latency_min;
            let max = match (src.sub_latency_max, src.peer_latency_max) {
                (Some(sub_max), Some(max)) => Some(max + sub_max),
                _ => None,
            };

            if let Some(max) = max.filter(|max| min > *max) {
                warn!(
                    "{}: The requested latency {latency:?} is too big for the current pipeline, limiting to {max:?}",
                    self.name()
                );
                latency = latency.saturating_sub(min - max);
            }
        }

        if state.settings.latency == latency {
            return;
        }

        debug!("{}: Latency changed to {latency:?}", self.name());
        state.settings.latency = latency;
        for pad in &state.pads {
            pad.broadcast();
        }
        drop(state);
        self.0.src_broadcast(&src);
    }

    pub(super) fn set_sub_latency(&self, min: Duration, max: Option<Duration>) -> Result<(), Error> {
        if let Some(max) = max {
            if max < min {
                error!(
                    "{}: Invalid latency, min {min:?} > max {max:?}",
                    self.name()
                );
                return Err(Error::InvalidLatency { min, max });
            }
        }

        let mut src = self.0.src.lock();
        if src.sub_latency_min != min || src.sub_latency_max != max {
            debug!("{}: Sub latency changed to {min:?} - {max:?}", self.name());
            src.sub_latency_min = min;
            src.sub_latency_max = max;
            self.0.src_broadcast(&src);
        }

        Ok(())
    }

    fn select_start_time(
        &self,
        state: &mut State,
        data: &PadData,
        pts: Option<Duration>,
        duration: Option<Duration>,
    ) {
        let start_time = match state.settings.start_time_selection {
            StartTimeSelection::Zero => Some(Duration::ZERO),
            StartTimeSelection::First if data.head_segment.format() == Format::Time => {
                pts.and_then(|pts| {
                    let mut start_time = pts;
                    if data.head_segment.rate() < 0.0 {
                        start_time += duration.unwrap_or(Duration::ZERO);
                    }
                    start_time = start_time.max(data.head_segment.start());
                    data.head_segment.to_running_time(start_time)
                })
            }
            StartTimeSelection::First => {
                warn!(
                    "{}: Ignoring request of selecting the first start time as the segment is a {:?} segment instead of a time segment",
                    self.name(),
                    data.head_segment.format()
                );
                Some(Duration::ZERO)
            }
            StartTimeSelection::Set => Some(state.settings.start_time.unwrap_or(Duration::ZERO)),
        };

        if let Some(start_time) = start_time {
            let position = match state.segment.position() {
                Some(position) => position.min(start_time),
                None => start_time,
            };
            state.segment.set_position(position);
            debug!("{}: Selecting start time {start_time:?}", self.name());
        }
    }

    /// Queues a buffer on `pad`.
    ///
    /// Regular buffers go to the producer end and wait for space, `head == false` inserts at the
    /// consumption end without waiting.
    pub(super) fn chain_internal(
        &self,
        pad: &AggregatorPad,
        buffer: Buffer,
        head: bool,
    ) -> FlowResult {
        trace!("{}: Chaining {buffer:?}", pad.name());

        {
            let data = pad.lock_data();
            if let Some(err) = data.flow.err() {
                debug!("{}: Pad is {err:?}, dropping buffer", pad.name());
                return Err(err);
            }
            if head && data.eos_received() {
                debug!("{}: Buffer after EOS, dropping", pad.name());
                return Err(FlowError::Eos);
            }
        }

        let pts = buffer.pts();
        let duration = buffer.duration();

        loop {
            let mut src = self.0.src.lock();
            let mut state = self.0.state.lock();
            let mut data = pad.lock_data();

            if data.first_buffer {
                // A new input joined, its upstream latency counts from now on
                src.has_peer_latency = false;
                data.first_buffer = false;
            }

            let live = is_live_unlocked(&src, &state);
            if (!head || data.has_space(live, state.settings.latency)) && data.flow.is_ok() {
                pad.apply_buffer(&mut data, &buffer, head);
                if head {
                    debug!("{}: Queueing {buffer:?}", pad.name());
                    data.queue.push_back(PadItem::Buffer(buffer));
                } else {
                    data.queue.push_front(PadItem::Buffer(buffer));
                }
                data.num_buffers += 1;
                self.0.src_broadcast(&src);

                if state.first_buffer {
                    self.select_start_time(&mut state, &data, pts, duration);
                }

                trace!("{}: Done chaining", pad.name());
                return Ok(FlowSuccess::Ok);
            }

            if let Some(err) = data.flow.err() {
                debug!("{}: Pad is {err:?}, dropping buffer", pad.name());
                return Err(err);
            }

            debug!(
                "{}: Waiting for buffer to be consumed before queueing {buffer:?}",
                pad.name()
            );
            drop(state);
            drop(src);
            data.wait(&pad.0.cond);
        }
    }

    /// Queues serialized events for the output thread, handles the others right away.
    pub(super) fn sink_event_pre_queue(&self, pad: &AggregatorPad, event: Event) -> FlowResult {
        let type_ = event.type_();

        if !event.is_serialized() || type_ == EventType::FlushStop {
            return if self.0.imp.sink_event(self, pad, event) {
                Ok(FlowSuccess::Ok)
            } else {
                Err(FlowError::Error)
            };
        }

        let mut need_restart = false;
        let ret = {
            let mut src = self.0.src.lock();
            let mut data = pad.lock_data();

            if type_ == EventType::StreamStart && src.running {
                data.flow = FlowState::Ok;
                data.stream_start_pending = true;

                if src.task_paused {
                    need_restart = true;
                } else {
                    debug!("{}: Output thread is running already", pad.name());
                }
            }

            let ret = match data.flow.err() {
                Some(err) => {
                    debug!("{}: Pad is {err:?}, dropping {event:?}", pad.name());
                    Err(err)
                }
                None => {
                    if let EventView::Segment(segment) = event.view() {
                        data.head_segment = segment.clone();
                        data.head_position = segment.position();
                        pad.update_time_level(&mut data, true);
                    }

                    debug!("{}: Queueing {event:?}", pad.name());
                    data.queue.push_back(PadItem::Event(event));
                    Ok(FlowSuccess::Ok)
                }
            };
            drop(data);

            if need_restart {
                src.send_eos = true;
                self.0.state.lock().reset_flow_values();
            }
            self.0.src_broadcast(&src);

            ret
        };

        if need_restart {
            info!("{}: Resuming output thread", pad.name());
            if let Err(err) = self.start_srcpad_task() {
                error!("{}: Failed to restart output thread: {err}", self.name());
                return Err(FlowError::Error);
            }
        }

        ret
    }

    /// Queues serialized queries and blocks until the output thread answered them.
    pub(super) fn sink_query_pre_queue(&self, pad: &AggregatorPad, query: &mut Query) -> bool {
        if !query.is_serialized() {
            return self.0.imp.sink_query(self, pad, query);
        }

        let src = self.0.src.lock();
        let mut data = pad.lock_data();

        if let Some(err) = data.flow.err() {
            debug!("{}: Pad is {err:?}, dropping {query:?}", pad.name());
            return false;
        }

        let id = data.next_query_id;
        data.next_query_id += 1;
        data.queue.push_back(PadItem::Query {
            id,
            query: query.clone(),
        });
        self.0.src_broadcast(&src);
        drop(src);

        loop {
            if matches!(&data.query_answer, Some((answer_id, ..)) if *answer_id == id) {
                if let Some((_, answer, res)) = data.query_answer.take() {
                    *query = answer;
                    return res;
                }
            }

            if let Some(err) = data.flow.err() {
                debug!("{}: Pad is {err:?}, dropping {query:?}", pad.name());
                data.queue
                    .retain(|item| !matches!(item, PadItem::Query { id: other, .. } if *other == id));
                return false;
            }

            debug!("{}: Waiting for query to be consumed", pad.name());
            data.wait(&pad.0.cond);
        }
    }

    fn all_flush_start_received(&self, state: &State, seqnum: Seqnum) -> bool {
        state
            .pads
            .iter()
            .all(|pad| pad.lock_data().last_flush_start_seqnum == Some(seqnum))
    }

    fn all_flush_stop_received(&self, state: &State, seqnum: Seqnum) -> bool {
        state.pads.iter().all(|pad| {
            let data = pad.lock_data();
            data.last_flush_start_seqnum == Some(seqnum)
                && data.last_flush_stop_seqnum == Some(seqnum)
        })
    }

    fn flush_start(&self, pad: &AggregatorPad, event: Event) {
        let seqnum = event.seqnum();

        pad.set_flushing(FlowError::Flushing, false);

        let _flush = pad.0.flush_lock.lock();
        pad.lock_data().last_flush_start_seqnum = Some(seqnum);

        let mut state = self.0.state.lock();
        if !state.flushing && self.all_flush_start_received(&state, seqnum) {
            // Only one flush-start per round goes downstream
            state.flushing = true;
            state.next_seqnum = Some(seqnum);
            drop(state);

            info!("{}: Flushing, pausing output thread", self.name());
            self.stop_srcpad_task(Some(event));
        } else {
            debug!(
                "{}: Flush start on {} with seqnum {seqnum}, waiting for the other pads",
                self.name(),
                pad.name()
            );
        }
    }

    fn flush_stop(&self, pad: &AggregatorPad, event: Event) {
        let seqnum = event.seqnum();

        let _flush = pad.0.flush_lock.lock();
        {
            let mut data = pad.lock_data();
            data.last_flush_stop_seqnum = Some(seqnum);
            pad.reset(&mut data);
            pad.broadcast();
        }

        let state = self.0.state.lock();
        if state.flushing && self.all_flush_stop_received(&state, seqnum) {
            drop(state);

            if let Err(err) = self.flush() {
                warn!("{}: Flushing failed: {err}", self.name());
            }
            self.push_event(event);

            {
                let mut src = self.0.src.lock();
                src.send_eos = true;
                src.got_eos_event = false;
                self.0.src_broadcast(&src);
            }

            info!("{}: Flush stopped", self.name());
            if let Err(err) = self.start_srcpad_task() {
                error!("{}: Failed to restart output thread: {err}", self.name());
            }
        }
    }

    fn flush(&self) -> FlowResult {
        debug!("{}: Flushing everything", self.name());
        {
            let mut state = self.0.state.lock();
            state.send_segment = true;
            state.flushing = false;
        }

        self.0.imp.flush(self)
    }

    pub(super) fn default_sink_event(&self, pad: &AggregatorPad, event: Event) -> bool {
        debug!("{}: Got {event:?}", pad.name());

        match event.view() {
            EventView::FlushStart => {
                // Forwarded only once all inputs are flushing
                self.flush_start(pad, event);
                true
            }
            EventView::FlushStop { .. } => {
                self.flush_stop(pad, event);
                true
            }
            EventView::Eos => {
                let src = self.0.src.lock();
                pad.lock_data().eos = true;
                self.0.src_broadcast(&src);
                true
            }
            EventView::Segment(segment) => {
                {
                    let mut data = pad.lock_data();
                    pad.set_segment(segment.clone());
                    // Meaningless with the new segment
                    data.tail_position = None;
                    pad.update_time_level(&mut data, false);
                }

                self.0.state.lock().seqnum = Some(event.seqnum());
                true
            }
            EventView::StreamStart { .. } => {
                let src = self.0.src.lock();
                {
                    let mut data = pad.lock_data();
                    debug!("{}: Clearing EOS on stream start", pad.name());
                    data.eos = false;
                    data.stream_start_pending = false;
                }
                self.0.src_broadcast(&src);
                true
            }
            EventView::Gap {
                timestamp,
                duration,
                missing_data,
            } => {
                let start = *timestamp;
                let stop = duration.map(|duration| start + duration);

                let segment = pad.segment();
                let (start, stop) = if segment.format() == Format::Time {
                    match segment.clip(Some(start), stop) {
                        Some(clipped) => clipped,
                        None => {
                            warn!("{}: GAP event outside segment, dropping", pad.name());
                            return true;
                        }
                    }
                } else {
                    (Some(start), stop)
                };

                let mut buffer = Buffer::new();
                buffer.set_pts(start);
                buffer.set_duration(match (start, stop) {
                    (Some(start), Some(stop)) => Some(stop.saturating_sub(start)),
                    _ => None,
                });
                buffer.set_flags(BufferFlags::GAP | BufferFlags::DROPPABLE);
                if *missing_data {
                    buffer.set_flags(BufferFlags::MISSING_DATA);
                }

                // Takes the place of the event, before anything queued after it
                if let Err(err) = self.chain_internal(pad, buffer, false) {
                    warn!("{}: Failed to chain gap buffer: {err}", pad.name());
                    return false;
                }

                true
            }
            EventView::Caps(_) | EventView::Tag(_) => true,
            _ => {
                debug!("{}: Forwarding {event:?}", pad.name());
                self.push_event(event)
            }
        }
    }

    pub(super) fn default_sink_query(&self, pad: &AggregatorPad, query: &mut Query) -> bool {
        let Some(downstream) = self.0.downstream() else {
            debug!("{}: Not linked, can't forward {query:?}", pad.name());
            return false;
        };

        downstream.query(query)
    }

    /// Sends `event` to the upstream peer of every input.
    ///
    /// Returns whether all of them handled it and whether at least one did.
    fn forward_event_to_all_sinkpads(&self, event: &Event, only_to_active_pads: bool) -> (bool, bool) {
        let mut result = true;
        let mut one_actually_handled = false;

        for pad in self.pads() {
            let Some(upstream) = pad.upstream() else {
                continue;
            };

            let mut ret = if only_to_active_pads && pad.lock_data().first_buffer {
                debug!("{}: Not sending {event:?} to inactive pad", pad.name());
                true
            } else {
                upstream.event(event.clone())
            };

            if ret {
                one_actually_handled = true;
            } else if event.type_() == EventType::Seek {
                let mut seeking = Query::Seeking { seekable: true };
                if upstream.query(&mut seeking) {
                    if let Query::Seeking { seekable: false } = seeking {
                        info!("{}: Source not seekable, ignoring failure", pad.name());
                        ret = true;
                    }
                } else {
                    error!("{}: Seeking query failed", pad.name());
                }
            }

            result &= ret;
        }

        (result, one_actually_handled)
    }

    fn do_seek(&self, event: Event) -> bool {
        let EventView::Seek {
            rate,
            flush,
            start,
            stop,
        } = *event.view()
        else {
            return false;
        };
        let seqnum = event.seqnum();

        if rate == 0.0 || !rate.is_finite() {
            warn!("{}: Refusing seek with invalid rate {rate}", self.name());
            return false;
        }

        info!("{}: Starting seek", self.name());

        {
            let mut state = self.0.state.lock();

            if state.next_seqnum == Some(seqnum) {
                debug!("{}: Dropping duplicated seek with seqnum {seqnum}", self.name());
                return true;
            }

            state.next_seqnum = Some(seqnum);
            state.segment.do_seek(rate, start, stop, flush);
            // Seeking sets a position
            state.first_buffer = false;

            if flush {
                state.flushing = true;
            }
        }

        if flush {
            self.stop_srcpad_task(Some(Event::flush_start().with_seqnum(seqnum)));
        }

        let (result, one_actually_seeked) = self.forward_event_to_all_sinkpads(&event, false);

        if !result || !one_actually_seeked {
            self.0.state.lock().flushing = false;

            // No flush-stop is coming from upstream
            if flush {
                self.push_event(Event::flush_stop(true).with_seqnum(seqnum));

                {
                    let mut src = self.0.src.lock();
                    src.send_eos = true;
                    self.0.src_broadcast(&src);
                }

                if let Err(err) = self.start_srcpad_task() {
                    error!("{}: Failed to restart output thread: {err}", self.name());
                }
            }
        }

        info!("{}: Seek done, result {result}", self.name());

        result
    }

    pub(super) fn default_src_event(&self, event: Event) -> bool {
        match event.view() {
            EventView::Seek { .. } => self.do_seek(event),
            // Up to the implementation
            EventView::Navigation => false,
            // Negotiation is up to the implementation
            EventView::Reconfigure => true,
            _ => {
                // Inputs without data yet would consider their first buffer late
                let only_to_active_pads = event.type_() == EventType::Qos;
                self.forward_event_to_all_sinkpads(&event, only_to_active_pads)
                    .0
            }
        }
    }

    pub(super) fn default_src_query(&self, query: &mut Query) -> bool {
        match query {
            Query::Seeking { seekable } => {
                // Upstream seekability doesn't carry over to the combined stream
                *seekable = false;
                true
            }
            Query::Latency(latency) => {
                let mut src = self.0.src.lock();
                self.query_latency_unlocked(&mut src, latency)
            }
            _ => self
                .pads()
                .iter()
                .filter_map(|pad| pad.upstream())
                .any(|upstream| upstream.query(query)),
        }
    }

    pub(super) fn send_event_internal(&self, event: Event) -> bool {
        if event.type_() == EventType::Eos {
            let mut src = self.0.src.lock();
            debug!("{}: Got EOS from the application", self.name());
            src.got_eos_event = true;
            self.0.src_broadcast(&src);
            return true;
        }

        self.0.imp.src_event(self, event)
    }

    pub(super) fn default_create_new_pad(&self, req_name: Option<&str>) -> AggregatorPad {
        let mut state = self.0.state.lock();

        let requested = req_name
            .and_then(|name| name.strip_prefix("sink_"))
            .and_then(|serial| serial.parse::<u32>().ok());

        let serial = match requested {
            Some(serial) => {
                state.max_pad_serial = Some(state.max_pad_serial.map_or(serial, |max| max.max(serial)));
                serial
            }
            None => {
                let serial = state.max_pad_serial.map_or(0, |max| max + 1);
                state.max_pad_serial = Some(serial);
                serial
            }
        };

        AggregatorPad::new(format!("sink_{serial}"), Arc::downgrade(&self.0))
    }

    pub(super) fn request_pad_internal(&self, req_name: Option<&str>) -> Option<AggregatorPad> {
        let pad = self.0.imp.create_new_pad(self, req_name)?;

        let mut src = self.0.src.lock();
        let mut state = self.0.state.lock();

        if state.pads.iter().any(|other| other.name() == pad.name()) {
            warn!("{}: Pad {} exists already", self.name(), pad.name());
            return None;
        }

        debug!("{}: Adding pad {}", self.name(), pad.name());
        state.pads.push(pad.clone());
        drop(state);

        src.has_peer_latency = false;
        self.0.src_broadcast(&src);

        Some(pad)
    }

    pub(super) fn release_pad_internal(&self, pad: &AggregatorPad) {
        debug!("{}: Removing pad {}", self.name(), pad.name());

        let mut src = self.0.src.lock();
        pad.set_flushing(FlowError::Flushing, true);
        pad.reset_peeked();
        self.0.state.lock().pads.retain(|other| other != pad);

        src.has_peer_latency = false;
        self.0.src_broadcast(&src);
    }

    pub(super) fn start_internal(&self) -> Result<(), Error> {
        {
            let mut src = self.0.src.lock();
            let mut state = self.0.state.lock();

            if state.started {
                return Err(Error::AlreadyStarted);
            }

            src.send_eos = true;
            src.got_eos_event = false;
            src.task_paused = false;
            src.reset_peer_latency();

            state.reset_flow_values();
            state.srccaps = None;
            state.current_caps = None;
            state.flushing = false;
            state.seqnum = None;
            state.next_seqnum = None;

            for pad in &state.pads {
                pad.activate();
            }
        }

        if !self.0.imp.start(self) {
            error!("{}: Failed to start", self.name());
            return Err(Error::StartFailed(format!("{} refused to start", self.name())));
        }

        self.0.state.lock().started = true;
        info!("{}: Started", self.name());

        self.start_srcpad_task()
    }

    pub(super) fn stop_internal(&self) {
        if !self.0.state.lock().started {
            return;
        }

        // Unblocks all producers
        for pad in self.pads() {
            pad.set_flushing(FlowError::Flushing, true);
            pad.reset_peeked();
        }

        self.stop_srcpad_task(None);

        self.0.state.lock().reset_flow_values();

        if !self.0.imp.stop(self) {
            warn!("{}: Failed to stop", self.name());
        }

        {
            let mut src = self.0.src.lock();
            src.reset_peer_latency();
            src.task_paused = false;
        }

        self.0.state.lock().started = false;
        info!("{}: Stopped", self.name());
    }

    pub(super) fn current_state(&self) -> AggregatorState {
        let task = self.0.task.lock();
        let src = self.0.src.lock();
        let state = self.0.state.lock();

        if !state.started {
            return AggregatorState::Stopped;
        }

        let flush_pending = state.flushing
            || state
                .pads
                .iter()
                .any(|pad| pad.lock_data().flow == FlowState::Err(FlowError::Flushing));

        if flush_pending {
            AggregatorState::FlushPending
        } else if task.is_some() && !src.task_paused {
            AggregatorState::Running
        } else {
            AggregatorState::Started
        }
    }
}
