// SPDX-License-Identifier: MPL-2.0

//! N-to-1 stream aggregation.
//!
//! An [`Aggregator`] owns any number of [`AggregatorPad`] inputs, each fed by its own producer
//! thread, and one output. A dedicated output thread replays queued serialized events and
//! queries, waits until every input has data (or, when live, until a clock deadline passes)
//! and then calls [`AggregatorImpl::aggregate`].
//!
//! Locks are always taken in this order:
//!
//! 1. pad stream lock (held by the producer for the duration of a chain or serialized event)
//! 2. pad flush lock
//! 3. output task handle
//! 4. output stream lock
//! 5. output thread state and condition variable
//! 6. aggregator object state
//! 7. pad queue and condition variable
//! 8. pad segment

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::buffer::Buffer;
use crate::clock::Clock;
use crate::error::Error;
use crate::event::{Caps, Event, Query, TagList};
use crate::flow::{FlowResult, FlowSuccess};
use crate::peer::Downstream;
use crate::segment::Segment;

mod imp;
mod pad;

pub use pad::AggregatorPad;

pub const DEFAULT_LATENCY: Duration = Duration::ZERO;
pub const DEFAULT_MIN_UPSTREAM_LATENCY: Duration = Duration::ZERO;
pub const DEFAULT_START_TIME_SELECTION: StartTimeSelection = StartTimeSelection::Zero;
pub const DEFAULT_START_TIME: Option<Duration> = None;
pub const DEFAULT_FORCE_LIVE: bool = false;
pub const DEFAULT_IGNORE_INACTIVE_PADS: bool = false;

/// How the running time of the first output buffer is chosen.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum StartTimeSelection {
    /// Start at running time zero.
    #[default]
    Zero,
    /// Start at the running time of the first buffer on any input.
    First,
    /// Start at [`Settings::start_time`].
    Set,
}

#[derive(Debug, Clone)]
pub struct Settings {
    /// Additional latency in live mode to allow inputs to deliver late.
    pub latency: Duration,
    /// Lower bound for the latency reported by upstream.
    pub min_upstream_latency: Duration,
    pub start_time_selection: StartTimeSelection,
    pub start_time: Option<Duration>,
    /// Behave as live even without a live upstream.
    pub force_live: bool,
    /// In live mode, don't wait for inputs that never produced any data.
    pub ignore_inactive_pads: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            latency: DEFAULT_LATENCY,
            min_upstream_latency: DEFAULT_MIN_UPSTREAM_LATENCY,
            start_time_selection: DEFAULT_START_TIME_SELECTION,
            start_time: DEFAULT_START_TIME,
            force_live: DEFAULT_FORCE_LIVE,
            ignore_inactive_pads: DEFAULT_IGNORE_INACTIVE_PADS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregatorState {
    Stopped,
    /// Started but the output thread is not running, e.g. after EOS or an error.
    Started,
    Running,
    /// A flush started on some inputs and not all of them finished it yet.
    FlushPending,
}

/// The behaviour of a concrete aggregator.
///
/// Every method except [`aggregate`](Self::aggregate) has a default that calls the matching
/// `parent_*` method of [`Aggregator`].
///
/// [`clip`](Self::clip) and [`skip_buffer`](Self::skip_buffer) are called with the input's queue
/// locked. They must not call back into that pad or the aggregator, including getters such as
/// [`Aggregator::segment`], [`Aggregator::settings`] or [`Aggregator::pads`]. Anything they need
/// has to be captured by the implementation itself. [`next_time`](Self::next_time) must not
/// block.
pub trait AggregatorImpl: Send + Sync + 'static {
    /// Produces output from the inputs' buffers.
    ///
    /// `timeout` is set if the live deadline passed before all inputs had data. Return
    /// [`FlowSuccess::NeedData`] to loop without producing output.
    fn aggregate(&self, aggregator: &Aggregator, timeout: bool) -> FlowResult;

    fn clip(&self, aggregator: &Aggregator, pad: &AggregatorPad, buffer: Buffer) -> Option<Buffer> {
        aggregator.parent_clip(pad, buffer)
    }

    /// Running time at which the next output is due in live mode.
    fn next_time(&self, aggregator: &Aggregator) -> Option<Duration> {
        aggregator.parent_next_time()
    }

    fn flush(&self, aggregator: &Aggregator) -> FlowResult {
        aggregator.parent_flush()
    }

    fn start(&self, aggregator: &Aggregator) -> bool {
        aggregator.parent_start()
    }

    fn stop(&self, aggregator: &Aggregator) -> bool {
        aggregator.parent_stop()
    }

    fn sink_event(&self, aggregator: &Aggregator, pad: &AggregatorPad, event: Event) -> bool {
        aggregator.parent_sink_event(pad, event)
    }

    fn sink_query(&self, aggregator: &Aggregator, pad: &AggregatorPad, query: &mut Query) -> bool {
        aggregator.parent_sink_query(pad, query)
    }

    fn src_event(&self, aggregator: &Aggregator, event: Event) -> bool {
        aggregator.parent_src_event(event)
    }

    fn src_query(&self, aggregator: &Aggregator, query: &mut Query) -> bool {
        aggregator.parent_src_query(query)
    }

    /// Whether a queued buffer is too old to be worth aggregating, only asked in live mode.
    fn skip_buffer(&self, _aggregator: &Aggregator, _pad: &AggregatorPad, _buffer: &Buffer) -> bool {
        false
    }

    fn finish_buffer(&self, aggregator: &Aggregator, buffer: Buffer) -> FlowResult {
        aggregator.parent_finish_buffer(buffer)
    }

    fn create_new_pad(&self, aggregator: &Aggregator, req_name: Option<&str>) -> Option<AggregatorPad> {
        aggregator.parent_create_new_pad(req_name)
    }
}

#[derive(Clone)]
pub struct Aggregator(Arc<imp::AggregatorInner>);

impl PartialEq for Aggregator {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Aggregator {}

impl fmt::Debug for Aggregator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Aggregator")
            .field("name", &self.name())
            .finish()
    }
}

impl Aggregator {
    pub fn new(name: impl Into<String>, imp: impl AggregatorImpl, settings: Settings) -> Self {
        Aggregator(Arc::new(imp::AggregatorInner::new(
            name.into(),
            Box::new(imp),
            settings,
        )))
    }

    pub fn name(&self) -> &str {
        self.0.name()
    }

    pub fn settings(&self) -> Settings {
        self.0.settings()
    }

    pub fn set_downstream(&self, downstream: Arc<dyn Downstream>) {
        self.0.set_downstream(downstream);
    }

    /// Clock to wait on in live mode.
    pub fn set_clock(&self, clock: Option<Arc<dyn Clock>>) {
        self.0.set_clock(clock);
    }

    /// Clock time corresponding to running time zero.
    pub fn set_base_time(&self, base_time: Duration) {
        self.0.set_base_time(base_time);
    }

    pub fn set_min_upstream_latency(&self, latency: Duration) {
        self.0.set_min_upstream_latency(latency);
    }

    pub fn set_start_time_selection(&self, selection: StartTimeSelection) {
        self.0.update_settings(|settings| settings.start_time_selection = selection);
    }

    pub fn set_start_time(&self, start_time: Option<Duration>) {
        self.0.update_settings(|settings| settings.start_time = start_time);
    }

    pub fn set_force_live(&self, force_live: bool) {
        self.0.update_settings(|settings| settings.force_live = force_live);
    }

    pub fn set_ignore_inactive_pads(&self, ignore: bool) {
        self.0.update_settings(|settings| settings.ignore_inactive_pads = ignore);
    }

    /// Starts the implementation and the output thread.
    pub fn start(&self) -> Result<(), Error> {
        self.start_internal()
    }

    /// Flushes all inputs, stops the output thread and the implementation.
    pub fn stop(&self) {
        self.stop_internal();
    }

    pub fn state(&self) -> AggregatorState {
        self.current_state()
    }

    /// Creates a new input, `req_name` of the form `sink_%u` picks its serial.
    pub fn request_pad(&self, req_name: Option<&str>) -> Option<AggregatorPad> {
        self.request_pad_internal(req_name)
    }

    /// Removes an input, producers blocked on it return [`FlowError::Flushing`](crate::FlowError).
    pub fn release_pad(&self, pad: &AggregatorPad) {
        self.release_pad_internal(pad);
    }

    pub fn pads(&self) -> Vec<AggregatorPad> {
        self.0.pads()
    }

    /// Handles an event sent to the output, e.g. a seek.
    ///
    /// EOS makes the output thread push EOS downstream.
    pub fn send_event(&self, event: Event) -> bool {
        self.send_event_internal(event)
    }

    /// Handles a query on the output.
    pub fn query(&self, query: &mut Query) -> bool {
        self.0.imp.src_query(self, query)
    }

    /// Pushes an output buffer, preceded by any pending stream-start, caps, segment and tags.
    pub fn finish_buffer(&self, buffer: Buffer) -> FlowResult {
        self.0.imp.finish_buffer(self, buffer)
    }

    /// Sets the output caps, pushed downstream right away after a pending stream-start.
    pub fn set_src_caps(&self, caps: Caps) {
        self.set_src_caps_internal(caps);
    }

    pub fn current_caps(&self) -> Option<Caps> {
        self.0.current_caps()
    }

    /// Merges `tags` into the output tags, pushed before the next buffer.
    pub fn merge_tags(&self, tags: &TagList) {
        self.0.merge_tags(tags);
    }

    /// Output segment.
    pub fn segment(&self) -> Segment {
        self.0.segment()
    }

    /// Replaces the output segment, it is pushed before the next buffer.
    pub fn update_segment(&self, segment: Segment) {
        self.0.update_segment(segment);
    }

    /// Latency waited for in live mode, `None` when not live.
    pub fn latency(&self) -> Option<Duration> {
        self.latency_internal()
    }

    /// Sets the configured extra latency.
    pub fn set_latency_property(&self, latency: Duration) {
        self.set_latency_property_internal(latency);
    }

    /// Reports the latency the implementation adds on top of the inputs.
    pub fn set_latency(&self, min: Duration, max: Option<Duration>) -> Result<(), Error> {
        self.set_sub_latency(min, max)
    }

    pub fn is_live(&self) -> bool {
        self.0.is_live()
    }

    /// Running time of the output position, a default for [`AggregatorImpl::next_time`].
    pub fn simple_next_time(&self) -> Option<Duration> {
        self.0.simple_next_time()
    }

    pub fn parent_clip(&self, _pad: &AggregatorPad, buffer: Buffer) -> Option<Buffer> {
        Some(buffer)
    }

    pub fn parent_next_time(&self) -> Option<Duration> {
        None
    }

    pub fn parent_flush(&self) -> FlowResult {
        Ok(FlowSuccess::Ok)
    }

    pub fn parent_start(&self) -> bool {
        true
    }

    pub fn parent_stop(&self) -> bool {
        true
    }

    pub fn parent_sink_event(&self, pad: &AggregatorPad, event: Event) -> bool {
        self.default_sink_event(pad, event)
    }

    pub fn parent_sink_query(&self, pad: &AggregatorPad, query: &mut Query) -> bool {
        self.default_sink_query(pad, query)
    }

    pub fn parent_src_event(&self, event: Event) -> bool {
        self.default_src_event(event)
    }

    pub fn parent_src_query(&self, query: &mut Query) -> bool {
        self.default_src_query(query)
    }

    pub fn parent_finish_buffer(&self, buffer: Buffer) -> FlowResult {
        self.default_finish_buffer(buffer)
    }

    pub fn parent_create_new_pad(&self, req_name: Option<&str>) -> Option<AggregatorPad> {
        Some(self.default_create_new_pad(req_name))
    }
}
