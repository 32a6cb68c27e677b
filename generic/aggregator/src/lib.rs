// SPDX-License-Identifier: MPL-2.0

//! Multi-input stream aggregation and RTP jitter buffering.
//!
//! The [`Aggregator`] owns any number of [`AggregatorPad`] inputs and a single output, and runs
//! a dedicated thread that waits until enough inputs have data (or a clock deadline passes)
//! before calling into an [`AggregatorImpl`] to produce output.
//!
//! The [`JitterBuffer`] reorders a stream of RTP packets on a dedicated thread, waiting for
//! missing packets up to a configurable latency. It is built on top of
//! [`BoundedOrderedQueue`].

#[macro_use]
extern crate log;

pub mod aggregator;
pub mod buffer;
pub mod clock;
pub mod error;
pub mod event;
pub mod flow;
pub mod jitterbuffer;
mod lockorder;
pub mod peer;
pub mod queue;
pub mod segment;
pub mod seqnum;

pub use aggregator::{
    Aggregator, AggregatorImpl, AggregatorPad, AggregatorState, StartTimeSelection,
};
pub use buffer::{Buffer, BufferFlags};
pub use clock::{Clock, ClockId, ClockReturn, SystemClock, TestClock};
pub use error::Error;
pub use event::{Caps, Event, EventType, EventView, LatencyQuery, Query, TagList};
pub use flow::{FlowError, FlowResult, FlowSuccess};
pub use jitterbuffer::{JitterBuffer, RtpPacket};
pub use peer::{Downstream, Upstream};
pub use queue::{BoundedOrderedQueue, QueueItem};
pub use segment::{Format, Segment};
pub use seqnum::Seqnum;
