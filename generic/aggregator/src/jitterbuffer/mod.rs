// SPDX-License-Identifier: MPL-2.0

//! RTP jitter buffer.
//!
//! Packets pushed with [`JitterBuffer::chain`] are sorted by seqnum in a
//! [`BoundedOrderedQueue`](crate::queue::BoundedOrderedQueue) and released in order on a
//! dedicated thread. When a seqnum is missing the thread waits on the clock until the
//! deadline of the next packet (its running time plus the configured latency) before giving
//! up on the missing ones and flagging the next buffer as discontinuous.

use std::sync::Arc;
use std::time::Duration;

use crate::buffer::Buffer;
use crate::clock::Clock;
use crate::error::Error;
use crate::event::Event;
use crate::flow::FlowResult;
use crate::peer::Downstream;

mod imp;

pub const DEFAULT_LATENCY: Duration = Duration::from_millis(200);
pub const DEFAULT_DROP_ON_LATENCY: bool = false;
pub const DEFAULT_LOW_WATERMARK: f32 = 0.0;
pub const DEFAULT_HIGH_WATERMARK: f32 = 0.0;

#[derive(Debug, Clone)]
pub struct Settings {
    /// How long to wait for missing packets.
    pub latency: Duration,
    /// Evict the oldest packet instead of growing beyond `latency`.
    pub drop_on_latency: bool,
    /// Fraction of `latency` at which the output pauses to rebuffer.
    pub low_watermark: f32,
    /// Fraction of `latency` at which the output resumes after rebuffering.
    pub high_watermark: f32,
    /// Clock rate of the RTP timestamps, if known upfront.
    pub clock_rate: Option<u32>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            latency: DEFAULT_LATENCY,
            drop_on_latency: DEFAULT_DROP_ON_LATENCY,
            low_watermark: DEFAULT_LOW_WATERMARK,
            high_watermark: DEFAULT_HIGH_WATERMARK,
            clock_rate: None,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub num_pushed: u64,
    pub num_lost: u64,
    pub num_late: u64,
    pub num_duplicates: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// No clock rate yet.
    #[default]
    Unconfigured,
    Active,
    Flushing,
    Eos,
}

/// An RTP packet with the header fields the jitter buffer needs.
#[derive(Debug, Clone, PartialEq)]
pub struct RtpPacket {
    pub seqnum: u16,
    pub rtptime: u32,
    pub payload_type: u8,
    pub buffer: Buffer,
}

impl RtpPacket {
    pub fn new(seqnum: u16, rtptime: u32, payload_type: u8, buffer: Buffer) -> Self {
        RtpPacket {
            seqnum,
            rtptime,
            payload_type,
            buffer,
        }
    }
}

#[derive(Clone)]
pub struct JitterBuffer(Arc<imp::JitterBufferInner>);

impl JitterBuffer {
    pub fn new(settings: Settings) -> Self {
        JitterBuffer(Arc::new(imp::JitterBufferInner::new(settings)))
    }

    pub fn set_downstream(&self, downstream: Arc<dyn Downstream>) {
        self.0.set_downstream(downstream);
    }

    /// Clock to wait on for missing packets and the clock time corresponding to running
    /// time zero.
    pub fn set_clock(&self, clock: Option<Arc<dyn Clock>>, base_time: Duration) {
        self.0.set_clock(clock, base_time);
    }

    /// Callback resolving a payload type to its clock rate.
    pub fn connect_request_pt_map<F>(&self, f: F)
    where
        F: Fn(u8) -> Option<u32> + Send + Sync + 'static,
    {
        self.0.set_pt_map(Arc::new(f));
    }

    /// Starts the output thread. Output is held back until [`set_playing`](Self::set_playing).
    pub fn start(&self) -> Result<(), Error> {
        imp::JitterBufferInner::start(&self.0)
    }

    pub fn set_playing(&self, playing: bool) {
        self.0.set_playing(playing);
    }

    /// Stops the output thread and drops everything queued.
    pub fn stop(&self) {
        self.0.stop();
    }

    pub fn chain(&self, packet: RtpPacket) -> FlowResult {
        self.0.chain(packet)
    }

    pub fn event(&self, event: Event) -> bool {
        imp::JitterBufferInner::event(&self.0, event)
    }

    pub fn stats(&self) -> Stats {
        self.0.stats()
    }

    pub fn stream_state(&self) -> StreamState {
        self.0.stream_state()
    }

    pub fn is_buffering(&self) -> bool {
        self.0.is_buffering()
    }
}
