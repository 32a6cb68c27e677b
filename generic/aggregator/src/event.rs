// SPDX-License-Identifier: MPL-2.0

//! Control items travelling alongside buffers: events, queries, caps and tags.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::segment::Segment;
use crate::seqnum::Seqnum;

/// Opaque media format description.
///
/// Only carried around and compared, there is no negotiation logic attached.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Caps {
    name: String,
    fields: BTreeMap<String, String>,
}

impl Caps {
    pub fn new(name: impl Into<String>) -> Self {
        Caps {
            name: name.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn field(mut self, key: impl Into<String>, value: impl fmt::Display) -> Self {
        self.fields.insert(key.into(), value.to_string());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    pub fn get_u32(&self, key: &str) -> Option<u32> {
        self.get(key).and_then(|v| v.parse().ok())
    }
}

impl fmt::Display for Caps {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.name)?;
        for (k, v) in &self.fields {
            write!(f, ", {k}={v}")?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TagList(BTreeMap<String, String>);

impl TagList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, tag: impl Into<String>, value: impl Into<String>) {
        self.0.insert(tag.into(), value.into());
    }

    pub fn get(&self, tag: &str) -> Option<&str> {
        self.0.get(tag).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Merges `other` into `self`, values from `other` win.
    pub fn merge(&mut self, other: &TagList) {
        for (k, v) in &other.0 {
            self.0.insert(k.clone(), v.clone());
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventType {
    FlushStart,
    FlushStop,
    StreamStart,
    Caps,
    Segment,
    Tag,
    Gap,
    Eos,
    Seek,
    Qos,
    Reconfigure,
    Navigation,
    CustomDownstream,
    CustomDownstreamSticky,
    CustomDownstreamOob,
    CustomUpstream,
}

impl EventType {
    /// Sticky events stay in effect on a pad until replaced or flushed.
    pub fn is_sticky(self) -> bool {
        matches!(
            self,
            EventType::StreamStart
                | EventType::Caps
                | EventType::Segment
                | EventType::Tag
                | EventType::Eos
                | EventType::CustomDownstreamSticky
        )
    }

    /// Serialized events travel in order with buffers.
    pub fn is_serialized(self) -> bool {
        matches!(
            self,
            EventType::FlushStop
                | EventType::StreamStart
                | EventType::Caps
                | EventType::Segment
                | EventType::Tag
                | EventType::Gap
                | EventType::Eos
                | EventType::CustomDownstream
                | EventType::CustomDownstreamSticky
        )
    }

    pub fn is_downstream(self) -> bool {
        !matches!(
            self,
            EventType::Seek
                | EventType::Qos
                | EventType::Reconfigure
                | EventType::Navigation
                | EventType::CustomUpstream
        )
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum EventView {
    FlushStart,
    FlushStop {
        reset_time: bool,
    },
    StreamStart {
        stream_id: String,
    },
    Caps(Caps),
    Segment(Segment),
    Tag(TagList),
    Gap {
        timestamp: Duration,
        duration: Option<Duration>,
        /// Data is missing rather than the stream being sparse.
        missing_data: bool,
    },
    Eos,
    Seek {
        rate: f64,
        flush: bool,
        start: Option<Duration>,
        stop: Option<Duration>,
    },
    Qos {
        proportion: f64,
        diff: i64,
        timestamp: Duration,
    },
    Reconfigure,
    Navigation,
    Custom {
        type_: EventType,
        name: String,
    },
}

#[derive(Clone, PartialEq)]
pub struct Event {
    seqnum: Seqnum,
    view: EventView,
}

impl Event {
    pub fn new(view: EventView) -> Self {
        if let EventView::Custom { type_, .. } = &view {
            assert!(matches!(
                type_,
                EventType::CustomDownstream
                    | EventType::CustomDownstreamSticky
                    | EventType::CustomDownstreamOob
                    | EventType::CustomUpstream
            ));
        }

        Event {
            seqnum: Seqnum::next(),
            view,
        }
    }

    pub fn flush_start() -> Self {
        Self::new(EventView::FlushStart)
    }

    pub fn flush_stop(reset_time: bool) -> Self {
        Self::new(EventView::FlushStop { reset_time })
    }

    pub fn stream_start(stream_id: impl Into<String>) -> Self {
        Self::new(EventView::StreamStart {
            stream_id: stream_id.into(),
        })
    }

    pub fn caps(caps: Caps) -> Self {
        Self::new(EventView::Caps(caps))
    }

    pub fn segment(segment: Segment) -> Self {
        Self::new(EventView::Segment(segment))
    }

    pub fn tag(tags: TagList) -> Self {
        Self::new(EventView::Tag(tags))
    }

    pub fn gap(timestamp: Duration, duration: impl Into<Option<Duration>>) -> Self {
        Self::new(EventView::Gap {
            timestamp,
            duration: duration.into(),
            missing_data: false,
        })
    }

    /// A gap caused by lost data, e.g. packet loss.
    pub fn gap_missing_data(timestamp: Duration, duration: impl Into<Option<Duration>>) -> Self {
        Self::new(EventView::Gap {
            timestamp,
            duration: duration.into(),
            missing_data: true,
        })
    }

    pub fn eos() -> Self {
        Self::new(EventView::Eos)
    }

    pub fn seek(
        rate: f64,
        flush: bool,
        start: impl Into<Option<Duration>>,
        stop: impl Into<Option<Duration>>,
    ) -> Self {
        Self::new(EventView::Seek {
            rate,
            flush,
            start: start.into(),
            stop: stop.into(),
        })
    }

    pub fn custom(type_: EventType, name: impl Into<String>) -> Self {
        Self::new(EventView::Custom {
            type_,
            name: name.into(),
        })
    }

    /// Replaces the seqnum, used to tie an event to the operation that caused it.
    pub fn with_seqnum(mut self, seqnum: Seqnum) -> Self {
        self.seqnum = seqnum;
        self
    }

    pub fn seqnum(&self) -> Seqnum {
        self.seqnum
    }

    pub fn view(&self) -> &EventView {
        &self.view
    }

    pub fn type_(&self) -> EventType {
        match self.view {
            EventView::FlushStart => EventType::FlushStart,
            EventView::FlushStop { .. } => EventType::FlushStop,
            EventView::StreamStart { .. } => EventType::StreamStart,
            EventView::Caps(_) => EventType::Caps,
            EventView::Segment(_) => EventType::Segment,
            EventView::Tag(_) => EventType::Tag,
            EventView::Gap { .. } => EventType::Gap,
            EventView::Eos => EventType::Eos,
            EventView::Seek { .. } => EventType::Seek,
            EventView::Qos { .. } => EventType::Qos,
            EventView::Reconfigure => EventType::Reconfigure,
            EventView::Navigation => EventType::Navigation,
            EventView::Custom { type_, .. } => type_,
        }
    }

    pub fn is_sticky(&self) -> bool {
        self.type_().is_sticky()
    }

    pub fn is_serialized(&self) -> bool {
        self.type_().is_serialized()
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Event")
            .field("seqnum", &self.seqnum)
            .field("view", &self.view)
            .finish()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LatencyQuery {
    pub live: bool,
    pub min: Duration,
    /// `None` means unlimited.
    pub max: Option<Duration>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Query {
    Latency(LatencyQuery),
    Seeking {
        seekable: bool,
    },
    /// Serialized, answered once everything queued before it was handled.
    Drain,
    Custom {
        name: String,
        serialized: bool,
        result: Option<String>,
    },
}

impl Query {
    pub fn new_latency() -> Self {
        Query::Latency(LatencyQuery::default())
    }

    pub fn new_custom(name: impl Into<String>, serialized: bool) -> Self {
        Query::Custom {
            name: name.into(),
            serialized,
            result: None,
        }
    }

    pub fn is_serialized(&self) -> bool {
        match self {
            Query::Drain => true,
            Query::Custom { serialized, .. } => *serialized,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_flags() {
        assert!(Event::segment(Segment::new()).is_sticky());
        assert!(Event::segment(Segment::new()).is_serialized());
        assert!(!Event::flush_start().is_serialized());
        assert!(Event::flush_stop(true).is_serialized());
        assert!(!Event::flush_stop(true).is_sticky());
        assert!(Event::gap(Duration::ZERO, None).is_serialized());
        assert!(!Event::gap(Duration::ZERO, None).is_sticky());
        assert!(!EventType::Seek.is_downstream());
        assert!(Event::custom(EventType::CustomDownstreamSticky, "foo").is_sticky());
    }

    #[test]
    fn seqnum_override() {
        let start = Event::flush_start();
        let stop = Event::flush_stop(true).with_seqnum(start.seqnum());
        assert_eq!(start.seqnum(), stop.seqnum());
        assert_ne!(Event::eos().seqnum(), start.seqnum());
    }

    #[test]
    fn caps_fields() {
        let caps = Caps::new("application/x-rtp").field("clock-rate", 90000);
        assert_eq!(caps.get_u32("clock-rate"), Some(90000));
        assert_eq!(caps.to_string(), "application/x-rtp, clock-rate=90000");
    }
}
