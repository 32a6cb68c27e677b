// SPDX-License-Identifier: MPL-2.0

use std::time::Duration;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Format {
    Undefined,
    #[default]
    Time,
}

/// Mapping from stream positions to running time.
#[derive(Clone, Debug, PartialEq)]
pub struct Segment {
    format: Format,
    rate: f64,
    base: Duration,
    start: Duration,
    stop: Option<Duration>,
    time: Duration,
    position: Option<Duration>,
}

impl Default for Segment {
    fn default() -> Self {
        Segment {
            format: Format::Time,
            rate: 1.0,
            base: Duration::ZERO,
            start: Duration::ZERO,
            stop: None,
            time: Duration::ZERO,
            position: None,
        }
    }
}

fn scale(d: Duration, rate: f64) -> Duration {
    let rate = rate.abs();
    if rate == 1.0 {
        d
    } else {
        d.div_f64(rate)
    }
}

impl Segment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_format(format: Format) -> Self {
        Segment {
            format,
            ..Default::default()
        }
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn set_rate(&mut self, rate: f64) {
        assert!(rate != 0.0);
        self.rate = rate;
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn set_base(&mut self, base: Duration) {
        self.base = base;
    }

    pub fn start(&self) -> Duration {
        self.start
    }

    pub fn set_start(&mut self, start: Duration) {
        self.start = start;
    }

    pub fn stop(&self) -> Option<Duration> {
        self.stop
    }

    pub fn set_stop(&mut self, stop: impl Into<Option<Duration>>) {
        self.stop = stop.into();
    }

    pub fn time(&self) -> Duration {
        self.time
    }

    pub fn set_time(&mut self, time: Duration) {
        self.time = time;
    }

    pub fn position(&self) -> Option<Duration> {
        self.position
    }

    pub fn set_position(&mut self, position: impl Into<Option<Duration>>) {
        self.position = position.into();
    }

    /// Converts a position into running time, `None` if it is outside the segment.
    pub fn to_running_time(&self, position: impl Into<Option<Duration>>) -> Option<Duration> {
        let position = position.into()?;
        if self.format != Format::Time {
            return None;
        }

        if self.rate > 0.0 {
            if position < self.start || self.stop.is_some_and(|stop| position > stop) {
                return None;
            }
            Some(scale(position - self.start, self.rate) + self.base)
        } else {
            let stop = self.stop?;
            if position < self.start || position > stop {
                return None;
            }
            Some(scale(stop - position, self.rate) + self.base)
        }
    }

    /// Clips `start`/`stop` to the segment.
    ///
    /// Returns `None` if the range is completely outside of the segment.
    #[allow(clippy::type_complexity)]
    pub fn clip(
        &self,
        start: Option<Duration>,
        stop: Option<Duration>,
    ) -> Option<(Option<Duration>, Option<Duration>)> {
        if let (Some(seg_stop), Some(start)) = (self.stop, start) {
            if start > seg_stop || (self.start != seg_stop && start == seg_stop) {
                return None;
            }
        }

        if let Some(stop) = stop {
            if stop < self.start || (start != Some(stop) && stop == self.start) {
                return None;
            }
        }

        let clip_start = start.map(|start| start.max(self.start));
        let clip_stop = match (stop, self.stop) {
            (None, seg_stop) => seg_stop,
            (Some(stop), None) => Some(stop),
            (Some(stop), Some(seg_stop)) => Some(stop.min(seg_stop)),
        };

        Some((clip_start, clip_stop))
    }

    /// Applies a seek to the segment.
    ///
    /// A flushing seek restarts running time from zero, a non-flushing one continues from the
    /// running time of the current position.
    pub fn do_seek(
        &mut self,
        rate: f64,
        start: Option<Duration>,
        stop: Option<Duration>,
        flush: bool,
    ) {
        assert!(rate != 0.0);

        if flush {
            self.base = Duration::ZERO;
        } else if let Some(running_time) = self.to_running_time(self.position) {
            self.base = running_time;
        }

        self.rate = rate;
        if let Some(start) = start {
            self.start = start;
        }
        self.stop = stop;
        self.time = self.start;
        self.position = if rate > 0.0 {
            Some(self.start)
        } else {
            self.stop
        };
    }
}
