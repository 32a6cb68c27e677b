// SPDX-License-Identifier: MPL-2.0

use std::cmp::Ordering;
use std::fmt;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};

/// Computes the seqnum distance
///
/// This makes sense if both seqnums are in the same cycle.
pub fn seqnum_distance(seqnum1: u16, seqnum2: u16) -> i16 {
    // See http://en.wikipedia.org/wiki/Serial_number_arithmetic

    let seqnum1 = i16::from_ne_bytes(seqnum1.to_ne_bytes());
    let seqnum2 = i16::from_ne_bytes(seqnum2.to_ne_bytes());

    seqnum1.wrapping_sub(seqnum2)
}

/// Orders two RTP seqnums along the shorter circular distance.
pub fn compare_seqnum(seqnum1: u16, seqnum2: u16) -> Ordering {
    seqnum_distance(seqnum1, seqnum2).cmp(&0)
}

/// Extends 32 bit RTP timestamps to 64 bit, following wrap-arounds in both directions.
#[derive(Clone, Copy, Debug, Default)]
pub struct ExtendedTimestamp {
    last: Option<u64>,
}

impl ExtendedTimestamp {
    pub fn next(&mut self, rtptime: u32) -> u64 {
        const WRAP: u64 = 1 << 32;

        let ext = match self.last {
            None => rtptime as u64,
            Some(last) => {
                let candidate = (last & !0xffff_ffff) | rtptime as u64;
                if candidate < last {
                    if last - candidate > i32::MAX as u64 {
                        candidate + WRAP
                    } else {
                        candidate
                    }
                } else if candidate - last > i32::MAX as u64 && candidate >= WRAP {
                    candidate - WRAP
                } else {
                    candidate
                }
            }
        };

        // Only move forward, a late packet must not pull the cycle back
        if self.last.map_or(true, |last| ext > last) {
            self.last = Some(ext);
        }

        ext
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}

static SEQNUM: AtomicU32 = AtomicU32::new(1);

/// Sequence number shared by all events that belong to the same logical operation.
///
/// A flush-start and its flush-stop, or a seek and the flush it triggers, carry the same
/// seqnum, which is how a multi-input element recognises that every input took part in the
/// same round.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Seqnum(NonZeroU32);

impl Seqnum {
    pub fn next() -> Self {
        loop {
            let v = SEQNUM.fetch_add(1, AtomicOrdering::SeqCst);
            if let Some(v) = NonZeroU32::new(v) {
                return Seqnum(v);
            }
        }
    }
}

impl fmt::Display for Seqnum {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
