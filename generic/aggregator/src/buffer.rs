// SPDX-License-Identifier: MPL-2.0

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct BufferFlags: u32 {
        /// First buffer after a discontinuity in the stream.
        const DISCONT    = 1 << 0;
        /// Buffer carries no data, it only signals that time passed.
        const GAP        = 1 << 1;
        /// Buffer can be dropped without harm.
        const DROPPABLE  = 1 << 2;
        /// Buffer stands in for data that was lost upstream.
        const MISSING_DATA = 1 << 3;
    }
}

/// A chunk of media data with timing information.
///
/// Buffers move by value from producer to queue to consumer. The payload is reference counted
/// so that cloning a buffer for a read-only peek is cheap, and [`Buffer::data_mut`] copies the
/// payload first if anybody else still holds it.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Buffer {
    pts: Option<Duration>,
    dts: Option<Duration>,
    duration: Option<Duration>,
    offset: Option<u64>,
    flags: BufferFlags,
    data: Arc<Vec<u8>>,
}

impl Buffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_slice(data: impl AsRef<[u8]>) -> Self {
        Buffer {
            data: Arc::new(data.as_ref().to_vec()),
            ..Default::default()
        }
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Buffer {
            data: Arc::new(data),
            ..Default::default()
        }
    }

    pub fn pts(&self) -> Option<Duration> {
        self.pts
    }

    pub fn set_pts(&mut self, pts: impl Into<Option<Duration>>) {
        self.pts = pts.into();
    }

    pub fn dts(&self) -> Option<Duration> {
        self.dts
    }

    pub fn set_dts(&mut self, dts: impl Into<Option<Duration>>) {
        self.dts = dts.into();
    }

    /// DTS if set, PTS otherwise.
    pub fn dts_or_pts(&self) -> Option<Duration> {
        self.dts.or(self.pts)
    }

    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }

    pub fn set_duration(&mut self, duration: impl Into<Option<Duration>>) {
        self.duration = duration.into();
    }

    pub fn offset(&self) -> Option<u64> {
        self.offset
    }

    pub fn set_offset(&mut self, offset: impl Into<Option<u64>>) {
        self.offset = offset.into();
    }

    pub fn flags(&self) -> BufferFlags {
        self.flags
    }

    pub fn set_flags(&mut self, flags: BufferFlags) {
        self.flags.insert(flags);
    }

    pub fn unset_flags(&mut self, flags: BufferFlags) {
        self.flags.remove(flags);
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Whether this buffer is the only owner of its payload.
    pub fn is_writable(&self) -> bool {
        Arc::strong_count(&self.data) == 1
    }

    /// Mutable access to the payload, copying it first if it is shared.
    pub fn data_mut(&mut self) -> &mut Vec<u8> {
        Arc::make_mut(&mut self.data)
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("pts", &self.pts)
            .field("dts", &self.dts)
            .field("duration", &self.duration)
            .field("offset", &self.offset)
            .field("flags", &self.flags)
            .field("size", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_on_write() {
        let mut buffer = Buffer::from_slice([1, 2, 3]);
        assert!(buffer.is_writable());

        let peeked = buffer.clone();
        assert!(!buffer.is_writable());

        buffer.data_mut().push(4);
        assert!(buffer.is_writable());
        assert_eq!(buffer.data(), &[1, 2, 3, 4]);
        assert_eq!(peeked.data(), &[1, 2, 3]);
    }

    #[test]
    fn flags_and_timestamps() {
        let mut buffer = Buffer::new();
        buffer.set_pts(Duration::from_millis(10));
        assert_eq!(buffer.dts_or_pts(), Some(Duration::from_millis(10)));
        buffer.set_dts(Duration::from_millis(5));
        assert_eq!(buffer.dts_or_pts(), Some(Duration::from_millis(5)));

        buffer.set_flags(BufferFlags::GAP | BufferFlags::DROPPABLE);
        buffer.unset_flags(BufferFlags::DROPPABLE);
        assert_eq!(buffer.flags(), BufferFlags::GAP);
    }
}
