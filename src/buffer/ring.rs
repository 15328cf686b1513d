//! Single-writer, multi-reader ring of bytes
//!
//! The writer appends at `write_offset`; every reader owns a [`RingCursor`]
//! and copies out whatever has been appended since its last read.
//!
//! # Positions
//!
//! ```text
//!   storage (capacity bytes, reused every lap)
//!   ┌─────────────────────────────┬──────┐
//!   │ lap N+1 data ...  │ lap N data  │ pad  │
//!   └───────────────────┴─────────┴──────┘
//!                       ^ write_offset
//! ```
//!
//! Data is never split across the physical end of storage. When the next
//! write does not fit before the end, the remaining tail is skipped as
//! padding and the write lands at offset 0. Two monotonic counters describe
//! the stream:
//!
//! - `total_written`: payload bytes ever written
//! - `position`: payload plus padding, so `write_offset == position % capacity`
//!
//! After the first padding skip `total_written % capacity` no longer equals
//! `write_offset`. Cursors therefore track `position` and consult the
//! padding log instead of deriving offsets from `total_written`.
//!
//! # Overrun
//!
//! A cursor more than `capacity` bytes of `position` behind the writer has
//! lost data. Reads then fail with [`RelayError::BufferOverrun`]; nothing is
//! skipped silently.

use std::collections::VecDeque;

use bytes::Bytes;
use parking_lot::RwLock;

use crate::media::BoundaryScanner;
use crate::relay::error::RelayError;

/// Region of the stream with a boundary readers must respect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    /// Unused tail of a lap, never forwarded
    Pad { at: u64, len: usize },
    /// First byte of a discrete frame
    Frame { at: u64 },
}

impl Mark {
    fn at(&self) -> u64 {
        match *self {
            Mark::Pad { at, .. } | Mark::Frame { at } => at,
        }
    }

    fn end(&self) -> u64 {
        match *self {
            Mark::Pad { at, len } => at + len as u64,
            Mark::Frame { at } => at,
        }
    }
}

struct RingState {
    storage: Box<[u8]>,
    position: u64,
    total_written: u64,
    padding: u64,
    /// Marks inside the live window, ordered by position
    marks: VecDeque<Mark>,
}

impl RingState {
    /// Reserve `len` contiguous bytes, padding to the end of the lap if needed
    fn reserve(&mut self, len: usize) -> usize {
        let capacity = self.storage.len();
        let offset = (self.position % capacity as u64) as usize;

        if offset + len <= capacity {
            return offset;
        }

        let pad = capacity - offset;
        self.marks.push_back(Mark::Pad {
            at: self.position,
            len: pad,
        });
        self.position += pad as u64;
        self.padding += pad as u64;
        0
    }

    fn commit(&mut self, offset: usize, data: &[u8]) {
        self.storage[offset..offset + data.len()].copy_from_slice(data);
        self.position += data.len() as u64;
        self.total_written += data.len() as u64;
        self.prune();
    }

    /// Drop marks that fell out of the live window
    fn prune(&mut self) {
        let window_start = self.window_start();
        while let Some(mark) = self.marks.front() {
            let expired = match *mark {
                Mark::Pad { .. } => mark.end() < window_start,
                Mark::Frame { at } => at < window_start,
            };
            if !expired {
                break;
            }
            self.marks.pop_front();
        }
    }

    fn window_start(&self) -> u64 {
        self.position.saturating_sub(self.storage.len() as u64)
    }

    /// Padding bytes within `[from, to)`
    fn padding_between(&self, from: u64, to: u64) -> u64 {
        self.marks
            .iter()
            .filter_map(|m| match *m {
                Mark::Pad { at, len } => {
                    let start = at.max(from);
                    let end = (at + len as u64).min(to);
                    (end > start).then(|| end - start)
                }
                Mark::Frame { .. } => None,
            })
            .sum()
    }

    fn pad_containing(&self, pos: u64) -> Option<(u64, usize)> {
        self.marks.iter().rev().find_map(|m| match *m {
            Mark::Pad { at, len } if at <= pos && pos < at + len as u64 => Some((at, len)),
            _ => None,
        })
    }
}

/// Per-reader position in a [`RingByteBuffer`]
#[derive(Debug, Clone)]
pub struct RingCursor {
    /// Stream position (payload + padding) of the next byte to forward
    position: u64,
    /// Physical offset of the next byte to forward
    read_offset: usize,
    /// Writer's `total_written` at this cursor's starting point
    started_total: u64,
    /// Payload bytes handed out through this cursor
    written: u64,
}

impl RingCursor {
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn read_offset(&self) -> usize {
        self.read_offset
    }

    pub fn started_total(&self) -> u64 {
        self.started_total
    }

    pub fn written(&self) -> u64 {
        self.written
    }
}

/// Fixed-capacity byte ring with one writer and any number of cursors
pub struct RingByteBuffer {
    capacity: usize,
    state: RwLock<RingState>,
}

impl RingByteBuffer {
    /// Create a ring holding `capacity` bytes
    ///
    /// # Panics
    ///
    /// Panics if capacity is 0.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "capacity must be > 0");

        Self {
            capacity,
            state: RwLock::new(RingState {
                storage: vec![0u8; capacity].into_boxed_slice(),
                position: 0,
                total_written: 0,
                padding: 0,
                marks: VecDeque::new(),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Payload bytes ever written
    pub fn total_written(&self) -> u64 {
        self.state.read().total_written
    }

    /// Payload plus padding bytes ever consumed
    pub fn position(&self) -> u64 {
        self.state.read().position
    }

    /// Padding bytes ever skipped
    pub fn padding(&self) -> u64 {
        self.state.read().padding
    }

    /// Physical offset the next write lands at (before any padding skip)
    pub fn write_offset(&self) -> usize {
        (self.state.read().position % self.capacity as u64) as usize
    }

    /// Append a chunk of a continuous byte stream
    ///
    /// Chunks longer than the capacity are split into capacity-sized pieces.
    /// Each piece is stored contiguously.
    pub fn write(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }

        let mut state = self.state.write();
        for piece in data.chunks(self.capacity) {
            let offset = state.reserve(piece.len());
            state.commit(offset, piece);
        }
    }

    /// Append one discrete frame
    ///
    /// The frame is stored contiguously and its start recorded, so a cursor
    /// never hands out a slice spanning two frames.
    pub fn write_frame(&self, frame: &[u8]) -> Result<(), RelayError> {
        if frame.len() > self.capacity {
            return Err(RelayError::FrameTooLarge {
                len: frame.len(),
                capacity: self.capacity,
            });
        }
        if frame.is_empty() {
            return Ok(());
        }

        let mut state = self.state.write();
        let offset = state.reserve(frame.len());
        let at = state.position;
        state.marks.push_back(Mark::Frame { at });
        state.commit(offset, frame);
        Ok(())
    }

    /// Cursor positioned at the current write head
    pub fn cursor_at_head(&self) -> RingCursor {
        let state = self.state.read();
        RingCursor {
            position: state.position,
            read_offset: (state.position % self.capacity as u64) as usize,
            started_total: state.total_written,
            written: 0,
        }
    }

    /// Resolve a starting cursor for a late joiner
    ///
    /// Scans backward from the write head over the live window with a
    /// reverse `scanner` and positions the cursor at the first byte of the
    /// most recent marker. Padding is skipped so a marker split across a
    /// wrap is still found. An empty ring resolves to the stream start.
    pub fn find_join_point(
        &self,
        scanner: &mut dyn BoundaryScanner,
    ) -> Result<RingCursor, RelayError> {
        let state = self.state.read();

        if state.total_written == 0 {
            return Ok(RingCursor {
                position: state.position,
                read_offset: (state.position % self.capacity as u64) as usize,
                started_total: 0,
                written: 0,
            });
        }

        scanner.reset();
        let window_start = state.window_start();
        let mut pos = state.position;

        while pos > window_start {
            pos -= 1;
            if let Some((at, _)) = state.pad_containing(pos) {
                pos = at;
                continue;
            }

            let byte = state.storage[(pos % self.capacity as u64) as usize];
            if scanner.feed(byte).is_some() {
                let pending = (state.position - pos) - state.padding_between(pos, state.position);
                return Ok(RingCursor {
                    position: pos,
                    read_offset: (pos % self.capacity as u64) as usize,
                    started_total: state.total_written - pending,
                    written: 0,
                });
            }
        }

        Err(RelayError::NoValidStartFound)
    }

    /// Payload bytes appended since `cursor` last read
    pub fn pending(&self, cursor: &RingCursor) -> u64 {
        let state = self.state.read();
        state
            .total_written
            .saturating_sub(cursor.started_total + cursor.written)
    }

    /// Copy out the next contiguous slice available to `cursor`
    ///
    /// Returns `Ok(None)` when the cursor is caught up. A slice never spans
    /// the physical end of storage, a padding region or a frame start.
    pub fn read(&self, cursor: &mut RingCursor) -> Result<Option<Bytes>, RelayError> {
        let state = self.state.read();
        let capacity = self.capacity as u64;

        let mut limit = state.position;
        for mark in state.marks.iter() {
            match *mark {
                Mark::Pad { at, len } if at == cursor.position => {
                    cursor.position += len as u64;
                    cursor.read_offset = 0;
                }
                m if m.at() > cursor.position => {
                    limit = m.at();
                    break;
                }
                _ => {}
            }
        }

        let lag = state.position - cursor.position;
        if lag > capacity {
            return Err(RelayError::BufferOverrun {
                lag,
                capacity: self.capacity,
            });
        }

        let available = limit - cursor.position;
        if available == 0 {
            return Ok(None);
        }

        debug_assert_eq!(cursor.read_offset as u64, cursor.position % capacity);
        let len = (available as usize).min(self.capacity - cursor.read_offset);
        let start = cursor.read_offset;
        let slice = Bytes::copy_from_slice(&state.storage[start..start + len]);

        cursor.position += len as u64;
        cursor.read_offset = (start + len) % self.capacity;
        cursor.written += len as u64;

        Ok(Some(slice))
    }
}

impl std::fmt::Debug for RingByteBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("RingByteBuffer")
            .field("capacity", &self.capacity)
            .field("position", &state.position)
            .field("total_written", &state.total_written)
            .field("padding", &state.padding)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::StreamFormat;

    fn drain(ring: &RingByteBuffer, cursor: &mut RingCursor) -> Vec<Bytes> {
        let mut out = Vec::new();
        while let Some(slice) = ring.read(cursor).unwrap() {
            out.push(slice);
        }
        out
    }

    fn concat(slices: &[Bytes]) -> Vec<u8> {
        slices.iter().flat_map(|s| s.iter().copied()).collect()
    }

    #[test]
    fn test_write_and_read_in_order() {
        let ring = RingByteBuffer::new(16);
        let mut cursor = ring.cursor_at_head();

        ring.write(b"hello ");
        ring.write(b"world");

        let out = drain(&ring, &mut cursor);
        assert_eq!(concat(&out), b"hello world");
        assert_eq!(cursor.written(), 11);
        assert_eq!(ring.pending(&cursor), 0);
    }

    #[test]
    fn test_padding_skip_at_wrap() {
        let ring = RingByteBuffer::new(10);
        let mut cursor = ring.cursor_at_head();

        ring.write(b"abcdef");
        assert_eq!(concat(&drain(&ring, &mut cursor)), b"abcdef");

        // 6 + 5 > 10: four bytes of padding, then the write lands at 0
        ring.write(b"ghijk");
        assert_eq!(ring.write_offset(), 5);
        assert_eq!(ring.padding(), 4);
        assert_eq!(ring.total_written(), 11);
        assert_eq!(ring.position(), 15);

        let out = drain(&ring, &mut cursor);
        assert_eq!(concat(&out), b"ghijk");
        assert_eq!(cursor.read_offset(), 5);
    }

    #[test]
    fn test_overrun_detected() {
        let ring = RingByteBuffer::new(8);
        let mut cursor = ring.cursor_at_head();

        for _ in 0..3 {
            ring.write(b"1234");
        }

        let err = ring.read(&mut cursor).unwrap_err();
        assert!(matches!(
            err,
            RelayError::BufferOverrun {
                lag: 12,
                capacity: 8
            }
        ));
    }

    #[test]
    fn test_overrun_counts_padding() {
        // Payload lag stays within capacity but padding pushed the writer
        // over the unread bytes
        let ring = RingByteBuffer::new(10);
        ring.write(b"ab");
        let mut cursor = ring.cursor_at_head();
        ring.write(b"cdef");
        ring.write(b"ghijk");
        assert_eq!(ring.pending(&cursor), 9);
        assert!(matches!(
            ring.read(&mut cursor),
            Err(RelayError::BufferOverrun { lag: 13, .. })
        ));
    }

    #[test]
    fn test_lagging_cursor_skips_padding_before_overrun_check() {
        let ring = RingByteBuffer::new(10);
        ring.write(b"xxxxxx");
        let mut cursor = ring.cursor_at_head();
        ring.write(b"aaaaa");
        ring.write(b"bbbbb");

        // Everything after the padding is still intact
        let out = concat(&drain(&ring, &mut cursor));
        assert_eq!(out, b"aaaaabbbbb");
    }

    #[test]
    fn test_exact_capacity_lag_is_readable() {
        let ring = RingByteBuffer::new(8);
        let mut cursor = ring.cursor_at_head();
        ring.write(b"abcdefgh");
        assert_eq!(concat(&drain(&ring, &mut cursor)), b"abcdefgh");
    }

    #[test]
    fn test_frame_slices_never_span_frames() {
        let ring = RingByteBuffer::new(32);
        let mut cursor = ring.cursor_at_head();

        ring.write_frame(b"frame-1").unwrap();
        ring.write_frame(b"frame-2").unwrap();
        ring.write_frame(b"frame-3").unwrap();

        let out = drain(&ring, &mut cursor);
        assert_eq!(out.len(), 3);
        assert_eq!(&out[0][..], b"frame-1");
        assert_eq!(&out[2][..], b"frame-3");
    }

    #[test]
    fn test_frame_too_large() {
        let ring = RingByteBuffer::new(4);
        assert!(matches!(
            ring.write_frame(b"12345"),
            Err(RelayError::FrameTooLarge {
                len: 5,
                capacity: 4
            })
        ));
    }

    #[test]
    fn test_oversized_stream_chunk_is_split() {
        let ring = RingByteBuffer::new(4);
        ring.write(b"abcdefghij");
        assert_eq!(ring.total_written(), 10);
        assert_eq!(ring.padding(), 0);
    }

    #[test]
    fn test_join_empty_ring_starts_at_stream_start() {
        let ring = RingByteBuffer::new(8);
        let mut scanner = StreamFormat::Mjpeg.reverse_scanner();
        let cursor = ring.find_join_point(&mut *scanner).unwrap();
        assert_eq!(cursor.position(), 0);
        assert_eq!(cursor.started_total(), 0);
    }

    #[test]
    fn test_join_finds_most_recent_marker() {
        let ring = RingByteBuffer::new(64);
        ring.write(&[0xFF, 0xD8, 1, 2, 0xFF, 0xD9]);
        ring.write(&[0xFF, 0xD8, 3, 4, 0xFF, 0xD9]);
        ring.write(&[0x00, 0x00]);

        let mut scanner = StreamFormat::Mjpeg.reverse_scanner();
        let mut cursor = ring.find_join_point(&mut *scanner).unwrap();
        assert_eq!(cursor.position(), 6);
        assert_eq!(cursor.started_total(), 6);
        assert_eq!(ring.pending(&cursor), 8);

        let out = concat(&drain(&ring, &mut cursor));
        assert_eq!(out, vec![0xFF, 0xD8, 3, 4, 0xFF, 0xD9, 0x00, 0x00]);
    }

    #[test]
    fn test_join_without_marker_fails() {
        let ring = RingByteBuffer::new(8);
        ring.write(&[1, 2, 3, 4]);
        let mut scanner = StreamFormat::Mjpeg.reverse_scanner();
        assert!(matches!(
            ring.find_join_point(&mut *scanner),
            Err(RelayError::NoValidStartFound)
        ));
    }

    #[test]
    fn test_join_marker_split_by_padding() {
        let ring = RingByteBuffer::new(8);
        ring.write(&[9, 9, 9, 9, 9, 0xFF]);
        // Does not fit: 2 bytes of padding, then lands at 0
        ring.write(&[0xD8, 7, 7]);

        let mut scanner = StreamFormat::Mjpeg.reverse_scanner();
        let mut cursor = ring.find_join_point(&mut *scanner).unwrap();
        assert_eq!(cursor.position(), 5);
        assert_eq!(cursor.started_total(), 5);

        let out = concat(&drain(&ring, &mut cursor));
        assert_eq!(out, vec![0xFF, 0xD8, 7, 7]);
    }

    #[test]
    fn test_join_ignores_overwritten_bytes() {
        let ring = RingByteBuffer::new(8);
        ring.write(&[0xFF, 0xD8, 1, 1]);
        ring.write(&[2, 2, 2, 2]);
        // Overwrites the marker
        ring.write(&[3, 3, 3, 3]);

        let mut scanner = StreamFormat::Mjpeg.reverse_scanner();
        assert!(ring.find_join_point(&mut *scanner).is_err());
    }
}
