//! Frame boundary recognition
//!
//! A boundary scanner is a byte-at-a-time state machine that reports when
//! it has consumed a complete "start of frame" marker. Scanners run in one
//! direction only:
//!
//! - **Forward** scanners consume bytes left-to-right. A hit means the byte
//!   just fed was the *last* byte of the marker.
//! - **Reverse** scanners consume bytes right-to-left. A hit means the byte
//!   just fed was the *first* byte of the marker.
//!
//! Either way the hit carries the marker length, so the caller can derive
//! both the marker start and the first byte after it from the position of
//! the byte it just fed.

use super::h264::{H264KeyframeScanner, NaluType};
use super::jpeg::JpegScanner;

/// Direction a scanner consumes bytes in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanDirection {
    /// Left-to-right, as bytes arrive from a live source
    Forward,
    /// Right-to-left, when searching back from the write head
    Reverse,
}

/// A recognised start-of-frame marker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanHit {
    /// Length of the matched marker in bytes
    pub marker_len: usize,
}

impl ScanHit {
    /// Offset from the byte just fed to the first byte of the marker
    pub fn marker_start_delta(&self, direction: ScanDirection) -> isize {
        match direction {
            ScanDirection::Forward => 1 - self.marker_len as isize,
            ScanDirection::Reverse => 0,
        }
    }

    /// Offset from the byte just fed to the first byte after the marker
    pub fn payload_delta(&self, direction: ScanDirection) -> isize {
        match direction {
            ScanDirection::Forward => 1,
            ScanDirection::Reverse => self.marker_len as isize,
        }
    }
}

/// Byte-at-a-time start-of-frame recogniser
pub trait BoundaryScanner: Send {
    /// Feed the next byte in this scanner's direction
    fn feed(&mut self, byte: u8) -> Option<ScanHit>;

    /// Forget any partially matched marker
    fn reset(&mut self);

    /// Direction this scanner consumes bytes in
    fn direction(&self) -> ScanDirection;
}

impl<S: BoundaryScanner + ?Sized> BoundaryScanner for Box<S> {
    fn feed(&mut self, byte: u8) -> Option<ScanHit> {
        (**self).feed(byte)
    }

    fn reset(&mut self) {
        (**self).reset()
    }

    fn direction(&self) -> ScanDirection {
        (**self).direction()
    }
}

/// Encoded stream format carried by a relay
///
/// The format decides which marker counts as a safe join point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFormat {
    /// H.264 Annex-B byte stream; joins happen at a 4-byte start code
    /// followed by a NAL unit of type `key`
    H264 { key: NaluType },
    /// Concatenated JPEG images; joins happen at an SOI marker
    Mjpeg,
}

impl StreamFormat {
    /// H.264 joining at sequence parameter sets (the usual key-frame lead-in)
    pub fn h264() -> Self {
        StreamFormat::H264 { key: NaluType::Sps }
    }

    /// Scanner for live data flowing out of the writer
    pub fn forward_scanner(&self) -> Box<dyn BoundaryScanner> {
        self.scanner(ScanDirection::Forward)
    }

    /// Scanner for searching backwards from the write head on join
    pub fn reverse_scanner(&self) -> Box<dyn BoundaryScanner> {
        self.scanner(ScanDirection::Reverse)
    }

    fn scanner(&self, direction: ScanDirection) -> Box<dyn BoundaryScanner> {
        match *self {
            StreamFormat::H264 { key } => Box::new(H264KeyframeScanner::new(key, direction)),
            StreamFormat::Mjpeg => Box::new(JpegScanner::new(direction)),
        }
    }
}

impl std::fmt::Display for StreamFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamFormat::H264 { key } => write!(f, "h264(key={:?})", key),
            StreamFormat::Mjpeg => write!(f, "mjpeg"),
        }
    }
}

/// Find the start of the first marker in `data`, scanning forward
pub fn find_first_start(scanner: &mut dyn BoundaryScanner, data: &[u8]) -> Option<usize> {
    debug_assert_eq!(scanner.direction(), ScanDirection::Forward);
    for (i, &b) in data.iter().enumerate() {
        if let Some(hit) = scanner.feed(b) {
            return Some(i + 1 - hit.marker_len);
        }
    }
    None
}

/// Find the start of the last marker in `data`, scanning backward
pub fn find_last_start(scanner: &mut dyn BoundaryScanner, data: &[u8]) -> Option<usize> {
    debug_assert_eq!(scanner.direction(), ScanDirection::Reverse);
    for (i, &b) in data.iter().enumerate().rev() {
        if scanner.feed(b).is_some() {
            return Some(i);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const JPEG: &[u8] = &[0x00, 0xFF, 0xD8, 0x11, 0x22, 0xFF, 0xD9, 0xFF, 0xD8, 0x33];

    #[test]
    fn test_hit_deltas() {
        let hit = ScanHit { marker_len: 5 };
        assert_eq!(hit.marker_start_delta(ScanDirection::Forward), -4);
        assert_eq!(hit.payload_delta(ScanDirection::Forward), 1);
        assert_eq!(hit.marker_start_delta(ScanDirection::Reverse), 0);
        assert_eq!(hit.payload_delta(ScanDirection::Reverse), 5);
    }

    #[test]
    fn test_find_first_and_last_jpeg() {
        let format = StreamFormat::Mjpeg;
        assert_eq!(find_first_start(&mut *format.forward_scanner(), JPEG), Some(1));
        assert_eq!(find_last_start(&mut *format.reverse_scanner(), JPEG), Some(7));
    }

    #[test]
    fn test_find_h264_keyframe() {
        let data = [
            0xAA, 0x00, 0x00, 0x00, 0x01, 0x67, 0x42, 0x00, 0x00, 0x00, 0x01, 0x41, 0x9A,
        ];
        let format = StreamFormat::h264();
        assert_eq!(find_first_start(&mut *format.forward_scanner(), &data), Some(1));
        assert_eq!(find_last_start(&mut *format.reverse_scanner(), &data), Some(1));
    }

    #[test]
    fn test_no_marker() {
        let format = StreamFormat::Mjpeg;
        assert_eq!(find_first_start(&mut *format.forward_scanner(), &[1, 2, 3]), None);
        assert_eq!(find_last_start(&mut *format.reverse_scanner(), &[]), None);
    }

    #[test]
    fn test_format_display() {
        assert_eq!(StreamFormat::Mjpeg.to_string(), "mjpeg");
        assert_eq!(StreamFormat::h264().to_string(), "h264(key=Sps)");
    }
}
