//! JPEG frame markers
//!
//! An MJPEG stream is a plain concatenation of JPEG images. Each image
//! starts with SOI (`FF D8`) and ends with EOI (`FF D9`). Both are two-byte
//! markers, so a scanner only needs to remember the previous byte.

use super::boundary::{BoundaryScanner, ScanDirection, ScanHit};

/// Start of image marker
pub const SOI: [u8; 2] = [0xFF, 0xD8];
/// End of image marker
pub const EOI: [u8; 2] = [0xFF, 0xD9];

/// Marker event produced by [`JpegScanner`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JpegMarker {
    /// SOI completed
    Start,
    /// EOI completed
    End,
}

/// Previous-byte state machine distinguishing SOI and EOI
#[derive(Debug, Clone)]
pub struct JpegScanner {
    direction: ScanDirection,
    prev: Option<u8>,
}

impl JpegScanner {
    pub fn new(direction: ScanDirection) -> Self {
        Self {
            direction,
            prev: None,
        }
    }

    pub fn forward() -> Self {
        Self::new(ScanDirection::Forward)
    }

    pub fn reverse() -> Self {
        Self::new(ScanDirection::Reverse)
    }

    /// Feed one byte and report any marker it completes
    pub fn feed_marker(&mut self, byte: u8) -> Option<JpegMarker> {
        // In reverse the marker's second byte arrives first
        let (first, second) = match self.direction {
            ScanDirection::Forward => (self.prev, Some(byte)),
            ScanDirection::Reverse => (Some(byte), self.prev),
        };
        self.prev = Some(byte);

        match (first, second) {
            (Some(0xFF), Some(0xD8)) => {
                self.prev = None;
                Some(JpegMarker::Start)
            }
            (Some(0xFF), Some(0xD9)) => {
                self.prev = None;
                Some(JpegMarker::End)
            }
            _ => None,
        }
    }
}

impl BoundaryScanner for JpegScanner {
    fn feed(&mut self, byte: u8) -> Option<ScanHit> {
        match self.feed_marker(byte) {
            Some(JpegMarker::Start) => Some(ScanHit { marker_len: 2 }),
            _ => None,
        }
    }

    fn reset(&mut self) {
        self.prev = None;
    }

    fn direction(&self) -> ScanDirection {
        self.direction
    }
}

/// Check that `data` is exactly one JPEG image: SOI first, EOI last and
/// no other SOI/EOI marker in between
pub fn is_single_frame(data: &[u8]) -> bool {
    if data.len() < 4 || !data.starts_with(&SOI) || !data.ends_with(&EOI) {
        return false;
    }

    let mut scanner = JpegScanner::forward();
    let mut starts = 0;
    for (i, &b) in data.iter().enumerate() {
        match scanner.feed_marker(b) {
            Some(JpegMarker::Start) => starts += 1,
            Some(JpegMarker::End) => return i == data.len() - 1 && starts == 1,
            None => {}
        }
    }
    false
}
