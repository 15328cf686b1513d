//! H.264 Annex-B key-frame recognition
//!
//! Encoders writing a raw H.264 elementary stream separate NAL units with
//! start codes. A late-joining consumer can only begin decoding where a key
//! frame's lead-in NAL unit starts:
//!
//! ```text
//! ... | 00 00 00 01 | NAL header (type = key) | payload ... | 00 00 00 01 | ...
//!       start code    forbidden(1) ref_idc(2) type(5)
//! ```
//!
//! The marker is the 4-byte start code plus the NAL header byte, five bytes
//! in total.

use super::boundary::{BoundaryScanner, ScanDirection, ScanHit};

/// Length of a 4-byte start code plus the NAL header
pub const KEYFRAME_MARKER_LEN: usize = 5;

/// NAL unit type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NaluType {
    /// Non-IDR slice
    Slice = 1,
    /// Slice data partition A
    SlicePartA = 2,
    /// Slice data partition B
    SlicePartB = 3,
    /// Slice data partition C
    SlicePartC = 4,
    /// IDR slice (keyframe)
    Idr = 5,
    /// Supplemental enhancement information
    Sei = 6,
    /// Sequence parameter set
    Sps = 7,
    /// Picture parameter set
    Pps = 8,
    /// Access unit delimiter
    Aud = 9,
    /// End of sequence
    EndSeq = 10,
    /// End of stream
    EndStream = 11,
    /// Filler data
    Filler = 12,
}

impl NaluType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b & 0x1F {
            1 => Some(NaluType::Slice),
            2 => Some(NaluType::SlicePartA),
            3 => Some(NaluType::SlicePartB),
            4 => Some(NaluType::SlicePartC),
            5 => Some(NaluType::Idr),
            6 => Some(NaluType::Sei),
            7 => Some(NaluType::Sps),
            8 => Some(NaluType::Pps),
            9 => Some(NaluType::Aud),
            10 => Some(NaluType::EndSeq),
            11 => Some(NaluType::EndStream),
            12 => Some(NaluType::Filler),
            _ => None,
        }
    }

    pub fn is_keyframe(&self) -> bool {
        matches!(self, NaluType::Idr)
    }

    pub fn is_parameter_set(&self) -> bool {
        matches!(self, NaluType::Sps | NaluType::Pps)
    }

    /// Whether `header` is a valid NAL header of this type
    ///
    /// The forbidden zero bit must be clear.
    fn matches_header(&self, header: u8) -> bool {
        header & 0x80 == 0 && NaluType::from_byte(header) == Some(*self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    /// Forward: number of consecutive zeros seen (saturates at 3).
    /// Reverse: number of zeros seen after the `01` (1..=2).
    Zeros(u8),
    /// Forward: saw `00 00 00 01`. Reverse: saw `01 <header>`.
    One,
    /// Reverse only: saw the key NAL header
    Header,
}

/// State machine recognising `00 00 00 01 <key NAL header>`
#[derive(Debug, Clone)]
pub struct H264KeyframeScanner {
    key: NaluType,
    direction: ScanDirection,
    phase: Phase,
}

impl H264KeyframeScanner {
    /// Create a scanner for key NAL units of type `key`
    pub fn new(key: NaluType, direction: ScanDirection) -> Self {
        Self {
            key,
            direction,
            phase: Phase::Idle,
        }
    }

    /// The NAL type treated as a key frame lead-in
    pub fn key(&self) -> NaluType {
        self.key
    }

    fn feed_forward(&mut self, byte: u8) -> Option<ScanHit> {
        let (next, hit) = match (self.phase, byte) {
            (Phase::Zeros(n), 0x00) => (Phase::Zeros((n + 1).min(3)), false),
            (Phase::Zeros(3), 0x01) => (Phase::One, false),
            (Phase::One, b) if self.key.matches_header(b) => (Phase::Idle, true),
            (_, 0x00) => (Phase::Zeros(1), false),
            _ => (Phase::Idle, false),
        };
        self.phase = next;
        hit.then_some(ScanHit {
            marker_len: KEYFRAME_MARKER_LEN,
        })
    }

    fn feed_reverse(&mut self, byte: u8) -> Option<ScanHit> {
        let (next, hit) = match (self.phase, byte) {
            (Phase::Header, 0x01) => (Phase::One, false),
            (Phase::One, 0x00) => (Phase::Zeros(1), false),
            (Phase::Zeros(n), 0x00) if n < 2 => (Phase::Zeros(n + 1), false),
            (Phase::Zeros(_), 0x00) => (Phase::Idle, true),
            (_, b) if self.key.matches_header(b) => (Phase::Header, false),
            _ => (Phase::Idle, false),
        };
        self.phase = next;
        hit.then_some(ScanHit {
            marker_len: KEYFRAME_MARKER_LEN,
        })
    }
}

impl BoundaryScanner for H264KeyframeScanner {
    fn feed(&mut self, byte: u8) -> Option<ScanHit> {
        match self.direction {
            ScanDirection::Forward => self.feed_forward(byte),
            ScanDirection::Reverse => self.feed_reverse(byte),
        }
    }

    fn reset(&mut self) {
        self.phase = Phase::Idle;
    }

    fn direction(&self) -> ScanDirection {
        self.direction
    }
}
