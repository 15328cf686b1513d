//! Raw and encoded frame types
//!
//! A [`RawFrame`] owns its pixel memory as [`Bytes`]; planes are borrowed
//! out of it as slices, with every plane and row lookup bounds-checked.

use std::time::Duration;

use bytes::Bytes;

/// Location of one image plane inside a frame's pixel memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneLayout {
    /// Byte offset of the first row
    pub offset: usize,
    /// Bytes between the starts of consecutive rows
    pub stride: usize,
    pub rows: usize,
}

impl PlaneLayout {
    pub fn len(&self) -> usize {
        self.stride * self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Frame geometry and capture metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub width: u32,
    pub height: u32,
    /// Capture time relative to the source's epoch
    pub timestamp: Duration,
    pub planes: Vec<PlaneLayout>,
}

impl FrameHeader {
    /// Single interleaved plane, `bytes_per_pixel` wide, rows tightly packed
    pub fn packed(width: u32, height: u32, bytes_per_pixel: usize) -> Self {
        Self {
            width,
            height,
            timestamp: Duration::ZERO,
            planes: vec![PlaneLayout {
                offset: 0,
                stride: width as usize * bytes_per_pixel,
                rows: height as usize,
            }],
        }
    }

    pub fn with_timestamp(mut self, timestamp: Duration) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Bytes needed to hold every plane
    pub fn required_len(&self) -> usize {
        self.planes
            .iter()
            .map(|p| p.offset + p.len())
            .max()
            .unwrap_or(0)
    }
}

/// Uncompressed frame captured from a source
#[derive(Debug, Clone)]
pub struct RawFrame {
    header: FrameHeader,
    data: Bytes,
}

impl RawFrame {
    /// Wrap captured pixel memory
    ///
    /// Returns `None` if `data` is too short for the planes in `header`.
    pub fn new(header: FrameHeader, data: impl Into<Bytes>) -> Option<Self> {
        let data = data.into();
        if data.len() < header.required_len() {
            return None;
        }
        Some(Self { header, data })
    }

    pub fn header(&self) -> &FrameHeader {
        &self.header
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn plane_count(&self) -> usize {
        self.header.planes.len()
    }

    /// Pixel bytes of plane `index`
    pub fn plane(&self, index: usize) -> Option<&[u8]> {
        let layout = self.header.planes.get(index)?;
        self.data.get(layout.offset..layout.offset + layout.len())
    }

    /// Row `y` of plane `index`
    pub fn row(&self, index: usize, y: usize) -> Option<&[u8]> {
        let layout = self.header.planes.get(index)?;
        if y >= layout.rows {
            return None;
        }
        let start = layout.offset + y * layout.stride;
        self.data.get(start..start + layout.stride)
    }
}

/// Output of one encode, tagged with its pipeline sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    pub seq: u64,
    pub timestamp: Duration,
    pub data: Bytes,
}

impl EncodedFrame {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
