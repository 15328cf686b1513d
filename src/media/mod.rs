//! Media format knowledge
//!
//! This module provides:
//! - Start-of-frame boundary scanners (forward and reverse)
//! - H.264 Annex-B key-frame recognition
//! - JPEG SOI/EOI recognition and single-frame validation

pub mod boundary;
pub mod h264;
pub mod jpeg;

pub use boundary::{BoundaryScanner, ScanDirection, ScanHit, StreamFormat};
pub use h264::{H264KeyframeScanner, NaluType};
pub use jpeg::{JpegMarker, JpegScanner};
