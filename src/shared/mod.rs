//! Frame capture to encoded fan-out
//!
//! This module provides:
//! - Owned raw frames with bounds-checked plane access
//! - The [`FrameSource`] and [`FrameEncoder`] collaborator traits
//! - [`SharedBufferMultiplexer`], which encodes frames in parallel and
//!   serves the ordered output to byte tailers and frame readers

pub mod config;
pub mod frame;
pub mod multiplexer;

pub use config::SharedBufferConfig;
pub use frame::{EncodedFrame, FrameHeader, PlaneLayout, RawFrame};
pub use multiplexer::{FrameEncoder, FrameSource, SharedBufferMultiplexer, SharedBufferStats};
