//! Single-writer, multi-reader buffers
//!
//! - [`RingByteBuffer`]: bytes, read through per-consumer cursors
//! - [`SlottedCyclicBuffer`]: whole items, read through independent readers

pub mod ring;
pub mod slotted;

pub use ring::{RingByteBuffer, RingCursor};
pub use slotted::{SlotItem, SlotReader, SlottedCyclicBuffer};
