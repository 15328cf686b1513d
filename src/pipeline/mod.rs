//! Ordered parallel processing
//!
//! Items from a [`WorkSource`] are numbered, transformed concurrently on a
//! bounded pool of reusable worker states, and handed to a [`MergeSink`]
//! in strictly increasing sequence order. Items that arrive while every
//! worker is busy are dropped.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::mpsc;
//!
//! use framecast::pipeline::{ChannelSource, OrderedPipeline, PipelineConfig, Work};
//! use tokio_util::sync::CancellationToken;
//!
//! # fn main() -> Result<(), framecast::error::PipelineError> {
//! let rt = tokio::runtime::Runtime::new()?;
//! let _guard = rt.enter();
//!
//! let (tx, rx) = mpsc::channel::<Vec<u8>>();
//! let pipeline: OrderedPipeline<Vec<u8>, Vec<u8>, Vec<u8>> =
//!     OrderedPipeline::new(PipelineConfig::new("encode").max_parallel_items(4));
//! let running = pipeline.start(
//!     ChannelSource::new(rx),
//!     |work: Work<Vec<u8>>, scratch: &mut Vec<u8>| {
//!         scratch.clear();
//!         scratch.extend(work.item.iter().rev());
//!         Some(scratch.clone())
//!     },
//!     |encoded: Vec<u8>, _: &CancellationToken| println!("{} bytes", encoded.len()),
//!     |_| Vec::with_capacity(4096),
//! )?;
//!
//! tx.send(vec![1, 2, 3]).ok();
//! let stats = running.stop();
//! println!("delivered {}", stats.delivered);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod pool;

pub use config::PipelineConfig;
pub use engine::{
    ChannelSource, MergeSink, OrderedPipeline, Outcome, RunningPipeline, Transform, Work,
    WorkSource,
};
pub use error::PipelineError;
pub use metrics::{PipelineMetrics, PipelineStats};
pub use pool::{WorkerLease, WorkerPool};
