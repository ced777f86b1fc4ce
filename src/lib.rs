//! Streaming dataflow runtime for signal-processing graphs
//!
//! This library provides a lock-light, buffer-based runtime for running
//! graphs of stream-processing blocks across threads.
//!
//! # Architecture
//!
//! - **Buffer**: Double-mapped circular buffer, single producer with
//!   multiple independent readers, written and read in typed item units
//! - **Block**: The processing contract; declares ports, a rate policy
//!   and history, and implements `work()` over offered windows
//! - **BlockExecutor**: Drives one block through a ready/blocked/done
//!   state machine, computing window sizes from the declared rates
//! - **Flowgraph**: Builder that validates the wiring and finalizes into
//!   buffers, readers and executors
//! - **Scheduler**: Runs user-declared block partitions on their own
//!   threads with cooperative polling and bounded backoff
//!
//! # Example
//!
//! ```no_run
//! use sigflow::{Flowgraph, blocks::{VectorSource, NullSink}};
//!
//! let mut fg = Flowgraph::new();
//! let src = fg.add_block("source", VectorSource::new(vec![1.0f32; 1024]))?;
//! let sink = fg.add_block("sink", NullSink::<f32>::new())?;
//! fg.connect(src, 0, sink, 0)?;
//! fg.build()?.run()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod blocks;
pub mod runtime;

// Re-export the block-author surface
pub use runtime::{
    Block, IoSignature, Item, RatePolicy, StreamInput, StreamOutput, WorkIo, WorkStatus,
};

// Re-export the graph-construction and run surface
pub use runtime::{
    BlockId, Flowgraph, GraphError, RunError, Scheduler, Tag, TagPropagation, TagValue, WorkError,
    WorkResult,
};
