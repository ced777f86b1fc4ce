//! Runtime support for streaming flowgraphs

pub mod block;
pub mod buffer;
pub mod errors;
pub mod executor;
pub mod graph;
pub mod reader;
pub mod scheduler;
pub mod tags;
pub mod watchdog;

pub use block::{
    Block, IoSignature, Item, RatePolicy, StreamInput, StreamOutput, WorkIo, WorkStatus,
};
pub use buffer::Buffer;
pub use errors::{GraphError, RunError, WorkError, WorkResult};
pub use executor::{BlockExecutor, BlockState, ParamMsg};
pub use graph::{BlockId, Connection, Flowgraph};
pub use reader::BufferReader;
pub use scheduler::Scheduler;
pub use tags::{Tag, TagPropagation, TagValue};
pub use watchdog::Watchdog;
