//! Reusable leaf blocks
//!
//! Small generic building blocks for wiring up flowgraphs: vector-backed
//! sources and sinks for tests, pass-through and arithmetic processors,
//! a decimator and a head limiter. All are generic over the [`Item`] type
//! flowing through them.
//!
//! [`Item`]: crate::runtime::block::Item

mod copy;
mod head;
mod keep_one_in_n;
mod multiply_const;
mod null_sink;
mod vector_sink;
mod vector_source;

pub use copy::Copy;
pub use head::Head;
pub use keep_one_in_n::KeepOneInN;
pub use multiply_const::MultiplyConst;
pub use null_sink::NullSink;
pub use vector_sink::VectorSink;
pub use vector_source::VectorSource;
