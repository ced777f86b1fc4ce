//! Sink that discards everything

use crate::runtime::block::{Block, IoSignature, Item, WorkIo, WorkStatus};
use crate::runtime::errors::WorkResult;

/// Consumes and discards all input, keeping only a running count
pub struct NullSink<T: Item> {
    count: u64,
    _marker: std::marker::PhantomData<T>,
}

impl<T: Item> NullSink<T> {
    pub fn new() -> Self {
        Self {
            count: 0,
            _marker: std::marker::PhantomData,
        }
    }

    /// Items discarded so far
    pub fn count(&self) -> u64 {
        self.count
    }
}

impl<T: Item> Default for NullSink<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Item> Block for NullSink<T> {
    fn name(&self) -> &str {
        "null_sink"
    }

    fn signature(&self) -> IoSignature {
        IoSignature::sink::<T>()
    }

    fn work(&mut self, io: &mut WorkIo<'_>) -> WorkResult<WorkStatus> {
        let input = io.input(0);
        let n = input.len();
        input.consume(n);
        self.count += n as u64;
        Ok(WorkStatus::Ok)
    }
}
