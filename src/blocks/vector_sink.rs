//! Sink that captures everything it receives into a shared vector

use std::sync::{Arc, Mutex};

use crate::runtime::block::{Block, IoSignature, Item, WorkIo, WorkStatus};
use crate::runtime::errors::WorkResult;

/// Collects all received items into a vector observable from outside the
/// graph
///
/// The capture vector is shared; grab a handle with [`data`](Self::data)
/// before moving the block into a flowgraph.
pub struct VectorSink<T: Item> {
    data: Arc<Mutex<Vec<T>>>,
}

impl<T: Item> VectorSink<T> {
    pub fn new() -> Self {
        Self {
            data: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Handle to the capture vector
    pub fn data(&self) -> Arc<Mutex<Vec<T>>> {
        Arc::clone(&self.data)
    }
}

impl<T: Item> Default for VectorSink<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Item> Block for VectorSink<T> {
    fn name(&self) -> &str {
        "vector_sink"
    }

    fn signature(&self) -> IoSignature {
        IoSignature::sink::<T>()
    }

    fn work(&mut self, io: &mut WorkIo<'_>) -> WorkResult<WorkStatus> {
        let input = io.input(0);
        let n = input.len();
        self.data.lock().unwrap().extend_from_slice(input.slice::<T>());
        input.consume(n);
        Ok(WorkStatus::Ok)
    }
}
