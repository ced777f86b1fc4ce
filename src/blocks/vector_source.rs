//! Source that streams a fixed vector and then finishes

use crate::runtime::block::{Block, IoSignature, Item, WorkIo, WorkStatus};
use crate::runtime::errors::WorkResult;

/// Streams the items of a vector downstream, then reports done
pub struct VectorSource<T: Item> {
    data: Vec<T>,
    position: usize,
}

impl<T: Item> VectorSource<T> {
    pub fn new(data: Vec<T>) -> Self {
        Self { data, position: 0 }
    }
}

impl<T: Item> Block for VectorSource<T> {
    fn name(&self) -> &str {
        "vector_source"
    }

    fn signature(&self) -> IoSignature {
        IoSignature::source::<T>()
    }

    fn work(&mut self, io: &mut WorkIo<'_>) -> WorkResult<WorkStatus> {
        let remaining = self.data.len() - self.position;
        if remaining == 0 {
            return Ok(WorkStatus::Done);
        }
        let out = io.output(0);
        let n = remaining.min(out.capacity());
        out.slice_mut::<T>()[..n].copy_from_slice(&self.data[self.position..self.position + n]);
        out.produce(n);
        self.position += n;
        if self.position == self.data.len() {
            Ok(WorkStatus::Done)
        } else {
            Ok(WorkStatus::Ok)
        }
    }
}
