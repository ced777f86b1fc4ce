//! Pass-through block

use crate::runtime::block::{Block, IoSignature, Item, WorkIo, WorkStatus};
use crate::runtime::errors::WorkResult;

/// Copies input to output unchanged
pub struct Copy<T: Item> {
    _marker: std::marker::PhantomData<T>,
}

impl<T: Item> Copy<T> {
    pub fn new() -> Self {
        Self {
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T: Item> Default for Copy<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Item> Block for Copy<T> {
    fn name(&self) -> &str {
        "copy"
    }

    fn signature(&self) -> IoSignature {
        IoSignature::through::<T>()
    }

    fn work(&mut self, io: &mut WorkIo<'_>) -> WorkResult<WorkStatus> {
        let n = io.input(0).len().min(io.output(0).capacity());
        let data = io.input(0).slice::<T>()[..n].to_vec();
        io.output(0).slice_mut::<T>()[..n].copy_from_slice(&data);
        io.output(0).produce(n);
        io.input(0).consume(n);
        Ok(WorkStatus::Ok)
    }
}
