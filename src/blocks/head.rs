//! Pass through the first `n` items, then finish

use crate::runtime::block::{Block, IoSignature, Item, WorkIo, WorkStatus};
use crate::runtime::errors::WorkResult;

/// Forwards the first `n` items and then reports done
///
/// The usual way to bound an otherwise infinite source.
pub struct Head<T: Item> {
    remaining: u64,
    _marker: std::marker::PhantomData<T>,
}

impl<T: Item> Head<T> {
    pub fn new(n: u64) -> Self {
        Self {
            remaining: n,
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T: Item> Block for Head<T> {
    fn name(&self) -> &str {
        "head"
    }

    fn signature(&self) -> IoSignature {
        IoSignature::through::<T>()
    }

    fn work(&mut self, io: &mut WorkIo<'_>) -> WorkResult<WorkStatus> {
        let n = (io.input(0).len() as u64)
            .min(io.output(0).capacity() as u64)
            .min(self.remaining) as usize;
        let data = io.input(0).slice::<T>()[..n].to_vec();
        io.output(0).slice_mut::<T>()[..n].copy_from_slice(&data);
        io.output(0).produce(n);
        io.input(0).consume(n);
        self.remaining -= n as u64;
        if self.remaining == 0 {
            Ok(WorkStatus::Done)
        } else {
            Ok(WorkStatus::Ok)
        }
    }
}
