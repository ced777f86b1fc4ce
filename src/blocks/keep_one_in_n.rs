//! Decimator that keeps the first item of every group of `n`

use crate::runtime::block::{Block, IoSignature, Item, RatePolicy, WorkIo, WorkStatus};
use crate::runtime::errors::WorkResult;

/// Keeps one item out of every `n`, starting with the first
///
/// Declares a fixed n:1 rate, so the executor sizes input windows in
/// multiples of `n` and derives consumption from what gets produced.
pub struct KeepOneInN<T: Item> {
    n: usize,
    _marker: std::marker::PhantomData<T>,
}

impl<T: Item> KeepOneInN<T> {
    pub fn new(n: usize) -> Self {
        assert!(n > 0, "decimation factor must be non-zero");
        Self {
            n,
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T: Item> Block for KeepOneInN<T> {
    fn name(&self) -> &str {
        "keep_one_in_n"
    }

    fn signature(&self) -> IoSignature {
        IoSignature::through::<T>()
    }

    fn rate(&self) -> RatePolicy {
        RatePolicy::decimate(self.n)
    }

    fn work(&mut self, io: &mut WorkIo<'_>) -> WorkResult<WorkStatus> {
        let m = (io.input(0).len() / self.n).min(io.output(0).capacity());
        let kept: Vec<T> = {
            let input = io.input(0).slice::<T>();
            (0..m).map(|i| input[i * self.n]).collect()
        };
        io.output(0).slice_mut::<T>()[..m].copy_from_slice(&kept);
        io.output(0).produce(m);
        Ok(WorkStatus::Ok)
    }
}
