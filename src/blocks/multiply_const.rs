//! Multiply every item by a runtime-adjustable constant

use std::ops::Mul;

use crate::runtime::block::{Block, IoSignature, Item, WorkIo, WorkStatus};
use crate::runtime::errors::WorkResult;
use crate::runtime::tags::TagValue;

/// Item types whose multiplier can be set from a parameter message
pub trait FromTagValue: Sized {
    fn from_tag_value(value: &TagValue) -> Option<Self>;
}

impl FromTagValue for f32 {
    fn from_tag_value(value: &TagValue) -> Option<Self> {
        match *value {
            TagValue::F64(v) => Some(v as f32),
            TagValue::U64(v) => Some(v as f32),
            _ => None,
        }
    }
}

impl FromTagValue for f64 {
    fn from_tag_value(value: &TagValue) -> Option<Self> {
        match *value {
            TagValue::F64(v) => Some(v),
            TagValue::U64(v) => Some(v as f64),
            _ => None,
        }
    }
}

impl FromTagValue for i32 {
    fn from_tag_value(value: &TagValue) -> Option<Self> {
        match *value {
            TagValue::U64(v) => i32::try_from(v).ok(),
            TagValue::F64(v) => Some(v as i32),
            _ => None,
        }
    }
}

/// Multiplies each item by a constant `k`
///
/// `k` can be changed while the graph runs by sending a parameter message
/// with key `"k"`; the new value applies from the next batch on.
pub struct MultiplyConst<T> {
    k: T,
}

impl<T: Item + Mul<Output = T> + FromTagValue> MultiplyConst<T> {
    pub fn new(k: T) -> Self {
        Self { k }
    }
}

impl<T: Item + Mul<Output = T> + FromTagValue> Block for MultiplyConst<T> {
    fn name(&self) -> &str {
        "multiply_const"
    }

    fn signature(&self) -> IoSignature {
        IoSignature::through::<T>()
    }

    fn set_param(&mut self, key: &str, value: TagValue) {
        if key == "k"
            && let Some(k) = T::from_tag_value(&value)
        {
            self.k = k;
        }
    }

    fn work(&mut self, io: &mut WorkIo<'_>) -> WorkResult<WorkStatus> {
        let n = io.input(0).len().min(io.output(0).capacity());
        let scaled: Vec<T> = io.input(0).slice::<T>()[..n]
            .iter()
            .map(|&v| v * self.k)
            .collect();
        io.output(0).slice_mut::<T>()[..n].copy_from_slice(&scaled);
        io.output(0).produce(n);
        io.input(0).consume(n);
        Ok(WorkStatus::Ok)
    }
}
