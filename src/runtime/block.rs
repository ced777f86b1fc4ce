//! Block contract: the narrow interface every leaf block satisfies
//!
//! A block declares an io-signature (port counts and item sizes), a rate
//! policy, optional history and output-multiple constraints, and implements
//! `work()`. Rate behavior is declarative: the executor computes input
//! requirements from [`RatePolicy`] instead of blocks overriding forecast
//! logic through subclassing.

use std::marker::PhantomData;

use super::errors::WorkResult;
use super::tags::{Tag, TagPropagation, TagValue};

/// Marker for plain-old-data item types that may flow through buffers
///
/// # Safety
///
/// Implementors must be valid for any initialized byte pattern and contain
/// no padding, so raw buffer bytes can be viewed as `&[T]`.
pub unsafe trait Item: Copy + Send + 'static {}

unsafe impl Item for u8 {}
unsafe impl Item for i8 {}
unsafe impl Item for u16 {}
unsafe impl Item for i16 {}
unsafe impl Item for u32 {}
unsafe impl Item for i32 {}
unsafe impl Item for u64 {}
unsafe impl Item for i64 {}
unsafe impl Item for f32 {}
unsafe impl Item for f64 {}
// Vector items: item size = base size × vector length.
unsafe impl<T: Item, const N: usize> Item for [T; N] {}

/// Io-signature: how many ports a block supports and their item sizes
///
/// Determines how many buffers and readers the graph builder instantiates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoSignature {
    pub min_inputs: usize,
    pub max_inputs: usize,
    pub min_outputs: usize,
    pub max_outputs: usize,
    /// Item size in bytes for all input ports (0 when no inputs)
    pub input_item_size: usize,
    /// Item size in bytes for all output ports (0 when no outputs)
    pub output_item_size: usize,
}

impl IoSignature {
    pub fn new(
        inputs: (usize, usize),
        input_item_size: usize,
        outputs: (usize, usize),
        output_item_size: usize,
    ) -> Self {
        Self {
            min_inputs: inputs.0,
            max_inputs: inputs.1,
            min_outputs: outputs.0,
            max_outputs: outputs.1,
            input_item_size,
            output_item_size,
        }
    }

    /// 0 inputs, 1 output of `T`
    pub fn source<T: Item>() -> Self {
        Self::new((0, 0), 0, (1, 1), size_of::<T>())
    }

    /// 1 input of `T`, 0 outputs
    pub fn sink<T: Item>() -> Self {
        Self::new((1, 1), size_of::<T>(), (0, 0), 0)
    }

    /// 1 input and 1 output, both of `T`
    pub fn through<T: Item>() -> Self {
        Self::new((1, 1), size_of::<T>(), (1, 1), size_of::<T>())
    }
}

/// Declarative rate relationship between a block's inputs and outputs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RatePolicy {
    /// One output item per input item
    #[default]
    Sync,
    /// `input` items consumed for every `output` items produced
    Fixed { input: usize, output: usize },
}

impl RatePolicy {
    /// Decimate by `n`: consume n, produce 1
    pub fn decimate(n: usize) -> Self {
        Self::Fixed { input: n, output: 1 }
    }

    /// Interpolate by `n`: consume 1, produce n
    pub fn interpolate(n: usize) -> Self {
        Self::Fixed { input: 1, output: n }
    }

    /// (input items, output items) per rate granule
    pub(crate) fn ratio(&self) -> (usize, usize) {
        match *self {
            Self::Sync => (1, 1),
            Self::Fixed { input, output } => {
                assert!(input > 0 && output > 0, "rate ratio must be non-zero");
                (input, output)
            }
        }
    }
}

/// Status a block reports from `work()`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkStatus {
    /// Made whatever progress the offered windows allowed
    Ok,
    /// No more output will ever be produced; the only graph-termination
    /// signal a leaf block can emit
    Done,
}

/// Read-only view of one input port's window for a single `work()` call
pub struct StreamInput<'a> {
    data: &'a [u8],
    item_size: usize,
    nitems_read: u64,
    tags: Vec<Tag>,
    finished: bool,
    consumed: usize,
    consumed_explicit: bool,
}

impl<'a> StreamInput<'a> {
    pub(crate) fn new(
        data: &'a [u8],
        item_size: usize,
        nitems_read: u64,
        tags: Vec<Tag>,
        finished: bool,
    ) -> Self {
        debug_assert_eq!(data.len() % item_size, 0);
        Self {
            data,
            item_size,
            nitems_read,
            tags,
            finished,
            consumed: 0,
            consumed_explicit: false,
        }
    }

    /// Items offered in this window
    pub fn len(&self) -> usize {
        self.data.len() / self.item_size
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Typed view of the window
    ///
    /// Panics if `T`'s size does not match the port's item size.
    pub fn slice<T: Item>(&self) -> &[T] {
        assert_eq!(
            size_of::<T>(),
            self.item_size,
            "typed view does not match port item size"
        );
        debug_assert_eq!(self.data.as_ptr().addr() % align_of::<T>(), 0);
        // SAFETY: the window is fully initialized buffer memory, T is
        // plain-old-data, and size/alignment were just checked.
        unsafe { std::slice::from_raw_parts(self.data.as_ptr().cast::<T>(), self.len()) }
    }

    /// Absolute offset of the first item in this window
    pub fn nitems_read(&self) -> u64 {
        self.nitems_read
    }

    /// Tags attached within this window (absolute offsets)
    pub fn tags(&self) -> &[Tag] {
        &self.tags
    }

    /// Whether the upstream block is done; this window holds all remaining
    /// data on this port
    pub fn finished(&self) -> bool {
        self.finished
    }

    /// Report items consumed; overrides the rate-derived default
    pub fn consume(&mut self, num_items: usize) {
        self.consumed += num_items;
        self.consumed_explicit = true;
    }

    pub(crate) fn reported_consumed(&self) -> Option<usize> {
        self.consumed_explicit.then_some(self.consumed)
    }
}

/// Mutable view of one output port's free space for a single `work()` call
pub struct StreamOutput<'a> {
    data: *mut u8,
    capacity: usize,
    item_size: usize,
    nitems_written: u64,
    produced: usize,
    tags: Vec<Tag>,
    _region: PhantomData<&'a mut [u8]>,
}

impl<'a> StreamOutput<'a> {
    pub(crate) fn new(data: *mut u8, capacity: usize, item_size: usize, nitems_written: u64) -> Self {
        Self {
            data,
            capacity,
            item_size,
            nitems_written,
            produced: 0,
            tags: Vec::new(),
            _region: PhantomData,
        }
    }

    /// Items of free space offered in this window
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Absolute offset the first item written here will have
    pub fn nitems_written(&self) -> u64 {
        self.nitems_written
    }

    /// Typed mutable view of the window
    ///
    /// Panics if `T`'s size does not match the port's item size.
    pub fn slice_mut<T: Item>(&mut self) -> &mut [T] {
        assert_eq!(
            size_of::<T>(),
            self.item_size,
            "typed view does not match port item size"
        );
        debug_assert_eq!(self.data.addr() % align_of::<T>(), 0);
        // SAFETY: the executor derived this region from the producing
        // buffer's writable span; it is exclusive to this work call.
        unsafe { std::slice::from_raw_parts_mut(self.data.cast::<T>(), self.capacity) }
    }

    /// Report items produced into this window
    pub fn produce(&mut self, num_items: usize) {
        self.produced += num_items;
    }

    pub(crate) fn produced(&self) -> usize {
        self.produced
    }

    /// Attach a tag at an offset relative to this window's start
    pub fn add_tag(&mut self, offset: usize, key: impl Into<String>, value: TagValue) {
        self.tags
            .push(Tag::new(self.nitems_written + offset as u64, key, value));
    }

    pub(crate) fn take_tags(&mut self) -> Vec<Tag> {
        std::mem::take(&mut self.tags)
    }
}

/// Per-call io bundle handed to `work()`
pub struct WorkIo<'a> {
    pub(crate) inputs: Vec<StreamInput<'a>>,
    pub(crate) outputs: Vec<StreamOutput<'a>>,
}

impl<'a> WorkIo<'a> {
    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    pub fn num_outputs(&self) -> usize {
        self.outputs.len()
    }

    pub fn input(&mut self, idx: usize) -> &mut StreamInput<'a> {
        &mut self.inputs[idx]
    }

    pub fn output(&mut self, idx: usize) -> &mut StreamOutput<'a> {
        &mut self.outputs[idx]
    }
}

/// A unit of stream processing with declared ports and a `work()` entry
/// point
///
/// - Sources have 0 inputs and N outputs
/// - Sinks have N inputs and 0 outputs
/// - Processors have N inputs and M outputs
pub trait Block: Send {
    /// Debug name for this block
    fn name(&self) -> &str;

    /// Port counts and item sizes
    fn signature(&self) -> IoSignature;

    /// Relative rate between inputs and outputs
    fn rate(&self) -> RatePolicy {
        RatePolicy::Sync
    }

    /// Extra look-back items required beyond the current window (e.g., FIR
    /// taps). Re-read every iteration, so a parameter change may grow it.
    fn history(&self) -> usize {
        0
    }

    /// Output windows are always offered in multiples of this
    fn output_multiple(&self) -> usize {
        1
    }

    /// How input tags are forwarded downstream
    fn tag_propagation(&self) -> TagPropagation {
        TagPropagation::All
    }

    /// Asynchronous parameter delivery; invoked between `work()` calls,
    /// never concurrently with one
    fn set_param(&mut self, _key: &str, _value: TagValue) {}

    /// Process one batch: read from input windows, write to output windows,
    /// report consumed/produced counts through `io`
    fn work(&mut self, io: &mut WorkIo<'_>) -> WorkResult<WorkStatus>;
}
