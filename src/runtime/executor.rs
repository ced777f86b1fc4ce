//! Block executor: drives one block's `work()` call per iteration
//!
//! `run_one_iteration()` never blocks. It computes availability on every
//! input, free space on every output, forecasts the block's requirement
//! from its rate policy, and either short-circuits with a blocked state or
//! invokes the block and publishes the reported consumed/produced counts to
//! the shared buffers. The calling scheduler thread owns retry policy.

use crossbeam_channel::Receiver;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, trace};

use super::block::{Block, StreamInput, StreamOutput, WorkIo, WorkStatus};
use super::buffer::Buffer;
use super::errors::{WorkError, WorkResult};
use super::reader::BufferReader;
use super::tags::{TagPropagation, TagValue};

/// Outcome of one executor iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    /// Progress was made and output produced
    Ready,
    /// Input consumed (or an internal renegotiation pass) but nothing
    /// produced
    ReadyNoOutput,
    /// Some input is below the block's forecast requirement
    BlockedInput,
    /// Some output lacks space for one output granule
    BlockedOutput,
    /// Permanently complete; the block will never be called again
    Done,
}

/// Asynchronous parameter change, delivered between `work()` calls
#[derive(Debug, Clone)]
pub struct ParamMsg {
    pub key: String,
    pub value: TagValue,
}

fn gcd(a: usize, b: usize) -> usize {
    if b == 0 { a } else { gcd(b, a % b) }
}

fn lcm(a: usize, b: usize) -> usize {
    a / gcd(a, b) * b
}

/// Executor state for a single block within a running graph
pub struct BlockExecutor {
    name: String,
    block: Box<dyn Block>,
    inputs: Vec<BufferReader>,
    outputs: Vec<Arc<Buffer>>,
    state: BlockState,
    max_noutput_items: usize,
    param_rx: Receiver<ParamMsg>,
}

impl BlockExecutor {
    pub(crate) fn new(
        name: String,
        block: Box<dyn Block>,
        inputs: Vec<BufferReader>,
        outputs: Vec<Arc<Buffer>>,
        max_noutput_items: usize,
        param_rx: Receiver<ParamMsg>,
    ) -> Self {
        Self {
            name,
            block,
            inputs,
            outputs,
            state: BlockState::ReadyNoOutput,
            max_noutput_items,
            param_rx,
        }
    }

    /// Block name, for logs and error reports
    pub fn name(&self) -> &str {
        &self.name
    }

    /// State classified by the most recent iteration
    pub fn state(&self) -> BlockState {
        self.state
    }

    /// Mark this executor permanently done, signal downstream, and release
    /// upstream
    fn finish(&mut self) {
        self.state = BlockState::Done;
        for input in &self.inputs {
            input.detach();
        }
        for out in &self.outputs {
            out.set_finished();
        }
    }

    /// Run one non-blocking iteration of the block
    pub fn run_one_iteration(&mut self) -> WorkResult<BlockState> {
        if self.state == BlockState::Done {
            return Ok(BlockState::Done);
        }

        // Parameter changes land between work() calls, never during one.
        while let Ok(msg) = self.param_rx.try_recv() {
            debug!("[{}] applying parameter '{}'", self.name, msg.key);
            self.block.set_param(&msg.key, msg.value);
        }

        // Done states flow upstream through reader detachment: once every
        // consumer of every output is gone, nothing this block produces can
        // be delivered, so a head-bounded graph drains an infinite source.
        if !self.outputs.is_empty() && self.outputs.iter().all(|out| !out.has_active_readers()) {
            debug!("[{}] all downstream consumers finished", self.name);
            self.finish();
            return Ok(BlockState::Done);
        }

        let (in_rate, out_rate) = self.block.rate().ratio();
        let history = self.block.history();
        // Offering outputs in lcm(output_multiple, out_rate) granules keeps
        // the input forecast an exact integer.
        let granule = lcm(self.block.output_multiple().max(1), out_rate);
        let input_per_granule = granule / out_rate * in_rate + history;

        // Step 1-3: per-input availability against the forecast requirement.
        let mut feasible_in = usize::MAX;
        for (idx, reader) in self.inputs.iter().enumerate() {
            let avail = reader.items_available();
            if avail < input_per_granule {
                if reader.is_finished() {
                    // Drained below one granule with upstream done: this
                    // block can never run again.
                    if avail > 0 {
                        debug!(
                            "[{}] dropping {} residual item(s) on input {} at shutdown",
                            self.name, avail, idx
                        );
                    }
                    self.finish();
                    return Ok(BlockState::Done);
                }
                reader.input_blocked_callback(input_per_granule);
                self.state = BlockState::BlockedInput;
                return Ok(self.state);
            }
            feasible_in = feasible_in.min((avail - history) / in_rate * out_rate);
        }

        // Step 4: output space in whole granules.
        let mut feasible_out = usize::MAX;
        for out in &self.outputs {
            feasible_out = feasible_out.min(out.space_available());
        }
        if !self.outputs.is_empty() && feasible_out < granule {
            self.state = BlockState::BlockedOutput;
            return Ok(self.state);
        }

        let max_batch = self.max_noutput_items.max(granule);
        let noutput = feasible_in.min(feasible_out).min(max_batch) / granule * granule;
        debug_assert!(noutput >= granule);
        let window_items = if self.inputs.is_empty() {
            0
        } else {
            noutput / out_rate * in_rate + history
        };

        // Step 5-6: snapshot tags, build the io windows, call the block.
        let mut io = WorkIo {
            inputs: self
                .inputs
                .iter()
                .map(|reader| {
                    let bytes = window_items * reader.item_size();
                    StreamInput::new(
                        &reader.read_slice()[..bytes],
                        reader.item_size(),
                        reader.total_items_read(),
                        reader.tags_in_window(window_items),
                        reader.is_finished(),
                    )
                })
                .collect(),
            outputs: self
                .outputs
                .iter()
                .map(|out| {
                    // SAFETY: this executor is the buffer's single producer
                    // and `noutput` never exceeds the available space.
                    let region = unsafe { out.write_region() };
                    StreamOutput::new(region, noutput, out.item_size(), out.total_items_written())
                })
                .collect(),
        };

        // A panic inside work() must not unwind through the partition loop:
        // an uncaught unwind would kill the thread without recording a
        // failure, leaving wait() hanging on the completion channel.
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.block.work(&mut io)));
        let status = match result {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                // Unrecoverable block error: tear this executor down and let
                // downstream drain out.
                self.finish();
                return Err(e);
            }
            Err(payload) => {
                let msg = payload
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "opaque panic payload".to_string());
                self.finish();
                return Err(WorkError::BlockError(format!("work() panicked: {msg}")));
            }
        };

        // Step 7: interpret reported counts, with contract validation.
        let mut produced = Vec::with_capacity(io.outputs.len());
        for (j, out) in io.outputs.iter().enumerate() {
            let p = out.produced();
            if p > noutput {
                self.finish();
                return Err(WorkError::ContractViolation {
                    block: self.name.clone(),
                    detail: format!("produced {p} items on output {j}, offered {noutput}"),
                });
            }
            produced.push(p);
        }
        let major_produced = produced.iter().copied().max().unwrap_or(0);

        let mut consumed = Vec::with_capacity(io.inputs.len());
        for (i, input) in io.inputs.iter().enumerate() {
            let c = input
                .reported_consumed()
                .unwrap_or(major_produced / out_rate * in_rate);
            if c > window_items {
                self.finish();
                return Err(WorkError::ContractViolation {
                    block: self.name.clone(),
                    detail: format!("consumed {c} items on input {i}, offered {window_items}"),
                });
            }
            consumed.push(c);
        }

        // Step 8: forward tags before publishing the data they annotate, so
        // a downstream reader never observes an item ahead of its tag.
        if self.block.tag_propagation() == TagPropagation::All {
            for (i, input) in io.inputs.iter().enumerate() {
                let base = input.nitems_read();
                let end = base + consumed[i] as u64;
                for tag in input.tags().iter().filter(|t| t.offset < end) {
                    let rel = (tag.offset - base) as usize * out_rate / in_rate;
                    for out in &self.outputs {
                        let mut forwarded = tag.clone();
                        forwarded.offset = out.total_items_written() + rel as u64;
                        out.add_tag(forwarded);
                    }
                }
            }
        }
        for (j, out) in io.outputs.iter_mut().enumerate() {
            for tag in out.take_tags() {
                self.outputs[j].add_tag(tag);
            }
        }

        for (j, out) in self.outputs.iter().enumerate() {
            out.post_write(produced[j]);
        }
        for (i, reader) in self.inputs.iter().enumerate() {
            reader.post_read(consumed[i]);
        }

        if status == WorkStatus::Done {
            trace!("[{}] signaled done", self.name);
            self.finish();
            return Ok(BlockState::Done);
        }

        // Step 9: classify.
        self.state = if major_produced > 0 {
            BlockState::Ready
        } else {
            BlockState::ReadyNoOutput
        };
        Ok(self.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::block::{IoSignature, RatePolicy};
    use crate::runtime::tags::Tag;
    use crossbeam_channel::unbounded;

    // Minimal test blocks, wired by hand without a flowgraph.

    struct CountSource {
        next: i32,
        remaining: usize,
    }

    impl Block for CountSource {
        fn name(&self) -> &str {
            "count_source"
        }
        fn signature(&self) -> IoSignature {
            IoSignature::source::<i32>()
        }
        fn work(&mut self, io: &mut WorkIo<'_>) -> WorkResult<WorkStatus> {
            let out = io.output(0);
            let n = out.capacity().min(self.remaining);
            for slot in &mut out.slice_mut::<i32>()[..n] {
                *slot = self.next;
                self.next += 1;
            }
            out.produce(n);
            self.remaining -= n;
            if self.remaining == 0 {
                Ok(WorkStatus::Done)
            } else {
                Ok(WorkStatus::Ok)
            }
        }
    }

    struct CollectSink {
        seen: Vec<i32>,
    }

    impl Block for CollectSink {
        fn name(&self) -> &str {
            "collect_sink"
        }
        fn signature(&self) -> IoSignature {
            IoSignature::sink::<i32>()
        }
        fn work(&mut self, io: &mut WorkIo<'_>) -> WorkResult<WorkStatus> {
            let input = io.input(0);
            self.seen.extend_from_slice(input.slice::<i32>());
            let n = input.len();
            input.consume(n);
            Ok(WorkStatus::Ok)
        }
    }

    struct Overproducer;

    impl Block for Overproducer {
        fn name(&self) -> &str {
            "overproducer"
        }
        fn signature(&self) -> IoSignature {
            IoSignature::source::<i32>()
        }
        fn work(&mut self, io: &mut WorkIo<'_>) -> WorkResult<WorkStatus> {
            let cap = io.output(0).capacity();
            io.output(0).produce(cap + 1);
            Ok(WorkStatus::Ok)
        }
    }

    fn executor(block: impl Block + 'static, inputs: Vec<BufferReader>, outputs: Vec<Arc<Buffer>>) -> BlockExecutor {
        let (_tx, rx) = unbounded();
        let name = block.name().to_string();
        BlockExecutor::new(name, Box::new(block), inputs, outputs, 64, rx)
    }

    #[test]
    fn test_source_runs_to_done_and_finishes_buffer() {
        let buf = Arc::new(Buffer::new(32, 4));
        let reader = buf.add_reader();
        let mut ex = executor(CountSource { next: 0, remaining: 100 }, vec![], vec![Arc::clone(&buf)]);

        let mut total = 0u64;
        loop {
            match ex.run_one_iteration().unwrap() {
                BlockState::Done => break,
                BlockState::Ready => {}
                // Space starvation: drain downstream and retry.
                BlockState::BlockedOutput => {
                    let n = reader.items_available();
                    reader.post_read(n);
                    total += n as u64;
                }
                other => panic!("unexpected state {other:?}"),
            }
        }
        total += reader.items_available() as u64;
        assert_eq!(total, 100);
        assert!(buf.is_finished());
        assert_eq!(ex.run_one_iteration().unwrap(), BlockState::Done);
    }

    #[test]
    fn test_sink_blocked_then_drains_to_done() {
        let buf = Arc::new(Buffer::new(32, 4));
        let reader = buf.add_reader();
        let mut ex = executor(CollectSink { seen: Vec::new() }, vec![reader], vec![]);

        assert_eq!(ex.run_one_iteration().unwrap(), BlockState::BlockedInput);

        unsafe {
            let dst = buf.write_region().cast::<i32>();
            for k in 0..5 {
                *dst.add(k) = k as i32;
            }
        }
        buf.post_write(5);
        assert_eq!(ex.run_one_iteration().unwrap(), BlockState::ReadyNoOutput);

        buf.set_finished();
        assert_eq!(ex.run_one_iteration().unwrap(), BlockState::Done);
    }

    #[test]
    fn test_decimator_forecast_and_default_consume() {
        struct Decim;
        impl Block for Decim {
            fn name(&self) -> &str {
                "decim"
            }
            fn signature(&self) -> IoSignature {
                IoSignature::through::<i32>()
            }
            fn rate(&self) -> RatePolicy {
                RatePolicy::decimate(4)
            }
            fn work(&mut self, io: &mut WorkIo<'_>) -> WorkResult<WorkStatus> {
                let n = io.output(0).capacity();
                for k in 0..n {
                    let v = io.input(0).slice::<i32>()[k * 4];
                    io.output(0).slice_mut::<i32>()[k] = v;
                }
                io.output(0).produce(n);
                Ok(WorkStatus::Ok)
            }
        }

        let up = Arc::new(Buffer::new(64, 4));
        let down = Arc::new(Buffer::new(64, 4));
        let reader = up.add_reader();
        let down_reader = down.add_reader();
        let mut ex = executor(Decim, vec![reader], vec![Arc::clone(&down)]);

        // Below one granule (4 in -> 1 out): blocked.
        unsafe {
            let dst = up.write_region().cast::<i32>();
            for k in 0..3 {
                *dst.add(k) = k as i32;
            }
        }
        up.post_write(3);
        assert_eq!(ex.run_one_iteration().unwrap(), BlockState::BlockedInput);

        unsafe {
            let dst = up.write_region().cast::<i32>();
            for k in 0..9 {
                *dst.add(k) = (3 + k) as i32;
            }
        }
        up.post_write(9);
        assert_eq!(ex.run_one_iteration().unwrap(), BlockState::Ready);

        // 12 available -> 3 outputs, default consume = 3 * 4.
        assert_eq!(down_reader.items_available(), 3);
        let out: Vec<i32> = {
            let bytes = down_reader.read_slice();
            unsafe { std::slice::from_raw_parts(bytes.as_ptr().cast::<i32>(), 3) }.to_vec()
        };
        assert_eq!(out, vec![0, 4, 8]);
    }

    #[test]
    fn test_panic_in_work_becomes_block_error() {
        struct PanicSource;
        impl Block for PanicSource {
            fn name(&self) -> &str {
                "panic_source"
            }
            fn signature(&self) -> IoSignature {
                IoSignature::source::<i32>()
            }
            fn work(&mut self, _io: &mut WorkIo<'_>) -> WorkResult<WorkStatus> {
                panic!("bad sample table");
            }
        }

        let buf = Arc::new(Buffer::new(16, 4));
        let _reader = buf.add_reader();
        let mut ex = executor(PanicSource, vec![], vec![Arc::clone(&buf)]);

        let err = ex.run_one_iteration().unwrap_err();
        match err {
            WorkError::BlockError(msg) => assert!(msg.contains("bad sample table")),
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(ex.state(), BlockState::Done);
        assert!(buf.is_finished());
    }

    #[test]
    fn test_source_finishes_when_all_readers_detach() {
        let buf = Arc::new(Buffer::new(32, 4));
        let reader = buf.add_reader();
        let mut ex = executor(CountSource { next: 0, remaining: 1_000_000 }, vec![], vec![Arc::clone(&buf)]);

        assert_eq!(ex.run_one_iteration().unwrap(), BlockState::Ready);
        reader.detach();
        assert_eq!(ex.run_one_iteration().unwrap(), BlockState::Done);
        assert!(buf.is_finished());
    }

    #[test]
    fn test_contract_violation_is_fatal_for_the_block() {
        let buf = Arc::new(Buffer::new(16, 4));
        let _reader = buf.add_reader();
        let mut ex = executor(Overproducer, vec![], vec![Arc::clone(&buf)]);

        let err = ex.run_one_iteration().unwrap_err();
        assert!(matches!(err, WorkError::ContractViolation { .. }));
        assert_eq!(ex.state(), BlockState::Done);
        assert!(buf.is_finished());
    }

    #[test]
    fn test_tags_propagate_with_offset_translation() {
        struct Pass;
        impl Block for Pass {
            fn name(&self) -> &str {
                "pass"
            }
            fn signature(&self) -> IoSignature {
                IoSignature::through::<i32>()
            }
            fn work(&mut self, io: &mut WorkIo<'_>) -> WorkResult<WorkStatus> {
                let n = io.input(0).len().min(io.output(0).capacity());
                let data = io.input(0).slice::<i32>()[..n].to_vec();
                io.output(0).slice_mut::<i32>()[..n].copy_from_slice(&data);
                io.output(0).produce(n);
                Ok(WorkStatus::Ok)
            }
        }

        let up = Arc::new(Buffer::new(16, 4));
        let down = Arc::new(Buffer::new(16, 4));
        let reader = up.add_reader();
        let down_reader = down.add_reader();
        let mut ex = executor(Pass, vec![reader], vec![Arc::clone(&down)]);

        up.add_tag(Tag::new(2, "burst", TagValue::U64(7)));
        unsafe {
            let dst = up.write_region().cast::<i32>();
            for k in 0..6 {
                *dst.add(k) = k as i32;
            }
        }
        up.post_write(6);

        assert_eq!(ex.run_one_iteration().unwrap(), BlockState::Ready);
        let tags = down_reader.tags_in_window(6);
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].offset, 2);
        assert_eq!(tags[0].key, "burst");
    }

    #[test]
    fn test_param_applied_between_iterations() {
        struct Gate {
            open: bool,
        }
        impl Block for Gate {
            fn name(&self) -> &str {
                "gate"
            }
            fn signature(&self) -> IoSignature {
                IoSignature::source::<i32>()
            }
            fn set_param(&mut self, key: &str, _value: TagValue) {
                if key == "open" {
                    self.open = true;
                }
            }
            fn work(&mut self, io: &mut WorkIo<'_>) -> WorkResult<WorkStatus> {
                if self.open {
                    io.output(0).slice_mut::<i32>()[0] = 1;
                    io.output(0).produce(1);
                }
                Ok(WorkStatus::Ok)
            }
        }

        let buf = Arc::new(Buffer::new(16, 4));
        let _reader = buf.add_reader();
        let (tx, rx) = unbounded();
        let mut ex = BlockExecutor::new(
            "gate".into(),
            Box::new(Gate { open: false }),
            vec![],
            vec![buf],
            64,
            rx,
        );

        assert_eq!(ex.run_one_iteration().unwrap(), BlockState::ReadyNoOutput);
        tx.send(ParamMsg {
            key: "open".into(),
            value: TagValue::Bool(true),
        })
        .unwrap();
        assert_eq!(ex.run_one_iteration().unwrap(), BlockState::Ready);
    }
}
