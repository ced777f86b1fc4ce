//! Flowgraph builder for constructing streaming block graphs
//!
//! Collects blocks and connections, validates the wiring against each
//! block's io-signature (item sizes must match per edge, no cycles, dense
//! required inputs), then finalizes into a ready-to-run [`Scheduler`]:
//! one buffer per connected output port, one reader per connected input
//! port, executors ordered topologically.

use crossbeam_channel::unbounded;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use super::block::{Block, IoSignature};
use super::buffer::Buffer;
use super::errors::GraphError;
use super::executor::BlockExecutor;
use super::scheduler::Scheduler;

/// Unique identifier for a block in the graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(usize);

impl BlockId {
    pub fn as_usize(&self) -> usize {
        self.0
    }
}

/// A connection between an output port and an input port
#[derive(Debug, Clone)]
pub struct Connection {
    pub from_block: BlockId,
    pub from_port: usize,
    pub to_block: BlockId,
    pub to_port: usize,
    /// Per-edge buffer capacity override, in items
    pub buffer_items: Option<usize>,
}

struct BlockEntry {
    name: String,
    block: Box<dyn Block>,
    signature: IoSignature,
}

/// Builder for a streaming flowgraph
pub struct Flowgraph {
    blocks: Vec<BlockEntry>,
    names: HashMap<String, usize>,
    connections: Vec<Connection>,
    default_buffer_items: usize,
    max_noutput_items: usize,
}

impl Flowgraph {
    pub fn new() -> Self {
        Self {
            blocks: Vec::new(),
            names: HashMap::new(),
            connections: Vec::new(),
            default_buffer_items: 8192,
            max_noutput_items: 4096,
        }
    }

    /// Set the default buffer capacity (items) for connections
    pub fn with_default_buffer_items(mut self, items: usize) -> Self {
        self.default_buffer_items = items;
        self
    }

    /// Bound the per-call batch size, trading throughput for latency
    pub fn with_max_noutput_items(mut self, items: usize) -> Self {
        self.max_noutput_items = items;
        self
    }

    /// Add a block by name
    pub fn add_block<B: Block + 'static>(
        &mut self,
        name: impl Into<String>,
        block: B,
    ) -> Result<BlockId, GraphError> {
        let name = name.into();
        if self.names.contains_key(&name) {
            return Err(GraphError::DuplicateName(name));
        }
        let id = BlockId(self.blocks.len());
        let signature = block.signature();
        self.names.insert(name.clone(), id.0);
        self.blocks.push(BlockEntry {
            name,
            block: Box::new(block),
            signature,
        });
        Ok(id)
    }

    fn entry(&self, id: BlockId) -> Result<&BlockEntry, GraphError> {
        self.blocks
            .get(id.0)
            .ok_or_else(|| GraphError::BlockNotFound(format!("#{}", id.0)))
    }

    /// Name of a block, for diagnostics
    pub fn block_name(&self, id: BlockId) -> Option<&str> {
        self.blocks.get(id.0).map(|e| e.name.as_str())
    }

    /// Connect an output port to an input port with the default buffer size
    pub fn connect(
        &mut self,
        from: BlockId,
        from_port: usize,
        to: BlockId,
        to_port: usize,
    ) -> Result<(), GraphError> {
        self.connect_inner(from, from_port, to, to_port, None)
    }

    /// Connect with an explicit buffer capacity (items) for this edge
    pub fn connect_with_buffer(
        &mut self,
        from: BlockId,
        from_port: usize,
        to: BlockId,
        to_port: usize,
        buffer_items: usize,
    ) -> Result<(), GraphError> {
        self.connect_inner(from, from_port, to, to_port, Some(buffer_items))
    }

    fn connect_inner(
        &mut self,
        from: BlockId,
        from_port: usize,
        to: BlockId,
        to_port: usize,
        buffer_items: Option<usize>,
    ) -> Result<(), GraphError> {
        let from_entry = self.entry(from)?;
        let to_entry = self.entry(to)?;

        if from_port >= from_entry.signature.max_outputs {
            return Err(GraphError::PortOutOfRange {
                block: from_entry.name.clone(),
                port: from_port,
            });
        }
        if to_port >= to_entry.signature.max_inputs {
            return Err(GraphError::PortOutOfRange {
                block: to_entry.name.clone(),
                port: to_port,
            });
        }

        // Item sizes must match per connected edge.
        let from_size = from_entry.signature.output_item_size;
        let to_size = to_entry.signature.input_item_size;
        if from_size != to_size {
            return Err(GraphError::ItemSizeMismatch {
                from_block: from_entry.name.clone(),
                from_port,
                from_size,
                to_block: to_entry.name.clone(),
                to_port,
                to_size,
            });
        }

        if self
            .connections
            .iter()
            .any(|c| c.to_block == to && c.to_port == to_port)
        {
            return Err(GraphError::DuplicateConnection {
                block: to_entry.name.clone(),
                port: to_port,
            });
        }

        // A streaming graph has no cycle-breaking mechanism; reject at
        // wiring time rather than deadlocking at runtime.
        if self.reachable(to, from) {
            return Err(GraphError::CycleDetected {
                from_block: from_entry.name.clone(),
                to_block: to_entry.name.clone(),
            });
        }

        self.connections.push(Connection {
            from_block: from,
            from_port,
            to_block: to,
            to_port,
            buffer_items,
        });
        Ok(())
    }

    /// Whether `target` is reachable from `start` along existing edges
    fn reachable(&self, start: BlockId, target: BlockId) -> bool {
        let mut visited = vec![false; self.blocks.len()];
        let mut stack = vec![start];
        while let Some(node) = stack.pop() {
            if node == target {
                return true;
            }
            if std::mem::replace(&mut visited[node.0], true) {
                continue;
            }
            for conn in &self.connections {
                if conn.from_block == node {
                    stack.push(conn.to_block);
                }
            }
        }
        false
    }

    /// Check every block's wiring against its io-signature
    pub fn validate(&self) -> Result<(), GraphError> {
        for (idx, entry) in self.blocks.iter().enumerate() {
            let id = BlockId(idx);
            let in_ports: Vec<usize> = self
                .connections
                .iter()
                .filter(|c| c.to_block == id)
                .map(|c| c.to_port)
                .collect();
            let out_ports: Vec<usize> = self
                .connections
                .iter()
                .filter(|c| c.from_block == id)
                .map(|c| c.from_port)
                .collect();

            if in_ports.len() < entry.signature.min_inputs {
                return Err(GraphError::MissingInputs {
                    block: entry.name.clone(),
                    required: entry.signature.min_inputs,
                    connected: in_ports.len(),
                });
            }
            let distinct_outs = {
                let mut p = out_ports.clone();
                p.sort_unstable();
                p.dedup();
                p
            };
            if distinct_outs.len() < entry.signature.min_outputs {
                return Err(GraphError::MissingOutputs {
                    block: entry.name.clone(),
                    required: entry.signature.min_outputs,
                    connected: distinct_outs.len(),
                });
            }

            // Executors index output buffers by port as well; a gap would
            // silently shift every later port's buffer down by one.
            for (want, &have) in distinct_outs.iter().enumerate() {
                if want != have {
                    return Err(GraphError::SparseOutputs {
                        block: entry.name.clone(),
                        port: want,
                    });
                }
            }

            // Executors index input readers by port, so connected input
            // ports must be exactly 0..n.
            let mut sorted_ins = in_ports;
            sorted_ins.sort_unstable();
            for (want, &have) in sorted_ins.iter().enumerate() {
                if want != have {
                    return Err(GraphError::SparseInputs {
                        block: entry.name.clone(),
                        port: want,
                    });
                }
            }
        }
        Ok(())
    }

    /// Topological order over block ids (the graph is acyclic by
    /// construction)
    fn topological_order(&self) -> Vec<usize> {
        let n = self.blocks.len();
        let mut indegree = vec![0usize; n];
        for conn in &self.connections {
            indegree[conn.to_block.0] += 1;
        }
        let mut queue: Vec<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
        let mut order = Vec::with_capacity(n);
        while let Some(node) = queue.pop() {
            order.push(node);
            for conn in &self.connections {
                if conn.from_block.0 == node {
                    indegree[conn.to_block.0] -= 1;
                    if indegree[conn.to_block.0] == 0 {
                        queue.push(conn.to_block.0);
                    }
                }
            }
        }
        debug_assert_eq!(order.len(), n);
        order
    }

    /// Smallest output batch a block's executor will ever offer, in items
    fn block_granule(entry: &BlockEntry) -> usize {
        fn gcd(a: usize, b: usize) -> usize {
            if b == 0 { a } else { gcd(b, a % b) }
        }
        let (_, out_rate) = entry.block.rate().ratio();
        let om = entry.block.output_multiple().max(1);
        om / gcd(om, out_rate) * out_rate
    }

    /// Items a consumer needs buffered to run one output granule
    fn consumer_need(entry: &BlockEntry) -> usize {
        let (in_rate, out_rate) = entry.block.rate().ratio();
        Self::block_granule(entry) / out_rate * in_rate + entry.block.history()
    }

    /// Finalize the graph: allocate buffers and readers, wire executors,
    /// and return a scheduler ready for `start()`
    pub fn build(mut self) -> Result<Scheduler, GraphError> {
        self.validate()?;
        info!(
            "Building flowgraph with {} blocks and {} connections",
            self.blocks.len(),
            self.connections.len()
        );

        let topo = self.topological_order();

        // Phase 1: one buffer per connected output port, sized for the
        // largest request on that port and at least twice what its slowest
        // consumer needs per iteration.
        let mut buffers: HashMap<(usize, usize), Arc<Buffer>> = HashMap::new();
        for conn in &self.connections {
            let key = (conn.from_block.0, conn.from_port);
            if buffers.contains_key(&key) {
                continue;
            }
            let item_size = self.blocks[conn.from_block.0].signature.output_item_size;
            let mut items = self.default_buffer_items;
            // A producer whose smallest batch exceeds the capacity would be
            // blocked on output forever.
            items = items.max(2 * Self::block_granule(&self.blocks[conn.from_block.0]));
            for c in self
                .connections
                .iter()
                .filter(|c| c.from_block == conn.from_block && c.from_port == conn.from_port)
            {
                if let Some(req) = c.buffer_items {
                    items = items.max(req);
                }
                items = items.max(2 * Self::consumer_need(&self.blocks[c.to_block.0]));
            }
            debug!(
                "Allocating buffer for {}.{}: {} items x {} bytes",
                self.blocks[conn.from_block.0].name, conn.from_port, items, item_size
            );
            buffers.insert(key, Arc::new(Buffer::new(items, item_size)));
        }

        // Phase 2: one reader per connected input port.
        let mut readers: HashMap<(usize, usize), _> = HashMap::new();
        for conn in &self.connections {
            let buffer = &buffers[&(conn.from_block.0, conn.from_port)];
            readers.insert((conn.to_block.0, conn.to_port), buffer.add_reader());
        }

        // Phase 3: executors in block-id order, with a parameter channel
        // each.
        let mut executors = Vec::with_capacity(self.blocks.len());
        let mut param_txs = Vec::with_capacity(self.blocks.len());
        for (id, entry) in self.blocks.drain(..).enumerate() {
            let num_inputs = (0..)
                .take_while(|&p| readers.contains_key(&(id, p)))
                .count();
            let inputs = (0..num_inputs)
                .map(|p| readers.remove(&(id, p)).unwrap())
                .collect();
            let outputs = (0..entry.signature.max_outputs)
                .filter_map(|p| buffers.get(&(id, p)).cloned())
                .collect();

            let (tx, rx) = unbounded();
            param_txs.push(tx);
            executors.push(BlockExecutor::new(
                entry.name,
                entry.block,
                inputs,
                outputs,
                self.max_noutput_items,
                rx,
            ));
        }

        Ok(Scheduler::new(executors, topo, param_txs))
    }
}

impl Default for Flowgraph {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::block::{RatePolicy, WorkIo, WorkStatus};
    use crate::runtime::errors::WorkResult;

    struct TestSource;
    impl Block for TestSource {
        fn name(&self) -> &str {
            "test_source"
        }
        fn signature(&self) -> IoSignature {
            IoSignature::source::<u32>()
        }
        fn work(&mut self, _io: &mut WorkIo<'_>) -> WorkResult<WorkStatus> {
            Ok(WorkStatus::Done)
        }
    }

    struct TestSink;
    impl Block for TestSink {
        fn name(&self) -> &str {
            "test_sink"
        }
        fn signature(&self) -> IoSignature {
            IoSignature::sink::<u32>()
        }
        fn work(&mut self, io: &mut WorkIo<'_>) -> WorkResult<WorkStatus> {
            let n = io.input(0).len();
            io.input(0).consume(n);
            Ok(WorkStatus::Ok)
        }
    }

    struct WideSink;
    impl Block for WideSink {
        fn name(&self) -> &str {
            "wide_sink"
        }
        fn signature(&self) -> IoSignature {
            IoSignature::new((1, 4), 4, (0, 0), 0)
        }
        fn work(&mut self, io: &mut WorkIo<'_>) -> WorkResult<WorkStatus> {
            for i in 0..io.num_inputs() {
                let n = io.input(i).len();
                io.input(i).consume(n);
            }
            Ok(WorkStatus::Ok)
        }
    }

    struct WideSource;
    impl Block for WideSource {
        fn name(&self) -> &str {
            "wide_source"
        }
        fn signature(&self) -> IoSignature {
            IoSignature::new((0, 0), 0, (1, 4), 8)
        }
        fn work(&mut self, _io: &mut WorkIo<'_>) -> WorkResult<WorkStatus> {
            Ok(WorkStatus::Done)
        }
    }

    struct TestPass;
    impl Block for TestPass {
        fn name(&self) -> &str {
            "test_pass"
        }
        fn signature(&self) -> IoSignature {
            IoSignature::through::<u32>()
        }
        fn work(&mut self, _io: &mut WorkIo<'_>) -> WorkResult<WorkStatus> {
            Ok(WorkStatus::Ok)
        }
    }

    #[test]
    fn test_basic_chain_builds() {
        let mut fg = Flowgraph::new();
        let src = fg.add_block("source", TestSource).unwrap();
        let pass = fg.add_block("pass", TestPass).unwrap();
        let sink = fg.add_block("sink", TestSink).unwrap();
        fg.connect(src, 0, pass, 0).unwrap();
        fg.connect(pass, 0, sink, 0).unwrap();
        assert!(fg.validate().is_ok());
        assert!(fg.build().is_ok());
    }

    #[test]
    fn test_duplicate_block_name_rejected() {
        let mut fg = Flowgraph::new();
        fg.add_block("a", TestSource).unwrap();
        let err = fg.add_block("a", TestSource).unwrap_err();
        assert!(matches!(err, GraphError::DuplicateName(_)));
    }

    #[test]
    fn test_item_size_mismatch_rejected() {
        let mut fg = Flowgraph::new();
        let src = fg.add_block("source", WideSource).unwrap();
        let sink = fg.add_block("sink", TestSink).unwrap();
        let err = fg.connect(src, 0, sink, 0).unwrap_err();
        assert!(matches!(err, GraphError::ItemSizeMismatch { .. }));
    }

    #[test]
    fn test_duplicate_input_connection_rejected() {
        let mut fg = Flowgraph::new();
        let s1 = fg.add_block("s1", TestSource).unwrap();
        let s2 = fg.add_block("s2", TestSource).unwrap();
        let sink = fg.add_block("sink", TestSink).unwrap();
        fg.connect(s1, 0, sink, 0).unwrap();
        let err = fg.connect(s2, 0, sink, 0).unwrap_err();
        assert!(matches!(err, GraphError::DuplicateConnection { .. }));
    }

    #[test]
    fn test_fanout_from_one_output_allowed() {
        let mut fg = Flowgraph::new();
        let src = fg.add_block("source", TestSource).unwrap();
        let k1 = fg.add_block("k1", TestSink).unwrap();
        let k2 = fg.add_block("k2", TestSink).unwrap();
        fg.connect(src, 0, k1, 0).unwrap();
        fg.connect(src, 0, k2, 0).unwrap();
        assert!(fg.build().is_ok());
    }

    #[test]
    fn test_cycle_rejected() {
        let mut fg = Flowgraph::new();
        let a = fg.add_block("a", TestPass).unwrap();
        let b = fg.add_block("b", TestPass).unwrap();
        fg.connect(a, 0, b, 0).unwrap();
        let err = fg.connect(b, 0, a, 0).unwrap_err();
        assert!(matches!(err, GraphError::CycleDetected { .. }));
    }

    #[test]
    fn test_port_out_of_range_rejected() {
        let mut fg = Flowgraph::new();
        let src = fg.add_block("source", TestSource).unwrap();
        let sink = fg.add_block("sink", TestSink).unwrap();
        let err = fg.connect(src, 1, sink, 0).unwrap_err();
        assert!(matches!(err, GraphError::PortOutOfRange { .. }));
    }

    #[test]
    fn test_missing_required_input_rejected() {
        let mut fg = Flowgraph::new();
        fg.add_block("sink", TestSink).unwrap();
        let err = fg.validate().unwrap_err();
        assert!(matches!(err, GraphError::MissingInputs { .. }));
    }

    #[test]
    fn test_sparse_inputs_rejected() {
        let mut fg = Flowgraph::new();
        let src = fg.add_block("source", TestSource).unwrap();
        let sink = fg.add_block("sink", WideSink).unwrap();
        // Port 1 connected, port 0 left open.
        fg.connect(src, 0, sink, 1).unwrap();
        let err = fg.validate().unwrap_err();
        assert!(matches!(err, GraphError::SparseInputs { .. }));
    }

    #[test]
    fn test_sparse_outputs_rejected() {
        struct U64Sink;
        impl Block for U64Sink {
            fn name(&self) -> &str {
                "u64_sink"
            }
            fn signature(&self) -> IoSignature {
                IoSignature::sink::<u64>()
            }
            fn work(&mut self, io: &mut WorkIo<'_>) -> WorkResult<WorkStatus> {
                let n = io.input(0).len();
                io.input(0).consume(n);
                Ok(WorkStatus::Ok)
            }
        }

        let mut fg = Flowgraph::new();
        let src = fg.add_block("source", WideSource).unwrap();
        let sink = fg.add_block("sink", U64Sink).unwrap();
        // Port 1 connected, port 0 left open.
        fg.connect(src, 1, sink, 0).unwrap();
        let err = fg.validate().unwrap_err();
        assert!(matches!(err, GraphError::SparseOutputs { .. }));
    }

    #[test]
    fn test_buffer_sized_for_decimator_need() {
        struct BigDecim;
        impl Block for BigDecim {
            fn name(&self) -> &str {
                "big_decim"
            }
            fn signature(&self) -> IoSignature {
                IoSignature::through::<u32>()
            }
            fn rate(&self) -> RatePolicy {
                RatePolicy::decimate(100)
            }
            fn history(&self) -> usize {
                50
            }
            fn work(&mut self, _io: &mut WorkIo<'_>) -> WorkResult<WorkStatus> {
                Ok(WorkStatus::Ok)
            }
        }

        let mut fg = Flowgraph::new().with_default_buffer_items(16);
        let src = fg.add_block("source", TestSource).unwrap();
        let decim = fg.add_block("decim", BigDecim).unwrap();
        let sink = fg.add_block("sink", TestSink).unwrap();
        fg.connect(src, 0, decim, 0).unwrap();
        fg.connect(decim, 0, sink, 0).unwrap();
        // Build succeeds even though the default (16) is far below the
        // decimator's 150-item requirement; sizing rounds up.
        assert!(fg.build().is_ok());
    }
}
