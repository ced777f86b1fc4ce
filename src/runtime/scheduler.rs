//! Partitioned cooperative scheduler for streaming flowgraphs
//!
//! Blocks are partitioned into groups; each group runs on its own thread,
//! iterating its blocks in topological order. Within a partition execution
//! is strictly sequential; across partitions the only synchronization is
//! the shared buffer between a producer and its consumers.
//!
//! The loop is a cooperative poll: `run_one_iteration()` never blocks, a
//! blocked block is skipped and retried next pass, and a full pass with no
//! progress triggers a bounded exponential backoff (yield, then a doubling
//! sleep capped at 1 ms) so a stalled partition does not peg a core.

use crossbeam_channel::{Receiver, Sender, unbounded};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info};

use super::errors::{GraphError, RunError};
use super::executor::{BlockExecutor, BlockState, ParamMsg};
use super::graph::BlockId;
use super::tags::TagValue;
use super::watchdog::Watchdog;

/// Backoff bounds for a partition pass that made no progress
const BACKOFF_MIN: Duration = Duration::from_micros(10);
const BACKOFF_MAX: Duration = Duration::from_millis(1);

/// Runtime scheduler that executes a finalized flowgraph
pub struct Scheduler {
    /// Executors indexed by block id; taken when partitions start
    executors: Vec<Option<BlockExecutor>>,
    /// Block id -> position in topological order
    topo_pos: Vec<usize>,
    /// User-declared block groups
    groups: Vec<Vec<usize>>,
    grouped: Vec<bool>,
    param_txs: Vec<Sender<ParamMsg>>,
    threads: Vec<(String, JoinHandle<()>)>,
    stop_signal: Arc<AtomicBool>,
    completion_tx: Sender<String>,
    completion_rx: Option<Receiver<String>>,
    failures: Arc<Mutex<Vec<RunError>>>,
    watchdog: Watchdog,
    watchdog_handle: Option<JoinHandle<()>>,
}

impl Scheduler {
    pub(crate) fn new(
        executors: Vec<BlockExecutor>,
        topo_order: Vec<usize>,
        param_txs: Vec<Sender<ParamMsg>>,
    ) -> Self {
        let mut topo_pos = vec![0; executors.len()];
        for (pos, &id) in topo_order.iter().enumerate() {
            topo_pos[id] = pos;
        }
        let (completion_tx, completion_rx) = unbounded();
        let watchdog = Watchdog::new();
        let watchdog_handle = watchdog.start_monitoring_thread();
        let grouped = vec![false; executors.len()];
        Self {
            executors: executors.into_iter().map(Some).collect(),
            topo_pos,
            groups: Vec::new(),
            grouped,
            param_txs,
            threads: Vec::new(),
            stop_signal: Arc::new(AtomicBool::new(false)),
            completion_tx,
            completion_rx: Some(completion_rx),
            failures: Arc::new(Mutex::new(Vec::new())),
            watchdog,
            watchdog_handle: Some(watchdog_handle),
        }
    }

    /// Get a reference to the watchdog
    pub fn watchdog(&self) -> &Watchdog {
        &self.watchdog
    }

    /// Declare that the listed blocks run together on one thread
    ///
    /// Blocks not named in any group each run on a thread of their own.
    /// Grouping is a pure performance concern; it has no observable effect
    /// on the data a graph produces.
    pub fn add_block_group(&mut self, blocks: &[BlockId]) -> Result<(), GraphError> {
        let mut ids = Vec::with_capacity(blocks.len());
        for &id in blocks {
            let idx = id.as_usize();
            let Some(slot) = self.executors.get(idx) else {
                return Err(GraphError::BlockNotFound(format!("#{idx}")));
            };
            if self.grouped[idx] {
                let name = slot.as_ref().map(|e| e.name().to_string()).unwrap_or_default();
                return Err(GraphError::AlreadyGrouped(name));
            }
            ids.push(idx);
        }
        for &idx in &ids {
            self.grouped[idx] = true;
        }
        self.groups.push(ids);
        Ok(())
    }

    /// Sender for asynchronous parameter changes to one block
    pub fn param_sender(&self, block: BlockId) -> Sender<ParamMsg> {
        self.param_txs[block.as_usize()].clone()
    }

    /// Deliver a parameter change; applied before the block's next `work()`
    pub fn set_param(&self, block: BlockId, key: impl Into<String>, value: TagValue) {
        let _ = self.param_txs[block.as_usize()].send(ParamMsg {
            key: key.into(),
            value,
        });
    }

    /// Spawn one thread per partition
    pub fn start(&mut self) {
        // Declared groups first, then a singleton partition per remaining
        // block; members run in topological order within their partition.
        let mut partitions: Vec<Vec<usize>> = self.groups.clone();
        for idx in 0..self.executors.len() {
            if !self.grouped[idx] && self.executors[idx].is_some() {
                partitions.push(vec![idx]);
            }
        }
        for partition in &mut partitions {
            partition.sort_by_key(|&idx| self.topo_pos[idx]);
        }

        for (pnum, partition) in partitions.into_iter().enumerate() {
            let mut execs: Vec<BlockExecutor> = partition
                .into_iter()
                .filter_map(|idx| self.executors[idx].take())
                .collect();
            if execs.is_empty() {
                continue;
            }
            let name = if execs.len() == 1 {
                execs[0].name().to_string()
            } else {
                format!("group-{pnum}")
            };

            let stop_signal = Arc::clone(&self.stop_signal);
            let completion_tx = self.completion_tx.clone();
            let failures = Arc::clone(&self.failures);
            let wd = self.watchdog.register_partition(&name);
            let thread_name = name.clone();

            debug!("Starting partition: {}", name);

            let handle = thread::spawn(move || {
                let mut backoff = BACKOFF_MIN;
                let mut passes = 0u64;

                loop {
                    if stop_signal.load(Ordering::Relaxed) {
                        break;
                    }

                    let mut progress = false;
                    for ex in &mut execs {
                        if ex.state() == BlockState::Done {
                            continue;
                        }
                        match ex.run_one_iteration() {
                            Ok(BlockState::Ready)
                            | Ok(BlockState::ReadyNoOutput)
                            | Ok(BlockState::Done) => progress = true,
                            Ok(BlockState::BlockedInput) | Ok(BlockState::BlockedOutput) => {}
                            Err(e) => {
                                // Fail fast: most blocks have no sensible
                                // partial-failure semantics in a pipeline.
                                error!("[{}] work error: {}", ex.name(), e);
                                failures.lock().unwrap().push(RunError {
                                    block: ex.name().to_string(),
                                    source: e,
                                });
                                stop_signal.store(true, Ordering::Relaxed);
                            }
                        }
                    }
                    passes += 1;

                    if execs.iter().all(|ex| ex.state() == BlockState::Done) {
                        info!("[{}] all blocks done after {} passes", thread_name, passes);
                        break;
                    }

                    if progress {
                        wd.mark_progress();
                        backoff = BACKOFF_MIN;
                    } else if backoff <= BACKOFF_MIN {
                        thread::yield_now();
                        backoff *= 2;
                    } else {
                        thread::sleep(backoff);
                        backoff = (backoff * 2).min(BACKOFF_MAX);
                    }
                }

                // Notify the scheduler that this thread is about to exit
                let _ = completion_tx.send(thread_name);
            });

            self.threads.push((name, handle));
        }
    }

    /// Request all partition threads to exit at their next safe point
    ///
    /// Advisory and non-blocking: cancellation latency is bounded by one
    /// pass over each partition's blocks.
    pub fn stop(&self) {
        self.stop_signal.store(true, Ordering::Relaxed);
    }

    /// Join all partition threads; returns the first recorded block failure
    ///
    /// Returns after every thread has exited, so a crashed block aborts the
    /// run rather than hanging the caller.
    pub fn wait(mut self) -> Result<(), RunError> {
        let completion_rx = self
            .completion_rx
            .take()
            .expect("completion_rx already taken");

        // Drop the main completion sender so the channel closes when all
        // threads complete
        drop(self.completion_tx);

        let total_threads = self.threads.len();
        let mut completed = 0;

        debug!("Waiting for {} partition threads...", total_threads);

        let mut threads_by_name: HashMap<String, JoinHandle<()>> =
            self.threads.into_iter().collect();

        while completed < total_threads {
            match completion_rx.recv() {
                Ok(thread_name) => {
                    completed += 1;
                    if let Some(handle) = threads_by_name.remove(&thread_name) {
                        match handle.join() {
                            Ok(_) => debug!(
                                "[{}] partition completed ({}/{})",
                                thread_name, completed, total_threads
                            ),
                            Err(e) => error!(
                                "[{}] partition panicked ({}/{}): {:?}",
                                thread_name, completed, total_threads, e
                            ),
                        }
                    }
                }
                Err(_) => break,
            }
        }

        info!("All {} partition threads completed", total_threads);

        self.watchdog.stop();
        if let Some(handle) = self.watchdog_handle.take() {
            let _ = handle.join();
        }

        let mut failures = self.failures.lock().unwrap();
        match failures.drain(..).next() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Convenience: `start()` then `wait()`
    pub fn run(mut self) -> Result<(), RunError> {
        self.start();
        self.wait()
    }

    /// Number of running partition threads
    pub fn num_threads(&self) -> usize {
        self.threads.len()
    }

    /// Names of all running partition threads
    pub fn thread_names(&self) -> Vec<String> {
        self.threads.iter().map(|(name, _)| name.clone()).collect()
    }
}
