//! # Pipeline Workers
//!
//! Workers pull evidence items from the ingestion queue, dispatch them to
//! plugins, and push the produced events onto the output queue.

use std::ops::AddAssign;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::RunContext;
use crate::event::Event;
use crate::evidence::{EvidenceItem, EvidenceResolver};
use crate::plugins::{ParserContext, Registry};

use super::queue::{ChannelQueue, Queue};
use super::tasks::{CancelToken, TaskHandle};

/// Counters accumulated while dispatching items.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub items_processed: u64,
    pub events_produced: u64,
    pub events_filtered: u64,
    pub not_applicable: u64,
    pub plugin_failures: u64,
    pub recursion_limited: u64,
    pub unreadable_items: u64,
}

impl AddAssign for DispatchStats {
    fn add_assign(&mut self, other: Self) {
        self.items_processed += other.items_processed;
        self.events_produced += other.events_produced;
        self.events_filtered += other.events_filtered;
        self.not_applicable += other.not_applicable;
        self.plugin_failures += other.plugin_failures;
        self.recursion_limited += other.recursion_limited;
        self.unreadable_items += other.unreadable_items;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Running,
    Stopped,
    Errored,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => WorkerState::Running,
            2 => WorkerState::Stopped,
            3 => WorkerState::Errored,
            _ => WorkerState::Idle,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            WorkerState::Idle => 0,
            WorkerState::Running => 1,
            WorkerState::Stopped => 2,
            WorkerState::Errored => 3,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub id: usize,
    pub state: WorkerState,
    pub current_item: Option<String>,
    pub items_processed: u64,
    pub events_produced: u64,
}

/// Live view of a worker, readable from other threads.
#[derive(Debug)]
pub struct WorkerMonitor {
    id: usize,
    state: AtomicU8,
    current_item: Mutex<Option<String>>,
    items_processed: AtomicU64,
    events_produced: AtomicU64,
}

impl WorkerMonitor {
    fn new(id: usize) -> Self {
        Self {
            id,
            state: AtomicU8::new(WorkerState::Idle.as_u8()),
            current_item: Mutex::new(None),
            items_processed: AtomicU64::new(0),
            events_produced: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: WorkerState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    fn set_current(&self, item: Option<String>) {
        let mut guard = self
            .current_item
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard = item;
    }

    pub fn status(&self) -> WorkerStatus {
        let current_item = self
            .current_item
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        WorkerStatus {
            id: self.id,
            state: self.state(),
            current_item,
            items_processed: self.items_processed.load(Ordering::Relaxed),
            events_produced: self.events_produced.load(Ordering::Relaxed),
        }
    }
}

/// Marks the worker `Errored` if its thread unwinds.
struct PanicGuard<'a>(&'a WorkerMonitor);

impl Drop for PanicGuard<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.set_state(WorkerState::Errored);
        }
    }
}

pub struct Worker {
    id: usize,
    run: Arc<RunContext>,
    registry: Arc<Registry>,
    resolver: EvidenceResolver,
    monitor: Arc<WorkerMonitor>,
}

impl Worker {
    pub fn new(
        id: usize,
        run: Arc<RunContext>,
        registry: Arc<Registry>,
        resolver: EvidenceResolver,
    ) -> Self {
        Self {
            id,
            run,
            registry,
            resolver,
            monitor: Arc::new(WorkerMonitor::new(id)),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn monitor(&self) -> Arc<WorkerMonitor> {
        self.monitor.clone()
    }

    pub fn status(&self) -> WorkerStatus {
        self.monitor.status()
    }

    /// Process items until the input is exhausted, the token is cancelled,
    /// or the output queue is closed.
    pub fn run(
        &self,
        input: &dyn Queue<EvidenceItem>,
        output: &dyn Queue<Event>,
        cancel: &CancelToken,
    ) -> DispatchStats {
        let _guard = PanicGuard(&self.monitor);
        self.monitor.set_state(WorkerState::Running);
        debug!("worker {} started", self.id);

        let mut stats = DispatchStats::default();
        loop {
            if cancel.is_cancelled() {
                debug!("worker {} cancelled", self.id);
                break;
            }
            let Some(item) = input.pop() else {
                break;
            };
            let (item_stats, output_closed) = self.process_item(&item, output);
            stats += item_stats;
            if output_closed {
                warn!("worker {}: output queue closed, stopping", self.id);
                break;
            }
        }

        self.monitor.set_current(None);
        self.monitor.set_state(WorkerState::Stopped);
        info!(
            "worker {} stopped items={} events={} failures={}",
            self.id, stats.items_processed, stats.events_produced, stats.plugin_failures
        );
        stats
    }

    fn process_item(&self, item: &EvidenceItem, output: &dyn Queue<Event>) -> (DispatchStats, bool) {
        self.monitor.set_current(Some(item.to_string()));
        let mut item_stats = DispatchStats::default();
        let output_closed = {
            let mut ctx = ParserContext::new(
                &self.run,
                &self.registry,
                &self.resolver,
                output,
                &mut item_stats,
            );
            ctx.dispatch(item);
            ctx.output_closed()
        };
        item_stats.items_processed = 1;
        self.monitor
            .items_processed
            .fetch_add(1, Ordering::Relaxed);
        self.monitor
            .events_produced
            .fetch_add(item_stats.events_produced, Ordering::Relaxed);
        (item_stats, output_closed)
    }
}

/// A spawned worker: its task plus the monitor used for status reports.
pub struct WorkerTask {
    pub task: TaskHandle<DispatchStats>,
    pub monitor: Arc<WorkerMonitor>,
}

/// Spawn `count` workers bound to the same queues.
pub fn spawn_workers(
    count: usize,
    run: Arc<RunContext>,
    registry: Arc<Registry>,
    resolver: EvidenceResolver,
    input: Arc<ChannelQueue<EvidenceItem>>,
    output: Arc<ChannelQueue<Event>>,
    cancel: CancelToken,
) -> std::io::Result<Vec<WorkerTask>> {
    let mut tasks = Vec::with_capacity(count);
    for id in 0..count.max(1) {
        let worker = Worker::new(id, run.clone(), registry.clone(), resolver.clone());
        let monitor = worker.monitor();
        let input = input.clone();
        let output = output.clone();
        let token = cancel.clone();
        let task = TaskHandle::spawn(format!("Worker_{id}"), cancel.clone(), move || {
            worker.run(input.as_ref(), output.as_ref(), &token)
        })?;
        tasks.push(WorkerTask { task, monitor });
    }
    Ok(tasks)
}
