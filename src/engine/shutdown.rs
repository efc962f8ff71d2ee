//! Cancellation entry points shared between the engine and signal handlers.

use std::io::{BufRead, IsTerminal, Write};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use tracing::{info, warn};

use crate::pipeline::queue::Closeable;
use crate::pipeline::tasks::CancelToken;
use crate::pipeline::workers::{WorkerMonitor, WorkerStatus};

use super::EngineState;

/// What the caller of [`ShutdownHandle::interrupt`] should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptAction {
    /// A graceful stop was requested; the run drains and ends on its own.
    Draining,
    /// Second interrupt: everything was cancelled, exit immediately.
    Terminate,
}

pub(crate) struct EngineShared {
    state: Mutex<EngineState>,
    stop_requested: AtomicBool,
    force_terminated: AtomicBool,
    interrupts: AtomicU32,
    post_mortem_mode: AtomicBool,
    inspecting: AtomicBool,
    queues: Mutex<Vec<Arc<dyn Closeable>>>,
    monitors: Mutex<Vec<Arc<WorkerMonitor>>>,
    pub(crate) collector_cancel: CancelToken,
    pub(crate) worker_cancel: CancelToken,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl EngineShared {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(EngineState::Idle),
            stop_requested: AtomicBool::new(false),
            force_terminated: AtomicBool::new(false),
            interrupts: AtomicU32::new(0),
            post_mortem_mode: AtomicBool::new(false),
            inspecting: AtomicBool::new(false),
            queues: Mutex::new(Vec::new()),
            monitors: Mutex::new(Vec::new()),
            collector_cancel: CancelToken::new(),
            worker_cancel: CancelToken::new(),
        }
    }

    pub(crate) fn state(&self) -> EngineState {
        *lock(&self.state)
    }

    pub(crate) fn set_state(&self, state: EngineState) {
        let mut guard = lock(&self.state);
        // Error is terminal.
        if *guard != EngineState::Error {
            *guard = state;
        }
    }

    pub(crate) fn register_queues(&self, queues: Vec<Arc<dyn Closeable>>) {
        lock(&self.queues).extend(queues);
    }

    pub(crate) fn register_monitor(&self, monitor: Arc<WorkerMonitor>) {
        lock(&self.monitors).push(monitor);
    }

    pub(crate) fn set_post_mortem_mode(&self, enabled: bool) {
        self.post_mortem_mode.store(enabled, Ordering::SeqCst);
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    pub(crate) fn force_terminated(&self) -> bool {
        self.force_terminated.load(Ordering::SeqCst)
    }

    fn close_queues(&self) {
        for queue in lock(&self.queues).iter() {
            queue.close();
        }
    }

    fn cancel_all(&self) {
        self.collector_cancel.cancel();
        self.close_queues();
        self.worker_cancel.cancel();
    }

    /// Fatal failure inside a task: stop everything and mark the run failed.
    pub(crate) fn abort(&self, reason: &str) {
        warn!("aborting run: {reason}");
        self.stop_requested.store(true, Ordering::SeqCst);
        self.set_state(EngineState::Error);
        self.cancel_all();
    }

    fn worker_statuses(&self) -> Vec<WorkerStatus> {
        lock(&self.monitors).iter().map(|m| m.status()).collect()
    }

    fn post_mortem(&self) {
        let mut stderr = std::io::stderr().lock();
        let _ = writeln!(stderr, "=== post-mortem ===");
        let _ = writeln!(stderr, "engine state: {:?}", self.state());
        for status in self.worker_statuses() {
            let _ = writeln!(
                stderr,
                "worker {} {:?} items={} events={} current={}",
                status.id,
                status.state,
                status.items_processed,
                status.events_produced,
                status.current_item.as_deref().unwrap_or("-")
            );
        }
        let stdin = std::io::stdin();
        if stdin.is_terminal() {
            let _ = writeln!(stderr, "press Enter to resume, interrupt again to terminate");
            drop(stderr);
            let mut line = String::new();
            let _ = stdin.lock().read_line(&mut line);
        }
    }
}

/// Cloneable handle for stopping a run from any thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    pub(crate) shared: Arc<EngineShared>,
}

impl ShutdownHandle {
    pub fn state(&self) -> EngineState {
        self.shared.state()
    }

    pub fn is_stop_requested(&self) -> bool {
        self.shared.stop_requested()
    }

    pub fn worker_statuses(&self) -> Vec<WorkerStatus> {
        self.shared.worker_statuses()
    }

    /// Close every queue and cancel the collector and workers. Safe in any
    /// state and idempotent. In sequential debug runs this opens the
    /// post-mortem inspection instead.
    pub fn stop_threads(&self) {
        let shared = &self.shared;
        if shared.post_mortem_mode.load(Ordering::SeqCst) {
            self.open_post_mortem();
            return;
        }
        if shared.stop_requested.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("stopping threads");
        if matches!(shared.state(), EngineState::Running { .. }) {
            shared.set_state(EngineState::Draining);
        }
        shared.cancel_all();
    }

    /// Runs the inspection on its own thread so the caller, usually the
    /// signal handler, stays free to take the next interrupt.
    fn open_post_mortem(&self) {
        if self.shared.inspecting.swap(true, Ordering::SeqCst) {
            return;
        }
        let shared = self.shared.clone();
        let spawned = thread::Builder::new()
            .name("PostMortem".to_string())
            .spawn(move || {
                shared.post_mortem();
                shared.inspecting.store(false, Ordering::SeqCst);
            });
        if let Err(err) = spawned {
            warn!("post-mortem inspection unavailable: {err}");
            self.shared.inspecting.store(false, Ordering::SeqCst);
        }
    }

    /// First call stops gracefully, any later call terminates.
    pub fn interrupt(&self) -> InterruptAction {
        let count = self.shared.interrupts.fetch_add(1, Ordering::SeqCst) + 1;
        if count == 1 {
            self.stop_threads();
            InterruptAction::Draining
        } else {
            self.force_terminate();
            InterruptAction::Terminate
        }
    }

    pub fn force_terminate(&self) {
        let shared = &self.shared;
        warn!("forcing termination");
        shared.force_terminated.store(true, Ordering::SeqCst);
        shared.stop_requested.store(true, Ordering::SeqCst);
        shared.set_state(EngineState::Error);
        shared.cancel_all();
    }
}
