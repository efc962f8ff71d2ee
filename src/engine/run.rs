use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::constants::JOIN_POLL_INTERVAL_MS;
use crate::event::Event;
use crate::evidence::{Collector, EvidenceItem, EvidenceResolver};
use crate::pipeline::PipelineQueues;
use crate::pipeline::queue::{Queue, SequentialQueue};
use crate::pipeline::tasks::{CancelToken, TaskExit, TaskHandle};
use crate::pipeline::workers::{DispatchStats, Worker, WorkerState, WorkerTask, spawn_workers};
use crate::storage::{StorageStats, StorageWriter};

use super::shutdown::EngineShared;
use super::{EngineError, EngineState, PreparedRun, RunStats};

/// A started run. [`RunningEngine::join`] drives it to the end.
pub struct RunningEngine {
    shared: Arc<EngineShared>,
    join_timeout: Duration,
    mode: Mode,
}

enum Mode {
    /// Nothing runs until `join`, which does all the work on the calling thread.
    Sequential(Box<PreparedRun>),
    Parallel(ParallelRun),
}

struct ParallelRun {
    queues: PipelineQueues,
    storage: TaskHandle<Result<StorageStats, crate::storage::StorageError>>,
    collector: Option<TaskHandle<Result<u64, crate::evidence::EvidenceError>>>,
    items_collected: u64,
    workers: Vec<WorkerTask>,
}

impl RunningEngine {
    pub(crate) fn start(
        prepared: PreparedRun,
        shared: Arc<EngineShared>,
    ) -> Result<Self, EngineError> {
        let join_timeout = Duration::from_millis(prepared.loaded.config.join_timeout_ms);
        let mode = if prepared.loaded.config.single_threaded {
            shared.set_post_mortem_mode(prepared.loaded.config.debug);
            info!("starting sequential run");
            Mode::Sequential(Box::new(prepared))
        } else {
            Mode::Parallel(start_parallel(prepared, &shared)?)
        };
        Ok(Self {
            shared,
            join_timeout,
            mode,
        })
    }

    pub fn state(&self) -> EngineState {
        self.shared.state()
    }

    /// Wait for every stage to finish and return the run totals.
    pub fn join(self) -> Result<RunStats, EngineError> {
        let shared = self.shared.clone();
        let result = match self.mode {
            Mode::Sequential(prepared) => run_sequential(*prepared, &shared),
            Mode::Parallel(run) => join_parallel(run, &shared, self.join_timeout),
        };
        shared.set_post_mortem_mode(false);
        match result {
            Ok(stats) if shared.force_terminated() => {
                stats.log_summary();
                Err(EngineError::Interrupted)
            }
            Ok(stats) => {
                shared.set_state(EngineState::Stopped);
                stats.log_summary();
                Ok(stats)
            }
            Err(err) => {
                shared.set_state(EngineState::Error);
                Err(err)
            }
        }
    }
}

fn collector_for(prepared: &PreparedRun) -> Collector {
    Collector::new(prepared.source.clone())
        .with_path_filter(prepared.path_filter.clone())
        .with_shadow_stores(prepared.shadow_stores.clone())
        .with_volume(prepared.volume.clone())
}

fn run_sequential(prepared: PreparedRun, shared: &EngineShared) -> Result<RunStats, EngineError> {
    let collector = collector_for(&prepared);
    let ingest: SequentialQueue<EvidenceItem> = SequentialQueue::new();
    let output: SequentialQueue<Event> = SequentialQueue::new();
    let config = &prepared.loaded.config;

    shared.set_state(EngineState::Running {
        collecting: true,
        dispatching: false,
        storing: false,
    });
    let items_collected = collector.run(&ingest, &shared.collector_cancel)?;

    shared.set_state(EngineState::Running {
        collecting: false,
        dispatching: true,
        storing: false,
    });
    let worker = Worker::new(
        0,
        prepared.run.clone(),
        prepared.registry.clone(),
        EvidenceResolver::new(prepared.volume.clone()),
    );
    shared.register_monitor(worker.monitor());
    let dispatch = worker.run(&ingest, &output, &shared.worker_cancel);
    Queue::close(&output);

    shared.set_state(EngineState::Running {
        collecting: false,
        dispatching: false,
        storing: true,
    });
    let mut writer = StorageWriter::new(
        prepared.store,
        config.buffer_size,
        config.flush_max_events,
        prepared.metadata,
    );
    let storage = writer.drain(&output)?;

    Ok(RunStats {
        items_collected,
        dispatch,
        events_stored: storage.events_stored,
        batches_flushed: storage.batches_flushed,
        workers_lost: 0,
        interrupted: shared.stop_requested(),
    })
}

fn spawn_error(task: &str) -> impl FnOnce(std::io::Error) -> EngineError + '_ {
    move |source| EngineError::Spawn {
        task: task.to_string(),
        source,
    }
}

fn start_parallel(prepared: PreparedRun, shared: &Arc<EngineShared>) -> Result<ParallelRun, EngineError> {
    let collector = collector_for(&prepared);
    let config = &prepared.loaded.config;
    let single_file = prepared.source.is_single_file();
    let worker_count = if single_file { 1 } else { config.worker_count.max(1) };
    let queues = PipelineQueues::new(worker_count, config.queue_capacity);
    shared.register_queues(queues.closeables());
    info!(
        "starting parallel run workers={worker_count} ingest_capacity={:?} output_capacity={:?}",
        queues.ingest.capacity(),
        queues.output.capacity()
    );

    let mut writer = StorageWriter::new(
        prepared.store,
        config.buffer_size,
        config.flush_max_events,
        prepared.metadata,
    );
    let storage = {
        let output = queues.output.clone();
        let shared = shared.clone();
        TaskHandle::spawn("StorageWriter", CancelToken::new(), move || {
            let result = writer.drain(output.as_ref());
            if let Err(err) = &result {
                shared.abort(&format!("storage writer failed: {err}"));
            }
            result
        })
        .map_err(spawn_error("StorageWriter"))?
    };

    let (collector_task, items_collected) = if single_file {
        // One item: collect it here, before any worker exists.
        let count = match collector.run(queues.ingest.as_ref(), &shared.collector_cancel) {
            Ok(count) => count,
            Err(err) => {
                shared.abort(&format!("collection failed: {err}"));
                let _ = storage.join();
                return Err(err.into());
            }
        };
        (None, count)
    } else {
        let ingest = queues.ingest.clone();
        let token = shared.collector_cancel.clone();
        let task = TaskHandle::spawn("Collection", token.clone(), move || {
            collector.run(ingest.as_ref(), &token)
        });
        match task {
            Ok(task) => (Some(task), 0),
            Err(err) => {
                shared.abort("collector could not be started");
                let _ = storage.join();
                return Err(spawn_error("Collection")(err));
            }
        }
    };

    let workers = match spawn_workers(
        worker_count,
        prepared.run.clone(),
        prepared.registry.clone(),
        EvidenceResolver::new(prepared.volume.clone()),
        queues.ingest.clone(),
        queues.output.clone(),
        shared.worker_cancel.clone(),
    ) {
        Ok(workers) => workers,
        Err(err) => {
            shared.abort("workers could not be started");
            if let Some(task) = collector_task {
                let _ = task.join();
            }
            let _ = storage.join();
            return Err(spawn_error("Worker")(err));
        }
    };
    for worker in &workers {
        shared.register_monitor(worker.monitor.clone());
    }

    shared.set_state(EngineState::Running {
        collecting: collector_task.is_some(),
        dispatching: true,
        storing: true,
    });
    Ok(ParallelRun {
        queues,
        storage,
        collector: collector_task,
        items_collected,
        workers,
    })
}

/// Wait for `task`; once a stop was requested, give it `timeout` and then
/// abandon it.
fn await_task<T: Send + 'static>(
    task: TaskHandle<T>,
    shared: &EngineShared,
    timeout: Duration,
) -> TaskExit<T> {
    let poll = Duration::from_millis(JOIN_POLL_INTERVAL_MS);
    loop {
        if task.is_finished() {
            return task.join();
        }
        if shared.stop_requested() {
            return task.join_timeout(timeout);
        }
        thread::sleep(poll);
    }
}

fn join_parallel(
    run: ParallelRun,
    shared: &EngineShared,
    timeout: Duration,
) -> Result<RunStats, EngineError> {
    let ParallelRun {
        queues,
        storage,
        collector,
        mut items_collected,
        workers,
    } = run;
    let mut fatal: Option<EngineError> = None;

    if let Some(task) = collector {
        match await_task(task, shared, timeout) {
            TaskExit::Completed(Ok(count)) => items_collected = count,
            TaskExit::Completed(Err(err)) => {
                shared.abort(&format!("collection failed: {err}"));
                fatal = Some(err.into());
            }
            TaskExit::Panicked(reason) => {
                shared.abort(&format!("collector panicked: {reason}"));
                fatal = Some(EngineError::TaskFailed {
                    task: "Collection".to_string(),
                    reason,
                });
            }
            TaskExit::Abandoned => warn!("collector did not stop in time"),
        }
        // Workers must see end-of-input whatever happened to the collector.
        Queue::close(queues.ingest.as_ref());
        if !shared.stop_requested() {
            shared.set_state(EngineState::Running {
                collecting: false,
                dispatching: true,
                storing: true,
            });
        }
    }

    let mut dispatch = DispatchStats::default();
    let mut workers_lost = 0u64;
    for WorkerTask { task, monitor } in workers {
        if task.is_finished() && monitor.state() == WorkerState::Errored {
            warn!("worker {} found dead", monitor.id());
            workers_lost += 1;
            continue;
        }
        match await_task(task, shared, timeout) {
            TaskExit::Completed(stats) => dispatch += stats,
            TaskExit::Panicked(reason) => {
                warn!("worker {} died: {reason}", monitor.id());
                workers_lost += 1;
            }
            TaskExit::Abandoned => {
                warn!("worker {} abandoned", monitor.id());
                workers_lost += 1;
            }
        }
    }

    if !shared.stop_requested() {
        shared.set_state(EngineState::Draining);
    }
    debug!("closing output queue");
    Queue::close(queues.output.as_ref());

    let mut storage_stats = StorageStats::default();
    match await_task(storage, shared, timeout) {
        TaskExit::Completed(Ok(stats)) => storage_stats = stats,
        TaskExit::Completed(Err(err)) => {
            fatal = Some(err.into());
        }
        TaskExit::Panicked(reason) => {
            fatal = fatal.or(Some(EngineError::TaskFailed {
                task: "StorageWriter".to_string(),
                reason,
            }));
        }
        TaskExit::Abandoned => {
            fatal = fatal.or(Some(EngineError::TaskFailed {
                task: "StorageWriter".to_string(),
                reason: "did not stop in time".to_string(),
            }));
        }
    }

    if let Some(err) = fatal {
        return Err(err);
    }
    Ok(RunStats {
        items_collected,
        dispatch,
        events_stored: storage_stats.events_stored,
        batches_flushed: storage_stats.batches_flushed,
        workers_lost,
        interrupted: shared.stop_requested(),
    })
}
