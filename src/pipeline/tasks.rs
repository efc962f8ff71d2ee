//! Named execution units with cooperative cancellation.
//!
//! A task is a thread plus a [`CancelToken`]. Forced termination is
//! cancellation followed, if the thread still does not finish within the
//! join timeout, by detaching it: the engine stops waiting and the thread
//! is abandoned to exit on its own.

use std::panic;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::constants::JOIN_POLL_INTERVAL_MS;

#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub enum TaskExit<T> {
    Completed(T),
    Panicked(String),
    /// Did not stop within the join timeout and was detached.
    Abandoned,
}

impl<T> TaskExit<T> {
    pub fn completed(self) -> Option<T> {
        match self {
            TaskExit::Completed(value) => Some(value),
            _ => None,
        }
    }
}

pub struct TaskHandle<T> {
    name: String,
    cancel: CancelToken,
    handle: JoinHandle<T>,
}

impl<T: Send + 'static> TaskHandle<T> {
    pub fn spawn<F>(name: impl Into<String>, cancel: CancelToken, f: F) -> std::io::Result<Self>
    where
        F: FnOnce() -> T + Send + 'static,
    {
        let name = name.into();
        let handle = thread::Builder::new().name(name.clone()).spawn(f)?;
        debug!("task {name} started");
        Ok(Self {
            name,
            cancel,
            handle,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn join(self) -> TaskExit<T> {
        let name = self.name;
        match self.handle.join() {
            Ok(value) => {
                debug!("task {name} joined");
                TaskExit::Completed(value)
            }
            Err(payload) => TaskExit::Panicked(panic_message(payload.as_ref())),
        }
    }

    /// Join, but give up after `timeout`: the task is cancelled and, if
    /// still running, detached.
    pub fn join_timeout(self, timeout: Duration) -> TaskExit<T> {
        let deadline = Instant::now() + timeout;
        let poll = Duration::from_millis(JOIN_POLL_INTERVAL_MS);
        while !self.handle.is_finished() {
            if Instant::now() >= deadline {
                self.cancel.cancel();
                warn!(
                    "task {} did not stop within {}ms, abandoning it",
                    self.name,
                    timeout.as_millis()
                );
                return TaskExit::Abandoned;
            }
            thread::sleep(poll);
        }
        self.join()
    }
}

pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Run `f`, turning a panic into an error message.
pub fn catch_panic<R>(f: impl FnOnce() -> R) -> Result<R, String> {
    panic::catch_unwind(panic::AssertUnwindSafe(f)).map_err(|payload| panic_message(payload.as_ref()))
}
