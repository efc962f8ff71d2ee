//! Closeable queues connecting the pipeline stages.
//!
//! Every queue carries [`QueueEnvelope`]s: payloads followed by at most one
//! end-of-input sentinel. Once a consumer has seen the sentinel, `pop`
//! returns `None` immediately from then on.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};
use std::thread;

use crossbeam_channel::{Receiver, Sender, TryRecvError, bounded, select};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue {0} is closed")]
    Closed(String),
}

/// Unit transported by a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEnvelope<T> {
    Payload(T),
    EndOfInput,
}

/// Shutdown side of a queue, usable without knowing the payload type.
pub trait Closeable: Send + Sync {
    fn name(&self) -> &str;
    fn close(&self);
    fn is_closed(&self) -> bool;
}

pub trait Queue<T> {
    /// Enqueue `item`. Fails once the queue is closed, including when a
    /// blocked push is woken by `close`.
    fn push(&self, item: T) -> Result<(), QueueError>;

    /// Next item, or `None` once the queue is closed and drained.
    fn pop(&self) -> Option<T>;

    /// Idempotent. Broadcasts end-of-input to every consumer.
    fn close(&self);

    fn is_closed(&self) -> bool;

    /// Best-effort length; `None` when the implementation cannot tell.
    fn approximate_length(&self) -> Option<usize>;
}

/// Unbounded single-threaded queue used by the sequential engine.
pub struct SequentialQueue<T> {
    items: RefCell<VecDeque<QueueEnvelope<T>>>,
    closed: Cell<bool>,
    finished: Cell<bool>,
}

impl<T> SequentialQueue<T> {
    pub fn new() -> Self {
        Self {
            items: RefCell::new(VecDeque::new()),
            closed: Cell::new(false),
            finished: Cell::new(false),
        }
    }
}

impl<T> Default for SequentialQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Queue<T> for SequentialQueue<T> {
    fn push(&self, item: T) -> Result<(), QueueError> {
        if self.closed.get() {
            return Err(QueueError::Closed("sequential".to_string()));
        }
        self.items
            .borrow_mut()
            .push_back(QueueEnvelope::Payload(item));
        Ok(())
    }

    fn pop(&self) -> Option<T> {
        if self.finished.get() {
            return None;
        }
        match self.items.borrow_mut().pop_front() {
            Some(QueueEnvelope::Payload(item)) => Some(item),
            Some(QueueEnvelope::EndOfInput) => {
                self.finished.set(true);
                None
            }
            // Nothing buffered: a sequential consumer never waits.
            None => None,
        }
    }

    fn close(&self) {
        if self.closed.replace(true) {
            return;
        }
        self.items.borrow_mut().push_back(QueueEnvelope::EndOfInput);
    }

    fn is_closed(&self) -> bool {
        self.closed.get()
    }

    fn approximate_length(&self) -> Option<usize> {
        let items = self.items.borrow();
        let sentinel = usize::from(matches!(items.back(), Some(QueueEnvelope::EndOfInput)));
        Some(items.len() - sentinel)
    }
}

/// Bounded multi-producer/multi-consumer queue.
///
/// `push` blocks while the queue is full and `pop` blocks while it is empty.
/// `close` wakes both: dropping the close sender disconnects `close_rx`,
/// which every blocked `select!` observes.
///
/// Pushes hold the `sends` read guard from the closed check until the send
/// resolves; `close` takes the write guard before sealing. Every acknowledged
/// payload therefore sits ahead of the end of input.
pub struct ChannelQueue<T> {
    name: String,
    tx: Sender<QueueEnvelope<T>>,
    rx: Receiver<QueueEnvelope<T>>,
    closed: AtomicBool,
    sealed: AtomicBool,
    sends: RwLock<()>,
    sentinel_seen: AtomicBool,
    close_tx: Mutex<Option<Sender<()>>>,
    close_rx: Receiver<()>,
}

impl<T> ChannelQueue<T> {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity.max(1));
        let (close_tx, close_rx) = bounded(0);
        Self {
            name: name.into(),
            tx,
            rx,
            closed: AtomicBool::new(false),
            sealed: AtomicBool::new(false),
            sends: RwLock::new(()),
            sentinel_seen: AtomicBool::new(false),
            close_tx: Mutex::new(Some(close_tx)),
            close_rx,
        }
    }

    pub fn capacity(&self) -> Option<usize> {
        self.tx.capacity()
    }

    fn closed_error(&self) -> QueueError {
        QueueError::Closed(self.name.clone())
    }

    fn unwrap_envelope(&self, envelope: QueueEnvelope<T>) -> Option<T> {
        match envelope {
            QueueEnvelope::Payload(item) => Some(item),
            QueueEnvelope::EndOfInput => {
                self.sentinel_seen.store(true, Ordering::SeqCst);
                None
            }
        }
    }

    /// Drain after close: payloads are handed out until the queue is sealed
    /// and empty.
    fn pop_closed(&self) -> Option<T> {
        loop {
            let sealed = self.sealed.load(Ordering::SeqCst);
            match self.rx.try_recv() {
                Ok(envelope) => return self.unwrap_envelope(envelope),
                Err(TryRecvError::Disconnected) => return None,
                Err(TryRecvError::Empty) if sealed => {
                    self.sentinel_seen.store(true, Ordering::SeqCst);
                    return None;
                }
                // A push admitted before close is still finishing.
                Err(TryRecvError::Empty) => thread::yield_now(),
            }
        }
    }
}

impl<T: Send> Queue<T> for ChannelQueue<T> {
    fn push(&self, item: T) -> Result<(), QueueError> {
        let _admitted = self.sends.read().unwrap_or_else(PoisonError::into_inner);
        if self.closed.load(Ordering::SeqCst) {
            return Err(self.closed_error());
        }
        select! {
            send(self.tx, QueueEnvelope::Payload(item)) -> res => {
                res.map_err(|_| self.closed_error())
            }
            recv(self.close_rx) -> _ => Err(self.closed_error()),
        }
    }

    fn pop(&self) -> Option<T> {
        if self.sentinel_seen.load(Ordering::SeqCst) {
            return None;
        }
        match self.rx.try_recv() {
            Ok(envelope) => return self.unwrap_envelope(envelope),
            Err(TryRecvError::Disconnected) => return None,
            Err(TryRecvError::Empty) => {}
        }
        if self.closed.load(Ordering::SeqCst) {
            return self.pop_closed();
        }
        select! {
            recv(self.rx) -> envelope => match envelope {
                Ok(envelope) => self.unwrap_envelope(envelope),
                Err(_) => None,
            },
            recv(self.close_rx) -> _ => self.pop_closed(),
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Wake blocked pushers first so they release their read guards.
        self.close_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        {
            let _sealing = self.sends.write().unwrap_or_else(PoisonError::into_inner);
            // Best effort: a full queue still ends once sealed and drained.
            let _ = self.tx.try_send(QueueEnvelope::EndOfInput);
            self.sealed.store(true, Ordering::SeqCst);
        }
        debug!("queue {} closed", self.name);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn approximate_length(&self) -> Option<usize> {
        let len = self.rx.len();
        if self.closed.load(Ordering::SeqCst) && len > 0 && !self.sentinel_seen.load(Ordering::SeqCst)
        {
            // May count the sentinel; it is an approximation either way.
            return Some(len.saturating_sub(1));
        }
        Some(len)
    }
}

impl<T: Send> Closeable for ChannelQueue<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn close(&self) {
        Queue::close(self);
    }

    fn is_closed(&self) -> bool {
        Queue::is_closed(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn sequential_preserves_order_then_ends() {
        let queue = SequentialQueue::new();
        for i in 0..5 {
            queue.push(i).expect("push");
        }
        assert_eq!(queue.approximate_length(), Some(5));
        queue.close();
        let drained: Vec<i32> = std::iter::from_fn(|| queue.pop()).collect();
        assert_eq!(drained, vec![0, 1, 2, 3, 4]);
        assert_eq!(queue.pop(), None);
        assert!(queue.push(9).is_err());
    }

    #[test]
    fn sequential_close_twice_is_close_once() {
        let queue = SequentialQueue::new();
        queue.push("a").expect("push");
        queue.close();
        queue.close();
        assert_eq!(queue.approximate_length(), Some(1));
        assert_eq!(queue.pop(), Some("a"));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn channel_preserves_single_producer_order() {
        let queue = ChannelQueue::new("test", 64);
        for i in 0..10 {
            queue.push(i).expect("push");
        }
        Queue::close(&queue);
        let drained: Vec<i32> = std::iter::from_fn(|| queue.pop()).collect();
        assert_eq!(drained, (0..10).collect::<Vec<_>>());

        let start = Instant::now();
        assert_eq!(queue.pop(), None);
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn channel_close_is_idempotent() {
        let queue = ChannelQueue::new("test", 4);
        queue.push(1).expect("push");
        Queue::close(&queue);
        Queue::close(&queue);
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), None);
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn full_queue_blocks_push_until_pop() {
        let queue = Arc::new(ChannelQueue::new("test", 2));
        queue.push(1).expect("push");
        queue.push(2).expect("push");

        let producer = {
            let queue = queue.clone();
            thread::spawn(move || queue.push(3))
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!producer.is_finished());

        assert_eq!(queue.pop(), Some(1));
        assert_eq!(producer.join().expect("join"), Ok(()));
        assert_eq!(queue.approximate_length(), Some(2));
    }

    #[test]
    fn close_fails_blocked_push() {
        let queue = Arc::new(ChannelQueue::new("test", 1));
        queue.push(1).expect("push");

        let producer = {
            let queue = queue.clone();
            thread::spawn(move || queue.push(2))
        };
        thread::sleep(Duration::from_millis(50));
        Queue::close(queue.as_ref());
        assert!(producer.join().expect("join").is_err());
    }

    #[test]
    fn close_wakes_blocked_pop() {
        let queue: Arc<ChannelQueue<u32>> = Arc::new(ChannelQueue::new("test", 4));
        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || queue.pop())
        };
        thread::sleep(Duration::from_millis(50));
        Queue::close(queue.as_ref());
        assert_eq!(consumer.join().expect("join"), None);
    }

    #[test]
    fn every_consumer_sees_end_of_input() {
        let queue: Arc<ChannelQueue<u32>> = Arc::new(ChannelQueue::new("test", 4));
        let consumers: Vec<_> = (0..3)
            .map(|_| {
                let queue = queue.clone();
                thread::spawn(move || std::iter::from_fn(|| queue.pop()).count())
            })
            .collect();
        for i in 0..3 {
            queue.push(i).expect("push");
        }
        Queue::close(queue.as_ref());
        let total: usize = consumers
            .into_iter()
            .map(|handle| handle.join().expect("join"))
            .sum();
        assert_eq!(total, 3);
    }
}
