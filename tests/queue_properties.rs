use std::sync::Arc;
use std::thread;
use std::time::Duration;

use plumbline::pipeline::queue::{ChannelQueue, Queue, QueueError, SequentialQueue};

fn drain<Q: Queue<u32> + ?Sized>(queue: &Q) -> Vec<u32> {
    std::iter::from_fn(|| queue.pop()).collect()
}

#[test]
fn single_producer_order_then_sentinel() {
    let sequential = SequentialQueue::new();
    let channel = ChannelQueue::new("props", 64);
    for n in 0..50u32 {
        sequential.push(n).expect("push");
        channel.push(n).expect("push");
    }
    Queue::close(&sequential);
    Queue::close(&channel);

    let expected: Vec<u32> = (0..50).collect();
    assert_eq!(drain(&sequential), expected);
    assert_eq!(drain(&channel), expected);
    // Pop after the sentinel returns at once.
    assert_eq!(sequential.pop(), None);
    assert_eq!(channel.pop(), None);
}

#[test]
fn closing_twice_is_closing_once() {
    let channel = ChannelQueue::new("twice", 4);
    channel.push(1u32).expect("push");
    Queue::close(&channel);
    Queue::close(&channel);
    assert!(Queue::is_closed(&channel));
    assert_eq!(drain(&channel), vec![1]);
    assert_eq!(
        channel.push(2),
        Err(QueueError::Closed("twice".to_string()))
    );
}

#[test]
fn close_wakes_blocked_consumer_and_producer() {
    let queue: Arc<ChannelQueue<u32>> = Arc::new(ChannelQueue::new("wake", 1));
    queue.push(0).expect("fill");

    let producer = {
        let queue = queue.clone();
        thread::spawn(move || queue.push(1))
    };
    thread::sleep(Duration::from_millis(50));
    Queue::close(queue.as_ref());
    assert!(producer.join().expect("producer").is_err());

    assert_eq!(queue.pop(), Some(0));
    let consumer = {
        let queue = queue.clone();
        thread::spawn(move || queue.pop())
    };
    assert_eq!(consumer.join().expect("consumer"), None);
}

#[test]
fn push_beyond_capacity_blocks_until_pop() {
    let queue: Arc<ChannelQueue<u32>> = Arc::new(ChannelQueue::new("full", 3));
    for n in 0..3 {
        queue.push(n).expect("push");
    }
    let producer = {
        let queue = queue.clone();
        thread::spawn(move || queue.push(3))
    };
    thread::sleep(Duration::from_millis(100));
    assert!(!producer.is_finished());

    assert_eq!(queue.pop(), Some(0));
    producer.join().expect("producer").expect("push after pop");
    Queue::close(queue.as_ref());
    assert_eq!(drain(queue.as_ref()), vec![1, 2, 3]);
}

#[test]
fn every_item_from_many_producers_is_delivered_once() {
    let queue: Arc<ChannelQueue<u32>> = Arc::new(ChannelQueue::new("mpmc", 8));
    let producers: Vec<_> = (0..4u32)
        .map(|p| {
            let queue = queue.clone();
            thread::spawn(move || {
                for n in 0..100u32 {
                    queue.push(p * 1000 + n).expect("push");
                }
            })
        })
        .collect();
    let consumers: Vec<_> = (0..3)
        .map(|_| {
            let queue = queue.clone();
            thread::spawn(move || drain(queue.as_ref()))
        })
        .collect();

    for producer in producers {
        producer.join().expect("producer");
    }
    Queue::close(queue.as_ref());

    let mut seen: Vec<u32> = consumers
        .into_iter()
        .flat_map(|c| c.join().expect("consumer"))
        .collect();
    assert_eq!(seen.len(), 400);
    seen.sort_unstable();
    seen.dedup();
    assert_eq!(seen.len(), 400);
}

#[test]
fn acknowledged_pushes_racing_close_are_delivered() {
    for _ in 0..500 {
        let queue: Arc<ChannelQueue<u32>> = Arc::new(ChannelQueue::new("race", 4096));
        let pushers: Vec<_> = (0..4u32)
            .map(|p| {
                let queue = queue.clone();
                thread::spawn(move || {
                    (0..200u32)
                        .filter(|n| queue.push(p * 1000 + n).is_ok())
                        .count()
                })
            })
            .collect();
        thread::yield_now();
        Queue::close(queue.as_ref());

        let acknowledged: usize = pushers
            .into_iter()
            .map(|p| p.join().expect("pusher"))
            .sum();
        assert_eq!(drain(queue.as_ref()).len(), acknowledged);
        assert!(queue.push(1).is_err());
    }
}

#[test]
fn approximate_length_never_fails() {
    let channel = ChannelQueue::new("len", 8);
    channel.push(1u32).expect("push");
    channel.push(2u32).expect("push");
    assert_eq!(channel.approximate_length(), Some(2));
    let sequential: SequentialQueue<u32> = SequentialQueue::new();
    assert_eq!(sequential.approximate_length(), Some(0));
}
