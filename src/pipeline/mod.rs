//! # Pipeline Module
//!
//! Queues, tasks and workers that connect collection, dispatch and storage.

pub mod queue;
pub mod tasks;
pub mod workers;

use std::sync::Arc;

use crate::constants::{CHANNEL_CAPACITY_MULTIPLIER, MIN_CHANNEL_CAPACITY};
use crate::event::Event;
use crate::evidence::EvidenceItem;

use queue::{ChannelQueue, Closeable};

/// The two bounded queues of a parallel run.
pub struct PipelineQueues {
    pub ingest: Arc<ChannelQueue<EvidenceItem>>,
    pub output: Arc<ChannelQueue<Event>>,
}

impl PipelineQueues {
    /// `capacity` overrides the derived size, which scales with the worker
    /// count; the output queue then gets twice the ingestion capacity.
    pub fn new(workers: usize, capacity: Option<usize>) -> Self {
        let (ingest_cap, output_cap) = match capacity {
            Some(cap) => (cap.max(1), cap.max(1)),
            None => {
                let cap = workers
                    .saturating_mul(CHANNEL_CAPACITY_MULTIPLIER)
                    .max(MIN_CHANNEL_CAPACITY);
                (cap, cap * 2)
            }
        };
        Self {
            ingest: Arc::new(ChannelQueue::new("ingest", ingest_cap)),
            output: Arc::new(ChannelQueue::new("output", output_cap)),
        }
    }

    pub fn closeables(&self) -> Vec<Arc<dyn Closeable>> {
        vec![
            self.ingest.clone() as Arc<dyn Closeable>,
            self.output.clone() as Arc<dyn Closeable>,
        ]
    }
}
