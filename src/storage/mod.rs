//! # Storage
//!
//! The storage writer drains the output queue into an [`EventStore`],
//! batching events and flushing each batch as one unit. Run metadata is
//! written exactly once per store.

pub mod jsonl;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::event::Event;
use crate::pipeline::queue::Queue;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("storage writer already closed")]
    Closed,
    #[error("storage error: {0}")]
    Other(String),
}

/// Facts about the run, recorded before processing starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub version: String,
    pub configured_zone: String,
    pub detected_zone: Option<String>,
    pub zone: String,
    pub file_processed: String,
    pub output_file: String,
    pub buffer_size: u64,
    pub time_of_run: DateTime<Utc>,
    /// Plugin names by category.
    pub parsers: BTreeMap<String, Vec<String>>,
    pub preprocess: bool,
    pub recursive: bool,
    pub debug: bool,
    pub vss_parsing: bool,
    pub vss_stores: Option<Vec<u32>>,
    pub filter: String,
    pub file_filter: Option<String>,
    pub os_detected: String,
    pub hostname: Option<String>,
    /// `image processed` or `OS collection`.
    pub method: String,
    pub image_offset: Option<u64>,
    /// `single threaded` or `multi threaded`.
    pub runtime: String,
    pub workers: Option<usize>,
    pub config_hash: String,
}

/// Persistence backend for events. Implementations must write a batch as
/// one unit and keep the order events were given in.
pub trait EventStore: Send {
    fn write_batch(&mut self, events: &[Event]) -> Result<(), StorageError>;
    fn write_metadata(&mut self, metadata: &RunMetadata) -> Result<(), StorageError>;
    fn finalize(&mut self) -> Result<(), StorageError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StorageStats {
    pub events_stored: u64,
    pub batches_flushed: u64,
}

pub struct StorageWriter {
    store: Box<dyn EventStore>,
    buffer: Vec<Event>,
    buffered_bytes: usize,
    max_bytes: usize,
    max_events: usize,
    metadata: RunMetadata,
    metadata_written: bool,
    closed: bool,
    stats: StorageStats,
}

impl StorageWriter {
    /// Flushes whenever the buffer reaches `buffer_size` estimated bytes or
    /// `flush_max_events` events.
    pub fn new(
        store: Box<dyn EventStore>,
        buffer_size: u64,
        flush_max_events: usize,
        metadata: RunMetadata,
    ) -> Self {
        Self {
            store,
            buffer: Vec::new(),
            buffered_bytes: 0,
            max_bytes: usize::try_from(buffer_size).unwrap_or(usize::MAX).max(1),
            max_events: flush_max_events.max(1),
            metadata,
            metadata_written: false,
            closed: false,
            stats: StorageStats::default(),
        }
    }

    pub fn stats(&self) -> StorageStats {
        self.stats
    }

    /// Persist the run metadata if that has not happened yet.
    pub fn write_metadata(&mut self) -> Result<(), StorageError> {
        if self.metadata_written {
            return Ok(());
        }
        self.store.write_metadata(&self.metadata)?;
        self.metadata_written = true;
        Ok(())
    }

    pub fn add_entry(&mut self, event: Event) -> Result<(), StorageError> {
        if self.closed {
            return Err(StorageError::Closed);
        }
        self.buffered_bytes += event.estimated_size();
        self.buffer.push(event);
        if self.buffered_bytes >= self.max_bytes || self.buffer.len() >= self.max_events {
            self.flush()?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), StorageError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        self.store.write_batch(&self.buffer)?;
        self.stats.events_stored += self.buffer.len() as u64;
        self.stats.batches_flushed += 1;
        debug!(
            "flushed batch events={} bytes={}",
            self.buffer.len(),
            self.buffered_bytes
        );
        self.buffer.clear();
        self.buffered_bytes = 0;
        Ok(())
    }

    /// Flush the remainder, write metadata if still pending, and finalize
    /// the store. Idempotent.
    pub fn close(&mut self) -> Result<StorageStats, StorageError> {
        if self.closed {
            return Ok(self.stats);
        }
        self.flush()?;
        self.write_metadata()?;
        self.store.finalize()?;
        self.closed = true;
        info!(
            "storage closed events={} batches={}",
            self.stats.events_stored, self.stats.batches_flushed
        );
        Ok(self.stats)
    }

    /// Consume `queue` until end-of-input, then close.
    pub fn drain(&mut self, queue: &dyn Queue<Event>) -> Result<StorageStats, StorageError> {
        self.write_metadata()?;
        while let Some(event) = queue.pop() {
            self.add_entry(event)?;
        }
        self.close()
    }
}
