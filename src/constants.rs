//! Shared defaults and limits.

pub const TOOL_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const MIB: u64 = 1024 * 1024;

/// Bytes per sector when an image offset is given in sectors.
pub const SECTOR_SIZE: u64 = 512;

/// Per-worker slots in the bounded ingestion queue.
pub const CHANNEL_CAPACITY_MULTIPLIER: usize = 16;
pub const MIN_CHANNEL_CAPACITY: usize = 64;

pub const DEFAULT_BUFFER_SIZE: u64 = 4 * MIB;
pub const DEFAULT_FLUSH_MAX_EVENTS: usize = 10_000;
pub const DEFAULT_MAX_RECURSION_DEPTH: usize = 16;
pub const DEFAULT_JOIN_TIMEOUT_MS: u64 = 5_000;

/// How much of an item is read to sniff its format category.
pub const SNIFF_HEADER_LEN: usize = 4096;

pub const JOIN_POLL_INTERVAL_MS: u64 = 20;

pub const EVENTS_FILE_NAME: &str = "events.jsonl";
pub const METADATA_FILE_NAME: &str = "run_metadata.json";
