//! Shared test infrastructure for engine integration tests.
//!
//! Fixture plugins, stores with controllable behavior, config builders and
//! readers for the JSONL output.

#![allow(dead_code)]

use std::io::{BufRead, BufReader, Cursor};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::DateTime;

use plumbline::config::{EngineConfig, LoadedConfig};
use plumbline::constants::{EVENTS_FILE_NAME, METADATA_FILE_NAME};
use plumbline::event::{Event, TimestampUsage};
use plumbline::evidence::{EvidenceError, EvidenceItem, ImageBackend, ImageVolume, ItemReader};
use plumbline::plugins::{
    ApplicabilitySignature, ParserContext, Plugin, PluginDescriptor, ProcessOutcome, Registry,
};
use plumbline::storage::{EventStore, RunMetadata, StorageError};

// ============================================================================
// Fixture Plugins
// ============================================================================

pub const LINE_DATA_TYPE: &str = "test:line";

static LINE_ECHO: PluginDescriptor = PluginDescriptor {
    name: "line_echo",
    description: "One event per non-empty line",
    category: "text",
    signature: ApplicabilitySignature::ANY,
    weight: 1,
    presets: &[],
};

/// Emits one event per non-empty line, with the line as attribute `line`.
pub struct LineEchoPlugin;

impl Plugin for LineEchoPlugin {
    fn descriptor(&self) -> &PluginDescriptor {
        &LINE_ECHO
    }

    fn process(&self, ctx: &mut ParserContext<'_>, item: &EvidenceItem) -> ProcessOutcome {
        let reader = match ctx.open_item(item) {
            Ok(reader) => BufReader::new(reader),
            Err(err) => return err.into(),
        };
        for (n, line) in reader.lines().enumerate() {
            let Ok(line) = line else {
                return ProcessOutcome::Failed("unreadable line".to_string());
            };
            if line.is_empty() {
                continue;
            }
            let ts = DateTime::from_timestamp(1_700_000_000 + n as i64, 0).expect("timestamp");
            let event = Event::new(ts, TimestampUsage::Written, LINE_DATA_TYPE)
                .with_attribute("line", line)
                .with_attribute("file", item.location().display().to_string());
            if let Err(err) = ctx.produce_event(event) {
                return err.into();
            }
        }
        ProcessOutcome::Applicable
    }
}

static PANICKING: PluginDescriptor = PluginDescriptor {
    name: "panicking",
    description: "Panics on every item",
    category: "text",
    signature: ApplicabilitySignature::ANY,
    weight: 0,
    presets: &[],
};

pub struct PanickingPlugin;

impl Plugin for PanickingPlugin {
    fn descriptor(&self) -> &PluginDescriptor {
        &PANICKING
    }

    fn process(&self, _ctx: &mut ParserContext<'_>, _item: &EvidenceItem) -> ProcessOutcome {
        panic!("fixture plugin failure");
    }
}

pub fn line_registry() -> Registry {
    let mut builder = Registry::builder();
    builder.register(Arc::new(LineEchoPlugin)).expect("register");
    builder.build()
}

pub fn registry_with_failing_plugin() -> Registry {
    let mut builder = Registry::builder();
    builder
        .register(Arc::new(PanickingPlugin))
        .expect("register")
        .register(Arc::new(LineEchoPlugin))
        .expect("register");
    builder.build()
}

// ============================================================================
// Stores
// ============================================================================

/// Counts what was written; optionally sleeps before each batch.
#[derive(Clone, Default)]
pub struct CountingStore {
    pub events: Arc<AtomicU64>,
    pub batches: Arc<AtomicU64>,
    pub metadata: Arc<Mutex<Option<RunMetadata>>>,
    pub delay: Duration,
}

impl CountingStore {
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn events(&self) -> u64 {
        self.events.load(Ordering::SeqCst)
    }
}

impl EventStore for CountingStore {
    fn write_batch(&mut self, events: &[Event]) -> Result<(), StorageError> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        self.events.fetch_add(events.len() as u64, Ordering::SeqCst);
        self.batches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn write_metadata(&mut self, metadata: &RunMetadata) -> Result<(), StorageError> {
        *self.metadata.lock().expect("lock") = Some(metadata.clone());
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Every batch write fails.
pub struct BrokenStore;

impl EventStore for BrokenStore {
    fn write_batch(&mut self, _events: &[Event]) -> Result<(), StorageError> {
        Err(StorageError::Other("device full".to_string()))
    }

    fn write_metadata(&mut self, _metadata: &RunMetadata) -> Result<(), StorageError> {
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), StorageError> {
        Ok(())
    }
}

// ============================================================================
// Image Volumes
// ============================================================================

/// In-memory volume: named entries plus shadow stores of named entries.
/// Opening the `poisoned` entry panics, as a broken filesystem backend would.
#[derive(Default)]
pub struct FakeVolume {
    pub entries: Vec<(String, Vec<u8>)>,
    pub stores: Vec<Vec<(String, Vec<u8>)>>,
    pub poisoned: Option<String>,
}

impl FakeVolume {
    pub fn with_entries<'a>(entries: impl IntoIterator<Item = (&'a str, String)>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|(name, content)| (name.to_string(), content.into_bytes()))
                .collect(),
            ..Self::default()
        }
    }

    pub fn add_store<'a>(&mut self, entries: impl IntoIterator<Item = (&'a str, String)>) {
        self.stores.push(
            entries
                .into_iter()
                .map(|(name, content)| (name.to_string(), content.into_bytes()))
                .collect(),
        );
    }
}

impl ImageVolume for FakeVolume {
    fn entries(&self) -> Result<Vec<EvidenceItem>, EvidenceError> {
        Ok(self
            .entries
            .iter()
            .map(|(name, data)| EvidenceItem::image_entry(name, 0, data.len() as u64))
            .collect())
    }

    fn shadow_store_count(&self) -> u32 {
        self.stores.len() as u32
    }

    fn shadow_store_entries(&self, store: u32) -> Result<Vec<EvidenceItem>, EvidenceError> {
        let entries = self
            .stores
            .get(store as usize)
            .ok_or_else(|| EvidenceError::Unsupported(format!("no store {store}")))?;
        Ok(entries
            .iter()
            .map(|(name, data)| {
                EvidenceItem::shadow_store_entry(name, store + 1).with_size(data.len() as u64)
            })
            .collect())
    }

    fn open_entry(&self, item: &EvidenceItem) -> Result<ItemReader, EvidenceError> {
        let name = item.location().to_string_lossy().to_string();
        if self.poisoned.as_deref() == Some(name.as_str()) {
            panic!("corrupt volume entry {name}");
        }
        let pool = match item.shadow_store() {
            Some(store) => store
                .checked_sub(1)
                .and_then(|index| self.stores.get(index as usize)),
            None => Some(&self.entries),
        };
        let data = pool
            .and_then(|entries| entries.iter().find(|(entry, _)| *entry == name))
            .map(|(_, data)| data.clone())
            .ok_or_else(|| EvidenceError::Unsupported(format!("no entry {item}")))?;
        Ok(Box::new(Cursor::new(data)))
    }
}

/// Hands out the same volume for any image path.
pub struct FakeImageBackend(pub Arc<FakeVolume>);

impl ImageBackend for FakeImageBackend {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn open(&self, _path: &Path, _offset: u64) -> Result<Arc<dyn ImageVolume>, EvidenceError> {
        let volume: Arc<dyn ImageVolume> = self.0.clone();
        Ok(volume)
    }
}

/// An image file on disk for validation; its content is never read.
pub fn image_config(dir: &Path, output: &Path) -> EngineConfig {
    let image = write_file(dir, "disk.raw", "not really a filesystem");
    let mut cfg = config(&image, output);
    cfg.is_image = true;
    cfg
}

// ============================================================================
// Fixtures & Config
// ============================================================================

pub fn write_file(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("mkdir");
    }
    std::fs::write(&path, content).expect("write fixture");
    path
}

pub fn numbered_lines(count: usize) -> String {
    (0..count).map(|n| format!("line {n}\n")).collect()
}

pub fn config(source: &Path, output: &Path) -> EngineConfig {
    EngineConfig {
        source_path: Some(source.to_path_buf()),
        output_path: output.to_path_buf(),
        worker_count: 2,
        join_timeout_ms: 2_000,
        ..EngineConfig::default()
    }
}

pub fn loaded(config: EngineConfig) -> LoadedConfig {
    LoadedConfig::from_config(config)
}

// ============================================================================
// Output Readers
// ============================================================================

pub fn read_events(output: &Path) -> Vec<serde_json::Value> {
    let content = std::fs::read_to_string(output.join(EVENTS_FILE_NAME)).expect("read events");
    content
        .lines()
        .map(|line| serde_json::from_str(line).expect("event json"))
        .collect()
}

pub fn read_metadata(output: &Path) -> serde_json::Value {
    let content =
        std::fs::read_to_string(output.join(METADATA_FILE_NAME)).expect("read metadata");
    serde_json::from_str(&content).expect("metadata json")
}
