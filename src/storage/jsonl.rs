use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::constants::{EVENTS_FILE_NAME, METADATA_FILE_NAME};
use crate::event::Event;
use crate::storage::{EventStore, RunMetadata, StorageError};

/// Events as JSON lines in `events.jsonl`, metadata in `run_metadata.json`,
/// both inside the output directory. An existing event file is appended to.
pub struct JsonlStore {
    dir: PathBuf,
    events: File,
}

impl JsonlStore {
    pub fn create(output_dir: &Path) -> Result<Self, StorageError> {
        std::fs::create_dir_all(output_dir)?;
        let path = output_dir.join(EVENTS_FILE_NAME);
        if path.exists() {
            warn!("appending to existing event store {}", path.display());
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            dir: output_dir.to_path_buf(),
            events: file,
        })
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.dir.join(METADATA_FILE_NAME)
    }
}

impl EventStore for JsonlStore {
    fn write_batch(&mut self, events: &[Event]) -> Result<(), StorageError> {
        // Serialize first so a failing event leaves no partial batch behind.
        let mut batch = Vec::with_capacity(events.len() * 256);
        for event in events {
            serde_json::to_writer(&mut batch, event)?;
            batch.push(b'\n');
        }
        self.events.write_all(&batch)?;
        Ok(())
    }

    fn write_metadata(&mut self, metadata: &RunMetadata) -> Result<(), StorageError> {
        let file = File::create(self.metadata_path())?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, metadata)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), StorageError> {
        self.events.sync_all()?;
        Ok(())
    }
}
